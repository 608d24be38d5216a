//! Core domain errors.

use thiserror::Error;

/// Core domain errors for the Sleepless Agent.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Task submission rejected before entering the queue.
    #[error("Invalid submission: {0}")]
    Validation(String),

    /// Configuration value outside its legal range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
