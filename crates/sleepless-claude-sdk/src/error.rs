//! Error types for the Claude Code SDK.

use thiserror::Error;

/// Errors that can occur during Claude Code SDK operations.
#[derive(Debug, Error)]
pub enum SdkError {
    /// Failed to spawn the Claude process.
    #[error("Failed to spawn Claude process: {0}")]
    SpawnError(#[from] std::io::Error),

    /// Claude process exited with an error.
    #[error("Claude process exited with error: {0}")]
    ProcessError(String),

    /// The result payload could not be parsed.
    #[error("Unparseable result payload: {0}")]
    ProtocolError(String),

    /// The deadline expired before the process finished. The child has been
    /// terminated and reaped by the time this is returned.
    #[error("Deadline expired after {0:?}")]
    Timeout(std::time::Duration),
}
