//! Sleepless Agent core domain types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Subprocesses
//! - Database
//! - Runtime specifics
//!
//! All types here represent the core business domain of the daemon: tasks,
//! their lifecycle, and the configuration values the engine is built from.

pub mod config;
pub mod error;
pub mod ids;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use config::{AgentConfig, DaemonConfig, PipelineConfig, StageConfig, UsageConfig};
pub use error::CoreError;
pub use ids::TaskId;
pub use status::{FailureKind, TaskOrigin, TaskStatus};
pub use task::Task;
