//! Claude Code SDK for the Sleepless Agent
//!
//! This crate provides a small abstraction for executing the Claude Code CLI
//! as a bounded one-shot subprocess: a prompt goes in, a parsed result
//! payload comes out, and the child process is guaranteed to be gone when the
//! call returns, whatever the exit path.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::time::Duration;
//! use sleepless_claude_sdk::{ClaudeExecutor, PermissionMode};
//!
//! async fn run_once() -> Result<(), Box<dyn std::error::Error>> {
//!     let executor = ClaudeExecutor::new("claude")
//!         .with_permission_mode(PermissionMode::BypassPermissions);
//!
//!     let output = executor
//!         .execute(Path::new("."), "Summarize TODO.md", 10, Duration::from_secs(300))
//!         .await?;
//!
//!     println!("{}", output.text);
//!     Ok(())
//! }
//! ```

mod error;
mod executor;
mod types;

// Re-export main types
pub use error::SdkError;
pub use executor::ClaudeExecutor;
pub use types::{CliRunOutput, PermissionMode, ResultPayload};
