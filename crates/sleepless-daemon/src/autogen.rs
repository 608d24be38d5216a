//! Idle-time task generation collaborator.
//!
//! When the queue has been empty long enough, the scheduler asks this seam
//! for one new self-directed task. The production implementation prompts the
//! CLI capability; tests inject scripted generators.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::pipeline::{CliRequest, CliRunner};

/// A generated task, not yet submitted.
#[derive(Debug, Clone)]
pub struct TaskDraft {
    pub description: String,
    pub project: Option<String>,
}

/// Generation errors. Never fatal: the scheduler logs and stays idle.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("Task generation failed: {0}")]
    Failed(String),
}

/// Source of auto-generated tasks.
#[async_trait]
pub trait TaskGenerator: Send + Sync {
    async fn generate(&self) -> Result<TaskDraft, GenerateError>;
}

/// CLI-backed generator: one short invocation producing a one-line task.
pub struct CliTaskGenerator {
    runner: Arc<dyn CliRunner>,
    working_dir: PathBuf,
    max_turns: u32,
    deadline: Duration,
}

impl CliTaskGenerator {
    pub fn new(runner: Arc<dyn CliRunner>, working_dir: PathBuf) -> Self {
        Self {
            runner,
            working_dir,
            max_turns: 3,
            deadline: Duration::from_secs(120),
        }
    }
}

#[async_trait]
impl TaskGenerator for CliTaskGenerator {
    async fn generate(&self) -> Result<TaskDraft, GenerateError> {
        let output = self
            .runner
            .run(CliRequest {
                working_dir: self.working_dir.clone(),
                prompt: "Suggest exactly one small, self-contained maintenance or \
                         improvement task an unattended coding agent could do right \
                         now. Reply with a single line describing the task, nothing \
                         else."
                    .to_string(),
                max_turns: self.max_turns,
                deadline: self.deadline,
            })
            .await
            .map_err(|e| GenerateError::Failed(e.to_string()))?;

        if output.is_error {
            return Err(GenerateError::Failed(
                output
                    .error_subtype
                    .unwrap_or_else(|| "CLI reported an error".to_string()),
            ));
        }

        let description = output
            .text
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| GenerateError::Failed("empty suggestion".to_string()))?
            .to_string();

        info!(description = %description, "Generated idle task");
        Ok(TaskDraft {
            description,
            project: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sleepless_claude_sdk::{CliRunOutput, SdkError};
    use std::sync::Mutex;

    struct OneShotRunner(Mutex<Option<Result<CliRunOutput, SdkError>>>);

    #[async_trait]
    impl CliRunner for OneShotRunner {
        async fn run(&self, _request: CliRequest) -> Result<CliRunOutput, SdkError> {
            self.0.lock().unwrap().take().unwrap()
        }
    }

    fn generator(response: Result<CliRunOutput, SdkError>) -> CliTaskGenerator {
        CliTaskGenerator::new(
            Arc::new(OneShotRunner(Mutex::new(Some(response)))),
            std::env::temp_dir(),
        )
    }

    #[tokio::test]
    async fn test_generates_first_nonempty_line() {
        let gen = generator(Ok(CliRunOutput {
            text: "\n  Add missing docs to the config module.  \nextra".to_string(),
            num_turns: Some(1),
            duration_ms: None,
            is_error: false,
            error_subtype: None,
            session_id: None,
        }));
        let draft = gen.generate().await.unwrap();
        assert_eq!(draft.description, "Add missing docs to the config module.");
        assert!(draft.project.is_none());
    }

    #[tokio::test]
    async fn test_empty_output_is_error() {
        let gen = generator(Ok(CliRunOutput {
            text: "   \n ".to_string(),
            num_turns: Some(1),
            duration_ms: None,
            is_error: false,
            error_subtype: None,
            session_id: None,
        }));
        assert!(gen.generate().await.is_err());
    }

    #[tokio::test]
    async fn test_cli_error_is_error() {
        let gen = generator(Err(SdkError::ProcessError("boom".to_string())));
        assert!(gen.generate().await.is_err());
    }
}
