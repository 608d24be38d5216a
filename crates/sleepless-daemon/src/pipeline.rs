//! Staged task pipeline: planner -> worker -> evaluator.
//!
//! Each stage is one bounded CLI invocation. Stages run strictly in order;
//! a stage is skipped only when disabled by configuration, never because an
//! earlier enabled stage failed (that aborts the run). One wall-clock
//! deadline spans all stages combined.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{info, warn};

use sleepless_claude_sdk::{ClaudeExecutor, CliRunOutput, SdkError};
use sleepless_core::{FailureKind, PipelineConfig, StageConfig, Task};

use crate::workspace::Workspace;

/// The closed set of pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Planner,
    Worker,
    Evaluator,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Worker => "worker",
            Self::Evaluator => "evaluator",
        }
    }
}

/// How one stage ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StageVerdict {
    /// Stage produced output and finished inside its limits.
    Completed,
    /// Evaluator accepted the work.
    Accepted,
    /// Evaluator rejected the work.
    Rejected,
    /// Stage failed (crash, timeout, turn exhaustion, missing verdict).
    Failed,
}

/// Record of one executed stage.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub stage: StageKind,
    pub verdict: StageVerdict,
    pub turns_used: Option<u32>,
    pub duration: Duration,
}

/// Aggregate verdict of a pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineVerdict {
    /// Worker finished and the evaluator (if enabled) accepted.
    Completed { summary: String },
    /// The run failed; `kind` drives the retry decision.
    Failed { kind: FailureKind, reason: String },
}

/// Result of one pipeline run against a task.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub verdict: PipelineVerdict,
    pub stages: Vec<StageOutcome>,
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.verdict, PipelineVerdict::Completed { .. })
    }
}

/// One CLI invocation request, as the pipeline sees the external capability.
#[derive(Debug, Clone)]
pub struct CliRequest {
    pub working_dir: PathBuf,
    pub prompt: String,
    pub max_turns: u32,
    pub deadline: Duration,
}

/// Seam between the pipeline and the external CLI. Tests inject scripted
/// implementations; production wires in the Claude executor.
#[async_trait]
pub trait CliRunner: Send + Sync {
    async fn run(&self, request: CliRequest) -> Result<CliRunOutput, SdkError>;
}

#[async_trait]
impl CliRunner for ClaudeExecutor {
    async fn run(&self, request: CliRequest) -> Result<CliRunOutput, SdkError> {
        self.execute(
            &request.working_dir,
            &request.prompt,
            request.max_turns,
            request.deadline,
        )
        .await
    }
}

/// Internal per-stage failure before it is folded into the aggregate verdict.
struct StageFailure {
    kind: FailureKind,
    reason: String,
}

/// The staged pipeline, assembled once at construction.
pub struct Pipeline {
    config: PipelineConfig,
    runner: Arc<dyn CliRunner>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, runner: Arc<dyn CliRunner>) -> Self {
        Self { config, runner }
    }

    /// Run the pipeline against a task inside its workspace.
    ///
    /// Failures never propagate as errors: every way a run can end is folded
    /// into a structured `PipelineOutcome` for the scheduler.
    pub async fn run(&self, task: &Task, workspace: &Workspace) -> PipelineOutcome {
        let deadline_at = Instant::now() + Duration::from_secs(self.config.task_timeout_secs);
        let working_dir = workspace.working_dir().to_path_buf();
        let mut stages = Vec::new();

        // Planner
        let plan = if self.config.planner.enabled {
            match self
                .run_stage(
                    StageKind::Planner,
                    self.config.planner,
                    planner_prompt(task),
                    &working_dir,
                    deadline_at,
                    &mut stages,
                )
                .await
            {
                Ok(text) => Some(text),
                Err(failure) => return Self::failed(failure, stages),
            }
        } else {
            None
        };

        // Worker (required)
        let work = match self
            .run_stage(
                StageKind::Worker,
                self.config.worker,
                worker_prompt(task, plan.as_deref()),
                &working_dir,
                deadline_at,
                &mut stages,
            )
            .await
        {
            Ok(text) => text,
            Err(failure) => return Self::failed(failure, stages),
        };

        // Evaluator
        if self.config.evaluator.enabled {
            let review = match self
                .run_stage(
                    StageKind::Evaluator,
                    self.config.evaluator,
                    evaluator_prompt(task, &work),
                    &working_dir,
                    deadline_at,
                    &mut stages,
                )
                .await
            {
                Ok(text) => text,
                Err(failure) => return Self::failed(failure, stages),
            };

            match parse_verdict(&review) {
                Some(Verdict::Accept) => {
                    if let Some(outcome) = stages.last_mut() {
                        outcome.verdict = StageVerdict::Accepted;
                    }
                }
                Some(Verdict::Reject { rationale }) => {
                    if let Some(outcome) = stages.last_mut() {
                        outcome.verdict = StageVerdict::Rejected;
                    }
                    info!(task_id = %task.id, "Evaluator rejected the result");
                    return PipelineOutcome {
                        verdict: PipelineVerdict::Failed {
                            kind: FailureKind::Permanent,
                            reason: format!("evaluator rejected the result: {rationale}"),
                        },
                        stages,
                    };
                }
                None => {
                    if let Some(outcome) = stages.last_mut() {
                        outcome.verdict = StageVerdict::Failed;
                    }
                    return PipelineOutcome {
                        verdict: PipelineVerdict::Failed {
                            kind: FailureKind::Transient,
                            reason: "evaluator returned no verdict".to_string(),
                        },
                        stages,
                    };
                }
            }
        }

        let summary = summarize(&work);
        PipelineOutcome {
            verdict: PipelineVerdict::Completed { summary },
            stages,
        }
    }

    /// Run one stage within the remaining wall-clock budget.
    async fn run_stage(
        &self,
        stage: StageKind,
        config: StageConfig,
        prompt: String,
        working_dir: &Path,
        deadline_at: Instant,
        stages: &mut Vec<StageOutcome>,
    ) -> Result<String, StageFailure> {
        let remaining = deadline_at.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            stages.push(StageOutcome {
                stage,
                verdict: StageVerdict::Failed,
                turns_used: None,
                duration: Duration::ZERO,
            });
            return Err(StageFailure {
                kind: FailureKind::Transient,
                reason: format!("task timeout expired before the {} stage", stage.as_str()),
            });
        }

        info!(
            stage = stage.as_str(),
            max_turns = config.max_turns,
            remaining_secs = remaining.as_secs(),
            "Running pipeline stage"
        );
        let started = Instant::now();
        let result = self
            .runner
            .run(CliRequest {
                working_dir: working_dir.to_path_buf(),
                prompt,
                max_turns: config.max_turns,
                deadline: remaining,
            })
            .await;
        let duration = started.elapsed();

        let (verdict, turns_used, outcome) = match result {
            Ok(output) if output.turns_exhausted() => {
                warn!(stage = stage.as_str(), "Stage exhausted its turn limit");
                (
                    StageVerdict::Failed,
                    output.num_turns,
                    Err(StageFailure {
                        kind: FailureKind::Transient,
                        reason: format!(
                            "{} stage exhausted its turn limit without finishing",
                            stage.as_str()
                        ),
                    }),
                )
            }
            Ok(output) if output.is_error => {
                let subtype = output
                    .error_subtype
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string());
                warn!(stage = stage.as_str(), subtype = %subtype, "Stage reported an error");
                (
                    StageVerdict::Failed,
                    output.num_turns,
                    Err(StageFailure {
                        kind: FailureKind::Transient,
                        reason: format!("{} stage failed: {subtype}", stage.as_str()),
                    }),
                )
            }
            Ok(output) => (StageVerdict::Completed, output.num_turns, Ok(output.text)),
            Err(SdkError::Timeout(_)) => (
                StageVerdict::Failed,
                None,
                Err(StageFailure {
                    kind: FailureKind::Transient,
                    reason: format!("{} stage hit the task timeout", stage.as_str()),
                }),
            ),
            Err(e) => {
                warn!(stage = stage.as_str(), error = %e, "Stage invocation failed");
                (
                    StageVerdict::Failed,
                    None,
                    Err(StageFailure {
                        kind: FailureKind::Transient,
                        reason: format!("{} stage failed: {e}", stage.as_str()),
                    }),
                )
            }
        };

        stages.push(StageOutcome {
            stage,
            verdict,
            turns_used,
            duration,
        });
        outcome
    }

    fn failed(failure: StageFailure, stages: Vec<StageOutcome>) -> PipelineOutcome {
        PipelineOutcome {
            verdict: PipelineVerdict::Failed {
                kind: failure.kind,
                reason: failure.reason,
            },
            stages,
        }
    }
}

enum Verdict {
    Accept,
    Reject { rationale: String },
}

/// Find the evaluator's `VERDICT:` line. Anything else in the reply is its
/// rationale.
fn parse_verdict(review: &str) -> Option<Verdict> {
    let mut decision = None;
    for line in review.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("VERDICT:") {
            match rest.trim().to_ascii_uppercase().as_str() {
                "ACCEPT" => decision = Some(true),
                "REJECT" => decision = Some(false),
                _ => {}
            }
        }
    }
    match decision? {
        true => Some(Verdict::Accept),
        false => {
            let rationale: String = review
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with("VERDICT:"))
                .collect::<Vec<_>>()
                .join(" ");
            let rationale = if rationale.is_empty() {
                "no rationale given".to_string()
            } else {
                rationale
            };
            Some(Verdict::Reject { rationale })
        }
    }
}

/// First paragraph of the worker's reply, used as the task summary.
fn summarize(work: &str) -> String {
    let summary = work
        .split("\n\n")
        .map(str::trim)
        .find(|p| !p.is_empty())
        .unwrap_or("task completed");
    summary.to_string()
}

fn planner_prompt(task: &Task) -> String {
    format!(
        "You are the planning stage of an unattended agent. Produce a short, \
         concrete plan (numbered steps) for the following task. Do not make \
         any changes yet.\n\nTask: {}",
        task.description
    )
}

fn worker_prompt(task: &Task, plan: Option<&str>) -> String {
    match plan {
        Some(plan) => format!(
            "Carry out the following task in the current directory, following \
             the plan below. Finish with a short summary of what you changed.\n\n\
             Task: {}\n\nPlan:\n{}",
            task.description, plan
        ),
        None => format!(
            "Carry out the following task in the current directory. Finish \
             with a short summary of what you changed.\n\nTask: {}",
            task.description
        ),
    }
}

fn evaluator_prompt(task: &Task, work: &str) -> String {
    format!(
        "You are the review stage of an unattended agent. Review the work \
         summary below against the task. Reply with your reasoning, then a \
         final line reading exactly 'VERDICT: ACCEPT' or 'VERDICT: REJECT'.\n\n\
         Task: {}\n\nWork summary:\n{}",
        task.description, work
    )
}
