//! The daemon's admission-and-dispatch loop.
//!
//! A single cooperative loop: check admission, pull the next task, run the
//! pipeline, fold the result back into the store. At most one pipeline run
//! is in flight at any time; the external CLI and the workspaces are not
//! designed for concurrent sharing.
//!
//! Only Task Store failures are fatal. Pipeline, workspace, and git failures
//! are per-task outcomes the loop records and moves past.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sleepless_core::{AgentConfig, FailureKind, Task, TaskId, TaskOrigin};

use crate::autogen::TaskGenerator;
use crate::git::GitOps;
use crate::pipeline::{Pipeline, PipelineVerdict};
use crate::store::{StoreError, TaskStore};
use crate::usage::{AdmissionDecision, UsageMonitor};
use crate::workspace::{Workspace, WorkspaceManager};

/// Scheduler errors. Anything surfacing here stops the daemon.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Task store failure: {0}")]
    Store(#[from] StoreError),
}

/// What one scheduler cycle did. Explicit so tests can drive many cycles
/// without real wall-clock delay.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Admission deferred; sleep this long before the next cycle.
    Deferred(Duration),
    /// Queue empty; sleep this long before the next cycle.
    Idle(Duration),
    /// A task was dispatched (its outcome is in the store).
    Executed(TaskId),
    /// Shutdown observed mid-run; the interrupted task has been requeued.
    Shutdown,
}

/// The scheduling-and-execution engine.
pub struct Scheduler {
    config: AgentConfig,
    store: TaskStore,
    monitor: UsageMonitor,
    workspaces: WorkspaceManager,
    pipeline: Pipeline,
    git: GitOps,
    generator: Option<Box<dyn TaskGenerator>>,
    idle_since: Option<Instant>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AgentConfig,
        store: TaskStore,
        monitor: UsageMonitor,
        workspaces: WorkspaceManager,
        pipeline: Pipeline,
        git: GitOps,
        generator: Option<Box<dyn TaskGenerator>>,
    ) -> Self {
        Self {
            config,
            store,
            monitor,
            workspaces,
            pipeline,
            git,
            generator,
            idle_since: None,
        }
    }

    /// Run until the token is cancelled. Tasks left `running` by a prior
    /// crash are recovered before the first admission.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), SchedulerError> {
        let recovered = self
            .store
            .recover_interrupted(self.config.daemon.retry_budget)?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Recovered interrupted tasks");
        }

        loop {
            if shutdown.is_cancelled() {
                info!("Shutdown requested, stopping scheduler");
                return Ok(());
            }
            match self.run_cycle(&shutdown).await? {
                CycleOutcome::Shutdown => {
                    info!("Shutdown observed mid-run, stopping scheduler");
                    return Ok(());
                }
                CycleOutcome::Deferred(pause) | CycleOutcome::Idle(pause) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                CycleOutcome::Executed(_) => {}
            }
        }
    }

    /// One admission-and-dispatch cycle.
    pub async fn run_cycle(
        &mut self,
        shutdown: &CancellationToken,
    ) -> Result<CycleOutcome, SchedulerError> {
        if let AdmissionDecision::Defer {
            retry_after,
            reason,
        } = self.monitor.check().await
        {
            info!(reason = %reason, retry_after_secs = retry_after.as_secs(), "Admission deferred");
            return Ok(CycleOutcome::Deferred(retry_after));
        }

        let task = match self.store.next_eligible()? {
            Some(task) => task,
            None => match self.try_autogen().await? {
                Some(task) => task,
                None => {
                    return Ok(CycleOutcome::Idle(Duration::from_secs(
                        self.config.daemon.idle_sleep_secs,
                    )))
                }
            },
        };
        self.idle_since = None;

        info!(
            task_id = %task.id,
            retry_count = task.retry_count,
            description = %task.description,
            "Dispatching task"
        );
        self.store.mark_running(&task.id)?;

        let workspace = match self.workspaces.allocate(&task).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Workspace allocation failed");
                self.requeue_or_fail(&task, &format!("workspace allocation failed: {e}"))?;
                return Ok(CycleOutcome::Executed(task.id));
            }
        };

        let outcome = tokio::select! {
            _ = shutdown.cancelled() => None,
            outcome = self.pipeline.run(&task, &workspace) => Some(outcome),
        };

        let Some(outcome) = outcome else {
            // Interrupted mid-run: same transient path as crash recovery.
            // Dropping the pipeline future killed the CLI subprocess.
            warn!(task_id = %task.id, "Pipeline interrupted by shutdown");
            self.requeue_or_fail(&task, "interrupted by shutdown")?;
            if let Err(e) = self.workspaces.release(&workspace, false).await {
                warn!(task_id = %task.id, error = %e, "Workspace release failed");
            }
            return Ok(CycleOutcome::Shutdown);
        };

        match outcome.verdict {
            PipelineVerdict::Completed { summary } => {
                self.store.mark_completed(&task.id, &summary)?;
                info!(task_id = %task.id, stages = outcome.stages.len(), "Task completed");
                if let Err(e) = self.workspaces.release(&workspace, true).await {
                    warn!(task_id = %task.id, error = %e, "Workspace release failed");
                }
                if task.is_project_bound() {
                    self.commit_project_changes(&task, &workspace, &summary).await;
                }
            }
            PipelineVerdict::Failed { kind, reason } => {
                if let Err(e) = self.workspaces.release(&workspace, false).await {
                    warn!(task_id = %task.id, error = %e, "Workspace release failed");
                }
                match kind {
                    FailureKind::Transient
                        if task.retry_count < self.config.daemon.retry_budget =>
                    {
                        self.store.requeue(&task.id)?;
                        info!(
                            task_id = %task.id,
                            retry_count = task.retry_count + 1,
                            reason = %reason,
                            "Transient failure, task requeued"
                        );
                        self.retry_backoff(shutdown).await;
                    }
                    _ => {
                        self.store.mark_failed(&task.id, &reason)?;
                        warn!(task_id = %task.id, reason = %reason, "Task failed permanently");
                    }
                }
            }
        }

        Ok(CycleOutcome::Executed(task.id))
    }

    /// Queue is empty: ask the auto-generation collaborator for a task once
    /// the idle interval has elapsed. Generation failures leave the daemon
    /// idle.
    async fn try_autogen(&mut self) -> Result<Option<Task>, SchedulerError> {
        if !self.config.daemon.autogen_enabled {
            return Ok(None);
        }
        let Some(generator) = &self.generator else {
            return Ok(None);
        };

        let idle_since = *self.idle_since.get_or_insert_with(Instant::now);
        if idle_since.elapsed() < Duration::from_secs(self.config.daemon.autogen_idle_secs) {
            return Ok(None);
        }

        // Reset the clock whether or not generation succeeds, so a failing
        // generator is retried one idle interval later, not every cycle.
        self.idle_since = Some(Instant::now());
        match generator.generate().await {
            Ok(draft) => {
                let id = self.store.submit(
                    &draft.description,
                    draft.project.as_deref(),
                    TaskOrigin::Generated,
                )?;
                info!(task_id = %id, "Auto-generated task submitted");
                Ok(self.store.next_eligible()?)
            }
            Err(e) => {
                warn!(error = %e, "Task generation failed");
                Ok(None)
            }
        }
    }

    /// Transient-failure transition bounded by the retry budget.
    fn requeue_or_fail(&self, task: &Task, reason: &str) -> Result<(), SchedulerError> {
        if task.retry_count < self.config.daemon.retry_budget {
            self.store.requeue(&task.id)?;
        } else {
            self.store
                .mark_failed(&task.id, &format!("{reason}; retry budget exhausted"))?;
        }
        Ok(())
    }

    /// Commit produced changes for a project-bound task. Non-fatal: a git
    /// failure is logged and the task stays completed.
    async fn commit_project_changes(&self, task: &Task, workspace: &Workspace, summary: &str) {
        let Some(project_path) = &workspace.project_path else {
            return;
        };
        let message = format!("task {}: {}", task.id, summary);
        match self.git.commit_task(project_path, &message).await {
            Ok(true) => info!(task_id = %task.id, "Project changes committed"),
            Ok(false) => info!(task_id = %task.id, "No project changes to commit"),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Git commit failed (task stays completed)")
            }
        }
    }

    async fn retry_backoff(&self, shutdown: &CancellationToken) {
        let backoff = Duration::from_secs(self.config.daemon.retry_backoff_secs);
        if backoff.is_zero() {
            return;
        }
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(backoff) => {}
        }
    }

    /// Read access for inspection and tests.
    pub fn store(&self) -> &TaskStore {
        &self.store
    }
}
