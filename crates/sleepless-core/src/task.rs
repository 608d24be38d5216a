//! The Task record.

use crate::{TaskId, TaskOrigin, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A Task is one unit of work for the daemon.
///
/// Tasks live in the Task Store; the scheduler and pipeline are the only
/// writers once a task has been submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique, immutable task identifier.
    pub id: TaskId,

    /// Free-text description of the work.
    pub description: String,

    /// Project this task is bound to, if any.
    pub project: Option<String>,

    /// Who created this task.
    pub origin: TaskOrigin,

    /// Current task status.
    pub status: TaskStatus,

    /// When the task was submitted.
    pub created_at: DateTime<Utc>,

    /// FIFO position. Equal to `created_at` unless the store is configured
    /// to re-stamp requeued tasks to the back of the queue.
    pub queued_at: DateTime<Utc>,

    /// When the current (or last) execution started.
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,

    /// Result summary from a successful pipeline run.
    pub summary: Option<String>,

    /// Human-readable reason for a failure.
    pub failure_reason: Option<String>,

    /// Number of times this task has been requeued after a transient failure.
    pub retry_count: u32,

    /// Soft-delete flag. Trashed tasks are hidden from listings but never
    /// removed from the store.
    pub deleted: bool,
}

impl Task {
    /// Create a new pending Task.
    pub fn new(
        description: impl Into<String>,
        project: Option<String>,
        origin: TaskOrigin,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            description: description.into(),
            project,
            origin,
            status: TaskStatus::Pending,
            created_at: now,
            queued_at: now,
            started_at: None,
            completed_at: None,
            summary: None,
            failure_reason: None,
            retry_count: 0,
            deleted: false,
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True when this task is bound to a project checkout.
    pub fn is_project_bound(&self) -> bool {
        self.project.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_is_pending() {
        let task = Task::new("fix the flaky test", None, TaskOrigin::User);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_none());
        assert!(!task.deleted);
        assert_eq!(task.queued_at, task.created_at);
    }

    #[test]
    fn test_project_binding() {
        let unbound = Task::new("housekeeping", None, TaskOrigin::Generated);
        assert!(!unbound.is_project_bound());

        let bound = Task::new("add CI", Some("website".into()), TaskOrigin::User);
        assert!(bound.is_project_bound());
    }
}
