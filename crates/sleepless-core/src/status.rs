//! Status and classification enums for tasks and pipeline failures.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a Task in the daemon's queue.
///
/// Transitions are monotonic: `Pending -> Running -> {Completed | Failed}`,
/// with `Running -> Pending` allowed only for the bounded transient-retry
/// path. A completed task never runs again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Task created but not yet picked up by the scheduler.
    #[default]
    Pending,
    /// Task is currently executing in the pipeline. At most one task
    /// process-wide may hold this status.
    Running,
    /// Task completed successfully.
    Completed,
    /// Task failed permanently (retry budget exhausted or rejected).
    Failed,
}

impl TaskStatus {
    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if `self -> to` is a legal transition.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        matches!(
            (*self, to),
            (Self::Pending, TaskStatus::Running)
                | (Self::Running, TaskStatus::Completed)
                | (Self::Running, TaskStatus::Failed)
                | (Self::Running, TaskStatus::Pending)
        )
    }

    /// Stable string form used in the persistent store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse the stable string form. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who created a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOrigin {
    /// Submitted by a user through an external interface.
    #[default]
    User,
    /// Produced by the idle-time auto-generation collaborator.
    Generated,
}

impl TaskOrigin {
    /// Stable string form used in the persistent store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Generated => "GENERATED",
        }
    }

    /// Parse the stable string form. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "USER" => Some(Self::User),
            "GENERATED" => Some(Self::Generated),
            _ => None,
        }
    }
}

/// Classification of a pipeline failure, driving the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Subprocess crash, timeout, or recoverable I/O error. Requeued while
    /// retry budget remains.
    Transient,
    /// Substantive failure (e.g. evaluator rejection). Never retried.
    Permanent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("CANCELLED"), None);
    }

    #[test]
    fn test_origin_string_roundtrip() {
        assert_eq!(TaskOrigin::parse("USER"), Some(TaskOrigin::User));
        assert_eq!(TaskOrigin::parse("GENERATED"), Some(TaskOrigin::Generated));
        assert_eq!(TaskOrigin::parse("robot"), None);
    }
}
