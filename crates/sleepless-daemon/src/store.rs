//! Durable task store backed by SQLite.
//!
//! Single source of truth for what work exists. Every status transition is a
//! guarded single `UPDATE` keyed on the expected current status, so a
//! transition plus its timestamp/summary write is all-or-nothing and a crash
//! after a successful call never loses it.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::{info, warn};

use sleepless_core::{Task, TaskId, TaskOrigin, TaskStatus};

/// Task store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database error. Treated as fatal by the scheduler.
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// Submission rejected before entering the queue.
    #[error("Invalid submission: {0}")]
    Validation(String),

    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// The task's current status does not permit the requested transition.
    #[error("Invalid state transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// A stored row could not be decoded.
    #[error("Corrupt task row: {0}")]
    Corrupt(String),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id             TEXT PRIMARY KEY,
    description    TEXT NOT NULL,
    project        TEXT,
    origin         TEXT NOT NULL,
    status         TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    queued_at      TEXT NOT NULL,
    started_at     TEXT,
    completed_at   TEXT,
    summary        TEXT,
    failure_reason TEXT,
    retry_count    INTEGER NOT NULL DEFAULT 0,
    deleted        INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_queued ON tasks(queued_at);
";

const COLUMNS: &str = "id, description, project, origin, status, created_at, queued_at, \
     started_at, completed_at, summary, failure_reason, retry_count, deleted";

/// SQLite-backed task store.
pub struct TaskStore {
    conn: Mutex<Connection>,

    /// When true, a requeued task re-enters the FIFO at the back instead of
    /// at its original creation-time position.
    requeue_at_tail: bool,
}

impl TaskStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path, requeue_at_tail: bool) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "Task store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            requeue_at_tail,
        })
    }

    /// Open an in-memory store (tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            requeue_at_tail: false,
        })
    }

    /// Flip the requeue ordering policy (builder style, tests and wiring).
    pub fn with_requeue_at_tail(mut self, at_tail: bool) -> Self {
        self.requeue_at_tail = at_tail;
        self
    }

    /// Create a new pending task. Rejects empty descriptions synchronously;
    /// a rejected submission never enters the queue.
    pub fn submit(
        &self,
        description: &str,
        project: Option<&str>,
        origin: TaskOrigin,
    ) -> Result<TaskId, StoreError> {
        if description.trim().is_empty() {
            return Err(StoreError::Validation(
                "task description must not be empty".to_string(),
            ));
        }

        let task = Task::new(description.trim(), project.map(str::to_owned), origin);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tasks (id, description, project, origin, status, created_at, queued_at, retry_count, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0)",
            params![
                task.id.as_str(),
                task.description,
                task.project,
                task.origin.as_str(),
                task.status.as_str(),
                task.created_at.to_rfc3339(),
                task.queued_at.to_rfc3339(),
            ],
        )?;
        info!(task_id = %task.id, origin = %task.origin.as_str(), "Task submitted");
        Ok(task.id)
    }

    /// Return the next task to execute: the oldest pending task in FIFO
    /// order. Returns `None` while any task is running, preserving the
    /// one-task-at-a-time invariant.
    pub fn next_eligible(&self) -> Result<Option<Task>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let running: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = 'RUNNING'",
            [],
            |row| row.get(0),
        )?;
        if running > 0 {
            return Ok(None);
        }

        conn.query_row(
            &format!(
                "SELECT {COLUMNS} FROM tasks
                 WHERE status = 'PENDING' AND deleted = 0
                 ORDER BY queued_at ASC, created_at ASC
                 LIMIT 1"
            ),
            [],
            row_to_task,
        )
        .optional()?
        .map(|r| r.map_err(StoreError::Corrupt))
        .transpose()
    }

    /// Transition a pending task to running. Refuses when another task is
    /// already running.
    pub fn mark_running(&self, id: &TaskId) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let running: i64 = tx.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = 'RUNNING' AND id != ?1",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        if running > 0 {
            return Err(StoreError::InvalidTransition {
                task: id.to_string(),
                from: TaskStatus::Pending,
                to: TaskStatus::Running,
            });
        }

        let changed = tx.execute(
            "UPDATE tasks SET status = 'RUNNING', started_at = ?2
             WHERE id = ?1 AND status = 'PENDING' AND deleted = 0",
            params![id.as_str(), Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(self.transition_error(&tx, id, TaskStatus::Running));
        }
        tx.commit()?;
        Ok(())
    }

    /// Transition a running task to completed with its result summary.
    pub fn mark_completed(&self, id: &TaskId, summary: &str) -> Result<(), StoreError> {
        self.guarded_terminal(id, TaskStatus::Completed, Some(summary), None)
    }

    /// Transition a running task to failed with a human-readable reason.
    pub fn mark_failed(&self, id: &TaskId, reason: &str) -> Result<(), StoreError> {
        self.guarded_terminal(id, TaskStatus::Failed, None, Some(reason))
    }

    /// Transition a running task back to pending after a transient failure,
    /// incrementing its retry count. FIFO position is preserved unless the
    /// store was configured to requeue at the tail.
    pub fn requeue(&self, id: &TaskId) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = if self.requeue_at_tail {
            conn.execute(
                "UPDATE tasks SET status = 'PENDING', started_at = NULL,
                        retry_count = retry_count + 1, queued_at = ?2
                 WHERE id = ?1 AND status = 'RUNNING'",
                params![id.as_str(), Utc::now().to_rfc3339()],
            )?
        } else {
            conn.execute(
                "UPDATE tasks SET status = 'PENDING', started_at = NULL,
                        retry_count = retry_count + 1
                 WHERE id = ?1 AND status = 'RUNNING'",
                params![id.as_str()],
            )?
        };
        if changed == 0 {
            return Err(self.transition_error(&conn, id, TaskStatus::Pending));
        }
        Ok(())
    }

    /// Startup sweep: any task left running by a prior crash or shutdown is
    /// a transient failure. Requeues it while the retry budget allows,
    /// otherwise fails it permanently. Returns the affected task IDs.
    pub fn recover_interrupted(&self, retry_budget: u32) -> Result<Vec<TaskId>, StoreError> {
        let interrupted: Vec<(TaskId, u32)> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt =
                conn.prepare("SELECT id, retry_count FROM tasks WHERE status = 'RUNNING'")?;
            let rows = stmt.query_map([], |row| {
                Ok((TaskId::new(row.get::<_, String>(0)?), row.get::<_, u32>(1)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };

        for (id, retry_count) in &interrupted {
            if *retry_count < retry_budget {
                self.requeue(id)?;
                warn!(task_id = %id, retry_count = retry_count + 1, "Interrupted task requeued");
            } else {
                self.mark_failed(id, "interrupted while running; retry budget exhausted")?;
                warn!(task_id = %id, "Interrupted task failed permanently");
            }
        }
        Ok(interrupted.into_iter().map(|(id, _)| id).collect())
    }

    /// Fetch a task by ID.
    pub fn get(&self, id: &TaskId) -> Result<Task, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM tasks WHERE id = ?1"),
            params![id.as_str()],
            row_to_task,
        )
        .optional()?
        .ok_or_else(|| StoreError::TaskNotFound(id.to_string()))?
        .map_err(StoreError::Corrupt)
    }

    /// List tasks, optionally filtered by status. Trashed tasks are hidden.
    pub fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let (sql, filter) = match status {
            Some(s) => (
                format!(
                    "SELECT {COLUMNS} FROM tasks WHERE deleted = 0 AND status = ?1
                     ORDER BY queued_at ASC, created_at ASC"
                ),
                Some(s.as_str()),
            ),
            None => (
                format!(
                    "SELECT {COLUMNS} FROM tasks WHERE deleted = 0
                     ORDER BY queued_at ASC, created_at ASC"
                ),
                None,
            ),
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = match filter {
            Some(s) => stmt.query_map(params![s], row_to_task)?,
            None => stmt.query_map([], row_to_task)?,
        };
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?.map_err(StoreError::Corrupt)?);
        }
        Ok(tasks)
    }

    /// Soft-delete a task. Running tasks cannot be trashed; nothing is ever
    /// hard-deleted.
    pub fn move_to_trash(&self, id: &TaskId) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE tasks SET deleted = 1 WHERE id = ?1 AND status != 'RUNNING'",
            params![id.as_str()],
        )?;
        if changed == 0 {
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM tasks WHERE id = ?1",
                    params![id.as_str()],
                    |_| Ok(true),
                )
                .optional()?
                .unwrap_or(false);
            return if exists {
                Err(StoreError::Validation(format!(
                    "task {id} is running and cannot be trashed"
                )))
            } else {
                Err(StoreError::TaskNotFound(id.to_string()))
            };
        }
        Ok(())
    }

    /// Terminal transition guarded on the running status.
    fn guarded_terminal(
        &self,
        id: &TaskId,
        to: TaskStatus,
        summary: Option<&str>,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE tasks SET status = ?2, completed_at = ?3, summary = ?4, failure_reason = ?5
             WHERE id = ?1 AND status = 'RUNNING'",
            params![
                id.as_str(),
                to.as_str(),
                Utc::now().to_rfc3339(),
                summary,
                reason,
            ],
        )?;
        if changed == 0 {
            return Err(self.transition_error(&conn, id, to));
        }
        Ok(())
    }

    /// Distinguish a missing task from an illegal transition after a guarded
    /// UPDATE touched zero rows.
    fn transition_error(&self, conn: &Connection, id: &TaskId, to: TaskStatus) -> StoreError {
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM tasks WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .ok()
            .flatten();
        match current.and_then(|s| TaskStatus::parse(&s)) {
            Some(from) => StoreError::InvalidTransition {
                task: id.to_string(),
                from,
                to,
            },
            None => StoreError::TaskNotFound(id.to_string()),
        }
    }
}

/// Decode one row into a Task. Decode problems are reported as strings so
/// the caller can wrap them in `StoreError::Corrupt`.
fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Result<Task, String>> {
    fn ts(value: String) -> Result<DateTime<Utc>, String> {
        DateTime::parse_from_rfc3339(&value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| format!("bad timestamp '{value}': {e}"))
    }
    fn opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>, String> {
        value.map(ts).transpose()
    }

    let id: String = row.get(0)?;
    let description: String = row.get(1)?;
    let project: Option<String> = row.get(2)?;
    let origin: String = row.get(3)?;
    let status: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let queued_at: String = row.get(6)?;
    let started_at: Option<String> = row.get(7)?;
    let completed_at: Option<String> = row.get(8)?;
    let summary: Option<String> = row.get(9)?;
    let failure_reason: Option<String> = row.get(10)?;
    let retry_count: u32 = row.get(11)?;
    let deleted: bool = row.get::<_, i64>(12)? != 0;

    Ok((|| {
        Ok(Task {
            id: TaskId::new(id.clone()),
            description,
            project,
            origin: TaskOrigin::parse(&origin)
                .ok_or_else(|| format!("task {id}: unknown origin '{origin}'"))?,
            status: TaskStatus::parse(&status)
                .ok_or_else(|| format!("task {id}: unknown status '{status}'"))?,
            created_at: ts(created_at)?,
            queued_at: ts(queued_at)?,
            started_at: opt_ts(started_at)?,
            completed_at: opt_ts(completed_at)?,
            summary,
            failure_reason,
            retry_count,
            deleted,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TaskStore {
        TaskStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_submit_and_get() {
        let store = store();
        let id = store.submit("write docs", None, TaskOrigin::User).unwrap();
        let task = store.get(&id).unwrap();
        assert_eq!(task.description, "write docs");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
    }

    #[test]
    fn test_submit_rejects_empty_description() {
        let store = store();
        assert!(matches!(
            store.submit("   ", None, TaskOrigin::User),
            Err(StoreError::Validation(_))
        ));
        assert!(store.list(None).unwrap().is_empty());
    }

    #[test]
    fn test_submit_ids_are_unique() {
        let store = store();
        let a = store.submit("a", None, TaskOrigin::User).unwrap();
        let b = store.submit("b", None, TaskOrigin::User).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_fifo_order() {
        let store = store();
        let first = store.submit("first", None, TaskOrigin::User).unwrap();
        let _second = store.submit("second", None, TaskOrigin::User).unwrap();
        let next = store.next_eligible().unwrap().unwrap();
        assert_eq!(next.id, first);
    }

    #[test]
    fn test_no_dispatch_while_running() {
        let store = store();
        let a = store.submit("a", None, TaskOrigin::User).unwrap();
        let _b = store.submit("b", None, TaskOrigin::User).unwrap();
        store.mark_running(&a).unwrap();
        assert!(store.next_eligible().unwrap().is_none());
        store.mark_completed(&a, "done").unwrap();
        assert!(store.next_eligible().unwrap().is_some());
    }

    #[test]
    fn test_single_running_invariant() {
        let store = store();
        let a = store.submit("a", None, TaskOrigin::User).unwrap();
        let b = store.submit("b", None, TaskOrigin::User).unwrap();
        store.mark_running(&a).unwrap();
        assert!(matches!(
            store.mark_running(&b),
            Err(StoreError::InvalidTransition { .. })
        ));
        assert_eq!(store.list(Some(TaskStatus::Running)).unwrap().len(), 1);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let store = store();
        let id = store.submit("a", None, TaskOrigin::User).unwrap();
        // pending -> completed without running
        assert!(matches!(
            store.mark_completed(&id, "done"),
            Err(StoreError::InvalidTransition { .. })
        ));
        store.mark_running(&id).unwrap();
        store.mark_completed(&id, "done").unwrap();
        // completed tasks never run again
        assert!(matches!(
            store.mark_running(&id),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_unknown_task() {
        let store = store();
        let ghost = TaskId::generate();
        assert!(matches!(
            store.get(&ghost),
            Err(StoreError::TaskNotFound(_))
        ));
        assert!(matches!(
            store.mark_running(&ghost),
            Err(StoreError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_requeue_preserves_fifo_position() {
        let store = store();
        let old = store.submit("old", None, TaskOrigin::User).unwrap();
        let _new = store.submit("new", None, TaskOrigin::User).unwrap();

        store.mark_running(&old).unwrap();
        store.requeue(&old).unwrap();

        // The requeued task keeps its creation-time position.
        let next = store.next_eligible().unwrap().unwrap();
        assert_eq!(next.id, old);
        assert_eq!(next.retry_count, 1);
    }

    #[test]
    fn test_requeue_at_tail() {
        let store = TaskStore::open_in_memory().unwrap().with_requeue_at_tail(true);
        let old = store.submit("old", None, TaskOrigin::User).unwrap();
        let fresh = store.submit("fresh", None, TaskOrigin::User).unwrap();

        store.mark_running(&old).unwrap();
        store.requeue(&old).unwrap();

        let next = store.next_eligible().unwrap().unwrap();
        assert_eq!(next.id, fresh);
    }

    #[test]
    fn test_recover_interrupted_requeues() {
        let store = store();
        let id = store.submit("a", None, TaskOrigin::User).unwrap();
        store.mark_running(&id).unwrap();

        let recovered = store.recover_interrupted(2).unwrap();
        assert_eq!(recovered, vec![id.clone()]);
        let task = store.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
    }

    #[test]
    fn test_recover_interrupted_exhausted_budget_fails() {
        let store = store();
        let id = store.submit("a", None, TaskOrigin::User).unwrap();
        // Burn the retry budget.
        for _ in 0..2 {
            store.mark_running(&id).unwrap();
            store.requeue(&id).unwrap();
        }
        store.mark_running(&id).unwrap();

        store.recover_interrupted(2).unwrap();
        let task = store.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.failure_reason.unwrap().contains("retry budget"));
    }

    #[test]
    fn test_trash_hides_task() {
        let store = store();
        let id = store.submit("a", None, TaskOrigin::User).unwrap();
        store.move_to_trash(&id).unwrap();
        assert!(store.list(None).unwrap().is_empty());
        assert!(store.next_eligible().unwrap().is_none());
        // Still present in the store, just hidden.
        assert!(store.get(&id).unwrap().deleted);
    }

    #[test]
    fn test_trash_refuses_running_task() {
        let store = store();
        let id = store.submit("a", None, TaskOrigin::User).unwrap();
        store.mark_running(&id).unwrap();
        assert!(matches!(
            store.move_to_trash(&id),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_lifecycle_timestamps_ordered() {
        let store = store();
        let id = store.submit("a", None, TaskOrigin::User).unwrap();
        store.mark_running(&id).unwrap();
        store.mark_completed(&id, "all green").unwrap();

        let task = store.get(&id).unwrap();
        let started = task.started_at.unwrap();
        let completed = task.completed_at.unwrap();
        assert!(task.created_at <= started);
        assert!(started <= completed);
        assert_eq!(task.summary.as_deref(), Some("all green"));
    }

    #[test]
    fn test_durable_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let id = {
            let store = TaskStore::open(&path, false).unwrap();
            let id = store.submit("persist me", None, TaskOrigin::User).unwrap();
            store.mark_running(&id).unwrap();
            id
        };
        let store = TaskStore::open(&path, false).unwrap();
        let task = store.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
    }
}
