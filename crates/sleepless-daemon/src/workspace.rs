//! Per-task workspace allocation and reclamation.
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/tasks/<task-id>/      scratch directory for one task
//! <root>/projects/<name>/      persistent project checkout, reused across tasks
//! <root>/trash/<task-id>-<ts>/ retired scratch directories
//! ```
//!
//! Project checkouts are reused rather than recloned; per-task edits are
//! isolated on a `task/<id>` branch so sequential tasks never see each
//! other's in-progress changes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use sleepless_core::{Task, TaskId};

use crate::git::{GitError, GitOps};

/// Workspace allocation errors.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The task already holds a workspace; never hand out a second one.
    #[error("Task {0} already holds a workspace")]
    AlreadyAllocated(TaskId),

    /// Filesystem failure.
    #[error("Workspace I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Project checkout could not be prepared.
    #[error("Project checkout failed: {0}")]
    Checkout(#[from] GitError),

    /// Releasing a workspace the manager does not own.
    #[error("No active workspace for task {0}")]
    NotAllocated(TaskId),
}

/// An isolated filesystem scope for one task's execution.
#[derive(Debug, Clone)]
pub struct Workspace {
    /// Scratch directory owned by the task.
    pub root: PathBuf,

    /// Owning task.
    pub task_id: TaskId,

    /// Project checkout, when the task is project-bound.
    pub project_path: Option<PathBuf>,

    /// Task isolation branch in the project checkout.
    pub branch: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Workspace {
    /// Directory the pipeline should execute in: the project checkout when
    /// bound, the scratch directory otherwise.
    pub fn working_dir(&self) -> &Path {
        self.project_path.as_deref().unwrap_or(&self.root)
    }
}

/// Allocates, tracks, and reclaims workspaces.
pub struct WorkspaceManager {
    root: PathBuf,
    retain_failed: bool,
    git: GitOps,
    active: HashMap<TaskId, PathBuf>,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, retain_failed: bool, git: GitOps) -> Self {
        Self {
            root: root.into(),
            retain_failed,
            git,
            active: HashMap::new(),
        }
    }

    /// Provision a workspace for the task. Re-entrant allocation fails:
    /// a task holding a workspace never receives a second one, and the
    /// active map guarantees no path is shared with a running task.
    pub async fn allocate(&mut self, task: &Task) -> Result<Workspace, WorkspaceError> {
        if self.active.contains_key(&task.id) {
            return Err(WorkspaceError::AlreadyAllocated(task.id.clone()));
        }

        let scratch = self.root.join("tasks").join(task.id.as_str());
        tokio::fs::create_dir_all(&scratch).await?;

        let (project_path, branch) = match &task.project {
            Some(project) => {
                let path = self.root.join("projects").join(project);
                self.git.ensure_checkout(&path).await?;
                let branch = format!("task/{}", task.id);
                self.git.checkout_task_branch(&path, &branch).await?;
                (Some(path), Some(branch))
            }
            None => (None, None),
        };

        self.active.insert(task.id.clone(), scratch.clone());
        info!(task_id = %task.id, path = %scratch.display(), "Workspace allocated");

        Ok(Workspace {
            root: scratch,
            task_id: task.id.clone(),
            project_path,
            branch,
            created_at: Utc::now(),
        })
    }

    /// Release a workspace after its pipeline run reached a terminal
    /// outcome. Successful scratch content is moved to the trash (project
    /// changes stay in the checkout for the Git collaborator); failed
    /// workspaces are retained in place for inspection unless retention is
    /// disabled.
    pub async fn release(
        &mut self,
        workspace: &Workspace,
        success: bool,
    ) -> Result<(), WorkspaceError> {
        if self.active.remove(&workspace.task_id).is_none() {
            return Err(WorkspaceError::NotAllocated(workspace.task_id.clone()));
        }

        if !success && self.retain_failed {
            info!(
                task_id = %workspace.task_id,
                path = %workspace.root.display(),
                "Workspace retained for inspection"
            );
            return Ok(());
        }

        self.trash(workspace).await
    }

    /// Whether the task currently holds a workspace.
    pub fn is_allocated(&self, task_id: &TaskId) -> bool {
        self.active.contains_key(task_id)
    }

    async fn trash(&self, workspace: &Workspace) -> Result<(), WorkspaceError> {
        let trash_dir = self.root.join("trash");
        tokio::fs::create_dir_all(&trash_dir).await?;
        let target = trash_dir.join(format!(
            "{}-{}",
            workspace.task_id,
            Utc::now().format("%Y%m%dT%H%M%S")
        ));
        match tokio::fs::rename(&workspace.root, &target).await {
            Ok(()) => {
                info!(task_id = %workspace.task_id, target = %target.display(), "Workspace trashed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Already gone; nothing to reclaim.
                warn!(task_id = %workspace.task_id, "Workspace directory missing at release");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sleepless_core::TaskOrigin;

    fn manager(root: &Path, retain_failed: bool) -> WorkspaceManager {
        WorkspaceManager::new(root, retain_failed, GitOps::new(false))
    }

    #[tokio::test]
    async fn test_allocate_creates_scratch_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = manager(dir.path(), true);
        let task = Task::new("scratch work", None, TaskOrigin::User);

        let ws = mgr.allocate(&task).await.unwrap();
        assert!(ws.root.is_dir());
        assert!(ws.project_path.is_none());
        assert_eq!(ws.working_dir(), ws.root.as_path());
        assert!(mgr.is_allocated(&task.id));
    }

    #[tokio::test]
    async fn test_reentrant_allocation_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = manager(dir.path(), true);
        let task = Task::new("scratch work", None, TaskOrigin::User);

        let _ws = mgr.allocate(&task).await.unwrap();
        assert!(matches!(
            mgr.allocate(&task).await,
            Err(WorkspaceError::AlreadyAllocated(_))
        ));
    }

    #[tokio::test]
    async fn test_release_success_moves_to_trash() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = manager(dir.path(), true);
        let task = Task::new("scratch work", None, TaskOrigin::User);

        let ws = mgr.allocate(&task).await.unwrap();
        tokio::fs::write(ws.root.join("out.txt"), "result").await.unwrap();
        mgr.release(&ws, true).await.unwrap();

        assert!(!ws.root.exists());
        assert!(!mgr.is_allocated(&task.id));
        let trash_entries: Vec<_> = std::fs::read_dir(dir.path().join("trash"))
            .unwrap()
            .collect();
        assert_eq!(trash_entries.len(), 1);
    }

    #[tokio::test]
    async fn test_release_failure_retains_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = manager(dir.path(), true);
        let task = Task::new("scratch work", None, TaskOrigin::User);

        let ws = mgr.allocate(&task).await.unwrap();
        mgr.release(&ws, false).await.unwrap();

        assert!(ws.root.is_dir());
        assert!(!mgr.is_allocated(&task.id));
        // The path is free for the retry to reuse.
        let retry_ws = mgr.allocate(&task).await.unwrap();
        assert_eq!(retry_ws.root, ws.root);
    }

    #[tokio::test]
    async fn test_release_failure_without_retention_trashes() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = manager(dir.path(), false);
        let task = Task::new("scratch work", None, TaskOrigin::User);

        let ws = mgr.allocate(&task).await.unwrap();
        mgr.release(&ws, false).await.unwrap();
        assert!(!ws.root.exists());
    }

    #[tokio::test]
    async fn test_release_unknown_workspace_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = manager(dir.path(), true);
        let task = Task::new("scratch work", None, TaskOrigin::User);
        let ws = Workspace {
            root: dir.path().join("tasks").join(task.id.as_str()),
            task_id: task.id.clone(),
            project_path: None,
            branch: None,
            created_at: Utc::now(),
        };
        assert!(matches!(
            mgr.release(&ws, true).await,
            Err(WorkspaceError::NotAllocated(_))
        ));
    }

    #[tokio::test]
    async fn test_project_bound_allocation_reuses_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = manager(dir.path(), true);

        let first = Task::new("one", Some("site".into()), TaskOrigin::User);
        let ws1 = mgr.allocate(&first).await.unwrap();
        let project = ws1.project_path.clone().unwrap();
        assert!(project.join(".git").is_dir());
        assert_eq!(ws1.branch.as_deref(), Some(&*format!("task/{}", first.id)));
        mgr.release(&ws1, true).await.unwrap();

        // Second task reuses the same checkout on its own branch.
        let second = Task::new("two", Some("site".into()), TaskOrigin::User);
        let ws2 = mgr.allocate(&second).await.unwrap();
        assert_eq!(ws2.project_path.as_deref(), Some(project.as_path()));
        assert_ne!(ws1.branch, ws2.branch);
    }
}
