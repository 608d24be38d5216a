//! Git capability wrapper.
//!
//! The daemon consumes Git as a collaborator: project checkouts are reused
//! across tasks, per-task isolation happens on a task branch, and produced
//! changes are committed after a successful run. Commit/push failures are
//! reported to the caller, which logs them without reverting task state.

use std::path::Path;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Git invocation errors.
#[derive(Debug, Error)]
pub enum GitError {
    /// The git binary could not be run.
    #[error("Failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    /// A git command exited abnormally.
    #[error("git {command} failed: {stderr}")]
    Command { command: String, stderr: String },
}

/// Thin subprocess wrapper around the git CLI.
#[derive(Debug, Clone)]
pub struct GitOps {
    /// Push after committing.
    push: bool,
}

impl GitOps {
    pub fn new(push: bool) -> Self {
        Self { push }
    }

    /// Ensure a project checkout exists at `path`, initializing an empty
    /// repository on first use.
    pub async fn ensure_checkout(&self, path: &Path) -> Result<(), GitError> {
        if path.join(".git").is_dir() {
            return Ok(());
        }
        tokio::fs::create_dir_all(path).await?;
        self.run(path, &["init", "--quiet"]).await?;
        info!(path = %path.display(), "Initialized project checkout");
        Ok(())
    }

    /// Switch the checkout onto the task's isolation branch, creating or
    /// resetting it at the current HEAD.
    pub async fn checkout_task_branch(&self, path: &Path, branch: &str) -> Result<(), GitError> {
        self.run(path, &["checkout", "-B", branch]).await?;
        debug!(branch = branch, "Checked out task branch");
        Ok(())
    }

    /// Stage and commit everything in the checkout. Returns `false` when
    /// there was nothing to commit. Pushes the branch afterwards when
    /// configured to.
    pub async fn commit_task(&self, path: &Path, message: &str) -> Result<bool, GitError> {
        self.run(path, &["add", "-A"]).await?;

        // `diff --cached --quiet` exits 1 when the index has changes.
        if self.run(path, &["diff", "--cached", "--quiet"]).await.is_ok() {
            debug!("Nothing to commit");
            return Ok(false);
        }

        self.run(path, &["commit", "-m", message]).await?;
        info!(path = %path.display(), "Committed task changes");

        if self.push {
            self.run(path, &["push", "--set-upstream", "origin", "HEAD"])
                .await?;
            info!("Pushed task branch");
        }
        Ok(true)
    }

    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<String, GitError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(GitError::Command {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn configured_repo(dir: &Path) -> GitOps {
        let git = GitOps::new(false);
        git.ensure_checkout(dir).await.unwrap();
        // Commits need an identity in a fresh environment.
        git.run(dir, &["config", "user.email", "agent@test"])
            .await
            .unwrap();
        git.run(dir, &["config", "user.name", "agent"]).await.unwrap();
        git
    }

    #[tokio::test]
    async fn test_ensure_checkout_initializes_once() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitOps::new(false);
        git.ensure_checkout(dir.path()).await.unwrap();
        assert!(dir.path().join(".git").is_dir());
        // Second call reuses the checkout.
        git.ensure_checkout(dir.path()).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_task_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let git = configured_repo(dir.path()).await;

        assert!(!git.commit_task(dir.path(), "empty").await.unwrap());

        tokio::fs::write(dir.path().join("notes.md"), "work happened")
            .await
            .unwrap();
        assert!(git.commit_task(dir.path(), "task: add notes").await.unwrap());
        assert!(!git.commit_task(dir.path(), "nothing new").await.unwrap());
    }

    #[tokio::test]
    async fn test_task_branch_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let git = configured_repo(dir.path()).await;
        tokio::fs::write(dir.path().join("base.txt"), "base")
            .await
            .unwrap();
        git.commit_task(dir.path(), "base").await.unwrap();

        git.checkout_task_branch(dir.path(), "task/abc123")
            .await
            .unwrap();
        let head = git
            .run(dir.path(), &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .unwrap();
        assert_eq!(head.trim(), "task/abc123");
    }
}
