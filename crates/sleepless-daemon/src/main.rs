//! Sleepless Agent Daemon

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

mod autogen;
mod git;
mod pipeline;
mod scheduler;
mod store;
mod usage;
mod workspace;

use sleepless_claude_sdk::{ClaudeExecutor, PermissionMode};
use sleepless_core::AgentConfig;

use autogen::{CliTaskGenerator, TaskGenerator};
use git::GitOps;
use pipeline::{CliRunner, Pipeline};
use scheduler::Scheduler;
use store::TaskStore;
use usage::{CommandProbe, UsageMonitor};
use workspace::WorkspaceManager;

/// Environment overrides for the handful of values an operator most often
/// changes. Full configuration loading lives outside the engine.
fn load_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    if let Ok(path) = std::env::var("SLEEPLESS_DB") {
        config.daemon.db_path = path.into();
    }
    if let Ok(root) = std::env::var("SLEEPLESS_WORKSPACE_ROOT") {
        config.daemon.workspace_root = root.into();
    }
    if let Ok(path) = std::env::var("SLEEPLESS_CLAUDE_PATH") {
        config.daemon.claude_path = path;
    }
    if std::env::var("SLEEPLESS_SKIP_USAGE_CHECK").is_ok() {
        config.usage.skip_check = true;
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config();
    config.validate()?;

    info!(
        db = %config.daemon.db_path.display(),
        workspace_root = %config.daemon.workspace_root.display(),
        claude_path = %config.daemon.claude_path,
        "Starting Sleepless Agent daemon"
    );

    let store = TaskStore::open(&config.daemon.db_path, config.daemon.requeue_at_tail)?;
    let monitor = UsageMonitor::new(
        config.usage.clone(),
        Box::new(CommandProbe::new(config.usage.probe_command.clone())),
    );

    let mut executor = ClaudeExecutor::new(config.daemon.claude_path.clone())
        .with_permission_mode(PermissionMode::BypassPermissions);
    if let Some(model) = &config.daemon.model {
        executor = executor.with_model(model.clone());
    }
    let runner: Arc<dyn CliRunner> = Arc::new(executor);

    let git = GitOps::new(config.daemon.git_push);
    let workspaces = WorkspaceManager::new(
        config.daemon.workspace_root.clone(),
        config.daemon.retain_failed_workspaces,
        git.clone(),
    );
    let pipeline = Pipeline::new(config.pipeline.clone(), runner.clone());

    let generator: Option<Box<dyn TaskGenerator>> = if config.daemon.autogen_enabled {
        Some(Box::new(CliTaskGenerator::new(
            runner,
            config.daemon.workspace_root.clone(),
        )))
    } else {
        None
    };

    let mut scheduler = Scheduler::new(
        config, store, monitor, workspaces, pipeline, git, generator,
    );

    // Ctrl-C requests a graceful stop; the running task is requeued rather
    // than abandoned.
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal_token.cancel();
        }
    });

    if let Err(e) = scheduler.run(shutdown).await {
        error!(error = %e, "Scheduler stopped on fatal error");
        return Err(e.into());
    }

    info!("Daemon stopped");
    Ok(())
}
