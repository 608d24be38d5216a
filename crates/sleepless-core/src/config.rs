//! Configuration values consumed by the daemon.
//!
//! These are plain value structs threaded into each component at construction
//! time. Whatever loads them (a config file, environment, tests) is outside
//! the engine; defaults here are the shipped behavior.

use crate::CoreError;
use serde::Deserialize;
use std::path::PathBuf;

/// Usage-quota admission policy.
///
/// Thresholds are intentionally asymmetric: a low daytime threshold leaves
/// headroom for interactive use, a high nighttime threshold lets the agent
/// burn nearly all remaining quota unattended.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    /// Skip quota checking entirely (unmetered backend). Admission is then
    /// always granted.
    pub skip_check: bool,

    /// Percent-consumed ceiling during day hours.
    pub threshold_day: f64,

    /// Percent-consumed ceiling during night hours.
    pub threshold_night: f64,

    /// Start of the night window, inclusive (hour of day, 0-23).
    pub night_start_hour: u32,

    /// End of the night window, exclusive (hour of day, 0-23).
    pub night_end_hour: u32,

    /// How long to defer when the quota ceiling is hit (seconds).
    pub poll_interval_secs: u64,

    /// Backoff after an unreadable quota signal (seconds).
    pub probe_backoff_secs: u64,

    /// Command invoked to read the percent-consumed value.
    pub probe_command: String,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            skip_check: false,
            threshold_day: 20.0,
            threshold_night: 80.0,
            night_start_hour: 22,
            night_end_hour: 8,
            poll_interval_secs: 300,
            probe_backoff_secs: 60,
            probe_command: "ccusage blocks --json".to_string(),
        }
    }
}

impl UsageConfig {
    /// Validate ranges.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.night_start_hour > 23 || self.night_end_hour > 23 {
            return Err(CoreError::InvalidConfig(
                "night window hours must be 0-23".to_string(),
            ));
        }
        for (name, value) in [
            ("threshold_day", self.threshold_day),
            ("threshold_night", self.threshold_night),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(CoreError::InvalidConfig(format!(
                    "{name} must be within 0-100, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Per-stage pipeline settings.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Whether this stage runs at all.
    pub enabled: bool,

    /// Maximum conversational turns granted to the CLI for this stage.
    pub max_turns: u32,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_turns: 10,
        }
    }
}

/// Pipeline assembly settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Planner stage (optional).
    pub planner: StageConfig,

    /// Worker stage. Disabling the worker makes the pipeline a no-op and is
    /// rejected at validation.
    pub worker: StageConfig,

    /// Evaluator stage (optional).
    pub evaluator: StageConfig,

    /// Wall-clock ceiling for one pipeline run, all stages combined (seconds).
    pub task_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            planner: StageConfig {
                enabled: true,
                max_turns: 10,
            },
            worker: StageConfig {
                enabled: true,
                max_turns: 50,
            },
            evaluator: StageConfig {
                enabled: true,
                max_turns: 10,
            },
            task_timeout_secs: 3600,
        }
    }
}

impl PipelineConfig {
    /// Validate stage assembly.
    pub fn validate(&self) -> Result<(), CoreError> {
        if !self.worker.enabled {
            return Err(CoreError::InvalidConfig(
                "the worker stage cannot be disabled".to_string(),
            ));
        }
        if self.task_timeout_secs == 0 {
            return Err(CoreError::InvalidConfig(
                "task_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Daemon-wide settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path of the SQLite task store.
    pub db_path: PathBuf,

    /// Root directory for per-task workspaces, project checkouts, and trash.
    pub workspace_root: PathBuf,

    /// Path of the Claude CLI executable.
    pub claude_path: String,

    /// Model passed to the CLI, if pinned.
    pub model: Option<String>,

    /// How many transient failures a task may absorb before it is failed
    /// permanently.
    pub retry_budget: u32,

    /// Delay before a requeued task becomes eligible again (seconds).
    pub retry_backoff_secs: u64,

    /// Sleep between cycles when the queue is empty (seconds).
    pub idle_sleep_secs: u64,

    /// Keep failed-task workspaces on disk for inspection.
    pub retain_failed_workspaces: bool,

    /// When true, a requeued task re-enters the FIFO at the back instead of
    /// at its original creation-time position.
    pub requeue_at_tail: bool,

    /// Generate a task of our own when the queue has been idle long enough.
    pub autogen_enabled: bool,

    /// Queue-idle time before auto-generation kicks in (seconds).
    pub autogen_idle_secs: u64,

    /// Push after committing project changes.
    pub git_push: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("sleepless.db"),
            workspace_root: PathBuf::from("workspaces"),
            claude_path: "claude".to_string(),
            model: None,
            retry_budget: 2,
            retry_backoff_secs: 30,
            idle_sleep_secs: 60,
            retain_failed_workspaces: true,
            requeue_at_tail: false,
            autogen_enabled: false,
            autogen_idle_secs: 1800,
            git_push: false,
        }
    }
}

/// Aggregate configuration threaded into the scheduler at construction.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub daemon: DaemonConfig,
    pub usage: UsageConfig,
    pub pipeline: PipelineConfig,
}

impl AgentConfig {
    /// Validate all sections.
    pub fn validate(&self) -> Result<(), CoreError> {
        self.usage.validate()?;
        self.pipeline.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        AgentConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_disabled_worker() {
        let mut config = AgentConfig::default();
        config.pipeline.worker.enabled = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_threshold() {
        let mut config = AgentConfig::default();
        config.usage.threshold_night = 140.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_night_hours() {
        let mut config = AgentConfig::default();
        config.usage.night_start_hour = 24;
        assert!(config.validate().is_err());
    }
}
