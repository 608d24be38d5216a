//! Usage-aware admission control.
//!
//! Polls an external quota signal, maps the wall clock onto a day/night
//! bucket, and turns the pair into an admission decision. The monitor fails
//! closed: an unreadable or malformed signal defers, it never admits.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, Timelike, Utc};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use sleepless_core::UsageConfig;

/// Errors reading the quota signal.
#[derive(Debug, Error)]
pub enum UsageError {
    /// The probe command could not be run.
    #[error("Failed to run usage probe: {0}")]
    Probe(#[from] std::io::Error),

    /// The probe ran but its output carried no usable percentage.
    #[error("Unparseable usage signal: {0}")]
    Unparseable(String),

    /// The probe exited abnormally.
    #[error("Usage probe exited with code {0}")]
    ProbeFailed(i32),
}

/// Day/night bucket at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBucket {
    Day,
    Night,
}

/// A point-in-time read of quota consumption. Immutable once recorded; the
/// bucket is always re-derived from the wall clock at read time.
#[derive(Debug, Clone, Copy)]
pub struct UsageSnapshot {
    pub percent_used: f64,
    pub read_at: DateTime<Utc>,
    pub bucket: TimeBucket,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    /// Run a task now.
    Admit,
    /// Hold off and re-check after the given interval.
    Defer {
        retry_after: Duration,
        reason: String,
    },
}

/// Source of the percent-consumed value.
#[async_trait]
pub trait UsageProbe: Send + Sync {
    async fn read_percent(&self) -> Result<f64, UsageError>;
}

/// Production probe: runs a configured shell command and parses its output.
///
/// Accepts either a JSON object carrying a `percent_used` / `percentage` /
/// `percent` field, or plain text whose first numeric token is the value.
pub struct CommandProbe {
    command: String,
}

impl CommandProbe {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl UsageProbe for CommandProbe {
    async fn read_percent(&self) -> Result<f64, UsageError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(UsageError::ProbeFailed(output.status.code().unwrap_or(-1)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_percent(&stdout)
    }
}

/// Extract a percent-consumed value from probe output.
pub fn parse_percent(raw: &str) -> Result<f64, UsageError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(UsageError::Unparseable("empty output".to_string()));
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        for key in ["percent_used", "percentage", "percent"] {
            if let Some(found) = find_number(&value, key) {
                return Ok(found.clamp(0.0, 100.0));
            }
        }
        return Err(UsageError::Unparseable(
            "JSON output has no percentage field".to_string(),
        ));
    }

    for token in trimmed.split_whitespace() {
        let token = token.trim_end_matches('%');
        if let Ok(value) = token.parse::<f64>() {
            return Ok(value.clamp(0.0, 100.0));
        }
    }
    let preview: String = trimmed.chars().take(120).collect();
    Err(UsageError::Unparseable(preview))
}

/// Depth-first search for a numeric field with the given key.
fn find_number(value: &serde_json::Value, key: &str) -> Option<f64> {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(found) = map.get(key).and_then(|v| v.as_f64()) {
                return Some(found);
            }
            map.values().find_map(|v| find_number(v, key))
        }
        serde_json::Value::Array(items) => items.iter().find_map(|v| find_number(v, key)),
        _ => None,
    }
}

/// Map an hour of day onto a bucket using a half-open
/// `[night_start, night_end)` window, wrapping across midnight when
/// `night_start > night_end`.
pub fn bucket_for_hour(hour: u32, night_start: u32, night_end: u32) -> TimeBucket {
    let night = if night_start <= night_end {
        hour >= night_start && hour < night_end
    } else {
        hour >= night_start || hour < night_end
    };
    if night {
        TimeBucket::Night
    } else {
        TimeBucket::Day
    }
}

/// Usage-aware admission controller.
pub struct UsageMonitor {
    config: UsageConfig,
    probe: Box<dyn UsageProbe>,
}

impl UsageMonitor {
    pub fn new(config: UsageConfig, probe: Box<dyn UsageProbe>) -> Self {
        Self { config, probe }
    }

    /// Read the quota signal and decide whether a task may be admitted.
    pub async fn check(&self) -> AdmissionDecision {
        if self.config.skip_check {
            return AdmissionDecision::Admit;
        }

        let percent = match self.probe.read_percent().await {
            Ok(p) => p,
            Err(e) => {
                // Fail closed: an unreadable signal is never an admission.
                warn!(error = %e, "Usage signal unreadable, deferring");
                return AdmissionDecision::Defer {
                    retry_after: Duration::from_secs(self.config.probe_backoff_secs),
                    reason: format!("usage signal unreadable: {e}"),
                };
            }
        };

        let snapshot = UsageSnapshot {
            percent_used: percent,
            read_at: Utc::now(),
            bucket: bucket_for_hour(
                Local::now().hour(),
                self.config.night_start_hour,
                self.config.night_end_hour,
            ),
        };
        debug!(
            percent = snapshot.percent_used,
            bucket = ?snapshot.bucket,
            "Usage snapshot"
        );
        self.decide(&snapshot)
    }

    /// Pure policy: compare a snapshot against the bucket's threshold.
    pub fn decide(&self, snapshot: &UsageSnapshot) -> AdmissionDecision {
        let threshold = match snapshot.bucket {
            TimeBucket::Day => self.config.threshold_day,
            TimeBucket::Night => self.config.threshold_night,
        };
        if snapshot.percent_used >= threshold {
            AdmissionDecision::Defer {
                retry_after: Duration::from_secs(self.config.poll_interval_secs),
                reason: format!(
                    "usage {:.1}% at or above {:?} threshold {:.1}%",
                    snapshot.percent_used, snapshot.bucket, threshold
                ),
            }
        } else {
            AdmissionDecision::Admit
        }
    }
}
