//! Claude Code executor for bounded one-shot runs.
//!
//! This module provides the `ClaudeExecutor` type for executing a single
//! prompt against the Claude CLI with a hard turn limit and a caller-enforced
//! deadline. The child process never outlives the call: on deadline expiry it
//! is killed and reaped before the error is returned.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::error::SdkError;
use crate::types::{CliRunOutput, PermissionMode, ResultPayload};

/// Executor for one-shot Claude Code runs.
///
/// # Example
///
/// ```rust,no_run
/// use std::path::Path;
/// use std::time::Duration;
/// use sleepless_claude_sdk::{ClaudeExecutor, PermissionMode};
///
/// async fn run() -> Result<(), Box<dyn std::error::Error>> {
///     let executor = ClaudeExecutor::new("claude")
///         .with_permission_mode(PermissionMode::BypassPermissions);
///
///     let output = executor
///         .execute(Path::new("."), "What is 2 + 2?", 5, Duration::from_secs(120))
///         .await?;
///
///     println!("{}", output.text);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ClaudeExecutor {
    /// Path to the Claude CLI executable.
    claude_path: String,

    /// Permission mode to use.
    permission_mode: PermissionMode,

    /// Model to use (optional).
    model: Option<String>,

    /// System prompt (optional).
    system_prompt: Option<String>,

    /// Additional environment variables.
    env_vars: Vec<(String, String)>,
}

impl ClaudeExecutor {
    /// Create a new executor with the given path to the Claude CLI.
    ///
    /// The path can be just "claude" to use PATH lookup, or a full path.
    pub fn new(claude_path: impl Into<String>) -> Self {
        Self {
            claude_path: claude_path.into(),
            permission_mode: PermissionMode::Default,
            model: None,
            system_prompt: None,
            env_vars: Vec::new(),
        }
    }

    /// Set the permission mode.
    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    /// Set the model to use.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set a system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Execute a prompt with Claude Code, bounded by `max_turns` and
    /// `deadline`.
    ///
    /// On deadline expiry the child is killed, reaped, and
    /// `SdkError::Timeout` is returned. A CLI-reported error (including turn
    /// exhaustion) is returned as a successful call with `is_error` set so
    /// the caller can classify it.
    pub async fn execute(
        &self,
        working_dir: &Path,
        prompt: &str,
        max_turns: u32,
        deadline: Duration,
    ) -> Result<CliRunOutput, SdkError> {
        info!(
            claude_path = %self.claude_path,
            working_dir = %working_dir.display(),
            prompt_len = prompt.len(),
            max_turns = max_turns,
            deadline_secs = deadline.as_secs(),
            "Preparing Claude execution"
        );

        let mut cmd = Command::new(&self.claude_path);

        // One-shot execution: a single JSON result object on stdout.
        cmd.arg("--print")
            .arg("--output-format")
            .arg("json")
            .arg("--max-turns")
            .arg(max_turns.to_string())
            .arg("--permission-mode")
            .arg(self.permission_mode.as_flag());

        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }

        if let Some(system) = &self.system_prompt {
            cmd.arg("--append-system-prompt").arg(system);
        }

        cmd.arg(prompt);

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(working_dir)
            .kill_on_drop(true);

        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }

        debug!("Full command: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|e| {
            error!(error = %e, "Failed to spawn Claude process");
            e
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SdkError::ProtocolError("Failed to get stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SdkError::ProtocolError("Failed to get stderr".to_string()))?;

        // Drain stderr into the log so a wedged CLI is diagnosable.
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let trimmed = line.trim();
                        if !trimmed.is_empty() {
                            warn!(stderr = %trimmed, "Claude stderr");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Error reading Claude stderr");
                        break;
                    }
                }
            }
        });

        let mut stdout_reader = BufReader::new(stdout);
        let mut raw = String::new();

        let waited = tokio::time::timeout(deadline, async {
            stdout_reader.read_to_string(&mut raw).await?;
            let status = child.wait().await?;
            Ok::<std::process::ExitStatus, std::io::Error>(status)
        })
        .await;

        let status = match waited {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    deadline_secs = deadline.as_secs(),
                    "Deadline expired, killing Claude process"
                );
                // kill() also reaps, so no zombie is left behind.
                if let Err(e) = child.kill().await {
                    error!(error = %e, "Failed to kill timed-out Claude process");
                }
                return Err(SdkError::Timeout(deadline));
            }
        };

        let exit_code = status.code().unwrap_or(-1);
        info!(exit_code = exit_code, success = status.success(), "Claude process exited");

        let payload = parse_result_payload(&raw)?;

        if !status.success() && !payload.is_error {
            // Abnormal exit without a structured error: surface the exit code.
            return Err(SdkError::ProcessError(format!(
                "Claude exited with code {exit_code}"
            )));
        }

        Ok(CliRunOutput::from(payload))
    }
}

impl Default for ClaudeExecutor {
    fn default() -> Self {
        Self::new("claude")
    }
}

/// Parse the terminal result object from the CLI's stdout.
///
/// The CLI prints exactly one JSON object in `--output-format json` mode, but
/// wrappers sometimes prepend noise, so fall back to the last line that looks
/// like an object.
fn parse_result_payload(raw: &str) -> Result<ResultPayload, SdkError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SdkError::ProtocolError("empty stdout".to_string()));
    }

    if let Ok(payload) = serde_json::from_str::<ResultPayload>(trimmed) {
        if payload.payload_type == "result" {
            return Ok(payload);
        }
    }

    for line in trimmed.lines().rev() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        if let Ok(payload) = serde_json::from_str::<ResultPayload>(line) {
            if payload.payload_type == "result" {
                return Ok(payload);
            }
        }
    }

    let preview: String = trimmed.chars().take(200).collect();
    Err(SdkError::ProtocolError(format!(
        "no result object in output: {preview}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_builder() {
        let executor = ClaudeExecutor::new("claude")
            .with_model("claude-sonnet-4-20250514")
            .with_permission_mode(PermissionMode::BypassPermissions)
            .with_system_prompt("You are an unattended agent.")
            .with_env("ANTHROPIC_API_KEY", "test-key");

        assert_eq!(executor.claude_path, "claude");
        assert_eq!(executor.model, Some("claude-sonnet-4-20250514".to_string()));
        assert_eq!(executor.permission_mode, PermissionMode::BypassPermissions);
        assert_eq!(
            executor.system_prompt,
            Some("You are an unattended agent.".to_string())
        );
        assert_eq!(executor.env_vars.len(), 1);
    }

    #[test]
    fn test_default_executor() {
        let executor = ClaudeExecutor::default();
        assert_eq!(executor.claude_path, "claude");
        assert_eq!(executor.permission_mode, PermissionMode::Default);
        assert!(executor.model.is_none());
    }

    #[test]
    fn test_parse_clean_payload() {
        let raw = r#"{"type":"result","subtype":"success","is_error":false,"result":"done","num_turns":3}"#;
        let payload = parse_result_payload(raw).unwrap();
        assert_eq!(payload.result.as_deref(), Some("done"));
    }

    #[test]
    fn test_parse_payload_with_leading_noise() {
        let raw = "npm warn something\n{\"type\":\"result\",\"is_error\":false,\"result\":\"ok\"}\n";
        let payload = parse_result_payload(raw).unwrap();
        assert_eq!(payload.result.as_deref(), Some("ok"));
    }

    #[test]
    fn test_parse_empty_stdout_is_error() {
        assert!(matches!(
            parse_result_payload("  \n"),
            Err(SdkError::ProtocolError(_))
        ));
    }

    /// Write an executable stand-in for the CLI that ignores its arguments.
    #[cfg(unix)]
    fn fake_cli(dir: &Path, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-claude");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success_payload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(
            dir.path(),
            r#"echo '{"type":"result","subtype":"success","is_error":false,"result":"did it","num_turns":2}'"#,
        );
        let executor = ClaudeExecutor::new(cli.to_string_lossy());
        let output = executor
            .execute(dir.path(), "work", 5, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.text, "did it");
        assert_eq!(output.num_turns, Some(2));
        assert!(!output.is_error);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(dir.path(), "sleep 30");
        let executor = ClaudeExecutor::new(cli.to_string_lossy());
        let result = executor
            .execute(dir.path(), "work", 1, Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(SdkError::Timeout(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_abnormal_exit_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(dir.path(), "echo '{\"type\":\"result\"}'; exit 3");
        let executor = ClaudeExecutor::new(cli.to_string_lossy());
        let result = executor
            .execute(dir.path(), "work", 1, Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(SdkError::ProcessError(_))));
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces() {
        let executor = ClaudeExecutor::new("/nonexistent/claude-cli");
        let result = executor
            .execute(Path::new("."), "hello", 1, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(SdkError::SpawnError(_))));
    }
}
