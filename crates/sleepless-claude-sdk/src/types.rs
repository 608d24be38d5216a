//! Wire types for the Claude Code CLI's `--output-format json` payload.

use serde::{Deserialize, Serialize};

/// Permission mode passed to the CLI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    /// Standard permission prompts (unusable unattended).
    #[default]
    Default,
    /// Auto-accept file edits.
    AcceptEdits,
    /// Skip all permission prompts.
    BypassPermissions,
}

impl PermissionMode {
    /// CLI flag value.
    pub fn as_flag(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::BypassPermissions => "bypassPermissions",
        }
    }
}

/// The single JSON object the CLI prints in one-shot `--output-format json`
/// mode. Unknown fields are ignored so newer CLI versions keep parsing.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultPayload {
    /// Payload discriminator; `"result"` for the terminal object.
    #[serde(rename = "type")]
    pub payload_type: String,

    /// `"success"` or an error subtype such as `"error_max_turns"`.
    #[serde(default)]
    pub subtype: Option<String>,

    /// True when the run ended in an error.
    #[serde(default)]
    pub is_error: bool,

    /// The final assistant text.
    #[serde(default)]
    pub result: Option<String>,

    /// Conversational turns consumed.
    #[serde(default)]
    pub num_turns: Option<u32>,

    /// Wall-clock duration reported by the CLI.
    #[serde(default)]
    pub duration_ms: Option<u64>,

    /// Session identifier, usable for follow-up invocations.
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Outcome of one bounded CLI execution.
#[derive(Debug, Clone)]
pub struct CliRunOutput {
    /// Final assistant text (empty when the CLI reported none).
    pub text: String,

    /// Turns consumed, when reported.
    pub num_turns: Option<u32>,

    /// Duration reported by the CLI, when present.
    pub duration_ms: Option<u64>,

    /// True when the CLI reported an error result (including turn-limit
    /// exhaustion without a terminal answer).
    pub is_error: bool,

    /// Error subtype when `is_error` is set.
    pub error_subtype: Option<String>,

    /// Session ID for follow-ups.
    pub session_id: Option<String>,
}

impl CliRunOutput {
    /// True when the CLI hit its turn ceiling without finishing.
    pub fn turns_exhausted(&self) -> bool {
        self.error_subtype.as_deref() == Some("error_max_turns")
    }
}

impl From<ResultPayload> for CliRunOutput {
    fn from(p: ResultPayload) -> Self {
        Self {
            text: p.result.unwrap_or_default(),
            num_turns: p.num_turns,
            duration_ms: p.duration_ms,
            is_error: p.is_error,
            error_subtype: if p.is_error { p.subtype } else { None },
            session_id: p.session_id,
        }
    }
}
