//! Outcome model: what one invocation produced.
//!
//! This module does not touch storage. The executor builds an `Outcome`,
//! and the report step turns it into a terminal status write.

use serde::{Deserialize, Serialize};

use super::status::TaskStatus;

/// Why an invocation ended in `failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Payload could not be decoded or names an unknown handler.
    Decode,
    /// Merged arguments did not fit the handler's argument type.
    Arguments,
    /// Handler returned an error.
    Execution,
    /// Handler panicked.
    Panicked,
    /// Handler exceeded the configured task timeout.
    TimedOut,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Decode => "decode",
            FailureKind::Arguments => "arguments",
            FailureKind::Execution => "execution",
            FailureKind::Panicked => "panicked",
            FailureKind::TimedOut => "timed_out",
        }
    }

    fn fallback_message(self) -> &'static str {
        match self {
            FailureKind::Decode => "payload could not be decoded",
            FailureKind::Arguments => "invalid arguments",
            FailureKind::Execution => "execution failed",
            FailureKind::Panicked => "handler panicked",
            FailureKind::TimedOut => "handler timed out",
        }
    }
}

/// Result of invoking one claimed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success { output: Option<String> },
    Failure { kind: FailureKind, error: String },
}

impl Outcome {
    /// Success carrying the textual form of the handler's return value.
    pub fn success(value: &serde_json::Value) -> Self {
        Outcome::Success {
            output: render_output(value),
        }
    }

    /// Failure with `error` as its description. An empty or blank message
    /// falls back to one derived from `kind`, so stored errors are never empty.
    pub fn failure(kind: FailureKind, error: impl Into<String>) -> Self {
        let mut error = error.into();
        if error.trim().is_empty() {
            error = kind.fallback_message().to_string();
        }
        Outcome::Failure { kind, error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// Terminal status this outcome reports.
    pub fn status(&self) -> TaskStatus {
        match self {
            Outcome::Success { .. } => TaskStatus::Success,
            Outcome::Failure { .. } => TaskStatus::Failure,
        }
    }

    /// Text persisted in the `output` column.
    pub fn text(&self) -> Option<&str> {
        match self {
            Outcome::Success { output } => output.as_deref(),
            Outcome::Failure { error, .. } => Some(error),
        }
    }
}

/// Textual representation of a handler's return value.
///
/// Strings are stored verbatim (no quotes), `null` means "no output",
/// everything else is compact JSON.
pub fn render_output(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
