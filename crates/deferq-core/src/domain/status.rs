//! Task status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a task row.
///
/// State transitions:
/// - Pending -> InProgress (claim)
/// - InProgress -> Success
/// - InProgress -> Failure
///
/// Success and Failure are terminal. Nothing skips InProgress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its scheduled time.
    Pending,

    /// Claimed by exactly one executor.
    InProgress,

    /// Handler returned a value.
    Success,

    /// Decode, argument or handler failure.
    Failure,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Success,
        TaskStatus::Failure,
    ];

    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
        }
    }

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }

    /// The only status a row may hold right before entering `self`.
    pub fn required_predecessor(self) -> Option<TaskStatus> {
        match self {
            TaskStatus::Pending => None,
            TaskStatus::InProgress => Some(TaskStatus::Pending),
            TaskStatus::Success | TaskStatus::Failure => Some(TaskStatus::InProgress),
        }
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        next.required_predecessor() == Some(self)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "success" => Ok(TaskStatus::Success),
            "failure" => Ok(TaskStatus::Failure),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}
