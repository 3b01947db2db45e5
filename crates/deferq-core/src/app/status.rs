//! Status - ステータス別件数と 1 パスごとのレポート

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::TaskStatus;

/// Number of task rows in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub success: usize,
    pub failure: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: TaskStatus, n: usize) {
        match status {
            TaskStatus::Pending => self.pending += n,
            TaskStatus::InProgress => self.in_progress += n,
            TaskStatus::Success => self.success += n,
            TaskStatus::Failure => self.failure += n,
        }
    }

    pub fn get(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::InProgress => self.in_progress,
            TaskStatus::Success => self.success,
            TaskStatus::Failure => self.failure,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.success + self.failure
    }
}

impl fmt::Display for StatusCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pending={} in_progress={} success={} failure={}",
            self.pending, self.in_progress, self.success, self.failure
        )
    }
}

/// What one `process_due` pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl ProcessReport {
    /// Claimed tasks whose terminal status has not been written.
    pub fn unreported(&self) -> usize {
        self.claimed.saturating_sub(self.succeeded + self.failed)
    }
}
