//! Task record: one row of the durable task table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{TaskId, WorkerId};
use super::status::TaskStatus;

/// Persisted task as read back from a store.
///
/// - `payload` is opaque here; only the codec gives it meaning.
/// - `output` stays `None` until the terminal report.
/// - `start_time` / `end_time` bracket the `InProgress` window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub scheduled_time: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub output: Option<String>,
    pub claimed_by: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Pending and not scheduled after `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.scheduled_time <= now
    }
}

/// Input for `TaskStore::insert`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub scheduled_time: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A task handed to exactly one executor by the claim step.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedTask {
    pub id: TaskId,
    pub name: String,
    pub scheduled_time: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub start_time: DateTime<Utc>,
    pub claimed_by: WorkerId,
}

/// A single status write.
///
/// Stores apply it only when the row currently holds
/// `status.required_predecessor()`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: TaskStatus,
    pub output: Option<String>,
    pub claimed_by: Option<WorkerId>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn claim(now: DateTime<Utc>, worker: WorkerId) -> Self {
        Self {
            status: TaskStatus::InProgress,
            output: None,
            claimed_by: Some(worker),
            start_time: Some(now),
            end_time: None,
        }
    }

    pub fn success(output: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            status: TaskStatus::Success,
            output,
            claimed_by: None,
            start_time: None,
            end_time: Some(now),
        }
    }

    pub fn failure(error: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            status: TaskStatus::Failure,
            output: Some(error.into()),
            claimed_by: None,
            start_time: None,
            end_time: Some(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn record(status: TaskStatus, scheduled_time: DateTime<Utc>) -> TaskRecord {
        TaskRecord {
            id: TaskId::new(1),
            name: "t".to_string(),
            scheduled_time,
            payload: serde_json::json!({}),
            status,
            output: None,
            claimed_by: None,
            start_time: None,
            end_time: None,
            created_at: scheduled_time,
        }
    }

    #[test]
    fn due_only_when_pending_and_not_in_future() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert!(record(TaskStatus::Pending, now).is_due(now));
        assert!(record(TaskStatus::Pending, now - Duration::seconds(1)).is_due(now));
        assert!(!record(TaskStatus::Pending, now + Duration::seconds(1)).is_due(now));
        assert!(!record(TaskStatus::InProgress, now).is_due(now));
        assert!(!record(TaskStatus::Success, now).is_due(now));
    }

    #[test]
    fn failure_update_carries_error_as_output() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let update = StatusUpdate::failure("boom", now);
        assert_eq!(update.status, TaskStatus::Failure);
        assert_eq!(update.output.as_deref(), Some("boom"));
        assert_eq!(update.end_time, Some(now));
        assert_eq!(update.start_time, None);
    }
}
