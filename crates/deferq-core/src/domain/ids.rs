//! Domain identifiers (strongly-typed IDs).
//!
//! - `TaskId` is assigned by the store and grows with insertion order, so it
//!   doubles as the tie-breaker when two tasks share a `scheduled_time`.
//! - `WorkerId` names one scheduler instance. It is a ULID so independent
//!   processes can mint one without coordinating.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Identifier of a persisted task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(i64);

impl TaskId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for TaskId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Identity of the executor that claimed a task.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(Ulid);

impl WorkerId {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl From<Ulid> for WorkerId {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

impl FromStr for WorkerId {
    type Err = String;

    /// Accepts both the bare ULID and the `worker-` prefixed display form,
    /// since the latter is what ends up in the `claimed_by` column.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("worker-").unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|e| format!("invalid worker id {s:?}: {e}"))
    }
}
