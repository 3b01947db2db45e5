//! Domain model (IDs, status, task records, outcomes).

pub mod ids;
pub mod outcome;
pub mod status;
pub mod task;

pub use self::ids::{TaskId, WorkerId};
pub use self::outcome::{FailureKind, Outcome, render_output};
pub use self::status::TaskStatus;
pub use self::task::{ClaimedTask, NewTask, StatusUpdate, TaskRecord};
