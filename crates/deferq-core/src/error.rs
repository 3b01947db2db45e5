//! Error taxonomy.
//!
//! Per-task problems (`DecodeError`, `ExecutionError`) are recorded on the
//! task row and never escape `process_due`. Only configuration, store and
//! pre-persistence encode failures reach callers, wrapped in [`Error`].

use thiserror::Error;

use crate::domain::{TaskId, TaskStatus};

/// Unusable configuration or connection settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("database url is not set")]
    MissingDatabaseUrl,

    #[error("unsupported database url scheme in {0:?}; expected sqlite or postgres")]
    UnsupportedScheme(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("failed to open database: {0}")]
    Open(#[source] rusqlite::Error),

    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),
}

/// Database failure during insert, select or update.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("corrupt task row: {0}")]
    Corrupt(String),

    #[error("store background operation failed: {0}")]
    Background(String),
}

/// The call could not be turned into a storable payload.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("invalid handler name {0:?}")]
    InvalidHandlerName(String),

    #[error("no handler registered under {0:?}")]
    UnknownHandler(String),

    #[error("{field} must serialize to a JSON object, got {found}")]
    NotAnObject { field: &'static str, found: String },

    #[error("failed to serialize {field}: {source}")]
    Serialize {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A stored payload could not be turned back into an invocable call.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("payload version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("no handler registered under {0:?}")]
    UnknownHandler(String),
}

/// The invoked handler failed.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        ExecutionError::Failed(message.into())
    }
}

/// Errors surfaced by the public entry points.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_message_names_both_states() {
        let err = StoreError::InvalidTransition {
            id: TaskId::new(3),
            from: TaskStatus::Success,
            to: TaskStatus::Failure,
        };
        assert_eq!(
            err.to_string(),
            "invalid status transition for task-3: success -> failure"
        );
    }

    #[test]
    fn top_level_error_is_transparent() {
        let err: Error = EncodeError::UnknownHandler("nope.v1".into()).into();
        assert_eq!(err.to_string(), "no handler registered under \"nope.v1\"");
    }
}
