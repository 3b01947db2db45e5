//! Executor - claim 済みタスクを 1 件実行して結果を記録
//!
//! `invoke` は store に触らない。書き込みは `report_outcome` だけ。
//! 分けておくと Scheduler が複数の invoke を並行に走らせ、
//! 終わったものから順に報告できる。

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::domain::{ClaimedTask, FailureKind, Outcome, StatusUpdate, TaskId};
use crate::error::{ExecutionError, StoreError};
use crate::ports::TaskStore;
use crate::typed::{HandlerRegistry, PayloadCodec};

/// Executor は decode → 引数マージ → Handler 実行 → 結果報告 を担当
pub struct Executor {
    registry: Arc<HandlerRegistry>,
    timeout: Option<Duration>,
}

impl Executor {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            timeout: None,
        }
    }

    /// Abort handlers that run longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Decode the payload, merge `params` over it and run the handler.
    ///
    /// Every way the call can go wrong becomes an `Outcome::Failure`; this
    /// never returns an error and never panics on a handler's behalf.
    pub async fn invoke(&self, task: &ClaimedTask, params: &Map<String, Value>) -> Outcome {
        let call = match PayloadCodec::decode(&task.payload, &self.registry) {
            Ok(call) => call,
            Err(e) => return Outcome::failure(FailureKind::Decode, e.to_string()),
        };
        let handler = call.handler();
        let args = call.arguments(params);

        // Own tokio task: a panic unwinds there and comes back as a JoinError.
        let mut join = tokio::spawn(async move { handler.call_dyn(args).await });
        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut join).await {
                Ok(joined) => joined,
                Err(_) => {
                    join.abort();
                    return Outcome::failure(
                        FailureKind::TimedOut,
                        format!("handler timed out after {}s", limit.as_secs_f64()),
                    );
                }
            },
            None => join.await,
        };

        match joined {
            Ok(Ok(value)) => Outcome::success(&value),
            Ok(Err(e @ ExecutionError::InvalidArguments(_))) => {
                Outcome::failure(FailureKind::Arguments, e.to_string())
            }
            Ok(Err(e)) => Outcome::failure(FailureKind::Execution, e.to_string()),
            Err(e) if e.is_panic() => Outcome::failure(
                FailureKind::Panicked,
                format!("handler panicked: {}", panic_message(e.into_panic())),
            ),
            Err(e) => Outcome::failure(FailureKind::Execution, e.to_string()),
        }
    }

    /// Write the terminal status for `id`.
    pub async fn report_outcome(
        &self,
        store: &dyn TaskStore,
        id: TaskId,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let update = match outcome {
            Outcome::Success { output } => StatusUpdate::success(output.clone(), now),
            Outcome::Failure { error, .. } => StatusUpdate::failure(error.clone(), now),
        };
        store.update_status(id, update).await?;

        match outcome {
            Outcome::Success { output } => {
                info!(task_id = %id, output = output.as_deref().unwrap_or(""), "task succeeded");
            }
            Outcome::Failure { kind, error } => {
                warn!(task_id = %id, kind = kind.as_str(), %error, "task failed");
            }
        }
        Ok(())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
