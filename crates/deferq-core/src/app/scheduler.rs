//! Scheduler - 公開 API（enqueue, 期限到来タスクの処理, 参照）
//!
//! # `process_due` 1 回の流れ
//! 1. `TaskStore::claim_due` で期限到来の行を一括で `in_progress` にする
//! 2. claim したタスクを Executor で実行（同時実行は最大 `max_concurrency`）
//! 3. 終わったタスクから順に結果を報告
//!
//! タスクの失敗でパスが止まることはない。呼び出し元に返るのは store
//! エラーだけで、それも実行中のタスクをすべて報告し終えてから。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Map;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::builder::SchedulerBuilder;
use super::executor::Executor;
use super::status::{ProcessReport, StatusCounts};
use crate::config::WorkerConfig;
use crate::domain::{NewTask, TaskId, TaskRecord, WorkerId};
use crate::error::{EncodeError, Result, StoreError};
use crate::ports::{Clock, TaskStore};
use crate::typed::{Deferred, HandlerRegistry, PayloadCodec};

/// Scheduler は store・registry・clock を束ねた公開エントリポイント
///
/// `SchedulerBuilder` から作る。`Arc<Scheduler>` にして `Driver` に渡せる。
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    executor: Arc<Executor>,
    clock: Arc<dyn Clock>,
    worker_id: WorkerId,
    config: WorkerConfig,
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    pub(crate) fn from_parts(
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        worker_id: WorkerId,
        config: WorkerConfig,
    ) -> Self {
        let executor = Executor::new(registry).with_timeout(config.task_timeout());
        Self {
            store,
            executor: Arc::new(executor),
            clock,
            worker_id,
            config,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        self.executor.registry()
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Create the task table if needed. Safe on every startup.
    pub async fn bootstrap(&self) -> Result<()> {
        self.store.create_schema().await?;
        debug!("schema ready");
        Ok(())
    }

    /// Persist a call to `handler` to run at `scheduled_time`.
    ///
    /// `context` and `defaults` must serialize to JSON objects (or `()` for
    /// none). Handlers this process has not registered are refused here, so a
    /// typo never reaches the table.
    pub async fn enqueue<C, D>(
        &self,
        name: &str,
        scheduled_time: DateTime<Utc>,
        handler: &str,
        context: &C,
        defaults: &D,
    ) -> Result<TaskId>
    where
        C: Serialize + ?Sized,
        D: Serialize + ?Sized,
    {
        let payload = PayloadCodec::encode(handler, context, defaults)?;
        if !self.registry().contains(handler) {
            return Err(EncodeError::UnknownHandler(handler.to_string()).into());
        }

        let id = self
            .store
            .insert(NewTask {
                name: name.to_string(),
                scheduled_time,
                payload: payload.to_value(),
                created_at: self.clock.now(),
            })
            .await?;
        info!(task_id = %id, %name, %handler, scheduled_time = %scheduled_time, "task enqueued");
        Ok(id)
    }

    /// Typed form of [`enqueue`](Self::enqueue): `args` become the context.
    pub async fn enqueue_typed<T: Deferred>(
        &self,
        name: &str,
        scheduled_time: DateTime<Utc>,
        args: &T,
    ) -> Result<TaskId> {
        self.enqueue(name, scheduled_time, T::NAME, args, &()).await
    }

    pub async fn process_due(&self) -> Result<ProcessReport> {
        self.process_due_at(self.clock.now()).await
    }

    /// Claim every task due at `now`, run them and record their outcomes.
    pub async fn process_due_at(&self, now: DateTime<Utc>) -> Result<ProcessReport> {
        let claimed = self
            .store
            .claim_due(now, self.worker_id, self.config.claim_batch_size)
            .await?;
        let mut report = ProcessReport {
            claimed: claimed.len(),
            ..ProcessReport::default()
        };
        if claimed.is_empty() {
            debug!(worker = %self.worker_id, "nothing due");
            return Ok(report);
        }
        info!(count = claimed.len(), worker = %self.worker_id, "claimed due tasks");

        let permits = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut in_flight = JoinSet::new();
        for task in claimed {
            let executor = Arc::clone(&self.executor);
            let permits = Arc::clone(&permits);
            in_flight.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                debug!(task_id = %task.id, name = %task.name, "invoking");
                let outcome = executor.invoke(&task, &Map::new()).await;
                (task.id, outcome)
            });
        }

        let mut first_error: Option<StoreError> = None;
        while let Some(joined) = in_flight.join_next().await {
            let (id, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "executor task did not finish; its row stays in_progress");
                    continue;
                }
            };
            // never report an end before the claim's start
            let finished = self.clock.now().max(now);
            match self
                .executor
                .report_outcome(self.store.as_ref(), id, &outcome, finished)
                .await
            {
                Ok(()) if outcome.is_success() => report.succeeded += 1,
                Ok(()) => report.failed += 1,
                Err(e) => {
                    error!(task_id = %id, error = %e, "failed to record outcome");
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(
            claimed = report.claimed,
            succeeded = report.succeeded,
            failed = report.failed,
            "pass complete"
        );
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(report),
        }
    }

    pub async fn task(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        Ok(self.store.get(id).await?)
    }

    pub async fn counts(&self) -> Result<StatusCounts> {
        Ok(self.store.counts().await?)
    }
}
