//! TaskStore port - 永続タスクテーブル（source of truth）
//!
//! executor 間で共有される状態は store だけなので、worker をまたぐ
//! 保証はすべてここにある:
//! - `claim_due` はアトミック。1 行が渡る先は高々 1 つ。
//! - `update_status` は状態遷移に従わない書き込みを拒否する
//!   （終端行は凍結される）。
//!
//! # 学習ポイント
//! - `#[async_trait]` による object-safe な async trait
//! - `Arc<dyn TaskStore>` で実装を差し替える

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::app::status::StatusCounts;
use crate::domain::{ClaimedTask, NewTask, StatusUpdate, TaskId, TaskRecord, WorkerId};
use crate::error::StoreError;

/// TaskStore はタスクテーブルの正本
///
/// # 実装
/// - `SqliteTaskStore` / `PostgresTaskStore`: 永続
/// - `MemoryTaskStore`: テスト用
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Ensure the task table exists. Safe to call on every startup.
    async fn create_schema(&self) -> Result<(), StoreError>;

    /// Persist a new `pending` task.
    async fn insert(&self, task: NewTask) -> Result<TaskId, StoreError>;

    /// Pending tasks with `scheduled_time <= now`, earliest first, ties by id.
    /// Read-only.
    async fn select_due(&self, now: DateTime<Utc>) -> Result<Vec<TaskRecord>, StoreError>;

    /// Atomically move due pending tasks to `in_progress` and return them,
    /// earliest first. `limit` caps the batch; `None` claims all due tasks.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        worker: WorkerId,
        limit: Option<usize>,
    ) -> Result<Vec<ClaimedTask>, StoreError>;

    /// Apply one status write. Fails with `InvalidTransition` unless the row
    /// currently holds `update.status.required_predecessor()`.
    async fn update_status(&self, id: TaskId, update: StatusUpdate) -> Result<(), StoreError>;

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    async fn counts(&self) -> Result<StatusCounts, StoreError>;
}
