//! PostgresTaskStore - PostgreSQL 上の永続タスクテーブル
//!
//! - claim は `UPDATE ... RETURNING` 1 文。対象行の選択に
//!   `FOR UPDATE SKIP LOCKED` を使うので、並行する worker は互いの行を
//!   待たずに backlog を分け合う。
//! - `TIMESTAMPTZ` はマイクロ秒精度。`scheduled_time` は insert 時に
//!   マイクロ秒単位へ切り上げ、bind する `now` は切り捨てられるので、
//!   予定時刻より前に claim されることはない。
//!
//! # 学習ポイント
//! - `sqlx::PgPool` とランタイムクエリ（`query` / `query_scalar` / `query_as`）
//! - 行ロック + skip-on-contention による分散 claim

use async_trait::async_trait;
use chrono::{DateTime, Duration, Timelike, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use tracing::debug;

use crate::app::status::StatusCounts;
use crate::config::{DatabaseConfig, DatabaseLocation};
use crate::domain::{ClaimedTask, NewTask, StatusUpdate, TaskId, TaskRecord, TaskStatus, WorkerId};
use crate::error::{ConfigError, StoreError};
use crate::ports::TaskStore;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tasks (
        id              BIGSERIAL   PRIMARY KEY,
        name            TEXT        NOT NULL,
        scheduled_time  TIMESTAMPTZ NOT NULL,
        payload         JSONB       NOT NULL,
        status          TEXT        NOT NULL DEFAULT 'pending'
                        CHECK (status IN ('pending', 'in_progress', 'success', 'failure')),
        output          TEXT,
        claimed_by      TEXT,
        start_time      TIMESTAMPTZ,
        end_time        TIMESTAMPTZ,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks (status, scheduled_time, id);
";

const RECORD_COLUMNS: &str = "id, name, scheduled_time, payload, status, output, claimed_by, \
                              start_time, end_time, created_at";

#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    /// Connect a pool to the server `config.url` points at.
    ///
    /// Does not create the schema; call `create_schema` (or
    /// `Scheduler::bootstrap`) once before use.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, ConfigError> {
        let DatabaseLocation::Postgres(url) = config.location()? else {
            return Err(ConfigError::Invalid(format!(
                "{} is not a postgres url; use SqliteTaskStore",
                config.url
            )));
        };
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.busy_timeout())
            .connect(&url)
            .await
            .map_err(ConfigError::Connect)?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn create_schema(&self) -> Result<(), StoreError> {
        // several statements: simple query protocol
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert(&self, task: NewTask) -> Result<TaskId, StoreError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO tasks (name, scheduled_time, payload, status, created_at)
             VALUES ($1, $2, $3, 'pending', $4)
             RETURNING id",
        )
        .bind(&task.name)
        .bind(ceil_to_micros(task.scheduled_time))
        .bind(&task.payload)
        .bind(task.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(TaskId::new(id))
    }

    async fn select_due(&self, now: DateTime<Utc>) -> Result<Vec<TaskRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM tasks
             WHERE status = 'pending' AND scheduled_time <= $1
             ORDER BY scheduled_time, id"
        );
        let rows = sqlx::query(&sql).bind(now).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        worker: WorkerId,
        limit: Option<usize>,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        // LIMIT NULL is "no limit" in PostgreSQL.
        let limit = limit.map(|n| i64::try_from(n).unwrap_or(i64::MAX));
        let rows = sqlx::query(
            "UPDATE tasks
             SET status = 'in_progress', start_time = $1, claimed_by = $2
             WHERE id IN (
                 SELECT id FROM tasks
                 WHERE status = 'pending' AND scheduled_time <= $1
                 ORDER BY scheduled_time, id
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED
             )
             AND status = 'pending'
             RETURNING id, name, scheduled_time, payload",
        )
        .bind(now)
        .bind(worker.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = rows
            .iter()
            .map(|row| -> Result<ClaimedTask, StoreError> {
                Ok(ClaimedTask {
                    id: TaskId::new(row.try_get("id")?),
                    name: row.try_get("name")?,
                    scheduled_time: row.try_get("scheduled_time")?,
                    payload: row.try_get("payload")?,
                    start_time: now,
                    claimed_by: worker,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not follow the subquery's ORDER BY.
        claimed.sort_by(|a, b| (a.scheduled_time, a.id).cmp(&(b.scheduled_time, b.id)));
        debug!(count = claimed.len(), worker = %worker, "claim committed");
        Ok(claimed)
    }

    async fn update_status(&self, id: TaskId, update: StatusUpdate) -> Result<(), StoreError> {
        let to = update.status;
        if let Some(from) = to.required_predecessor() {
            let result = sqlx::query(
                "UPDATE tasks
                 SET status = $1,
                     output = $2,
                     claimed_by = COALESCE($3, claimed_by),
                     start_time = COALESCE($4, start_time),
                     end_time = COALESCE($5, end_time)
                 WHERE id = $6 AND status = $7",
            )
            .bind(to.as_str())
            .bind(update.output)
            .bind(update.claimed_by.map(|w| w.to_string()))
            .bind(update.start_time)
            .bind(update.end_time)
            .bind(id.get())
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 1 {
                return Ok(());
            }
        }

        let current: Option<String> = sqlx::query_scalar("SELECT status FROM tasks WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        match current {
            None => Err(StoreError::TaskNotFound(id)),
            Some(s) => Err(StoreError::InvalidTransition {
                id,
                from: parse_status(&s)?,
                to,
            }),
        }
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM tasks WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            counts.add(parse_status(&status)?, usize::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }
}

fn record_from_row(row: &PgRow) -> Result<TaskRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let payload: Value = row.try_get("payload")?;
    Ok(TaskRecord {
        id: TaskId::new(row.try_get("id")?),
        name: row.try_get("name")?,
        scheduled_time: row.try_get("scheduled_time")?,
        payload,
        status: parse_status(&status)?,
        output: row.try_get("output")?,
        claimed_by: row.try_get("claimed_by")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_status(raw: &str) -> Result<TaskStatus, StoreError> {
    raw.parse().map_err(StoreError::Corrupt)
}

/// Smallest microsecond-aligned instant not before `ts`.
fn ceil_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    let sub_micro = ts.nanosecond() % 1_000;
    if sub_micro == 0 {
        ts
    } else {
        ts + Duration::nanoseconds(i64::from(1_000 - sub_micro))
    }
}
