//! SqliteTaskStore - SQLite 上の永続タスクテーブル
//!
//! - 接続は 1 本を `Arc<Mutex<_>>` で保持し、呼び出しはすべて
//!   `spawn_blocking` 上で実行する（async executor をディスク I/O で止めない）。
//! - タイムスタンプは RFC 3339 UTC テキスト、ナノ秒 9 桁固定。
//!   テキスト比較がそのまま時刻比較になる。
//! - claim は `IMMEDIATE` トランザクション内の `UPDATE ... RETURNING` 1 文。
//!   並行する claimer（スレッドでもプロセスでも）は書き込みロックで
//!   直列化され、各行は `pending` から一度だけ遷移する。
//!
//! # 学習ポイント
//! - 同期 API（rusqlite）を `spawn_blocking` で async trait に載せる
//! - `TransactionBehavior::Immediate` と `RETURNING` によるアトミックな claim

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde_json::Value;
use tracing::debug;

use crate::app::status::StatusCounts;
use crate::config::{DatabaseConfig, DatabaseLocation};
use crate::domain::{ClaimedTask, NewTask, StatusUpdate, TaskId, TaskRecord, TaskStatus, WorkerId};
use crate::error::{ConfigError, StoreError};
use crate::ports::TaskStore;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tasks (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        name            TEXT    NOT NULL,
        scheduled_time  TEXT    NOT NULL,   -- RFC 3339 UTC, nanoseconds
        payload         TEXT    NOT NULL,   -- JSON document, see typed::codec
        status          TEXT    NOT NULL DEFAULT 'pending'
                        CHECK (status IN ('pending', 'in_progress', 'success', 'failure')),
        output          TEXT,
        claimed_by      TEXT,
        start_time      TEXT,
        end_time        TEXT,
        created_at      TEXT    NOT NULL
    );

    -- Due query: WHERE status = 'pending' AND scheduled_time <= ? ORDER BY scheduled_time, id
    CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks (status, scheduled_time, id);
";

const RECORD_COLUMNS: &str = "id, name, scheduled_time, payload, status, output, claimed_by, \
                              start_time, end_time, created_at";

#[derive(Clone)]
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    /// Open the database `config.url` points at.
    ///
    /// Does not create the schema; call `create_schema` (or
    /// `Scheduler::bootstrap`) once before use.
    pub fn open(config: &DatabaseConfig) -> Result<Self, ConfigError> {
        let location = config.location()?;
        let conn = match &location {
            DatabaseLocation::Memory => Connection::open_in_memory(),
            DatabaseLocation::File(path) => Connection::open(path),
            DatabaseLocation::Postgres(_) => {
                return Err(ConfigError::Invalid(format!(
                    "{} is a postgres url; use PostgresTaskStore",
                    config.url
                )));
            }
        }
        .map_err(ConfigError::Open)?;
        conn.busy_timeout(config.busy_timeout())
            .map_err(ConfigError::Open)?;
        if let DatabaseLocation::File(_) = location {
            conn.execute_batch("PRAGMA journal_mode=WAL;")
                .map_err(ConfigError::Open)?;
        }
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, ConfigError> {
        let conn = Connection::open_in_memory().map_err(ConfigError::Open)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Background(format!("{op}: connection lock poisoned")))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| StoreError::Background(format!("{op}: {e}")))?
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create_schema(&self) -> Result<(), StoreError> {
        self.with_conn("create_schema", |conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
    }

    async fn insert(&self, task: NewTask) -> Result<TaskId, StoreError> {
        self.with_conn("insert", move |conn| {
            conn.execute(
                "INSERT INTO tasks (name, scheduled_time, payload, status, created_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4)",
                params![
                    task.name,
                    format_ts(task.scheduled_time),
                    task.payload.to_string(),
                    format_ts(task.created_at),
                ],
            )?;
            Ok(TaskId::new(conn.last_insert_rowid()))
        })
        .await
    }

    async fn select_due(&self, now: DateTime<Utc>) -> Result<Vec<TaskRecord>, StoreError> {
        self.with_conn("select_due", move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM tasks
                 WHERE status = 'pending' AND scheduled_time <= ?1
                 ORDER BY scheduled_time, id"
            ))?;
            let rows = stmt
                .query_map([format_ts(now)], RawRecord::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(RawRecord::into_record).collect()
        })
        .await
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        worker: WorkerId,
        limit: Option<usize>,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        // LIMIT -1 is "no limit" in SQLite.
        let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
        self.with_conn("claim_due", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let raw = {
                let mut stmt = tx.prepare(
                    "UPDATE tasks
                     SET status = 'in_progress', start_time = ?1, claimed_by = ?2
                     WHERE id IN (
                         SELECT id FROM tasks
                         WHERE status = 'pending' AND scheduled_time <= ?1
                         ORDER BY scheduled_time, id
                         LIMIT ?3
                     )
                     AND status = 'pending'
                     RETURNING id, name, scheduled_time, payload",
                )?;
                let rows = stmt
                    .query_map(params![format_ts(now), worker.to_string(), limit], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };

            let mut claimed = raw
                .into_iter()
                .map(|(id, name, scheduled_time, payload)| -> Result<ClaimedTask, StoreError> {
                    Ok(ClaimedTask {
                        id: TaskId::new(id),
                        name,
                        scheduled_time: parse_ts(&scheduled_time)?,
                        payload: parse_payload(payload),
                        start_time: now,
                        claimed_by: worker,
                    })
                })
                .collect::<Result<Vec<_>, StoreError>>()?;
            tx.commit()?;

            // RETURNING does not follow the subquery's ORDER BY.
            claimed.sort_by(|a, b| (a.scheduled_time, a.id).cmp(&(b.scheduled_time, b.id)));
            debug!(count = claimed.len(), worker = %worker, "claim committed");
            Ok(claimed)
        })
        .await
    }

    async fn update_status(&self, id: TaskId, update: StatusUpdate) -> Result<(), StoreError> {
        self.with_conn("update_status", move |conn| {
            let to = update.status;
            if let Some(from) = to.required_predecessor() {
                let changed = conn.execute(
                    "UPDATE tasks
                     SET status = ?1,
                         output = ?2,
                         claimed_by = COALESCE(?3, claimed_by),
                         start_time = COALESCE(?4, start_time),
                         end_time = COALESCE(?5, end_time)
                     WHERE id = ?6 AND status = ?7",
                    params![
                        to.as_str(),
                        update.output,
                        update.claimed_by.map(|w| w.to_string()),
                        update.start_time.map(format_ts),
                        update.end_time.map(format_ts),
                        id.get(),
                        from.as_str(),
                    ],
                )?;
                if changed == 1 {
                    return Ok(());
                }
            }

            let current: Option<String> = conn
                .query_row("SELECT status FROM tasks WHERE id = ?1", [id.get()], |row| {
                    row.get(0)
                })
                .optional()?;
            match current {
                None => Err(StoreError::TaskNotFound(id)),
                Some(s) => Err(StoreError::InvalidTransition {
                    id,
                    from: parse_status(&s)?,
                    to,
                }),
            }
        })
        .await
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.with_conn("get", move |conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {RECORD_COLUMNS} FROM tasks WHERE id = ?1"),
                    [id.get()],
                    RawRecord::from_row,
                )
                .optional()?;
            raw.map(RawRecord::into_record).transpose()
        })
        .await
    }

    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        self.with_conn("counts", |conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut counts = StatusCounts::default();
            for (status, n) in rows {
                counts.add(parse_status(&status)?, usize::try_from(n).unwrap_or(0));
            }
            Ok(counts)
        })
        .await
    }
}

/// Column values as SQLite returns them, before domain parsing.
struct RawRecord {
    id: i64,
    name: String,
    scheduled_time: String,
    payload: String,
    status: String,
    output: Option<String>,
    claimed_by: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    created_at: String,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            scheduled_time: row.get(2)?,
            payload: row.get(3)?,
            status: row.get(4)?,
            output: row.get(5)?,
            claimed_by: row.get(6)?,
            start_time: row.get(7)?,
            end_time: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<TaskRecord, StoreError> {
        Ok(TaskRecord {
            id: TaskId::new(self.id),
            name: self.name,
            scheduled_time: parse_ts(&self.scheduled_time)?,
            payload: parse_payload(self.payload),
            status: parse_status(&self.status)?,
            output: self.output,
            claimed_by: self.claimed_by,
            start_time: self.start_time.as_deref().map(parse_ts).transpose()?,
            end_time: self.end_time.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

/// Always nine fractional digits: lexical order of the text is time order
/// and nothing is lost on the way back.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

fn parse_status(raw: &str) -> Result<TaskStatus, StoreError> {
    raw.parse().map_err(StoreError::Corrupt)
}

/// Text that is not JSON is kept as a JSON string, which the codec then
/// rejects as malformed. A bad row fails its own task instead of the claim.
fn parse_payload(raw: String) -> Value {
    match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(_) => Value::String(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use std::collections::HashSet;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn worker() -> WorkerId {
        WorkerId::from_ulid(Ulid::new())
    }

    fn new_task(name: &str, at: DateTime<Utc>) -> NewTask {
        NewTask {
            name: name.to_string(),
            scheduled_time: at,
            payload: json!({ "version": 1, "handler": "test.double.v1" }),
            created_at: t0() - Duration::hours(1),
        }
    }

    async fn store() -> SqliteTaskStore {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        store.create_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn create_schema_is_idempotent() {
        let store = store().await;
        store.insert(new_task("a", t0())).await.unwrap();
        store.create_schema().await.unwrap();
        store.create_schema().await.unwrap();
        assert_eq!(store.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn insert_assigns_increasing_ids_and_pending_status() {
        let store = store().await;
        let a = store.insert(new_task("a", t0())).await.unwrap();
        let b = store.insert(new_task("b", t0())).await.unwrap();
        assert!(a < b);

        let record = store.get(a).await.unwrap().unwrap();
        assert_eq!(record.name, "a");
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.scheduled_time, t0());
        assert_eq!(record.payload["handler"], "test.double.v1");
        assert_eq!(record.output, None);
        assert_eq!(record.start_time, None);
        assert_eq!(record.claimed_by, None);
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let store = store().await;
        assert!(store.get(TaskId::new(99)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn select_due_orders_by_time_then_id() {
        let store = store().await;
        let late = store.insert(new_task("late", t0())).await.unwrap();
        let early = store
            .insert(new_task("early", t0() - Duration::minutes(5)))
            .await
            .unwrap();
        let tie = store.insert(new_task("tie", t0())).await.unwrap();
        store
            .insert(new_task("future", t0() + Duration::seconds(1)))
            .await
            .unwrap();

        let due: Vec<TaskId> = store
            .select_due(t0())
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(due, vec![early, late, tie]);

        // read-only
        assert_eq!(store.counts().await.unwrap().pending, 4);
    }

    #[tokio::test]
    async fn claim_moves_due_rows_to_in_progress() {
        let store = store().await;
        let w = worker();
        let due = store.insert(new_task("due", t0())).await.unwrap();
        let future = store
            .insert(new_task("future", t0() + Duration::hours(1)))
            .await
            .unwrap();

        let claimed = store.claim_due(t0(), w, None).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due);
        assert_eq!(claimed[0].claimed_by, w);
        assert_eq!(claimed[0].start_time, t0());

        let record = store.get(due).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::InProgress);
        assert_eq!(record.start_time, Some(t0()));
        assert_eq!(record.claimed_by, Some(w.to_string()));

        let record = store.get(future).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.start_time, None);

        // a second claim at the same instant finds nothing
        assert!(store.claim_due(t0(), worker(), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sub_microsecond_future_is_not_due() {
        let store = store().await;
        let at = t0() + Duration::nanoseconds(500);
        let id = store.insert(new_task("soon", at)).await.unwrap();

        assert!(store.select_due(t0()).await.unwrap().is_empty());
        assert!(store.claim_due(t0(), worker(), None).await.unwrap().is_empty());
        assert_eq!(store.get(id).await.unwrap().unwrap().scheduled_time, at);

        let claimed = store.claim_due(at, worker(), None).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].scheduled_time, at);
    }

    #[test]
    fn timestamps_are_fixed_width() {
        assert_eq!(format_ts(t0()), "2024-01-01T12:00:00.000000000Z");
        let later = t0() + Duration::nanoseconds(1);
        assert!(format_ts(t0()) < format_ts(later));
        assert_eq!(parse_ts(&format_ts(later)).unwrap(), later);
    }

    #[tokio::test]
    async fn claim_respects_limit_and_order() {
        let store = store().await;
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(
                store
                    .insert(new_task(&format!("t{i}"), t0() - Duration::minutes(5 - i)))
                    .await
                    .unwrap(),
            );
        }

        let first = store.claim_due(t0(), worker(), Some(2)).await.unwrap();
        let rest = store.claim_due(t0(), worker(), None).await.unwrap();

        let first: Vec<TaskId> = first.into_iter().map(|c| c.id).collect();
        let rest: Vec<TaskId> = rest.into_iter().map(|c| c.id).collect();
        assert_eq!(first, ids[..2].to_vec());
        assert_eq!(rest, ids[2..].to_vec());
    }

    #[tokio::test]
    async fn terminal_rows_are_frozen() {
        let store = store().await;
        let id = store.insert(new_task("a", t0())).await.unwrap();
        store.claim_due(t0(), worker(), None).await.unwrap();

        store
            .update_status(id, StatusUpdate::success(Some("10".into()), t0()))
            .await
            .unwrap();

        let err = store
            .update_status(id, StatusUpdate::failure("late", t0()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: TaskStatus::Success,
                to: TaskStatus::Failure,
                ..
            }
        ));

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Success);
        assert_eq!(record.output.as_deref(), Some("10"));
        assert_eq!(record.end_time, Some(t0()));
        assert!(record.start_time.is_some());
    }

    #[tokio::test]
    async fn pending_cannot_skip_in_progress() {
        let store = store().await;
        let id = store.insert(new_task("a", t0())).await.unwrap();
        let err = store
            .update_status(id, StatusUpdate::success(None, t0()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: TaskStatus::Pending,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn update_unknown_task_is_not_found() {
        let store = store().await;
        let err = store
            .update_status(TaskId::new(7), StatusUpdate::claim(t0(), worker()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TaskNotFound(id) if id == TaskId::new(7)));
    }

    #[tokio::test]
    async fn counts_group_by_status() {
        let store = store().await;
        let a = store.insert(new_task("a", t0())).await.unwrap();
        let b = store.insert(new_task("b", t0())).await.unwrap();
        store
            .insert(new_task("c", t0() + Duration::hours(1)))
            .await
            .unwrap();
        store.claim_due(t0(), worker(), None).await.unwrap();
        store
            .update_status(a, StatusUpdate::success(None, t0()))
            .await
            .unwrap();
        store
            .update_status(b, StatusUpdate::failure("boom", t0()))
            .await
            .unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(
            counts,
            StatusCounts {
                pending: 1,
                in_progress: 0,
                success: 1,
                failure: 1,
            }
        );
    }

    #[tokio::test]
    async fn non_json_payload_survives_the_claim() {
        let store = store().await;
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO tasks (name, scheduled_time, payload, created_at)
                 VALUES ('legacy', ?1, 'gASVAAAA', ?1)",
                [format_ts(t0())],
            )
            .unwrap();
        }
        let claimed = store.claim_due(t0(), worker(), None).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].payload, json!("gASVAAAA"));
    }

    #[tokio::test]
    async fn file_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("tasks.db").display()),
            ..DatabaseConfig::default()
        };

        let id = {
            let store = SqliteTaskStore::open(&config).unwrap();
            store.create_schema().await.unwrap();
            store.insert(new_task("kept", t0())).await.unwrap()
        };

        let store = SqliteTaskStore::open(&config).unwrap();
        store.create_schema().await.unwrap();
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.name, "kept");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claimers_never_share_a_task() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("tasks.db").display()),
            busy_timeout_ms: 10_000,
            ..DatabaseConfig::default()
        };

        let seed = SqliteTaskStore::open(&config).unwrap();
        seed.create_schema().await.unwrap();
        for i in 0..200 {
            seed.insert(new_task(&format!("t{i}"), t0())).await.unwrap();
        }

        // separate connections, as separate processes would have
        let mut joins = Vec::new();
        for _ in 0..4 {
            let store = SqliteTaskStore::open(&config).unwrap();
            joins.push(tokio::spawn(async move {
                let w = WorkerId::from_ulid(Ulid::new());
                let mut mine = Vec::new();
                loop {
                    let batch = store.claim_due(t0(), w, Some(7)).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|c| c.id));
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for join in joins {
            for id in join.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "{id} claimed twice");
            }
        }
        assert_eq!(total, 200);
        assert_eq!(seed.counts().await.unwrap().in_progress, 200);
    }
}
