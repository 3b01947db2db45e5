//! MemoryTaskStore - プロセス内のタスクテーブル
//!
//! SQLite 版と同じ契約（順序, アトミックな claim, 遷移ガード）で
//! 永続性だけがない。テストや、永続化を別に持つ組み込み用途向け。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::app::status::StatusCounts;
use crate::domain::{ClaimedTask, NewTask, StatusUpdate, TaskId, TaskRecord, TaskStatus, WorkerId};
use crate::error::StoreError;
use crate::ports::TaskStore;

struct MemoryState {
    /// Keyed by id, so iteration follows insertion order.
    records: BTreeMap<TaskId, TaskRecord>,
    next_id: i64,
}

impl MemoryState {
    fn allocate_id(&mut self) -> TaskId {
        let id = TaskId::new(self.next_id);
        self.next_id += 1;
        id
    }

    fn due(&self, now: DateTime<Utc>) -> Vec<&TaskRecord> {
        let mut due: Vec<&TaskRecord> = self.records.values().filter(|r| r.is_due(now)).collect();
        due.sort_by_key(|r| (r.scheduled_time, r.id));
        due
    }
}

#[derive(Clone)]
pub struct MemoryTaskStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                records: BTreeMap::new(),
                next_id: 1,
            })),
        }
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert(&self, task: NewTask) -> Result<TaskId, StoreError> {
        let mut state = self.state.lock().await;
        let id = state.allocate_id();
        state.records.insert(
            id,
            TaskRecord {
                id,
                name: task.name,
                scheduled_time: task.scheduled_time,
                payload: task.payload,
                status: TaskStatus::Pending,
                output: None,
                claimed_by: None,
                start_time: None,
                end_time: None,
                created_at: task.created_at,
            },
        );
        Ok(id)
    }

    async fn select_due(&self, now: DateTime<Utc>) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.due(now).into_iter().cloned().collect())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        worker: WorkerId,
        limit: Option<usize>,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        // Select and flip under one lock hold.
        let mut state = self.state.lock().await;
        let ids: Vec<TaskId> = state
            .due(now)
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|r| r.id)
            .collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(record) = state.records.get_mut(&id) else {
                continue;
            };
            record.status = TaskStatus::InProgress;
            record.start_time = Some(now);
            record.claimed_by = Some(worker.to_string());
            claimed.push(ClaimedTask {
                id,
                name: record.name.clone(),
                scheduled_time: record.scheduled_time,
                payload: record.payload.clone(),
                start_time: now,
                claimed_by: worker,
            });
        }
        Ok(claimed)
    }

    async fn update_status(&self, id: TaskId, update: StatusUpdate) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(&id)
            .ok_or(StoreError::TaskNotFound(id))?;

        if !record.status.can_transition_to(update.status) {
            return Err(StoreError::InvalidTransition {
                id,
                from: record.status,
                to: update.status,
            });
        }

        record.status = update.status;
        record.output = update.output;
        if let Some(worker) = update.claimed_by {
            record.claimed_by = Some(worker.to_string());
        }
        if let Some(start) = update.start_time {
            record.start_time = Some(start);
        }
        if let Some(end) = update.end_time {
            record.end_time = Some(end);
        }
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records.get(&id).cloned())
    }

    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = StatusCounts::default();
        for record in state.records.values() {
            counts.add(record.status, 1);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn new_task(name: &str, at: DateTime<Utc>) -> NewTask {
        NewTask {
            name: name.to_string(),
            scheduled_time: at,
            payload: json!({}),
            created_at: t0(),
        }
    }

    fn worker() -> WorkerId {
        WorkerId::from_ulid(Ulid::new())
    }

    #[tokio::test]
    async fn claim_orders_by_time_then_id_and_honors_limit() {
        let store = MemoryTaskStore::new();
        let b = store.insert(new_task("b", t0())).await.unwrap();
        let a = store
            .insert(new_task("a", t0() - Duration::minutes(1)))
            .await
            .unwrap();
        let c = store.insert(new_task("c", t0())).await.unwrap();
        store
            .insert(new_task("later", t0() + Duration::minutes(1)))
            .await
            .unwrap();

        let first = store.claim_due(t0(), worker(), Some(2)).await.unwrap();
        assert_eq!(first.iter().map(|t| t.id).collect::<Vec<_>>(), vec![a, b]);

        let rest = store.claim_due(t0(), worker(), None).await.unwrap();
        assert_eq!(rest.iter().map(|t| t.id).collect::<Vec<_>>(), vec![c]);

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.in_progress, 3);
        assert_eq!(counts.pending, 1);
    }

    #[tokio::test]
    async fn select_due_does_not_claim() {
        let store = MemoryTaskStore::new();
        store.insert(new_task("a", t0())).await.unwrap();
        assert_eq!(store.select_due(t0()).await.unwrap().len(), 1);
        assert_eq!(store.select_due(t0()).await.unwrap().len(), 1);
        assert_eq!(store.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn transitions_are_guarded() {
        let store = MemoryTaskStore::new();
        let id = store.insert(new_task("a", t0())).await.unwrap();

        let err = store
            .update_status(id, StatusUpdate::failure("too early", t0()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let w = worker();
        store
            .update_status(id, StatusUpdate::claim(t0(), w))
            .await
            .unwrap();
        store
            .update_status(id, StatusUpdate::failure("boom", t0()))
            .await
            .unwrap();

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failure);
        assert_eq!(record.output.as_deref(), Some("boom"));
        assert_eq!(record.claimed_by, Some(w.to_string()));
        assert_eq!(record.start_time, Some(t0()));
        assert_eq!(record.end_time, Some(t0()));

        let err = store
            .update_status(id, StatusUpdate::success(None, t0()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: TaskStatus::Failure,
                to: TaskStatus::Success,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = MemoryTaskStore::new();
        let err = store
            .update_status(TaskId::new(1), StatusUpdate::success(None, t0()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TaskNotFound(_)));
        assert!(store.get(TaskId::new(1)).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_partition_the_due_set() {
        let store = MemoryTaskStore::new();
        for i in 0..100 {
            store.insert(new_task(&format!("t{i}"), t0())).await.unwrap();
        }

        let mut joins = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            joins.push(tokio::spawn(async move {
                let w = WorkerId::from_ulid(Ulid::new());
                let mut mine = Vec::new();
                loop {
                    let batch = store.claim_due(t0(), w, Some(3)).await.unwrap();
                    if batch.is_empty() {
                        break mine;
                    }
                    mine.extend(batch.into_iter().map(|t| t.id));
                }
            }));
        }

        let mut all = Vec::new();
        for join in joins {
            all.extend(join.await.unwrap());
        }
        assert_eq!(all.len(), 100);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 100, "a task was claimed twice");
    }
}
