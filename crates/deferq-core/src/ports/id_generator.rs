//! IdGenerator port - worker ID の生成
//!
//! タスク ID は store が振る。worker ID はローカルで生成するので、
//! 各 Scheduler インスタンスは調整なしで claim した行に刻印できる。

use crate::domain::ids::WorkerId;
use crate::ports::Clock;
use ulid::Ulid;

pub trait IdGenerator: Send + Sync {
    fn generate_worker_id(&self) -> WorkerId;
}

/// ULID generator whose timestamp part comes from a `Clock`.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_worker_id(&self) -> WorkerId {
        // pre-epoch clocks pin to 0 instead of wrapping
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        WorkerId::from(ulid)
    }
}
