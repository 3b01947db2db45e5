//! Ports - エンジンと外部の境界（抽象化レイヤー）
//!
//! - `TaskStore`: 永続タスクテーブル（唯一の共有可変リソース）
//! - `Clock`: 時刻
//! - `IdGenerator`: worker ID

pub mod clock;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::TaskStore;
