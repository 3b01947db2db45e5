//! App - ports を組み合わせたアプリケーション層
//!
//! # コンポーネント
//! - **SchedulerBuilder**: 配線と fail-fast な起動時チェック
//! - **Scheduler**: enqueue / process_due / 参照系
//! - **Executor**: claim 済みタスク → `Outcome` → 終端ステータス
//! - **Driver**: 定期的な `process_due` と graceful shutdown

pub mod builder;
pub mod driver;
pub mod executor;
pub mod scheduler;
pub mod status;

pub use self::builder::{BuildError, SchedulerBuilder};
pub use self::driver::Driver;
pub use self::executor::Executor;
pub use self::scheduler::Scheduler;
pub use self::status::{ProcessReport, StatusCounts};
