//! deferq-core
//!
//! Durable deferred execution for the deferq queue.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, status 状態遷移, task record, outcome）
//! - **ports**: 抽象化レイヤー（TaskStore, Clock, IdGenerator）
//! - **typed**: 名前付き Handler API（Deferred trait, Handler trait, HandlerRegistry, PayloadCodec）
//! - **impls**: TaskStore 実装（SqliteTaskStore, PostgresTaskStore, MemoryTaskStore）
//! - **app**: アプリケーションロジック（Scheduler, Executor, Driver, SchedulerBuilder）
//! - **config**: `Config` の読み込み
//! - **error**: エラー型

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod typed;

pub use self::app::{BuildError, Driver, ProcessReport, Scheduler, SchedulerBuilder, StatusCounts};
pub use self::config::{Config, DatabaseConfig, WorkerConfig};
pub use self::domain::{Outcome, TaskId, TaskRecord, TaskStatus, WorkerId};
pub use self::error::{Error, Result};
pub use self::impls::{MemoryTaskStore, PostgresTaskStore, SqliteTaskStore};
pub use self::typed::{Deferred, Handler, HandlerRegistry};
