//! SchedulerBuilder - 配線と起動時チェック
//!
//! 何時間も後に失敗タスクとして表面化する問題を `build()` で止める:
//! - Handler 名の重複（`register` 時点）
//! - デプロイが期待しているのに登録されていない Handler
//! - 動かない worker 設定（concurrency 0 など）
//!
//! # 学習ポイント
//! - `Result<Self, E>` を返す builder メソッドと `?` チェーン
//! - `Option<Arc<dyn Trait>>` による必須依存の検出

use std::sync::Arc;

use serde_json::{Map, Value};

use super::scheduler::Scheduler;
use crate::config::WorkerConfig;
use crate::domain::WorkerId;
use crate::error::{ConfigError, ExecutionError};
use crate::ports::{Clock, IdGenerator, SystemClock, TaskStore, UlidGenerator};
use crate::typed::{Deferred, DynHandler, Handler, HandlerRegistry, RegistryError};

/// # Example
/// ```ignore
/// let scheduler = Scheduler::builder()
///     .register::<SendInvoice, _>(SendInvoiceHandler)?
///     .expect_handlers(&["billing.send_invoice.v1"])
///     .store(impls::connect(&config.database).await?)
///     .config(config.worker)
///     .build()?;
/// ```
pub struct SchedulerBuilder {
    registry: HandlerRegistry,
    expected_handlers: Option<Vec<String>>,
    store: Option<Arc<dyn TaskStore>>,
    clock: Option<Arc<dyn Clock>>,
    worker_id: Option<WorkerId>,
    config: WorkerConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing handlers: {0:?}. These handlers were expected but not registered.")]
    MissingHandlers(Vec<String>),

    #[error("no task store configured")]
    MissingStore,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            expected_handlers: None,
            store: None,
            clock: None,
            worker_id: None,
            config: WorkerConfig::default(),
        }
    }

    pub fn register<T: Deferred, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    pub fn register_fn<F>(mut self, name: &str, f: F) -> Result<Self, RegistryError>
    where
        F: Fn(Map<String, Value>) -> Result<Value, ExecutionError> + Send + Sync + 'static,
    {
        self.registry.register_fn(name, f)?;
        Ok(self)
    }

    pub fn register_dyn(mut self, handler: Arc<dyn DynHandler>) -> Result<Self, RegistryError> {
        self.registry.register_dyn(handler)?;
        Ok(self)
    }

    /// Handler names that must be registered by the time `build()` runs.
    pub fn expect_handlers(mut self, names: &[&str]) -> Self {
        self.expected_handlers = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to `SystemClock`.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to a fresh ULID.
    pub fn worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Scheduler, BuildError> {
        if let Some(expected) = &self.expected_handlers {
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !self.registry.contains(name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingHandlers(missing));
            }
        }
        self.config.validate()?;
        let store = self.store.ok_or(BuildError::MissingStore)?;
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let worker_id = self
            .worker_id
            .unwrap_or_else(|| UlidGenerator::new(Arc::clone(&clock)).generate_worker_id());

        Ok(Scheduler::from_parts(
            store,
            Arc::new(self.registry),
            clock,
            worker_id,
            self.config,
        ))
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
