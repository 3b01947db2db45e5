//! Impls - `TaskStore` の実装
//!
//! - `SqliteTaskStore`: 永続, プロセスをまたいで安全
//! - `PostgresTaskStore`: 永続, 複数ホストの worker で共有
//! - `MemoryTaskStore`: プロセス内, テスト・組み込み用

pub mod memory_store;
pub mod postgres_store;
pub mod sqlite_store;

use std::sync::Arc;

pub use self::memory_store::MemoryTaskStore;
pub use self::postgres_store::PostgresTaskStore;
pub use self::sqlite_store::SqliteTaskStore;

use crate::config::{DatabaseConfig, DatabaseLocation};
use crate::error::ConfigError;
use crate::ports::TaskStore;

/// Open the store `config.url` names: PostgreSQL for `postgres://` urls,
/// SQLite for everything else.
pub async fn connect(config: &DatabaseConfig) -> Result<Arc<dyn TaskStore>, ConfigError> {
    match config.location()? {
        DatabaseLocation::Postgres(_) => Ok(Arc::new(PostgresTaskStore::connect(config).await?)),
        DatabaseLocation::Memory | DatabaseLocation::File(_) => {
            Ok(Arc::new(SqliteTaskStore::open(config)?))
        }
    }
}
