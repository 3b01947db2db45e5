//! Configuration (deferq.toml + DEFERQ_* env overrides + DATABASE_URL).
//!
//! The library never discovers configuration on its own: callers build a
//! [`Config`] (usually through [`Config::load`]) and pass it to the store and
//! scheduler constructors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "deferq.toml";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://deferq.db";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    /// How long a connection waits on a locked database (SQLite) or for a
    /// pooled connection (PostgreSQL) before giving up.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// PostgreSQL pool size. SQLite always uses one connection.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Seconds between driver ticks.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Claimed tasks executing at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Upper bound on tasks claimed per pass. `None` claims everything due.
    #[serde(default)]
    pub claim_batch_size: Option<usize>,
    /// Per-task execution limit. `None` lets handlers run indefinitely.
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            claim_batch_size: None,
            task_timeout_secs: None,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }
}

/// Which database `url` names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    /// SQLite, in memory.
    Memory,
    /// SQLite file.
    File(PathBuf),
    /// PostgreSQL server; the full connection url.
    Postgres(String),
}

impl DatabaseConfig {
    /// Parse `url` into a location.
    ///
    /// Accepts `postgres://` / `postgresql://` urls, `sqlite::memory:`,
    /// `sqlite://<path>`, `sqlite:<path>` and bare paths.
    pub fn location(&self) -> Result<DatabaseLocation, ConfigError> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(ConfigError::MissingDatabaseUrl);
        }
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            return Ok(DatabaseLocation::Postgres(url.to_string()));
        }
        if url == ":memory:" || url == "sqlite::memory:" || url == "sqlite://:memory:" {
            return Ok(DatabaseLocation::Memory);
        }
        let path = if let Some(rest) = url.strip_prefix("sqlite://") {
            rest
        } else if let Some(rest) = url.strip_prefix("sqlite:") {
            rest
        } else if url.contains("://") {
            return Err(ConfigError::UnsupportedScheme(url.to_string()));
        } else {
            url
        };
        if path.is_empty() {
            return Err(ConfigError::MissingDatabaseUrl);
        }
        Ok(DatabaseLocation::File(PathBuf::from(path)))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.location()?;
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load from `path` (or `deferq.toml` if it exists), then `DEFERQ_*`
    /// variables (`__` separates nesting levels), then `DATABASE_URL`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        match path {
            Some(p) if !p.is_file() => {
                return Err(ConfigError::Invalid(format!(
                    "config file {} does not exist",
                    p.display()
                )));
            }
            Some(p) => figment = figment.merge(Toml::file(p)),
            None => figment = figment.merge(Toml::file(DEFAULT_CONFIG_FILE)),
        }
        let config: Config = figment
            .merge(Env::prefixed("DEFERQ_").split("__"))
            .merge(
                Env::raw()
                    .only(&["DATABASE_URL"])
                    .map(|_| "database.url".into()),
            )
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Config pointing at an in-memory database; handy for tests and demos.
    pub fn in_memory() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite::memory:".to_string(),
                ..DatabaseConfig::default()
            },
            worker: WorkerConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate()?;
        self.worker.validate()
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "worker.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "worker.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.claim_batch_size == Some(0) {
            return Err(ConfigError::Invalid(
                "worker.claim_batch_size must be at least 1 when set".to_string(),
            ));
        }
        if self.task_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "worker.task_timeout_secs must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn db(url: &str) -> DatabaseConfig {
        DatabaseConfig {
            url: url.to_string(),
            ..DatabaseConfig::default()
        }
    }

    #[rstest]
    #[case("sqlite::memory:", DatabaseLocation::Memory)]
    #[case(":memory:", DatabaseLocation::Memory)]
    #[case("sqlite://tasks.db", DatabaseLocation::File(PathBuf::from("tasks.db")))]
    #[case("sqlite:///var/lib/tasks.db", DatabaseLocation::File(PathBuf::from("/var/lib/tasks.db")))]
    #[case("sqlite:tasks.db", DatabaseLocation::File(PathBuf::from("tasks.db")))]
    #[case("data/tasks.db", DatabaseLocation::File(PathBuf::from("data/tasks.db")))]
    #[case(
        "postgres://user:pw@localhost/app",
        DatabaseLocation::Postgres("postgres://user:pw@localhost/app".to_string())
    )]
    #[case(
        "postgresql://localhost/app",
        DatabaseLocation::Postgres("postgresql://localhost/app".to_string())
    )]
    fn parses_database_locations(#[case] url: &str, #[case] expected: DatabaseLocation) {
        assert_eq!(db(url).location().unwrap(), expected);
    }

    #[test]
    fn rejects_foreign_schemes() {
        let err = db("mysql://user:pw@localhost/app").location().unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedScheme(_)));
    }

    #[test]
    fn rejects_empty_url() {
        assert!(matches!(
            db("  ").location().unwrap_err(),
            ConfigError::MissingDatabaseUrl
        ));
        assert!(matches!(
            db("sqlite://").location().unwrap_err(),
            ConfigError::MissingDatabaseUrl
        ));
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.worker.max_concurrency, DEFAULT_MAX_CONCURRENCY);
        assert_eq!(config.database.url, DEFAULT_DATABASE_URL);
        assert_eq!(config.worker.task_timeout(), None);
    }

    #[test]
    fn zero_concurrency_is_invalid() {
        let mut config = Config::in_memory();
        config.worker.max_concurrency = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_pool_size_is_invalid() {
        let mut config = Config::in_memory();
        config.database.max_connections = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn loads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deferq.toml");
        std::fs::write(
            &path,
            r#"
            [database]
            url = "sqlite://queue.db"

            [worker]
            max_concurrency = 2
            task_timeout_secs = 30
            "#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.worker.max_concurrency, 2);
        assert_eq!(config.worker.task_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.worker.poll_interval_secs, DEFAULT_POLL_INTERVAL_SECS);
        assert_eq!(config.database.busy_timeout_ms, DEFAULT_BUSY_TIMEOUT_MS);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
