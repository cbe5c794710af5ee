//! Connection pool setup.
//!
//! The database runs in WAL mode so readers never block the writer. Writes
//! that collide wait up to the busy timeout instead of failing.

use std::{str::FromStr, time::Duration};

use logbook_core::LogConfig;
use serde::{Deserialize, Serialize};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
};

/// Configuration for the store's connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum open connections (default: 4)
    pub max_connections: u32,
    /// Busy timeout in milliseconds (default: 5000)
    pub busy_timeout_ms: u64,
    /// Connection acquire timeout in seconds (default: 30)
    pub acquire_timeout_secs: u64,
    /// Page cache size; negative values are KiB (default: 16MB)
    pub cache_size_kib: i32,
    /// Create the database file if it does not exist (default: true)
    pub create_if_missing: bool,
    /// How long a unit of work waits for a key lock; `None` waits forever
    pub lock_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            busy_timeout_ms: 5000,
            acquire_timeout_secs: 30,
            cache_size_kib: -16000,
            create_if_missing: true,
            lock_timeout: None,
        }
    }
}

/// Pool defaults with the log's key lock timeout.
impl From<&LogConfig> for PoolConfig {
    fn from(config: &LogConfig) -> Self {
        Self {
            lock_timeout: config.lock_timeout,
            ..Self::default()
        }
    }
}

/// Open a pool on the database at `url`.
///
/// # Errors
///
/// Returns a `sqlx::Error` if the url is invalid or the database cannot be
/// opened.
#[tracing::instrument(skip(config))]
pub async fn connect(url: &str, config: &PoolConfig) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(config.create_if_missing)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .pragma("cache_size", config.cache_size_kib.to_string())
        .pragma("temp_store", "MEMORY");

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect_with(options)
        .await?;

    tracing::debug!(max_connections = config.max_connections, "sqlite pool created");
    Ok(pool)
}
