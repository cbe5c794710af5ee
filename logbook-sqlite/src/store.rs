use std::{sync::Arc, time::Duration};

use logbook_core::{
    concurrency::KeyLocks,
    kv::{BatchOp, KeyValueStore, WriteBatch, prefix_upper_bound},
};
use sqlx::{Sqlite, SqlitePool};

use crate::{Error, PoolConfig, pool};

fn unavailable(context: &'static str) -> impl FnOnce(sqlx::Error) -> logbook_core::Error {
    move |source| logbook_core::Error::unavailable(context, source)
}

/// A SQLite-backed [`KeyValueStore`].
///
/// Keys and values are stored as blobs in one table. `SQLite` compares blobs
/// bytewise, so prefix scans follow the same order as the in-memory store.
///
/// # Schema
///
/// Created by [`migrate()`](Self::migrate):
///
/// ```sql
/// CREATE TABLE IF NOT EXISTS logbook_kv (
///     key   BLOB PRIMARY KEY,
///     value BLOB NOT NULL
/// )
/// ```
///
/// Key locks are process-local: run one writer process per database file.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    locks: Arc<KeyLocks>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl Store {
    #[must_use]
    pub fn new(pool: SqlitePool, lock_timeout: Option<Duration>) -> Self {
        Self {
            pool,
            locks: Arc::new(KeyLocks::new(lock_timeout)),
        }
    }

    /// Connect to the database at `url` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if the database cannot be opened or
    /// migrated.
    #[tracing::instrument(skip(config))]
    pub async fn open(url: &str, config: &PoolConfig) -> Result<Self, Error> {
        let pool = pool::connect(url, config).await?;
        let store = Self::new(pool, config.lock_timeout);
        store.migrate().await?;
        tracing::info!("sqlite store opened");
        Ok(store)
    }

    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply the schema (idempotent).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] if the table cannot be created.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), Error> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS logbook_kv (
                key   BLOB PRIMARY KEY,
                value BLOB NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Close every pooled connection. Later calls fail with
    /// [`logbook_core::Error::StoreUnavailable`].
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl KeyValueStore for Store {
    async fn get<'a>(&'a self, key: &'a [u8]) -> Result<Option<Vec<u8>>, logbook_core::Error> {
        sqlx::query_scalar::<Sqlite, Vec<u8>>(r"SELECT value FROM logbook_kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable("reading key"))
    }

    async fn first_key_with_prefix<'a>(&'a self, prefix: &'a [u8]) -> Result<Option<Vec<u8>>, logbook_core::Error> {
        let query = match prefix_upper_bound(prefix) {
            Some(upper) => {
                sqlx::query_scalar::<Sqlite, Vec<u8>>(r"SELECT key FROM logbook_kv WHERE key >= ?1 AND key < ?2 ORDER BY key LIMIT 1")
                    .bind(prefix)
                    .bind(upper)
            }
            None => sqlx::query_scalar::<Sqlite, Vec<u8>>(r"SELECT key FROM logbook_kv WHERE key >= ?1 ORDER BY key LIMIT 1")
                .bind(prefix),
        };
        query
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable("scanning key prefix"))
    }

    #[tracing::instrument(skip(self, batch), fields(ops = batch.len()))]
    async fn write_batch(&self, batch: WriteBatch) -> Result<(), logbook_core::Error> {
        let mut tx = self.pool.begin().await.map_err(unavailable("beginning batch"))?;

        for op in batch {
            let applied = match op {
                BatchOp::Put { key, value } => {
                    sqlx::query(
                        r"
                        INSERT INTO logbook_kv (key, value)
                        VALUES (?1, ?2)
                        ON CONFLICT (key) DO UPDATE SET value = excluded.value
                        ",
                    )
                    .bind(key)
                    .bind(value)
                    .execute(&mut *tx)
                    .await
                }
                BatchOp::Delete { key } => {
                    sqlx::query(r"DELETE FROM logbook_kv WHERE key = ?1")
                        .bind(key)
                        .execute(&mut *tx)
                        .await
                }
                BatchOp::DeletePrefix { prefix } => match prefix_upper_bound(&prefix) {
                    Some(upper) => {
                        sqlx::query(r"DELETE FROM logbook_kv WHERE key >= ?1 AND key < ?2")
                            .bind(prefix)
                            .bind(upper)
                            .execute(&mut *tx)
                            .await
                    }
                    None => {
                        sqlx::query(r"DELETE FROM logbook_kv WHERE key >= ?1")
                            .bind(prefix)
                            .execute(&mut *tx)
                            .await
                    }
                },
            };
            applied.map_err(unavailable("applying batch"))?;
        }

        tx.commit().await.map_err(unavailable("committing batch"))?;
        tracing::trace!("batch applied");
        Ok(())
    }

    fn locks(&self) -> &Arc<KeyLocks> {
        &self.locks
    }
}
