//! In-memory key-value store for tests and light deployments.
//!
//! [`Store`] keeps an ordered map behind an `Arc<RwLock<_>>`; clones share the
//! same data and the same lock registry.
//!
//! ```
//! use logbook_core::kv::inmemory;
//!
//! let store = inmemory::Store::new();
//! assert!(store.is_empty());
//! ```

use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{Arc, RwLock},
    time::Duration,
};

use crate::{
    Error, LogConfig,
    concurrency::KeyLocks,
    kv::{BatchOp, KeyValueStore, WriteBatch, prefix_upper_bound},
};

/// Volatile [`KeyValueStore`].
#[derive(Debug, Clone)]
pub struct Store {
    entries: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
    locks: Arc<KeyLocks>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::with_lock_timeout(None)
    }

    /// Create a store whose key locks give up after `timeout`.
    #[must_use]
    pub fn with_lock_timeout(timeout: Option<Duration>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(BTreeMap::new())),
            locks: Arc::new(KeyLocks::new(timeout)),
        }
    }

    /// Create a store whose key locks honour `config.lock_timeout`.
    #[must_use]
    pub fn from_config(config: &LogConfig) -> Self {
        Self::with_lock_timeout(config.lock_timeout)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().expect("in-memory store lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encoded keys currently stored, in order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("in-memory store lock poisoned")
            .keys()
            .map(|key| String::from_utf8_lossy(key).into_owned())
            .collect()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

fn prefix_range(prefix: &[u8]) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let upper = prefix_upper_bound(prefix).map_or(Bound::Unbounded, Bound::Excluded);
    (Bound::Included(prefix.to_vec()), upper)
}

impl KeyValueStore for Store {
    fn get<'a>(&'a self, key: &'a [u8]) -> impl Future<Output = Result<Option<Vec<u8>>, Error>> + Send + 'a {
        let value = self
            .entries
            .read()
            .expect("in-memory store lock poisoned")
            .get(key)
            .cloned();
        std::future::ready(Ok(value))
    }

    fn first_key_with_prefix<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> impl Future<Output = Result<Option<Vec<u8>>, Error>> + Send + 'a {
        let first = self
            .entries
            .read()
            .expect("in-memory store lock poisoned")
            .range(prefix_range(prefix))
            .next()
            .map(|(key, _)| key.clone());
        std::future::ready(Ok(first))
    }

    #[tracing::instrument(skip(self, batch), fields(ops = batch.len()))]
    fn write_batch(&self, batch: WriteBatch) -> impl Future<Output = Result<(), Error>> + Send + '_ {
        let mut entries = self.entries.write().expect("in-memory store lock poisoned");
        for op in batch {
            match op {
                BatchOp::Put { key, value } => {
                    entries.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    entries.remove(&key);
                }
                BatchOp::DeletePrefix { prefix } => {
                    let doomed: Vec<Vec<u8>> =
                        entries.range(prefix_range(&prefix)).map(|(key, _)| key.clone()).collect();
                    for key in doomed {
                        entries.remove(&key);
                    }
                }
            }
        }
        drop(entries);
        tracing::trace!("batch applied");
        std::future::ready(Ok(()))
    }

    fn locks(&self) -> &Arc<KeyLocks> {
        &self.locks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_comes_from_config() {
        let config = LogConfig::default().with_lock_timeout(Some(Duration::from_millis(250)));
        let store = Store::from_config(&config);
        assert_eq!(store.locks().timeout(), Some(Duration::from_millis(250)));
        assert_eq!(Store::new().locks().timeout(), None);
    }

    #[tokio::test]
    async fn batch_puts_and_deletes() {
        let store = Store::new();
        let mut batch = WriteBatch::new();
        batch.put("a", "1").put("b", "2").delete("a");
        store.write_batch(batch).await.unwrap();

        assert_eq!(store.get(b"a").await.unwrap(), None);
        assert_eq!(store.get(b"b").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn prefix_queries_are_bounded() {
        let store = Store::new();
        let mut batch = WriteBatch::new();
        batch.put("ES_J:1", "x").put("ES_J:2", "y").put("ES_R:s:1", "1").put("ES_K", "z");
        store.write_batch(batch).await.unwrap();

        assert_eq!(
            store.first_key_with_prefix(b"ES_J:").await.unwrap(),
            Some(b"ES_J:1".to_vec())
        );
        assert_eq!(store.first_key_with_prefix(b"ES_X:").await.unwrap(), None);

        let mut purge = WriteBatch::new();
        purge.delete_prefix("ES_J:");
        store.write_batch(purge).await.unwrap();
        assert_eq!(store.keys(), vec!["ES_K".to_string(), "ES_R:s:1".to_string()]);
    }

    #[tokio::test]
    async fn clones_share_entries_and_locks() {
        let store = Store::new();
        let clone = store.clone();
        let mut batch = WriteBatch::new();
        batch.put("k", "v");
        clone.write_batch(batch).await.unwrap();

        assert_eq!(store.len(), 1);
        assert!(Arc::ptr_eq(store.locks(), clone.locks()));
    }
}
