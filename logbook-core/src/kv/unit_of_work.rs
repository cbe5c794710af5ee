use std::collections::{BTreeSet, HashMap};

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    Error,
    concurrency::KeyGuard,
    kv::{Key, KeyValueStore, WriteBatch},
};

/// A batched, lockable set of pending writes against a [`KeyValueStore`].
///
/// Writes are buffered and become visible to other readers only when
/// [`commit`](Self::commit) applies them as one atomic batch. Reads see the
/// unit's own pending writes first.
///
/// Locks are advisory and reentrant within a unit: locking the same key twice
/// holds it once. Every lock is released exactly once, when the unit is
/// committed, rolled back or dropped.
///
/// A unit is an explicit handle. Code that must take part in a caller's
/// transaction receives `&mut UnitOfWork` instead of starting its own.
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use logbook_core::kv::{Key, UnitOfWork, inmemory};
///
/// let store = inmemory::Store::new();
/// let key = Key::new("counter").unwrap();
///
/// let mut uow = UnitOfWork::start(&store);
/// uow.lock(&key.encoded()).await.unwrap();
/// uow.write(&key, &7_u32).unwrap();
/// uow.commit().await.unwrap();
///
/// let uow = UnitOfWork::start(&store);
/// assert_eq!(uow.read::<u32>(&key).await.unwrap(), Some(7));
/// # }
/// ```
#[derive(Debug)]
pub struct UnitOfWork<S: KeyValueStore> {
    store: S,
    batch: WriteBatch,
    pending: HashMap<Vec<u8>, Option<Vec<u8>>>,
    references: HashMap<String, BTreeSet<String>>,
    guards: HashMap<String, KeyGuard>,
}

impl<S: KeyValueStore> UnitOfWork<S> {
    /// Begin a unit of work against `store`.
    #[must_use]
    pub fn start(store: &S) -> Self {
        Self {
            store: store.clone(),
            batch: WriteBatch::new(),
            pending: HashMap::new(),
            references: HashMap::new(),
            guards: HashMap::new(),
        }
    }

    /// The store this unit writes to.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Take the advisory lock on `key` until commit or rollback.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the store's lock registry has a
    /// timeout and the lock is not granted in time.
    pub async fn lock(&mut self, key: &str) -> Result<(), Error> {
        if self.guards.contains_key(key) {
            return Ok(());
        }
        let guard = self.store.locks().acquire(key).await?;
        self.guards.insert(key.to_owned(), guard);
        Ok(())
    }

    /// Whether this unit currently holds the lock on `key`.
    #[must_use]
    pub fn holds_lock(&self, key: &str) -> bool {
        self.guards.contains_key(key)
    }

    /// Buffer a serialized write of `value` under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if `value` cannot be serialized.
    pub fn write<T: Serialize + ?Sized>(&mut self, key: &Key, value: &T) -> Result<(), Error> {
        let bytes = serde_json::to_vec(value).map_err(Error::Serialization)?;
        self.write_bytes(key.to_bytes(), bytes);
        Ok(())
    }

    /// Buffer a raw write.
    pub fn write_bytes(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.batch.put(key.clone(), value.clone());
        self.pending.insert(key, Some(value));
    }

    /// Buffer removal of `key`.
    pub fn remove(&mut self, key: &Key) {
        self.remove_bytes(key.to_bytes());
    }

    /// Buffer removal of a raw key.
    pub fn remove_bytes(&mut self, key: Vec<u8>) {
        self.batch.delete(key.clone());
        self.pending.insert(key, None);
    }

    /// Read and deserialize the value under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] on backend failure or
    /// [`Error::Deserialization`] if the stored bytes do not match `T`.
    pub async fn read<T: DeserializeOwned>(&self, key: &Key) -> Result<Option<T>, Error> {
        let Some(bytes) = self.read_bytes(&key.to_bytes()).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| Error::Deserialization {
                key: key.encoded(),
                source,
            })
    }

    /// Read the raw value under `key`, pending writes first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] on backend failure.
    pub async fn read_bytes(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        if let Some(pending) = self.pending.get(key) {
            return Ok(pending.clone());
        }
        self.store.get(key).await
    }

    /// Members of the reference set named by `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the set cannot be read or decoded.
    pub async fn read_keys(&mut self, key: &Key) -> Result<Vec<String>, Error> {
        Ok(self.reference_set(key).await?.iter().cloned().collect())
    }

    /// Any one member of the reference set named by `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the set cannot be read or decoded.
    pub async fn read_key(&mut self, key: &Key) -> Result<Option<String>, Error> {
        Ok(self.reference_set(key).await?.first().cloned())
    }

    /// Add the primary value of `key` to its reference set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `key` has no primary key, or an
    /// error if the set cannot be read or encoded.
    pub async fn update_key_reference(&mut self, key: &Key) -> Result<(), Error> {
        let member = primary_value(key)?;
        let set = self.reference_set(key).await?;
        set.insert(member);
        let encoded = serde_json::to_vec(&*set).map_err(Error::Serialization)?;
        self.write_bytes(key.to_bytes(), encoded);
        Ok(())
    }

    /// Remove the primary value of `key` from its reference set, deleting the
    /// set once it is empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `key` has no primary key, or an
    /// error if the set cannot be read or encoded.
    pub async fn remove_key_reference(&mut self, key: &Key) -> Result<(), Error> {
        let member = primary_value(key)?;
        let set = self.reference_set(key).await?;
        if !set.remove(&member) {
            return Ok(());
        }
        if set.is_empty() {
            self.remove(key);
        } else {
            let encoded = serde_json::to_vec(&*set).map_err(Error::Serialization)?;
            self.write_bytes(key.to_bytes(), encoded);
        }
        Ok(())
    }

    /// Number of buffered mutations.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.batch.len()
    }

    /// Apply all buffered writes atomically and release every lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the batch could not be applied.
    /// Locks are released either way.
    #[tracing::instrument(skip(self), fields(ops = self.batch.len(), locks = self.guards.len()))]
    pub async fn commit(self) -> Result<(), Error> {
        let Self {
            store, batch, guards, ..
        } = self;
        if !batch.is_empty() {
            store.write_batch(batch).await?;
        }
        drop(guards);
        tracing::trace!("unit of work committed");
        Ok(())
    }

    /// Discard all buffered writes and release every lock.
    pub fn rollback(self) {
        tracing::trace!(
            discarded = self.batch.len(),
            "unit of work rolled back"
        );
    }

    async fn reference_set(&mut self, key: &Key) -> Result<&mut BTreeSet<String>, Error> {
        let encoded = key.encoded();
        if !self.references.contains_key(&encoded) {
            let loaded = match self.read_bytes(&key.to_bytes()).await? {
                Some(bytes) => serde_json::from_slice(&bytes).map_err(|source| Error::Deserialization {
                    key: encoded.clone(),
                    source,
                })?,
                None => BTreeSet::new(),
            };
            self.references.insert(encoded.clone(), loaded);
        }
        Ok(self.references.entry(encoded).or_default())
    }
}

fn primary_value(key: &Key) -> Result<String, Error> {
    key.primary_key_value()
        .ok_or_else(|| Error::invalid(format!("reference key `{key}` has no primary key")))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::kv::inmemory::Store;

    fn key(name: &str) -> Key {
        Key::new(name).unwrap()
    }

    #[tokio::test]
    async fn writes_are_invisible_until_commit() {
        let store = Store::new();
        let mut uow = UnitOfWork::start(&store);
        uow.write(&key("a"), "one").unwrap();

        assert_eq!(uow.read::<String>(&key("a")).await.unwrap().as_deref(), Some("one"));
        assert!(store.is_empty());

        uow.commit().await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn rollback_discards_batch() {
        let store = Store::new();
        let mut uow = UnitOfWork::start(&store);
        uow.write(&key("a"), &1).unwrap();
        uow.rollback();

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn pending_removal_hides_stored_value() {
        let store = Store::new();
        let mut uow = UnitOfWork::start(&store);
        uow.write(&key("a"), &1).unwrap();
        uow.commit().await.unwrap();

        let mut uow = UnitOfWork::start(&store);
        uow.remove(&key("a"));
        assert_eq!(uow.read::<i32>(&key("a")).await.unwrap(), None);
        uow.commit().await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn relocking_same_key_is_reentrant() {
        let store = Store::with_lock_timeout(Some(Duration::from_millis(20)));
        let mut uow = UnitOfWork::start(&store);
        uow.lock("k").await.unwrap();
        uow.lock("k").await.unwrap();
        assert!(uow.holds_lock("k"));
        uow.commit().await.unwrap();

        // Released exactly once: a new unit can take it straight away.
        let mut next = UnitOfWork::start(&store);
        next.lock("k").await.unwrap();
        assert_eq!(store.locks().tracked_keys(), 1);
        next.rollback();
        assert_eq!(store.locks().tracked_keys(), 0);
    }

    #[tokio::test]
    async fn competing_unit_times_out_on_held_lock() {
        let store = Store::with_lock_timeout(Some(Duration::from_millis(20)));
        let mut first = UnitOfWork::start(&store);
        first.lock("k").await.unwrap();

        let mut second = UnitOfWork::start(&store);
        let err = second.lock("k").await.unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));

        drop(first);
        second.lock("k").await.unwrap();
    }

    #[tokio::test]
    async fn reference_sets_track_primary_values() {
        let store = Store::new();
        let one = Key::with_segments("PK", ["1"]).unwrap();
        let two = Key::with_segments("PK", ["2"]).unwrap();
        let all_one = Key::reference(&one, "ALL", Vec::<String>::new()).unwrap();
        let all_two = Key::reference(&two, "ALL", Vec::<String>::new()).unwrap();

        let mut uow = UnitOfWork::start(&store);
        uow.update_key_reference(&all_one).await.unwrap();
        uow.update_key_reference(&all_two).await.unwrap();
        uow.update_key_reference(&all_two).await.unwrap();
        uow.commit().await.unwrap();

        let mut reader = UnitOfWork::start(&store);
        assert_eq!(reader.read_keys(&key("ALL")).await.unwrap(), vec!["PK:1", "PK:2"]);

        let mut uow = UnitOfWork::start(&store);
        uow.remove_key_reference(&all_one).await.unwrap();
        uow.remove_key_reference(&all_two).await.unwrap();
        uow.commit().await.unwrap();

        // The emptied set is deleted rather than stored empty.
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn reference_update_requires_primary_key() {
        let store = Store::new();
        let mut uow = UnitOfWork::start(&store);
        let err = uow.update_key_reference(&key("ALL")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
