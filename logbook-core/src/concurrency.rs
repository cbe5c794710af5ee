//! Concurrency control primitives.
//!
//! Two mechanisms live here:
//!
//! - [`ConcurrencyViolation`]: optimistic check on versioned records such as
//!   publication trackers and process trackers.
//! - [`KeyLocks`]: advisory, key-granular locks taken by a
//!   [`UnitOfWork`](crate::kv::UnitOfWork) between `start` and
//!   `commit`/`rollback`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::Error;

/// Error indicating a versioned record was modified since it was read.
///
/// Returned when a tracker is saved with a concurrency version that no longer
/// matches the persisted one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "concurrency violation on `{entity}`: expected version {expected}, found {actual} (hint: \
     stale data was saved; reload and retry)"
)]
pub struct ConcurrencyViolation {
    /// Key of the record that was being saved.
    pub entity: String,
    /// The version the caller read.
    pub expected: u32,
    /// The version currently persisted.
    pub actual: u32,
}

/// Registry of per-key advisory locks.
///
/// Each key maps to its own async mutex, so writers that touch unrelated keys
/// proceed concurrently. Entries are pruned once no guard or waiter refers to
/// them.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    timeout: Option<Duration>,
}

impl KeyLocks {
    /// Create a registry. `None` waits for locks without bound.
    #[must_use]
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// The configured acquisition timeout.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Acquire the lock for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if a timeout is configured and the lock
    /// is not granted in time.
    #[tracing::instrument(skip(self), fields(timeout = ?self.timeout))]
    pub async fn acquire(self: &Arc<Self>, key: &str) -> Result<KeyGuard, Error> {
        let mutex = {
            let mut locks = self.locks.lock().expect("key lock registry poisoned");
            Arc::clone(locks.entry(key.to_owned()).or_default())
        };

        let guard = match self.timeout {
            Some(waited) => match tokio::time::timeout(waited, Arc::clone(&mutex).lock_owned()).await {
                Ok(guard) => guard,
                Err(_) => {
                    drop(mutex);
                    self.prune(key);
                    return Err(Error::LockTimeout {
                        key: key.to_owned(),
                        waited,
                    });
                }
            },
            None => Arc::clone(&mutex).lock_owned().await,
        };
        drop(mutex);
        tracing::trace!("key lock acquired");

        Ok(KeyGuard {
            key: key.to_owned(),
            guard: Some(guard),
            registry: Arc::clone(self),
        })
    }

    /// Forget `key` if nobody holds or awaits it.
    ///
    /// Callers must have dropped their own handle to the key's mutex first.
    fn prune(&self, key: &str) {
        // Clones are only handed out under the registry mutex, so a count of
        // one here means the registry holds the last handle.
        if let Ok(mut locks) = self.locks.lock()
            && locks.get(key).is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            locks.remove(key);
        }
    }

    /// Number of keys currently tracked by the registry.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.locks.lock().expect("key lock registry poisoned").len()
    }
}

/// Held lock on a single key. Released on drop.
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    registry: Arc<KeyLocks>,
}

impl KeyGuard {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.registry.prune(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_message_mentions_versions_and_hint() {
        let violation = ConcurrencyViolation {
            entity: "PUBNOTIF_TRACKER#PK:rabbit".into(),
            expected: 2,
            actual: 3,
        };
        let msg = violation.to_string();
        assert!(msg.contains("expected version 2, found 3"));
        assert!(msg.contains("reload and retry"));
    }

    #[tokio::test]
    async fn unrelated_keys_lock_independently() {
        let locks = Arc::new(KeyLocks::new(Some(Duration::from_millis(50))));
        let a = locks.acquire("a").await.unwrap();
        let b = locks.acquire("b").await.unwrap();
        assert_eq!(a.key(), "a");
        assert_eq!(b.key(), "b");
        assert_eq!(locks.tracked_keys(), 2);
    }

    #[tokio::test]
    async fn contended_key_times_out() {
        let locks = Arc::new(KeyLocks::new(Some(Duration::from_millis(20))));
        let _held = locks.acquire("tracker").await.unwrap();

        let err = locks.acquire("tracker").await.unwrap_err();
        assert!(matches!(err, Error::LockTimeout { ref key, .. } if key == "tracker"));
    }

    #[tokio::test]
    async fn timed_out_waiters_leave_nothing_behind() {
        let locks = Arc::new(KeyLocks::new(Some(Duration::from_millis(20))));
        let holder = locks.acquire("tracker").await.unwrap();

        // The holder may release while a timed-out waiter still has its
        // handle, so the holder's release cannot prune the key.
        let waiter_handle = Arc::clone(locks.locks.lock().unwrap().get("tracker").unwrap());
        drop(holder);
        assert_eq!(locks.tracked_keys(), 1);

        drop(waiter_handle);
        locks.prune("tracker");
        assert_eq!(locks.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn timeout_path_prunes_once_the_holder_is_gone() {
        let locks = Arc::new(KeyLocks::new(Some(Duration::from_millis(20))));
        let holder = locks.acquire("tracker").await.unwrap();
        let waiter = tokio::spawn({
            let locks = Arc::clone(&locks);
            async move { locks.acquire("tracker").await }
        });

        assert!(matches!(waiter.await.unwrap(), Err(Error::LockTimeout { .. })));
        assert_eq!(locks.tracked_keys(), 1);
        drop(holder);
        assert_eq!(locks.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn released_keys_are_pruned() {
        let locks = Arc::new(KeyLocks::new(None));
        let guard = locks.acquire("stream").await.unwrap();
        assert_eq!(locks.tracked_keys(), 1);

        drop(guard);
        assert_eq!(locks.tracked_keys(), 0);

        // Reacquiring after release succeeds immediately.
        let _again = locks.acquire("stream").await.unwrap();
    }
}
