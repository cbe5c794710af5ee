//! Key-value storage for [`TimeConstrainedProcessTracker`]s.
//!
//! Each tracker lives under `TCPROC_TRACKER#PK:<tenant>:<process>`. Two
//! reference sets index it: `TCPROC_TRACKER#ALL` across tenants and
//! `TCPROC_TRACKER#TENANT:<tenant>` per tenant.

use chrono::{DateTime, Utc};

use crate::{
    Error,
    concurrency::ConcurrencyViolation,
    kv::{Key, KeyValueStore, UnitOfWork},
    process::{ProcessId, TimeConstrainedProcessTracker},
};

const PRIMARY: &str = "TCPROC_TRACKER#PK";
const ALL: &str = "TCPROC_TRACKER#ALL";
const TENANT: &str = "TCPROC_TRACKER#TENANT";

/// Repository of process trackers.
#[derive(Debug, Clone)]
pub struct ProcessTrackerRepository<S: KeyValueStore> {
    store: S,
}

impl<S: KeyValueStore> ProcessTrackerRepository<S> {
    #[must_use]
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Store a new tracker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConcurrencyViolation`] if a tracker for the same
    /// process was already stored.
    pub async fn add(&self, tracker: &mut TimeConstrainedProcessTracker) -> Result<(), Error> {
        self.save(tracker).await
    }

    /// Store `tracker` in its own unit of work.
    ///
    /// On success `tracker` carries its new concurrency version. On failure it
    /// is left as it was.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConcurrencyViolation`] if the stored tracker changed
    /// since `tracker` was read, or a storage error.
    pub async fn save(&self, tracker: &mut TimeConstrainedProcessTracker) -> Result<(), Error> {
        let mut uow = UnitOfWork::start(&self.store);
        let mut updated = tracker.clone();
        self.save_in(&mut uow, &mut updated).await?;
        uow.commit().await?;
        *tracker = updated;
        Ok(())
    }

    /// Stage a save of `tracker` inside the caller's unit of work.
    ///
    /// The tracker's primary key stays locked until `uow` commits or rolls
    /// back. `tracker` is updated immediately; callers that roll back must
    /// discard it.
    ///
    /// # Errors
    ///
    /// See [`save`](Self::save).
    #[tracing::instrument(
        skip(self, uow, tracker),
        fields(tenant = %tracker.tenant_id(), process = %tracker.process_id())
    )]
    pub async fn save_in(
        &self,
        uow: &mut UnitOfWork<S>,
        tracker: &mut TimeConstrainedProcessTracker,
    ) -> Result<(), Error> {
        let key = primary_key(tracker.tenant_id(), tracker.process_id())?;
        uow.lock(&key.encoded()).await?;

        let persisted = uow
            .read::<TimeConstrainedProcessTracker>(&key)
            .await?
            .map_or(0, |stored| stored.concurrency_version());
        if persisted != tracker.concurrency_version() {
            return Err(ConcurrencyViolation {
                entity: key.encoded(),
                expected: tracker.concurrency_version(),
                actual: persisted,
            }
            .into());
        }

        tracker.set_concurrency_version(persisted + 1);
        uow.write(&key, &*tracker)?;
        uow.update_key_reference(&Key::reference(&key, ALL, Vec::<String>::new())?)
            .await?;
        uow.update_key_reference(&Key::reference(&key, TENANT, [tracker.tenant_id()])?)
            .await?;
        tracing::trace!(version = tracker.concurrency_version(), "tracker staged");
        Ok(())
    }

    /// Incomplete, uninformed trackers of every tenant whose deadline has
    /// passed at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or a tracker cannot be
    /// decoded.
    pub async fn all_timed_out(&self, now: DateTime<Utc>) -> Result<Vec<TimeConstrainedProcessTracker>, Error> {
        let trackers = self.load_set(&Key::new(ALL)?).await?;
        Ok(timed_out(trackers, now))
    }

    /// Like [`all_timed_out`](Self::all_timed_out), for one tenant.
    ///
    /// # Errors
    ///
    /// See [`all_timed_out`](Self::all_timed_out).
    pub async fn all_timed_out_of(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<TimeConstrainedProcessTracker>, Error> {
        let trackers = self.all_trackers(tenant_id).await?;
        Ok(timed_out(trackers, now))
    }

    /// Every tracker of `tenant_id`, completed or not.
    ///
    /// # Errors
    ///
    /// See [`all_timed_out`](Self::all_timed_out).
    pub async fn all_trackers(&self, tenant_id: &str) -> Result<Vec<TimeConstrainedProcessTracker>, Error> {
        self.load_set(&Key::with_segments(TENANT, [tenant_id])?).await
    }

    /// The tracker of one process.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or the tracker cannot be
    /// decoded.
    pub async fn tracker_of_process_id(
        &self,
        tenant_id: &str,
        process_id: &ProcessId,
    ) -> Result<Option<TimeConstrainedProcessTracker>, Error> {
        let uow = UnitOfWork::start(&self.store);
        let tracker = uow.read(&primary_key(tenant_id, process_id)?).await?;
        uow.rollback();
        Ok(tracker)
    }

    async fn load_set(&self, set: &Key) -> Result<Vec<TimeConstrainedProcessTracker>, Error> {
        let mut uow = UnitOfWork::start(&self.store);
        let members = uow.read_keys(set).await?;
        let mut trackers = Vec::with_capacity(members.len());
        for member in members {
            let Some(bytes) = uow.read_bytes(member.as_bytes()).await? else {
                tracing::debug!(%member, "indexed tracker is missing");
                continue;
            };
            let tracker = serde_json::from_slice(&bytes).map_err(|source| Error::Deserialization {
                key: member.clone(),
                source,
            })?;
            trackers.push(tracker);
        }
        uow.rollback();
        Ok(trackers)
    }
}

fn primary_key(tenant_id: &str, process_id: &ProcessId) -> Result<Key, Error> {
    if tenant_id.trim().is_empty() {
        return Err(Error::invalid("tenant id is required"));
    }
    Key::with_segments(PRIMARY, [tenant_id, process_id.as_str()])
}

fn timed_out(
    trackers: Vec<TimeConstrainedProcessTracker>,
    now: DateTime<Utc>,
) -> Vec<TimeConstrainedProcessTracker> {
    trackers
        .into_iter()
        .filter(|tracker| {
            !tracker.is_completed() && !tracker.is_informed_of_timeout() && tracker.has_timed_out_at(now)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::{kv::inmemory::Store, test::fixed_time};

    fn tracker(tenant: &str, process: &str, seconds: i64) -> TimeConstrainedProcessTracker {
        TimeConstrainedProcessTracker::new(
            tenant,
            ProcessId::existing(process),
            "Review backlog item",
            fixed_time(),
            TimeDelta::seconds(seconds),
            0,
            "review-timed-out",
        )
        .unwrap()
    }

    fn ids(trackers: &[TimeConstrainedProcessTracker]) -> Vec<&str> {
        let mut ids: Vec<_> = trackers.iter().map(|t| t.process_id().as_str()).collect();
        ids.sort_unstable();
        ids
    }

    #[tokio::test]
    async fn add_indexes_by_tenant_and_globally() {
        let store = Store::new();
        let repository = ProcessTrackerRepository::new(store.clone());
        let mut first = tracker("acme", "p-1", 10);
        repository.add(&mut first).await.unwrap();
        repository.add(&mut tracker("globex", "p-2", 10)).await.unwrap();

        assert_eq!(first.concurrency_version(), 1);
        assert_eq!(
            store.keys(),
            vec![
                "TCPROC_TRACKER#ALL",
                "TCPROC_TRACKER#PK:acme:p-1",
                "TCPROC_TRACKER#PK:globex:p-2",
                "TCPROC_TRACKER#TENANT:acme",
                "TCPROC_TRACKER#TENANT:globex",
            ]
        );
        assert_eq!(ids(&repository.all_trackers("acme").await.unwrap()), vec!["p-1"]);
        let found = repository
            .tracker_of_process_id("acme", &ProcessId::existing("p-1"))
            .await
            .unwrap();
        assert_eq!(found, Some(first));
    }

    #[tokio::test]
    async fn timed_out_scans_skip_completed_and_pending() {
        let repository = ProcessTrackerRepository::new(Store::new());
        repository.add(&mut tracker("acme", "due", 5)).await.unwrap();
        repository.add(&mut tracker("acme", "later", 60)).await.unwrap();
        repository.add(&mut tracker("globex", "other", 5)).await.unwrap();
        let mut done = tracker("acme", "done", 5);
        done.completed();
        repository.add(&mut done).await.unwrap();

        let now = fixed_time() + TimeDelta::seconds(10);
        assert_eq!(ids(&repository.all_timed_out(now).await.unwrap()), vec!["due", "other"]);
        assert_eq!(ids(&repository.all_timed_out_of("acme", now).await.unwrap()), vec!["due"]);
        assert_eq!(repository.all_trackers("acme").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn stale_save_is_rejected_and_left_untouched() {
        let repository = ProcessTrackerRepository::new(Store::new());
        let mut original = tracker("acme", "p-1", 10);
        repository.add(&mut original).await.unwrap();

        let mut stale = original.clone();
        repository.save(&mut original).await.unwrap();
        stale.completed();
        let err = repository.save(&mut stale).await.unwrap_err();

        assert!(matches!(
            err,
            Error::ConcurrencyViolation(ConcurrencyViolation { expected: 1, actual: 2, .. })
        ));
        assert_eq!(stale.concurrency_version(), 1);
        let stored = repository
            .tracker_of_process_id("acme", &ProcessId::existing("p-1"))
            .await
            .unwrap()
            .unwrap();
        assert!(!stored.is_completed());
    }

    #[tokio::test]
    async fn adding_twice_is_a_conflict() {
        let repository = ProcessTrackerRepository::new(Store::new());
        repository.add(&mut tracker("acme", "p-1", 10)).await.unwrap();
        let err = repository.add(&mut tracker("acme", "p-1", 10)).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrencyViolation(_)));
    }

    #[tokio::test]
    async fn save_in_joins_the_callers_unit() {
        let store = Store::new();
        let repository = ProcessTrackerRepository::new(store.clone());
        let mut uow = UnitOfWork::start(&store);
        repository.save_in(&mut uow, &mut tracker("acme", "p-1", 10)).await.unwrap();

        assert!(uow.holds_lock("TCPROC_TRACKER#PK:acme:p-1"));
        assert!(store.is_empty());
        uow.rollback();
        assert!(store.is_empty());
    }
}
