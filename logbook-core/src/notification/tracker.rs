//! Per-publisher publication progress.
//!
//! A [`PublishedNotificationTracker`] remembers the id of the last
//! notification a publisher sent, so publishing resumes from the next one.
//! Consumers deduplicate by notification id, which makes at-least-once
//! delivery safe.

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::{
    Error,
    concurrency::ConcurrencyViolation,
    kv::{Key, KeyValueStore, UnitOfWork},
    notification::Notification,
};

const PRIMARY: &str = "PUBNOTIF_TRACKER#PK";

/// Progress of one publisher type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedNotificationTracker {
    publisher_type: String,
    most_recent_published_id: u64,
    concurrency_version: u32,
}

impl PublishedNotificationTracker {
    /// A tracker that has published nothing yet.
    pub fn new(publisher_type: impl Into<String>) -> Self {
        Self {
            publisher_type: publisher_type.into(),
            most_recent_published_id: 0,
            concurrency_version: 0,
        }
    }

    #[must_use]
    pub fn publisher_type(&self) -> &str {
        &self.publisher_type
    }

    #[must_use]
    pub const fn most_recent_published_id(&self) -> u64 {
        self.most_recent_published_id
    }

    /// Bumped on every save.
    #[must_use]
    pub const fn concurrency_version(&self) -> u32 {
        self.concurrency_version
    }
}

/// Storage for [`PublishedNotificationTracker`]s.
pub trait PublishedNotificationTrackerStore: Send + Sync {
    /// The tracker for `publisher_type`, or a fresh one if none was saved.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store cannot be read.
    fn current<'a>(
        &'a self,
        publisher_type: &'a str,
    ) -> impl Future<Output = Result<PublishedNotificationTracker, Error>> + Send + 'a;

    /// Record the last of `notifications` as published.
    ///
    /// A no-op for an empty slice. On success `tracker` holds the saved state,
    /// including its new concurrency version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConcurrencyViolation`] if the tracker was saved by
    /// someone else since it was read.
    fn track_most_recent<'a, E: Send + Sync>(
        &'a self,
        tracker: &'a mut PublishedNotificationTracker,
        notifications: &'a [Notification<E>],
    ) -> impl Future<Output = Result<(), Error>> + Send + 'a;
}

/// [`PublishedNotificationTrackerStore`] over a [`KeyValueStore`].
///
/// Trackers live under `PUBNOTIF_TRACKER#PK:<publisher_type>`.
#[derive(Debug, Clone)]
pub struct KvPublishedNotificationTrackerStore<S: KeyValueStore> {
    store: S,
}

impl<S: KeyValueStore> KvPublishedNotificationTrackerStore<S> {
    #[must_use]
    pub const fn new(store: S) -> Self {
        Self { store }
    }
}

fn primary_key(publisher_type: &str) -> Result<Key, Error> {
    if publisher_type.trim().is_empty() {
        return Err(Error::invalid("publisher type must be provided"));
    }
    Ok(Key::new(PRIMARY)?.segment(publisher_type))
}

impl<S: KeyValueStore> PublishedNotificationTrackerStore for KvPublishedNotificationTrackerStore<S> {
    async fn current<'a>(&'a self, publisher_type: &'a str) -> Result<PublishedNotificationTracker, Error> {
        let key = primary_key(publisher_type)?;
        let uow = UnitOfWork::start(&self.store);
        let tracker = uow.read(&key).await?;
        uow.rollback();
        Ok(tracker.unwrap_or_else(|| PublishedNotificationTracker::new(publisher_type)))
    }

    #[tracing::instrument(
        skip(self, tracker, notifications),
        fields(publisher = %tracker.publisher_type, count = notifications.len())
    )]
    async fn track_most_recent<'a, E: Send + Sync>(
        &'a self,
        tracker: &'a mut PublishedNotificationTracker,
        notifications: &'a [Notification<E>],
    ) -> Result<(), Error> {
        let Some(last) = notifications.last() else {
            return Ok(());
        };
        let key = primary_key(&tracker.publisher_type)?;
        let mut uow = UnitOfWork::start(&self.store);
        uow.lock(&key.encoded()).await?;

        let persisted = uow
            .read::<PublishedNotificationTracker>(&key)
            .await?
            .map_or(0, |stored| stored.concurrency_version);
        if persisted != tracker.concurrency_version {
            return Err(ConcurrencyViolation {
                entity: key.encoded(),
                expected: tracker.concurrency_version,
                actual: persisted,
            }
            .into());
        }

        let updated = PublishedNotificationTracker {
            publisher_type: tracker.publisher_type.clone(),
            most_recent_published_id: last.notification_id,
            concurrency_version: tracker.concurrency_version + 1,
        };
        uow.write(&key, &updated)?;
        uow.commit().await?;
        tracing::debug!(most_recent = updated.most_recent_published_id, "publication tracked");
        *tracker = updated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kv::inmemory::Store,
        test::{fixed_time, tick},
    };

    fn notification(id: u64) -> Notification<crate::test::Tick> {
        Notification {
            notification_id: id,
            occurred_on: fixed_time(),
            type_tag: "tick".into(),
            version: 1,
            event: tick(id),
        }
    }

    #[tokio::test]
    async fn missing_tracker_starts_at_zero() {
        let trackers = KvPublishedNotificationTrackerStore::new(Store::new());
        let tracker = trackers.current("rabbitmq").await.unwrap();
        assert_eq!(tracker, PublishedNotificationTracker::new("rabbitmq"));
    }

    #[tokio::test]
    async fn tracking_is_resumable() {
        let store = Store::new();
        let trackers = KvPublishedNotificationTrackerStore::new(store.clone());
        let mut tracker = trackers.current("rabbitmq").await.unwrap();

        trackers
            .track_most_recent(&mut tracker, &[notification(5), notification(9)])
            .await
            .unwrap();
        assert_eq!(trackers.current("rabbitmq").await.unwrap().most_recent_published_id(), 9);

        trackers
            .track_most_recent::<crate::test::Tick>(&mut tracker, &[])
            .await
            .unwrap();
        let reloaded = trackers.current("rabbitmq").await.unwrap();
        assert_eq!(reloaded.most_recent_published_id(), 9);
        assert_eq!(reloaded.concurrency_version(), 1);
        assert_eq!(store.keys(), vec!["PUBNOTIF_TRACKER#PK:rabbitmq".to_string()]);
    }

    #[tokio::test]
    async fn stale_tracker_is_rejected() {
        let trackers = KvPublishedNotificationTrackerStore::new(Store::new());
        let mut first = trackers.current("rabbitmq").await.unwrap();
        let mut second = trackers.current("rabbitmq").await.unwrap();

        trackers.track_most_recent(&mut first, &[notification(3)]).await.unwrap();
        let err = trackers.track_most_recent(&mut second, &[notification(4)]).await.unwrap_err();

        assert!(matches!(
            err,
            Error::ConcurrencyViolation(ConcurrencyViolation { expected: 0, actual: 1, .. })
        ));
        assert_eq!(second.most_recent_published_id(), 0);
        assert_eq!(trackers.current("rabbitmq").await.unwrap().most_recent_published_id(), 3);
    }

    #[tokio::test]
    async fn publisher_types_are_independent() {
        let trackers = KvPublishedNotificationTrackerStore::new(Store::new());
        let mut a = trackers.current("a").await.unwrap();
        trackers.track_most_recent(&mut a, &[notification(2)]).await.unwrap();

        assert_eq!(trackers.current("b").await.unwrap().most_recent_published_id(), 0);
        assert!(matches!(trackers.current(" ").await, Err(Error::InvalidArgument(_))));
    }
}
