//! Pushes unpublished notifications to an external sink.
//!
//! The publisher reads its tracker, loads every event after the tracked id,
//! sends them in order and records the last one sent. Running it again after a
//! failure resends at most the notification that failed.

use std::future::Future;

use thiserror::Error;

use crate::{
    Error,
    event::EventSet,
    journal::Journal,
    notification::{Notification, PublishedNotificationTrackerStore},
    store::EventStore,
};

/// Destination of published notifications (a message bus, a webhook, ...).
pub trait NotificationSink<E>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Deliver one notification.
    ///
    /// # Errors
    ///
    /// Returns the sink's error if delivery failed.
    fn send<'a>(&'a self, notification: &'a Notification<E>) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}

/// Error returned by [`NotificationPublisher::publish_notifications`].
#[derive(Debug, Error)]
pub enum PublishError<SinkError>
where
    SinkError: std::error::Error + 'static,
{
    /// Reading events or tracking progress failed.
    #[error(transparent)]
    Store(#[from] Error),
    /// The sink rejected a notification. Everything before it was tracked.
    #[error("sink rejected notification {notification_id}: {source}")]
    Sink {
        notification_id: u64,
        #[source]
        source: SinkError,
    },
}

/// Publishes notifications for one publisher type.
#[derive(Debug, Clone)]
pub struct NotificationPublisher<J: Journal, T> {
    store: EventStore<J>,
    trackers: T,
    publisher_type: String,
}

impl<J, T> NotificationPublisher<J, T>
where
    J: Journal,
    T: PublishedNotificationTrackerStore,
{
    pub fn new(store: EventStore<J>, trackers: T, publisher_type: impl Into<String>) -> Self {
        Self {
            store,
            trackers,
            publisher_type: publisher_type.into(),
        }
    }

    #[must_use]
    pub fn publisher_type(&self) -> &str {
        &self.publisher_type
    }

    /// Send every notification after the tracked one, then track the last
    /// notification sent. Returns how many were sent.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Sink`] if the sink fails (after tracking what
    /// was already sent) and [`PublishError::Store`] if reading or tracking
    /// fails.
    #[tracing::instrument(skip(self, sink), fields(publisher = %self.publisher_type))]
    pub async fn publish_notifications<E, K>(&self, sink: &K) -> Result<usize, PublishError<K::Error>>
    where
        E: EventSet + Send + Sync,
        K: NotificationSink<E>,
    {
        let mut tracker = self.trackers.current(&self.publisher_type).await?;
        let pending = self
            .store
            .stored_events_since(tracker.most_recent_published_id())
            .await?
            .iter()
            .map(Notification::<E>::from_stored)
            .collect::<Result<Vec<_>, _>>()?;

        let mut sent = 0;
        let mut failure = None;
        for notification in &pending {
            if let Err(source) = sink.send(notification).await {
                failure = Some(PublishError::Sink {
                    notification_id: notification.notification_id,
                    source,
                });
                break;
            }
            sent += 1;
        }

        self.trackers.track_most_recent(&mut tracker, &pending[..sent]).await?;
        match failure {
            Some(err) => {
                tracing::warn!(sent, "publishing stopped at sink failure");
                Err(err)
            }
            None => {
                tracing::debug!(sent, "notifications published");
                Ok(sent)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        journal::inmemory,
        kv,
        notification::KvPublishedNotificationTrackerStore,
        test::{RecordingSink, Tick, seed},
    };

    async fn publisher() -> NotificationPublisher<inmemory::Journal, KvPublishedNotificationTrackerStore<kv::inmemory::Store>> {
        let store = EventStore::new(inmemory::Journal::new());
        seed(&store, "ticks", 5).await.unwrap();
        let trackers = KvPublishedNotificationTrackerStore::new(kv::inmemory::Store::new());
        NotificationPublisher::new(store, trackers, "bus")
    }

    #[tokio::test]
    async fn publishes_only_what_is_new() {
        let publisher = publisher().await;
        let sink = RecordingSink::new();

        assert_eq!(publisher.publish_notifications::<Tick, _>(&sink).await.unwrap(), 5);
        assert_eq!(publisher.publish_notifications::<Tick, _>(&sink).await.unwrap(), 0);
        assert_eq!(sink.sent(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn sink_failure_tracks_what_was_sent() {
        let publisher = publisher().await;
        let failing = RecordingSink::failing_after(2);

        let err = publisher.publish_notifications::<Tick, _>(&failing).await.unwrap_err();
        assert!(matches!(err, PublishError::Sink { notification_id: 3, .. }));
        assert_eq!(failing.sent(), vec![1, 2]);

        let sink = RecordingSink::new();
        publisher.publish_notifications::<Tick, _>(&sink).await.unwrap();
        assert_eq!(sink.sent(), vec![3, 4, 5]);
    }
}
