//! Notifications: stored events exposed to external subscribers.
//!
//! - [`log`] - Fixed-size pages over the global sequence (`NotificationLog`,
//!   `NotificationLogId`)
//! - [`factory`] - Builds current and archived pages from an event store
//! - [`tracker`] - Per-publisher progress (`PublishedNotificationTracker`)
//! - [`publisher`] - Pushes unpublished notifications to a sink
//!
//! [`NotificationLogRepresentation`] is the transport form of a page: ids and
//! timestamps as text, scalar event fields as text.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{Error, event::EventSet, store::StoredEvent};

pub mod factory;
pub mod log;
pub mod publisher;
pub mod tracker;

pub use factory::NotificationLogFactory;
pub use log::{NotificationLog, NotificationLogId};
pub use publisher::{NotificationPublisher, NotificationSink, PublishError};
pub use tracker::{KvPublishedNotificationTrackerStore, PublishedNotificationTracker, PublishedNotificationTrackerStore};

/// An event together with its global sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification<E> {
    /// Equal to the event's sequence in the store.
    pub notification_id: u64,
    pub occurred_on: DateTime<Utc>,
    pub type_tag: String,
    pub version: u32,
    pub event: E,
}

impl<E: EventSet> Notification<E> {
    /// Decode a stored event into a notification.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the event is not a member of `E`.
    pub fn from_stored(stored: &StoredEvent) -> Result<Self, Error> {
        Ok(Self {
            notification_id: stored.sequence,
            occurred_on: stored.occurred_on,
            type_tag: stored.type_tag.clone(),
            version: stored.version,
            event: stored.decode()?,
        })
    }
}

/// Transport form of a [`Notification`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationRepresentation {
    /// Decimal text.
    pub notification_id: String,
    /// Epoch milliseconds as decimal text.
    pub occurred_on: String,
    pub type_name: String,
    pub version: u32,
    pub event: Value,
}

impl NotificationRepresentation {
    /// Render `notification` for transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the event cannot be serialized.
    pub fn from_notification<E: Serialize>(notification: &Notification<E>) -> Result<Self, Error> {
        let event = serde_json::to_value(&notification.event).map_err(Error::Serialization)?;
        Ok(Self {
            notification_id: notification.notification_id.to_string(),
            occurred_on: notification.occurred_on.timestamp_millis().to_string(),
            type_name: notification.type_tag.clone(),
            version: notification.version,
            event: textual(event),
        })
    }
}

/// Hypermedia links of a page; values are encoded log ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLinks {
    #[serde(rename = "self")]
    pub self_link: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

/// Transport form of a [`NotificationLog`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationLogRepresentation {
    pub id: String,
    pub archived: bool,
    pub notifications: Vec<NotificationRepresentation>,
    pub links: LogLinks,
}

impl NotificationLogRepresentation {
    /// Render `log` for transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if an event cannot be serialized.
    pub fn from_log<E: Serialize>(log: &NotificationLog<E>) -> Result<Self, Error> {
        let notifications = log
            .notifications
            .iter()
            .map(NotificationRepresentation::from_notification)
            .collect::<Result<_, _>>()?;
        Ok(Self {
            id: log.id.encoded(),
            archived: log.archived,
            notifications,
            links: LogLinks {
                self_link: log.id.encoded(),
                previous: log.previous_id.map(|id| id.encoded()),
                next: log.next_id.map(|id| id.encoded()),
            },
        })
    }
}

/// Render numbers and booleans as strings, recursing into containers.
fn textual(value: Value) -> Value {
    match value {
        Value::Number(number) => Value::String(number.to_string()),
        Value::Bool(flag) => Value::String(flag.to_string()),
        Value::Array(items) => Value::Array(items.into_iter().map(textual).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(name, field)| (name, textual(field)))
                .collect::<Map<_, _>>(),
        ),
        other => other,
    }
}
