//! Domain event traits.
//!
//! `DomainEvent` is the lightweight trait every concrete event struct
//! implements. Persistence concerns stay with the event store: events are
//! serialized with serde and tagged with their [`DomainEvent::KIND`].

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Serialized form of an event's own fields.
pub type Payload = serde_json::Value;

/// Error returned when a stored event cannot be turned back into a value.
#[derive(Debug, Error)]
pub enum EventDecodeError {
    /// The event kind was not recognized by this event set.
    #[error("unknown event kind `{kind}`, expected one of {expected:?}")]
    UnknownKind {
        /// The unrecognized event kind string.
        kind: String,
        /// The list of event kinds this set can handle.
        expected: &'static [&'static str],
    },
    /// The payload did not match the shape of the event type.
    #[error("payload of `{kind}` could not be decoded: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Trait for events that can be appended to the event store.
///
/// Each event carries a unique [`Self::KIND`] identifier so stored payloads can
/// be routed back to the correct type, a schema [`Self::VERSION`] exposed to
/// notification consumers, and the instant it occurred.
///
/// Implement it by hand or with `#[derive(DomainEvent)]`.
pub trait DomainEvent {
    const KIND: &'static str;
    const VERSION: u32 = 1;

    fn occurred_on(&self) -> DateTime<Utc>;
}

/// Instance-level view of an event's tag, schema version and timestamp.
///
/// Blanket-implemented for every [`DomainEvent`]; event-set enums generated by
/// `#[derive(EventSet)]` implement it by delegating to the wrapped event.
pub trait EventKind {
    fn kind(&self) -> &'static str;

    fn event_version(&self) -> u32;

    fn event_occurred_on(&self) -> DateTime<Utc>;
}

impl<T: DomainEvent> EventKind for T {
    fn kind(&self) -> &'static str {
        T::KIND
    }

    fn event_version(&self) -> u32 {
        T::VERSION
    }

    fn event_occurred_on(&self) -> DateTime<Utc> {
        self.occurred_on()
    }
}

/// A closed set of event types that can be decoded from the store.
///
/// A single [`DomainEvent`] is a set of one. Sum types over several events
/// implement this via `#[derive(EventSet)]`.
pub trait EventSet: EventKind + Serialize + Sized {
    /// Kinds this set can decode.
    const EVENT_KINDS: &'static [&'static str];

    /// Rebuild an event from its kind tag and payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventDecodeError::UnknownKind`] if the kind is not part of the
    /// set, or [`EventDecodeError::Payload`] if the payload does not match.
    fn decode(kind: &str, payload: Payload) -> Result<Self, EventDecodeError>;
}

impl<T> EventSet for T
where
    T: DomainEvent + Serialize + DeserializeOwned,
{
    const EVENT_KINDS: &'static [&'static str] = &[T::KIND];

    fn decode(kind: &str, payload: Payload) -> Result<Self, EventDecodeError> {
        if kind != T::KIND {
            return Err(EventDecodeError::UnknownKind {
                kind: kind.to_string(),
                expected: Self::EVENT_KINDS,
            });
        }
        decode_payload(kind, payload)
    }
}

/// Deserialize a payload into `T`, tagging failures with `kind`.
///
/// # Errors
///
/// Returns [`EventDecodeError::Payload`] if the payload does not match `T`.
pub fn decode_payload<T: DeserializeOwned>(kind: &str, payload: Payload) -> Result<T, EventDecodeError> {
    serde_json::from_value(payload).map_err(|source| EventDecodeError::Payload {
        kind: kind.to_string(),
        source,
    })
}
