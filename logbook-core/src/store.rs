//! The event store.
//!
//! [`EventStore`] serializes domain events into journal records, gives every
//! event a global sequence number and a position in its stream, and reads them
//! back either by sequence (for notification logs and dispatchers) or by
//! stream (for rebuilding state).
//!
//! The store is a cheap, cloneable handle over any [`Journal`]. Every
//! committed append is announced on a broadcast channel so publishers can wake
//! up without polling.
use chrono::{DateTime, Utc};
use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{
    Error,
    event::{EventKind, EventSet, Payload},
    journal::{Journal, JournalEntry, LoggedEntry, journal_key, reference_key},
};

/// Pending append notices kept for slow subscribers.
const APPENDED_CHANNEL_CAPACITY: usize = 1024;

/// Identity of an event stream and a position in it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventStreamId {
    stream_name: String,
    stream_version: u32,
}

impl EventStreamId {
    /// The start of stream `stream_name` (version 1).
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self::with_version(stream_name, 1)
    }

    pub fn with_version(stream_name: impl Into<String>, stream_version: u32) -> Self {
        Self {
            stream_name: stream_name.into(),
            stream_version,
        }
    }

    /// The same stream at another version.
    #[must_use]
    pub fn with_stream_version(&self, stream_version: u32) -> Self {
        Self::with_version(self.stream_name.clone(), stream_version)
    }

    /// The same stream one version further.
    #[must_use]
    pub fn next(&self) -> Self {
        self.with_stream_version(self.stream_version.saturating_add(1))
    }

    #[must_use]
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    #[must_use]
    pub const fn stream_version(&self) -> u32 {
        self.stream_version
    }
}

/// Envelope persisted as the journal value of every event.
#[derive(Debug, Serialize, Deserialize)]
struct EventRecord {
    #[serde(rename = "type")]
    type_tag: String,
    version: u32,
    occurred_on: DateTime<Utc>,
    payload: Payload,
}

/// Event materialized from the store, payload still undecoded.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    /// Global, strictly increasing position assigned at append.
    pub sequence: u64,
    pub type_tag: String,
    pub version: u32,
    pub occurred_on: DateTime<Utc>,
    pub payload: Payload,
}

impl StoredEvent {
    fn from_logged(entry: LoggedEntry) -> Result<Self, Error> {
        let record: EventRecord =
            serde_json::from_slice(&entry.value).map_err(|source| Error::Deserialization {
                key: journal_key(entry.sequence),
                source,
            })?;
        Ok(Self {
            sequence: entry.sequence,
            type_tag: record.type_tag,
            version: record.version,
            occurred_on: record.occurred_on,
            payload: record.payload,
        })
    }

    /// Decode the payload into a member of `E`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the kind is not part of `E` or the payload
    /// does not match it.
    pub fn decode<E: EventSet>(&self) -> Result<E, Error> {
        Ok(E::decode(&self.type_tag, self.payload.clone())?)
    }
}

/// A decoded event together with its global sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchableEvent<E> {
    pub sequence: u64,
    pub event: E,
}

/// Events of one stream and the version of the last of them.
#[derive(Debug, Clone, PartialEq)]
pub struct EventStream<E> {
    pub events: Vec<E>,
    pub version: u32,
}

/// Append and read domain events through a [`Journal`].
#[derive(Debug, Clone)]
pub struct EventStore<J: Journal> {
    journal: J,
    appended: broadcast::Sender<u64>,
}

impl<J: Journal> EventStore<J> {
    #[must_use]
    pub fn new(journal: J) -> Self {
        let (appended, _) = broadcast::channel(APPENDED_CHANNEL_CAPACITY);
        Self { journal, appended }
    }

    pub const fn journal(&self) -> &J {
        &self.journal
    }

    /// Receive the last sequence number of every append committed from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.appended.subscribe()
    }

    /// Append `events` to the stream, starting at `stream_id`'s version.
    ///
    /// Event `i` occupies version `stream_version + i`. An empty slice is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateStreamPosition`] if any of the versions is
    /// already taken (nothing is written), [`Error::InvalidArgument`] for a
    /// blank stream name, version zero or a version range that overflows, and
    /// [`Error::Serialization`] if an event cannot be serialized.
    #[tracing::instrument(
        skip(self, events),
        fields(
            stream = %stream_id.stream_name(),
            version = stream_id.stream_version(),
            event_count = events.len()
        )
    )]
    pub async fn append<E>(&self, stream_id: &EventStreamId, events: &[E]) -> Result<(), Error>
    where
        E: EventKind + Serialize + Sync,
    {
        if stream_id.stream_name.trim().is_empty() {
            return Err(Error::invalid("stream name must be provided"));
        }
        if stream_id.stream_version == 0 {
            return Err(Error::invalid("stream versions start at 1"));
        }

        let mut entries = Vec::with_capacity(events.len());
        for (offset, event) in (0_u32..).zip(events) {
            let version = stream_id.stream_version.checked_add(offset).ok_or_else(|| {
                Error::invalid(format!("stream `{}` version overflows", stream_id.stream_name))
            })?;
            let record = EventRecord {
                type_tag: event.kind().to_owned(),
                version: event.event_version(),
                occurred_on: event.event_occurred_on(),
                payload: serde_json::to_value(event).map_err(Error::Serialization)?,
            };
            let value = serde_json::to_vec(&record).map_err(Error::Serialization)?;
            entries.push(JournalEntry::new(reference_key(&stream_id.stream_name, version), value));
        }
        let Some(entries) = NonEmpty::from_vec(entries) else {
            return Ok(());
        };

        let appended = self.journal.log_entries(&stream_id.stream_name, entries).await?;
        // No receivers is not an error.
        let _ = self.appended.send(appended.last);
        tracing::debug!(first = appended.first, last = appended.last, "events appended");
        Ok(())
    }

    /// Events after `last_sequence`, in order, stopping at the first gap.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be read or decoded into `E`.
    pub async fn events_since<E: EventSet>(&self, last_sequence: u64) -> Result<Vec<DispatchableEvent<E>>, Error> {
        self.stored_events_since(last_sequence)
            .await?
            .into_iter()
            .map(|stored| {
                Ok(DispatchableEvent {
                    sequence: stored.sequence,
                    event: stored.decode()?,
                })
            })
            .collect()
    }

    /// Undecoded events after `last_sequence`, stopping at the first gap.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be read.
    pub async fn stored_events_since(&self, last_sequence: u64) -> Result<Vec<StoredEvent>, Error> {
        to_stored(self.journal.entries_since(last_sequence).await?)
    }

    /// Undecoded events with `low <= sequence <= high`, stopping at the first
    /// gap.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be read.
    pub async fn events_between(&self, low: u64, high: u64) -> Result<Vec<StoredEvent>, Error> {
        to_stored(self.journal.entries_between(low, high).await?)
    }

    /// The stream from `stream_id`'s version onwards.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchStream`] if there is no event at that version,
    /// or an error if a record cannot be read or decoded.
    #[tracing::instrument(
        skip(self),
        fields(stream = %stream_id.stream_name(), version = stream_id.stream_version())
    )]
    pub async fn stream_since<E: EventSet>(&self, stream_id: &EventStreamId) -> Result<EventStream<E>, Error> {
        let name = stream_id.stream_name.clone();
        let keys = (stream_id.stream_version.max(1)..=u32::MAX).map(move |version| reference_key(&name, version));
        let logged = self.journal.referenced_entries(keys).await?;
        if logged.is_empty() {
            return Err(Error::NoSuchStream {
                stream_name: stream_id.stream_name.clone(),
                stream_version: stream_id.stream_version,
            });
        }

        let count = u32::try_from(logged.len())
            .map_err(|_| Error::invalid(format!("stream `{}` is too long", stream_id.stream_name)))?;
        let version = stream_id.stream_version.max(1) + (count - 1);
        let events = to_stored(logged)?
            .iter()
            .map(StoredEvent::decode)
            .collect::<Result<Vec<E>, _>>()?;
        tracing::trace!(version, "stream loaded");
        Ok(EventStream { events, version })
    }

    /// The whole stream `stream_name`.
    ///
    /// # Errors
    ///
    /// See [`stream_since`](Self::stream_since).
    pub async fn full_stream<E: EventSet>(&self, stream_name: &str) -> Result<EventStream<E>, Error> {
        self.stream_since(&EventStreamId::new(stream_name)).await
    }

    /// Highest sequence number assigned so far.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.journal.count()
    }

    /// Erase every event and reset the sequence.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] on storage failure.
    pub async fn purge(&self) -> Result<(), Error> {
        self.journal.purge().await
    }

    /// Close the underlying journal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] on storage failure.
    pub async fn close(&self) -> Result<(), Error> {
        self.journal.close().await
    }
}

fn to_stored(entries: Vec<LoggedEntry>) -> Result<Vec<StoredEvent>, Error> {
    entries.into_iter().map(StoredEvent::from_logged).collect()
}
