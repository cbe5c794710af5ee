//! Error taxonomy shared by every logbook component.

use std::time::Duration;

use thiserror::Error;

use crate::{concurrency::ConcurrencyViolation, event::EventDecodeError};

/// Boxed error used to carry backend failures without leaking backend types.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by journals, event stores, units of work and trackers.
#[derive(Debug, Error)]
pub enum Error {
    /// An append tried to occupy a stream position that is already taken.
    ///
    /// Not retried internally. The caller decides whether the append raced
    /// another writer or was simply submitted twice.
    #[error("stream `{stream_name}` already holds an event at version {stream_version}")]
    DuplicateStreamPosition {
        stream_name: String,
        stream_version: u32,
    },
    /// A stream read found no events at or after the requested version.
    #[error("no events in stream `{stream_name}` from version {stream_version}")]
    NoSuchStream {
        stream_name: String,
        stream_version: u32,
    },
    /// The underlying storage failed while performing `context`.
    #[error("store unavailable while {context}: {source}")]
    StoreUnavailable {
        context: String,
        #[source]
        source: BoxError,
    },
    /// A tracker was saved with a stale concurrency version.
    #[error(transparent)]
    ConcurrencyViolation(#[from] ConcurrencyViolation),
    /// The durable journal needed a repair scan and the scan could not finish.
    #[error("journal repair could not complete: {reason}")]
    RepairRequired { reason: String },
    /// A key lock was not granted within the configured lock timeout.
    #[error("timed out after {waited:?} waiting for lock on `{key}`")]
    LockTimeout { key: String, waited: Duration },
    /// The journal was closed and no longer accepts writes.
    #[error("journal is closed")]
    Closed,
    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
    #[error("deserialization error at `{key}`: {source}")]
    Deserialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Decode(#[from] EventDecodeError),
    #[error("invalid notification log id `{0}`")]
    InvalidLogId(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A tracker names a timeout signal kind the registry does not know.
    #[error("no timeout signal registered for kind `{0}`")]
    UnknownSignalKind(String),
    /// A stored record could not be interpreted.
    #[error("corrupt record at `{key}`: {reason}")]
    Corrupt { key: String, reason: String },
}

impl Error {
    /// Wrap a backend failure with the operation that was being performed.
    pub fn unavailable(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::StoreUnavailable {
            context: context.into(),
            source: source.into(),
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub(crate) fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error reports a stream position that was already taken.
    #[must_use]
    pub const fn is_duplicate_stream_position(&self) -> bool {
        matches!(self, Self::DuplicateStreamPosition { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_keeps_context_and_source() {
        let io = std::io::Error::other("disk full");
        let err = Error::unavailable("writing journal entry 7", io);

        let msg = err.to_string();
        assert!(msg.contains("writing journal entry 7"));
        assert!(msg.contains("disk full"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn duplicate_position_is_recognised() {
        let err = Error::DuplicateStreamPosition {
            stream_name: "product-1".into(),
            stream_version: 3,
        };
        assert!(err.is_duplicate_stream_position());
        assert!(!Error::Closed.is_duplicate_stream_position());
        assert_eq!(
            err.to_string(),
            "stream `product-1` already holds an event at version 3"
        );
    }
}
