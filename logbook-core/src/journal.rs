//! Append-only journals.
//!
//! A journal is the leaf of the event store: an append-only sequence of opaque
//! byte records keyed by a global, monotonic sequence number, plus a secondary
//! index from *reference keys* (stream positions) to sequence numbers.
//!
//! Two backends implement [`Journal`]:
//!
//! - [`inmemory::Journal`] keeps everything in process memory.
//! - [`durable::Journal`] persists records through any
//!   [`KeyValueStore`](crate::kv::KeyValueStore) and repairs itself after an
//!   unclean shutdown.

use std::future::Future;

use nonempty::NonEmpty;

use crate::Error;

pub mod durable;
pub mod inmemory;
mod repair;

pub use repair::RepairOutcome;

/// Prefix of journal record keys (`ES_J:<sequence>`).
pub const JOURNAL_PREFIX: &str = "ES_J:";
/// Prefix of reference keys (`ES_R:<stream>:<version>`).
pub const REFERENCE_PREFIX: &str = "ES_R:";

/// Record key for `sequence`.
#[must_use]
pub fn journal_key(sequence: u64) -> String {
    format!("{JOURNAL_PREFIX}{sequence}")
}

/// Reference key for a stream position.
#[must_use]
pub fn reference_key(stream_name: &str, stream_version: u32) -> String {
    format!("{REFERENCE_PREFIX}{stream_name}:{stream_version}")
}

/// A record to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Reference key that must not already exist.
    pub reference_key: String,
    pub value: Vec<u8>,
}

impl JournalEntry {
    pub fn new(reference_key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            reference_key: reference_key.into(),
            value: value.into(),
        }
    }
}

/// A record read back from the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedEntry {
    pub sequence: u64,
    pub reference_key: String,
    pub value: Vec<u8>,
}

/// Inclusive range of sequence numbers assigned to one append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    pub first: u64,
    pub last: u64,
}

/// Storage contract for append-only journals.
///
/// All reads stop at the first missing sequence number: a reader never skips
/// past a record that is still being committed.
pub trait Journal: Clone + Send + Sync + 'static {
    /// Append `entries` atomically.
    ///
    /// `lock_name` names the resource writers serialize on (typically the
    /// stream). Each entry receives the next sequence number, in order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateStreamPosition`] if any reference key already
    /// exists (or repeats within the batch); nothing is written in that case.
    /// Returns [`Error::Closed`] after [`close`](Self::close) and
    /// [`Error::StoreUnavailable`] on storage failure.
    fn log_entries<'a>(
        &'a self,
        lock_name: &'a str,
        entries: NonEmpty<JournalEntry>,
    ) -> impl Future<Output = Result<Appended, Error>> + Send + 'a;

    /// Records with `low <= sequence <= high`, stopping at the first gap.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] or [`Error::Corrupt`] if a record
    /// cannot be read.
    fn entries_between(&self, low: u64, high: u64) -> impl Future<Output = Result<Vec<LoggedEntry>, Error>> + Send + '_;

    /// Records after `sequence`, stopping at the first gap.
    ///
    /// # Errors
    ///
    /// See [`entries_between`](Self::entries_between).
    fn entries_since(&self, sequence: u64) -> impl Future<Output = Result<Vec<LoggedEntry>, Error>> + Send + '_ {
        self.entries_between(sequence.saturating_add(1), u64::MAX)
    }

    /// Records addressed by consecutive reference keys, stopping at the first
    /// key that is not present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] or [`Error::Corrupt`] if a record
    /// cannot be read.
    fn referenced_entries<'a, I>(&'a self, keys: I) -> impl Future<Output = Result<Vec<LoggedEntry>, Error>> + Send + 'a
    where
        I: IntoIterator<Item = String> + Send + 'a,
        I::IntoIter: Send + 'a;

    /// Highest sequence number handed out so far.
    fn count(&self) -> u64;

    /// Erase every record and reset the sequence.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] on storage failure.
    fn purge(&self) -> impl Future<Output = Result<(), Error>> + Send + '_;

    /// Persist whatever is needed for a clean reopen and refuse further writes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] on storage failure.
    fn close(&self) -> impl Future<Output = Result<(), Error>> + Send + '_;
}

/// Frame a reference key and a value into one stored record.
///
/// Layout: big-endian `u32` length of the reference key, the key bytes, then
/// the value bytes.
pub(crate) fn encode_record(reference_key: &str, value: &[u8]) -> Result<Vec<u8>, Error> {
    let length = u32::try_from(reference_key.len())
        .map_err(|_| Error::invalid(format!("reference key of {} bytes is too long", reference_key.len())))?;
    let mut record = Vec::with_capacity(4 + reference_key.len() + value.len());
    record.extend_from_slice(&length.to_be_bytes());
    record.extend_from_slice(reference_key.as_bytes());
    record.extend_from_slice(value);
    Ok(record)
}

/// Split a stored record into its reference key and value.
pub(crate) fn decode_record(key: &str, record: &[u8]) -> Result<(String, Vec<u8>), Error> {
    let (header, rest) = record
        .split_first_chunk::<4>()
        .ok_or_else(|| Error::corrupt(key, "record shorter than its header"))?;
    let length = u32::from_be_bytes(*header) as usize;
    if rest.len() < length {
        return Err(Error::corrupt(key, "reference key runs past end of record"));
    }
    let (reference, value) = rest.split_at(length);
    let reference = std::str::from_utf8(reference)
        .map_err(|_| Error::corrupt(key, "reference key is not UTF-8"))?
        .to_owned();
    Ok((reference, value.to_vec()))
}

/// Map a reference key back to the stream position it names.
pub(crate) fn duplicate_position(reference_key: &str) -> Error {
    let position = reference_key
        .strip_prefix(REFERENCE_PREFIX)
        .unwrap_or(reference_key);
    let (stream_name, stream_version) = position
        .rsplit_once(':')
        .and_then(|(name, version)| version.parse().ok().map(|version| (name, version)))
        .unwrap_or((position, 0));
    Error::DuplicateStreamPosition {
        stream_name: stream_name.to_owned(),
        stream_version,
    }
}
