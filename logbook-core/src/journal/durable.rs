//! Journal persisted through a [`KeyValueStore`].
//!
//! Records live under `ES_J:<sequence>` and stream positions under
//! `ES_R:<stream>:<version>`. The running sequence is written to `ES_J:0` on a
//! clean [`close`](super::Journal::close) and deleted again on
//! [`open`](Journal::open), so a missing counter next to existing records
//! means the previous process did not shut down cleanly. In that case the
//! repair scan rebuilds the counter before the journal accepts writes.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use nonempty::NonEmpty;

use crate::{
    Error, LogConfig,
    journal::{
        Appended, JOURNAL_PREFIX, JournalEntry, LoggedEntry, REFERENCE_PREFIX, RepairOutcome, decode_record,
        duplicate_position, encode_record, journal_key, repair,
    },
    kv::{KeyValueStore, UnitOfWork, WriteBatch},
};

/// Durable [`Journal`](super::Journal) over any key-value backend.
///
/// Appends reserve their sequences before committing, so concurrent appends
/// can land out of order. Readers and [`count`](super::Journal::count) only
/// see the committed prefix: a sequence becomes visible once it and every
/// sequence before it have been committed.
///
/// Clones share the counters and the closed flag.
#[derive(Debug, Clone)]
pub struct Journal<S: KeyValueStore> {
    store: S,
    sequence: Arc<AtomicU64>,
    committed: Arc<Mutex<Watermark>>,
    closed: Arc<AtomicBool>,
    repaired: Option<RepairOutcome>,
}

/// Highest sequence below which every append has finished, plus the ranges
/// that finished ahead of it.
#[derive(Debug, Default)]
struct Watermark {
    high: u64,
    pending: BTreeMap<u64, u64>,
}

impl Watermark {
    const fn at(high: u64) -> Self {
        Self {
            high,
            pending: BTreeMap::new(),
        }
    }

    fn settle(&mut self, first: u64, last: u64) -> u64 {
        self.pending.insert(first, last);
        while let Some(last) = self.pending.remove(&(self.high + 1)) {
            self.high = last;
        }
        self.high
    }
}

impl<S: KeyValueStore> Journal<S> {
    /// Open the journal stored in `store`, repairing it if the previous
    /// process did not close it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an unusable `config`,
    /// [`Error::RepairRequired`] if a needed repair scan cannot complete, and
    /// [`Error::StoreUnavailable`] or [`Error::Corrupt`] if the counter cannot
    /// be read.
    #[tracing::instrument(skip(store, config), fields(watermark = config.repair_watermark))]
    pub async fn open(store: S, config: &LogConfig) -> Result<Self, Error> {
        config.validate()?;
        let counter_key = journal_key(0);

        let (sequence, repaired) = match store.get(counter_key.as_bytes()).await? {
            Some(bytes) => (parse_sequence(&counter_key, &bytes)?, None),
            None if store.first_key_with_prefix(JOURNAL_PREFIX.as_bytes()).await?.is_some() => {
                let outcome = repair::run(&store, config.repair_watermark).await?;
                (outcome.last_sequence, Some(outcome))
            }
            None => (0, None),
        };

        let mut batch = WriteBatch::new();
        batch.delete(counter_key);
        store.write_batch(batch).await?;

        tracing::debug!(sequence, repaired = repaired.is_some(), "journal opened");
        Ok(Self {
            store,
            sequence: Arc::new(AtomicU64::new(sequence)),
            committed: Arc::new(Mutex::new(Watermark::at(sequence))),
            closed: Arc::new(AtomicBool::new(false)),
            repaired,
        })
    }

    /// The backing store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Result of the repair scan run by [`open`](Self::open), if one ran.
    #[must_use]
    pub const fn repaired(&self) -> Option<&RepairOutcome> {
        self.repaired.as_ref()
    }

    fn settle(&self, first: u64, last: u64) -> u64 {
        self.committed
            .lock()
            .expect("journal watermark lock poisoned")
            .settle(first, last)
    }

    async fn logged(&self, sequence: u64) -> Result<Option<LoggedEntry>, Error> {
        let key = journal_key(sequence);
        let Some(record) = self.store.get(key.as_bytes()).await? else {
            return Ok(None);
        };
        let (reference_key, value) = decode_record(&key, &record)?;
        Ok(Some(LoggedEntry {
            sequence,
            reference_key,
            value,
        }))
    }
}

impl<S: KeyValueStore> super::Journal for Journal<S> {
    #[tracing::instrument(skip(self, entries), fields(entry_count = entries.len()))]
    async fn log_entries<'a>(&'a self, lock_name: &'a str, entries: NonEmpty<JournalEntry>) -> Result<Appended, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let mut uow = UnitOfWork::start(&self.store);
        uow.lock(&format!("{REFERENCE_PREFIX}{lock_name}")).await?;

        let mut seen = HashSet::with_capacity(entries.len());
        let mut records = Vec::with_capacity(entries.len());
        for entry in &entries {
            if !seen.insert(entry.reference_key.as_str())
                || uow.read_bytes(entry.reference_key.as_bytes()).await?.is_some()
            {
                return Err(duplicate_position(&entry.reference_key));
            }
            records.push(encode_record(&entry.reference_key, &entry.value)?);
        }

        // Reserved only once the batch is known to be writable.
        let count = entries.len() as u64;
        let first = self.sequence.fetch_add(count, Ordering::AcqRel) + 1;
        for ((offset, entry), record) in (0_u64..).zip(entries.iter()).zip(records) {
            let sequence = first + offset;
            uow.write_bytes(journal_key(sequence).into_bytes(), record);
            uow.write_bytes(
                entry.reference_key.as_bytes().to_vec(),
                sequence.to_string().into_bytes(),
            );
        }
        let last = first + count - 1;
        if let Err(err) = uow.commit().await {
            // Hand the reservation back unless a later append already took
            // sequences after it.
            let released = self
                .sequence
                .compare_exchange(last, first - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if !released {
                // The range stays a hole; later appends must still settle past it.
                self.settle(first, last);
            }
            tracing::warn!(first, last, released, "journal commit failed");
            return Err(err);
        }

        let committed = self.settle(first, last);
        tracing::debug!(first, last, committed, "entries logged");
        Ok(Appended { first, last })
    }

    async fn entries_between(&self, low: u64, high: u64) -> Result<Vec<LoggedEntry>, Error> {
        let high = high.min(self.count());
        let mut entries = Vec::new();
        for sequence in low.max(1)..=high {
            match self.logged(sequence).await? {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }
        Ok(entries)
    }

    async fn referenced_entries<'a, I>(&'a self, keys: I) -> Result<Vec<LoggedEntry>, Error>
    where
        I: IntoIterator<Item = String> + Send + 'a,
        I::IntoIter: Send + 'a,
    {
        let mut entries = Vec::new();
        for key in keys {
            let Some(bytes) = self.store.get(key.as_bytes()).await? else {
                break;
            };
            let sequence = parse_sequence(&key, &bytes)?;
            match self.logged(sequence).await? {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }
        Ok(entries)
    }

    fn count(&self) -> u64 {
        self.committed.lock().expect("journal watermark lock poisoned").high
    }

    #[tracing::instrument(skip(self))]
    async fn purge(&self) -> Result<(), Error> {
        let mut batch = WriteBatch::new();
        batch.delete_prefix(JOURNAL_PREFIX).delete_prefix(REFERENCE_PREFIX);
        self.store.write_batch(batch).await?;
        self.sequence.store(0, Ordering::Release);
        *self.committed.lock().expect("journal watermark lock poisoned") = Watermark::default();
        tracing::debug!("journal purged");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let sequence = self.sequence.load(Ordering::Acquire);
        let mut batch = WriteBatch::new();
        batch.put(journal_key(0), sequence.to_string());
        self.store.write_batch(batch).await?;
        tracing::debug!(sequence, "journal closed");
        Ok(())
    }
}

pub(super) fn parse_sequence(key: &str, bytes: &[u8]) -> Result<u64, Error> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| Error::corrupt(key, "expected a decimal sequence number"))
}
