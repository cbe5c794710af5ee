//! In-memory journal for tests and single-process use.
//!
//! ```
//! use logbook_core::journal::{Journal as _, inmemory};
//!
//! let journal = inmemory::Journal::new();
//! assert_eq!(journal.count(), 0);
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
};

use nonempty::NonEmpty;

use crate::{
    Error,
    journal::{Appended, JournalEntry, LoggedEntry, duplicate_position},
};

/// Volatile [`Journal`](super::Journal). Clones share state.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<u64, (String, Vec<u8>)>,
    references: HashMap<String, u64>,
    sequence: u64,
    closed: bool,
}

impl Inner {
    fn logged(&self, sequence: u64) -> Option<LoggedEntry> {
        self.records.get(&sequence).map(|(reference_key, value)| LoggedEntry {
            sequence,
            reference_key: reference_key.clone(),
            value: value.clone(),
        })
    }
}

impl Journal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl super::Journal for Journal {
    #[tracing::instrument(skip(self, entries), fields(entry_count = entries.len()))]
    fn log_entries<'a>(
        &'a self,
        lock_name: &'a str,
        entries: NonEmpty<JournalEntry>,
    ) -> impl Future<Output = Result<Appended, Error>> + Send + 'a {
        let result = (|| {
            let mut inner = self.inner.write().expect("in-memory journal lock poisoned");
            if inner.closed {
                return Err(Error::Closed);
            }
            let mut seen = std::collections::HashSet::with_capacity(entries.len());
            for entry in &entries {
                if inner.references.contains_key(&entry.reference_key) || !seen.insert(&entry.reference_key) {
                    return Err(duplicate_position(&entry.reference_key));
                }
            }

            let first = inner.sequence + 1;
            for entry in entries {
                inner.sequence += 1;
                let sequence = inner.sequence;
                inner.references.insert(entry.reference_key.clone(), sequence);
                inner.records.insert(sequence, (entry.reference_key, entry.value));
            }
            let last = inner.sequence;
            drop(inner);
            tracing::debug!(first, last, "entries logged");
            Ok(Appended { first, last })
        })();
        std::future::ready(result)
    }

    fn entries_between(&self, low: u64, high: u64) -> impl Future<Output = Result<Vec<LoggedEntry>, Error>> + Send + '_ {
        let inner = self.inner.read().expect("in-memory journal lock poisoned");
        let high = high.min(inner.sequence);
        let mut entries = Vec::new();
        let mut sequence = low.max(1);
        while sequence <= high {
            let Some(entry) = inner.logged(sequence) else {
                break;
            };
            entries.push(entry);
            sequence += 1;
        }
        drop(inner);
        std::future::ready(Ok(entries))
    }

    fn referenced_entries<'a, I>(&'a self, keys: I) -> impl Future<Output = Result<Vec<LoggedEntry>, Error>> + Send + 'a
    where
        I: IntoIterator<Item = String> + Send + 'a,
        I::IntoIter: Send + 'a,
    {
        let inner = self.inner.read().expect("in-memory journal lock poisoned");
        let entries: Vec<LoggedEntry> = keys
            .into_iter()
            .map_while(|key| inner.references.get(&key).and_then(|sequence| inner.logged(*sequence)))
            .collect();
        drop(inner);
        std::future::ready(Ok(entries))
    }

    fn count(&self) -> u64 {
        self.inner.read().expect("in-memory journal lock poisoned").sequence
    }

    #[tracing::instrument(skip(self))]
    fn purge(&self) -> impl Future<Output = Result<(), Error>> + Send + '_ {
        let mut inner = self.inner.write().expect("in-memory journal lock poisoned");
        inner.records.clear();
        inner.references.clear();
        inner.sequence = 0;
        drop(inner);
        tracing::debug!("journal purged");
        std::future::ready(Ok(()))
    }

    fn close(&self) -> impl Future<Output = Result<(), Error>> + Send + '_ {
        self.inner.write().expect("in-memory journal lock poisoned").closed = true;
        std::future::ready(Ok(()))
    }
}
