//! Recovery scan for journals that were not closed cleanly.
//!
//! The scan walks `ES_J:1, ES_J:2, ...`. Everything up to the first missing
//! sequence is kept and defines the recovered counter. Records found after
//! that gap were committed by appends racing a crash; they are deleted along
//! with the stream reference that points at them, so the stream position can
//! be written again. The scan ends once `watermark` consecutive sequence
//! numbers are missing.

use crate::{
    Error,
    journal::{decode_record, durable::parse_sequence, journal_key},
    kv::{KeyValueStore, WriteBatch},
};

/// What a repair scan found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairOutcome {
    /// Last sequence of the contiguous prefix; the journal resumes after it.
    pub last_sequence: u64,
    /// Records deleted because they sat beyond a gap.
    pub orphans_removed: u64,
    /// Highest sequence number probed.
    pub scanned_to: u64,
}

pub(super) async fn run<S: KeyValueStore>(store: &S, watermark: u64) -> Result<RepairOutcome, Error> {
    let mut outcome = RepairOutcome {
        last_sequence: 0,
        orphans_removed: 0,
        scanned_to: 0,
    };
    let mut contiguous = true;
    let mut missing = 0_u64;
    let mut sequence = 0_u64;

    while missing < watermark {
        sequence += 1;
        let key = journal_key(sequence);
        let record = store.get(key.as_bytes()).await.map_err(|err| Error::RepairRequired {
            reason: format!("could not read `{key}`: {err}"),
        })?;
        let Some(record) = record else {
            contiguous = false;
            missing += 1;
            continue;
        };
        missing = 0;
        if contiguous {
            outcome.last_sequence = sequence;
        } else {
            remove_orphan(store, sequence, &key, &record).await;
            outcome.orphans_removed += 1;
        }
    }
    outcome.scanned_to = sequence;

    tracing::warn!(
        last_sequence = outcome.last_sequence,
        orphans_removed = outcome.orphans_removed,
        scanned_to = outcome.scanned_to,
        "journal was not closed cleanly; recovered sequence counter"
    );
    Ok(outcome)
}

/// Best effort: failures are logged and the scan carries on.
async fn remove_orphan<S: KeyValueStore>(store: &S, sequence: u64, key: &str, record: &[u8]) {
    let mut batch = WriteBatch::new();
    batch.delete(key);

    match decode_record(key, record) {
        Ok((reference_key, _)) => match store.get(reference_key.as_bytes()).await {
            Ok(Some(bytes)) if parse_sequence(&reference_key, &bytes).ok() == Some(sequence) => {
                batch.delete(reference_key);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(%reference_key, error = %err, "could not inspect orphaned stream reference");
            }
        },
        Err(err) => tracing::warn!(key, error = %err, "orphaned record is unreadable; deleting it alone"),
    }

    if let Err(err) = store.write_batch(batch).await {
        tracing::warn!(key, error = %err, "could not delete orphaned journal record");
    } else {
        tracing::info!(key, "deleted orphaned journal record");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        journal::{encode_record, reference_key},
        kv::inmemory::Store,
        test::write_raw_entry,
    };

    async fn put_entry(store: &Store, sequence: u64, stream: &str, version: u32) {
        write_raw_entry(store, sequence, &reference_key(stream, version), b"{}")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn contiguous_prefix_defines_counter() {
        let store = Store::new();
        for sequence in 1..=3 {
            put_entry(&store, sequence, "s", u32::try_from(sequence).unwrap()).await;
        }

        let outcome = run(&store, 10).await.unwrap();
        assert_eq!(outcome.last_sequence, 3);
        assert_eq!(outcome.orphans_removed, 0);
        assert_eq!(outcome.scanned_to, 13);
    }

    #[tokio::test]
    async fn entries_beyond_gap_are_removed_with_their_references() {
        let store = Store::new();
        put_entry(&store, 1, "a", 1).await;
        put_entry(&store, 2, "a", 2).await;
        put_entry(&store, 4, "b", 1).await;
        put_entry(&store, 7, "c", 1).await;

        let outcome = run(&store, 5).await.unwrap();
        assert_eq!(outcome.last_sequence, 2);
        assert_eq!(outcome.orphans_removed, 2);
        assert_eq!(
            store.keys(),
            vec!["ES_J:1", "ES_J:2", "ES_R:a:1", "ES_R:a:2"]
        );
    }

    #[tokio::test]
    async fn reference_owned_by_other_sequence_survives() {
        let store = Store::new();
        put_entry(&store, 1, "a", 1).await;
        // Orphan at 3 claims a:1, but the reference belongs to sequence 1.
        let mut batch = WriteBatch::new();
        batch.put(journal_key(3), encode_record(&reference_key("a", 1), b"{}").unwrap());
        store.write_batch(batch).await.unwrap();

        let outcome = run(&store, 3).await.unwrap();
        assert_eq!(outcome.orphans_removed, 1);
        assert_eq!(store.get(b"ES_R:a:1").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"ES_J:3").await.unwrap(), None);
    }

    #[tokio::test]
    async fn watermark_bounds_the_scan() {
        let store = Store::new();
        put_entry(&store, 1, "a", 1).await;
        put_entry(&store, 6, "a", 2).await;

        // Four missing keys end the scan before sequence 6 is reached.
        let outcome = run(&store, 4).await.unwrap();
        assert_eq!(outcome.orphans_removed, 0);
        assert_eq!(outcome.scanned_to, 5);
        assert!(store.get(b"ES_J:6").await.unwrap().is_some());
    }
}
