//! Integration tests for the SQLite-backed store.
//!
//! Each test opens a database file in a fresh temporary directory.

use chrono::TimeDelta;
use logbook_core::{
    Error, LogConfig,
    journal::durable,
    kv::{Key, KeyValueStore, UnitOfWork},
    notification::{KvPublishedNotificationTrackerStore, Notification, PublishedNotificationTrackerStore},
    process::{ProcessId, ProcessTrackerRepository, TimeConstrainedProcessTracker},
    store::{EventStore, EventStreamId},
    test::{Tick, fixed_time, seed, tick, write_raw_entry},
};
use logbook_sqlite::{PoolConfig, Store};
use tempfile::TempDir;

/// Test helper owning the temporary directory for as long as the test runs.
struct TestDb {
    dir: TempDir,
}

impl TestDb {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    async fn open(&self) -> Store {
        let path = self.dir.path().join("events.db");
        Store::open(path.to_str().unwrap(), &PoolConfig::default()).await.unwrap()
    }

    async fn events(&self) -> EventStore<durable::Journal<Store>> {
        let journal = durable::Journal::open(self.open().await, &LogConfig::default())
            .await
            .unwrap();
        EventStore::new(journal)
    }
}

#[tokio::test]
async fn migrate_is_idempotent() {
    let db = TestDb::new();
    let store = db.open().await;
    store.migrate().await.unwrap();
    store.migrate().await.unwrap();

    assert_eq!(store.first_key_with_prefix(b"ES_J:").await.unwrap(), None);
}

#[tokio::test]
async fn clean_close_resumes_sequence_on_reopen() {
    let db = TestDb::new();
    let events = db.events().await;
    seed(&events, "ticks", 3).await.unwrap();
    events.close().await.unwrap();

    let reopened = db.events().await;
    assert_eq!(reopened.count(), 3);
    assert!(reopened.journal().repaired().is_none());

    reopened
        .append(&EventStreamId::new("more"), &[tick(4)])
        .await
        .unwrap();
    let stored = reopened.events_since::<Tick>(3).await.unwrap();
    assert_eq!(stored[0].sequence, 4);
    assert_eq!(stored[0].event, tick(4));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_leave_no_gaps() {
    let db = TestDb::new();
    let events = db.events().await;

    let writers: Vec<_> = (0..6_u64)
        .map(|writer| {
            let events = events.clone();
            tokio::spawn(async move {
                let stream = format!("ticks-{writer}");
                for batch in 0..5_u32 {
                    let ticks = [tick(u64::from(batch) * 2 + 1), tick(u64::from(batch) * 2 + 2)];
                    events
                        .append(&EventStreamId::with_version(stream.as_str(), batch * 2 + 1), &ticks)
                        .await
                        .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    let sequences: Vec<u64> = events
        .events_since::<Tick>(0)
        .await
        .unwrap()
        .iter()
        .map(|stored| stored.sequence)
        .collect();
    assert_eq!(sequences, (1..=60).collect::<Vec<_>>());
    assert_eq!(events.count(), 60);
}

#[tokio::test]
async fn crash_leftovers_are_repaired_on_open() {
    let db = TestDb::new();
    let events = db.events().await;
    seed(&events, "ticks", 2).await.unwrap();
    // Sequence 3 never committed; 4 did, then the process died.
    write_raw_entry(events.journal().store(), 4, "ES_R:ghost:1", b"{}")
        .await
        .unwrap();
    drop(events);

    let reopened = db.events().await;
    let outcome = reopened.journal().repaired().copied().unwrap();
    assert_eq!(outcome.last_sequence, 2);
    assert_eq!(outcome.orphans_removed, 1);
    assert_eq!(reopened.journal().store().get(b"ES_J:4").await.unwrap(), None);
    assert_eq!(reopened.journal().store().get(b"ES_R:ghost:1").await.unwrap(), None);

    reopened
        .append(&EventStreamId::new("ghost"), &[tick(3)])
        .await
        .unwrap();
    assert_eq!(reopened.count(), 3);
    assert_eq!(reopened.full_stream::<Tick>("ticks").await.unwrap().version, 2);
}

#[tokio::test]
async fn duplicate_stream_position_survives_reopen() {
    let db = TestDb::new();
    let events = db.events().await;
    seed(&events, "ticks", 1).await.unwrap();
    events.close().await.unwrap();

    let reopened = db.events().await;
    let err = reopened
        .append(&EventStreamId::new("ticks"), &[tick(9)])
        .await
        .unwrap_err();
    assert!(err.is_duplicate_stream_position());
    assert_eq!(reopened.count(), 1);
}

#[tokio::test]
async fn unit_of_work_applies_all_or_nothing() {
    let db = TestDb::new();
    let store = db.open().await;
    let a = Key::new("a").unwrap();
    let b = Key::new("b").unwrap();

    let mut uow = UnitOfWork::start(&store);
    uow.write(&a, &1).unwrap();
    uow.write(&b, &2).unwrap();
    uow.rollback();
    assert_eq!(store.get(b"a").await.unwrap(), None);

    let mut uow = UnitOfWork::start(&store);
    uow.write(&a, &1).unwrap();
    uow.write(&b, &2).unwrap();
    uow.commit().await.unwrap();

    let reader = UnitOfWork::start(&store);
    assert_eq!(reader.read::<i32>(&a).await.unwrap(), Some(1));
    assert_eq!(reader.read::<i32>(&b).await.unwrap(), Some(2));
}

#[tokio::test]
async fn key_locks_honour_the_log_lock_timeout() {
    let db = TestDb::new();
    let log = LogConfig::default().with_lock_timeout(Some(std::time::Duration::from_millis(30)));
    let path = db.dir.path().join("events.db");
    let store = Store::open(path.to_str().unwrap(), &PoolConfig::from(&log)).await.unwrap();
    assert_eq!(store.locks().timeout(), log.lock_timeout);

    let mut holder = UnitOfWork::start(&store);
    holder.lock("ES_R:ticks").await.unwrap();
    let mut contender = UnitOfWork::start(&store);
    let err = contender.lock("ES_R:ticks").await.unwrap_err();
    assert!(matches!(err, Error::LockTimeout { ref key, .. } if key == "ES_R:ticks"));
}

#[tokio::test]
async fn closed_pool_reports_store_unavailable() {
    let db = TestDb::new();
    let store = db.open().await;
    store.close().await;

    let err = store.get(b"a").await.unwrap_err();
    assert!(matches!(err, Error::StoreUnavailable { .. }));
}

#[tokio::test]
async fn publication_progress_is_durable() {
    let db = TestDb::new();
    let trackers = KvPublishedNotificationTrackerStore::new(db.open().await);
    let mut tracker = trackers.current("bus").await.unwrap();
    let sent = Notification {
        notification_id: 5,
        occurred_on: fixed_time(),
        type_tag: "tick".into(),
        version: 1,
        event: tick(5),
    };
    trackers.track_most_recent(&mut tracker, &[sent]).await.unwrap();

    let reopened = KvPublishedNotificationTrackerStore::new(db.open().await);
    let tracker = reopened.current("bus").await.unwrap();
    assert_eq!(tracker.most_recent_published_id(), 5);
    assert_eq!(tracker.concurrency_version(), 1);
}

#[tokio::test]
async fn process_trackers_are_durable() {
    let db = TestDb::new();
    let repository = ProcessTrackerRepository::new(db.open().await);
    let mut tracker = TimeConstrainedProcessTracker::new(
        "acme",
        ProcessId::existing("p-1"),
        "Review backlog item",
        fixed_time(),
        TimeDelta::seconds(30),
        1,
        "review-timed-out",
    )
    .unwrap();
    repository.add(&mut tracker).await.unwrap();

    let reopened = ProcessTrackerRepository::new(db.open().await);
    let loaded = reopened
        .tracker_of_process_id("acme", &ProcessId::existing("p-1"))
        .await
        .unwrap();
    assert_eq!(loaded, Some(tracker));

    let due = reopened
        .all_timed_out(fixed_time() + TimeDelta::seconds(30))
        .await
        .unwrap();
    assert_eq!(due.len(), 1);
}
