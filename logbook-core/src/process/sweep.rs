use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    Error,
    event::EventKind,
    journal::Journal,
    kv::KeyValueStore,
    process::{ProcessTrackerRepository, SignalRegistry, TimeConstrainedProcessTracker},
    store::{EventStore, EventStreamId},
};

const TIMEOUT_STREAM: &str = "process-timeout";

/// Raise the timeout signal of every overdue tracker and append it to the
/// event store.
///
/// Each signal goes to the stream `process-timeout:<tenant>:<process>` at
/// version `max(retry_count, 1)`, so a signal appended by an earlier sweep
/// that failed to save its tracker is detected as a duplicate instead of
/// being published twice. Trackers saved concurrently by someone else are
/// skipped with a warning and picked up by the next sweep.
///
/// Returns the signals appended by this sweep.
///
/// # Errors
///
/// Returns an error if the trackers cannot be read, a signal cannot be built
/// or appended, or a tracker cannot be saved for a reason other than a
/// concurrent save.
#[tracing::instrument(skip(repository, store, registry))]
pub async fn sweep_timeouts<S, J, Sig>(
    repository: &ProcessTrackerRepository<S>,
    store: &EventStore<J>,
    registry: &SignalRegistry<Sig>,
    now: DateTime<Utc>,
) -> Result<Vec<Sig>, Error>
where
    S: KeyValueStore,
    J: Journal,
    Sig: EventKind + Serialize + Sync,
{
    let mut signals = Vec::new();
    for mut tracker in repository.all_timed_out(now).await? {
        let Some(signal) = tracker.inform_timed_out_at(now, registry)? else {
            continue;
        };

        let stream_id = EventStreamId::with_version(stream_name(&tracker), tracker.retry_count().max(1));
        let appended = match store.append(&stream_id, std::slice::from_ref(&signal)).await {
            Ok(()) => true,
            Err(err) if err.is_duplicate_stream_position() => {
                tracing::debug!(stream = %stream_id.stream_name(), "timeout already published");
                false
            }
            Err(err) => return Err(err),
        };

        match repository.save(&mut tracker).await {
            Ok(()) => {}
            Err(Error::ConcurrencyViolation(violation)) => {
                tracing::warn!(%violation, "tracker changed during sweep");
                continue;
            }
            Err(err) => return Err(err),
        }
        if appended {
            signals.push(signal);
        }
    }
    tracing::debug!(signalled = signals.len(), "timeout sweep finished");
    Ok(signals)
}

fn stream_name(tracker: &TimeConstrainedProcessTracker) -> String {
    format!("{TIMEOUT_STREAM}:{}:{}", tracker.tenant_id(), tracker.process_id())
}
