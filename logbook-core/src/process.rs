//! Long-running, time-constrained processes.
//!
//! A process (a saga spanning several aggregates) is allowed a bounded amount
//! of time, optionally with retries. Its [`TimeConstrainedProcessTracker`] is
//! persisted on its own so a scanner can detect timeouts without loading the
//! process, and raises a timeout signal when the deadline passes.
//!
//! - [`ProcessState`] / [`Process`] - the process side: completion and timeout
//!   bookkeeping
//! - [`signal`] - `ProcessTimedOut`, the `TimeoutSignal` trait and the
//!   `SignalRegistry` that builds concrete signals from a tracker's kind
//! - [`tracker`] - the tracker itself
//! - [`repository`] - tracker persistence over a key-value store
//! - [`sweep`] - inform every timed-out tracker and publish its signal

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

pub mod repository;
pub mod signal;
pub mod sweep;
pub mod tracker;

pub use repository::ProcessTrackerRepository;
pub use signal::{ProcessTimedOut, SignalRegistry, TimeoutSignal};
pub use sweep::sweep_timeouts;
pub use tracker::TimeConstrainedProcessTracker;

/// Identity of a process instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(String);

impl ProcessId {
    /// A fresh random id (lowercase UUID v4).
    #[must_use]
    pub fn new_process_id() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn existing(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a process ended, if it has.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessCompletion {
    #[default]
    NotCompleted,
    CompletedNormally,
    TimedOut,
}

/// Bookkeeping shared by every process type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessState {
    tenant_id: String,
    process_id: ProcessId,
    description: String,
    start_time: DateTime<Utc>,
    #[serde(with = "millis::optional")]
    allowable_duration: Option<TimeDelta>,
    total_retries_permitted: u32,
    completion: ProcessCompletion,
    timed_out_on: Option<DateTime<Utc>>,
    concurrency_version: u32,
}

impl ProcessState {
    /// A process with no time limit, started at `start_time`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the tenant id is blank.
    pub fn new(
        tenant_id: impl Into<String>,
        process_id: ProcessId,
        description: impl Into<String>,
        start_time: DateTime<Utc>,
    ) -> Result<Self, Error> {
        let tenant_id = tenant_id.into();
        if tenant_id.trim().is_empty() {
            return Err(Error::invalid("tenant id must be provided"));
        }
        Ok(Self {
            tenant_id,
            process_id,
            description: description.into(),
            start_time,
            allowable_duration: None,
            total_retries_permitted: 0,
            completion: ProcessCompletion::NotCompleted,
            timed_out_on: None,
            concurrency_version: 0,
        })
    }

    /// Limit the process to `allowable_duration` per attempt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] unless the duration is positive.
    pub fn with_allowable_duration(mut self, allowable_duration: TimeDelta) -> Result<Self, Error> {
        if allowable_duration <= TimeDelta::zero() {
            return Err(Error::invalid("allowable duration must be greater than zero"));
        }
        self.allowable_duration = Some(allowable_duration);
        Ok(self)
    }

    #[must_use]
    pub const fn with_total_retries_permitted(mut self, total_retries_permitted: u32) -> Self {
        self.total_retries_permitted = total_retries_permitted;
        self
    }

    #[must_use]
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    #[must_use]
    pub const fn process_id(&self) -> &ProcessId {
        &self.process_id
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub const fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    #[must_use]
    pub const fn allowable_duration(&self) -> Option<TimeDelta> {
        self.allowable_duration
    }

    #[must_use]
    pub const fn total_retries_permitted(&self) -> u32 {
        self.total_retries_permitted
    }

    #[must_use]
    pub const fn completion(&self) -> ProcessCompletion {
        self.completion
    }

    #[must_use]
    pub const fn timed_out_on(&self) -> Option<DateTime<Utc>> {
        self.timed_out_on
    }

    #[must_use]
    pub const fn concurrency_version(&self) -> u32 {
        self.concurrency_version
    }

    #[must_use]
    pub const fn can_timeout(&self) -> bool {
        self.allowable_duration.is_some()
    }

    /// Time elapsed between the start and `now`.
    #[must_use]
    pub fn current_duration_at(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.start_time
    }

    #[must_use]
    pub fn current_duration(&self) -> TimeDelta {
        self.current_duration_at(Utc::now())
    }

    /// The allowable duration, multiplied by the retries when any are
    /// permitted. `None` for a process that cannot time out.
    #[must_use]
    pub fn total_allowable_duration(&self) -> Option<TimeDelta> {
        let allowable = self.allowable_duration?;
        if self.total_retries_permitted == 0 {
            return Some(allowable);
        }
        let retries = i32::try_from(self.total_retries_permitted).unwrap_or(i32::MAX);
        Some(allowable.checked_mul(retries).unwrap_or(TimeDelta::MAX))
    }

    /// Record that the process timed out at `timed_out_on`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the process cannot time out or
    /// `timed_out_on` is earlier than its total allowable duration.
    pub fn inform_timeout(&mut self, timed_out_on: DateTime<Utc>) -> Result<(), Error> {
        let total = self
            .total_allowable_duration()
            .ok_or_else(|| Error::invalid("process does not time out"))?;
        if self.current_duration_at(timed_out_on) < total {
            return Err(Error::invalid(format!(
                "{timed_out_on} does not indicate a valid timeout"
            )));
        }
        self.completion = ProcessCompletion::TimedOut;
        self.timed_out_on = Some(timed_out_on);
        Ok(())
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completion != ProcessCompletion::NotCompleted
    }

    #[must_use]
    pub const fn is_timed_out(&self) -> bool {
        self.timed_out_on.is_some()
    }

    /// Completed, and not by timing out.
    #[must_use]
    pub fn did_processing_complete(&self) -> bool {
        self.is_completed() && !self.is_timed_out()
    }

    /// Check a caller's version against this state's.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConcurrencyViolation`] if they differ.
    pub fn fail_when_concurrency_violation(&self, version: u32) -> Result<(), Error> {
        if version != self.concurrency_version {
            return Err(crate::concurrency::ConcurrencyViolation {
                entity: format!("process {}", self.process_id),
                expected: version,
                actual: self.concurrency_version,
            }
            .into());
        }
        Ok(())
    }
}

/// A time-constrained process.
///
/// Implementors hold a [`ProcessState`] and decide when their work is done.
pub trait Process {
    /// Signal raised when this process times out.
    type TimedOut: TimeoutSignal;

    fn state(&self) -> &ProcessState;

    fn state_mut(&mut self) -> &mut ProcessState;

    /// Whether every step the process waits for has happened.
    fn completeness_verified(&self) -> bool;

    /// Mark the process `completion` if it is verified and not yet completed.
    fn complete_process(&mut self, completion: ProcessCompletion) {
        if !self.state().is_completed() && self.completeness_verified() {
            self.state_mut().completion = completion;
        }
    }

    /// A tracker that raises [`Self::TimedOut`] when this process runs late.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the process cannot time out or
    /// its description is not 1 to 100 characters.
    fn time_constrained_tracker(&self) -> Result<TimeConstrainedProcessTracker, Error> {
        let state = self.state();
        let allowable = state
            .allowable_duration
            .ok_or_else(|| Error::invalid("process does not time out"))?;
        TimeConstrainedProcessTracker::new(
            state.tenant_id.clone(),
            state.process_id.clone(),
            state.description.clone(),
            state.start_time,
            allowable,
            state.total_retries_permitted,
            <Self::TimedOut as crate::event::DomainEvent>::KIND,
        )
    }
}

/// `TimeDelta` as whole milliseconds.
pub(crate) mod millis {
    use chrono::TimeDelta;
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(value: &TimeDelta, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_milliseconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TimeDelta, D::Error> {
        let millis = i64::deserialize(deserializer)?;
        TimeDelta::try_milliseconds(millis).ok_or_else(|| D::Error::custom("duration out of range"))
    }

    pub mod optional {
        use chrono::TimeDelta;
        use serde::{Deserialize, Deserializer, Serializer};

        #[allow(clippy::ref_option, reason = "signature fixed by serde(with)")]
        pub fn serialize<S: Serializer>(value: &Option<TimeDelta>, serializer: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<TimeDelta>, D::Error> {
            #[derive(Deserialize)]
            struct Wrapper(#[serde(with = "super")] TimeDelta);

            Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(duration)| duration))
        }
    }
}
