use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    Error,
    process::{ProcessId, ProcessTimedOut, SignalRegistry, millis},
};

const MAX_DESCRIPTION_CHARS: usize = 100;

/// Deadline and retry budget of one process.
///
/// Timeouts are polled: something must call
/// [`inform_timed_out_at`](Self::inform_timed_out_at) periodically. A missed
/// poll delays the signal but never loses it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeConstrainedProcessTracker {
    tenant_id: String,
    process_id: ProcessId,
    description: String,
    #[serde(with = "millis")]
    allowable_duration: TimeDelta,
    total_retries_permitted: u32,
    retry_count: u32,
    timeout_occurs_on: DateTime<Utc>,
    informed_of_timeout: bool,
    completed: bool,
    signal_kind: String,
    concurrency_version: u32,
}

impl TimeConstrainedProcessTracker {
    /// Track a process started at `start_time`; its first deadline is
    /// `start_time + allowable_duration`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the tenant id or signal kind is
    /// blank, the description is not 1 to 100 characters, or the duration is
    /// not positive.
    pub fn new(
        tenant_id: impl Into<String>,
        process_id: ProcessId,
        description: impl Into<String>,
        start_time: DateTime<Utc>,
        allowable_duration: TimeDelta,
        total_retries_permitted: u32,
        signal_kind: impl Into<String>,
    ) -> Result<Self, Error> {
        let tenant_id = tenant_id.into();
        let description = description.into();
        let signal_kind = signal_kind.into();
        if tenant_id.trim().is_empty() {
            return Err(Error::invalid("tenant id is required"));
        }
        if !(1..=MAX_DESCRIPTION_CHARS).contains(&description.chars().count()) {
            return Err(Error::invalid("description must be 1 to 100 characters in length"));
        }
        if signal_kind.trim().is_empty() {
            return Err(Error::invalid("timeout signal kind is required"));
        }
        if allowable_duration <= TimeDelta::zero() {
            return Err(Error::invalid("allowable duration must be greater than zero"));
        }
        let timeout_occurs_on = start_time
            .checked_add_signed(allowable_duration)
            .ok_or_else(|| Error::invalid("timeout falls outside the representable range"))?;

        Ok(Self {
            tenant_id,
            process_id,
            description,
            allowable_duration,
            total_retries_permitted,
            retry_count: 0,
            timeout_occurs_on,
            informed_of_timeout: false,
            completed: false,
            signal_kind,
            concurrency_version: 0,
        })
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
    pub const fn allowable_duration(&self) -> TimeDelta {
        self.allowable_duration
    }

    #[must_use]
    pub const fn total_retries_permitted(&self) -> u32 {
        self.total_retries_permitted
    }

    #[must_use]
    pub const fn retry_count(&self) -> u32 {
        self.retry_count
    }

    #[must_use]
    pub const fn timeout_occurs_on(&self) -> DateTime<Utc> {
        self.timeout_occurs_on
    }

    #[must_use]
    pub const fn is_informed_of_timeout(&self) -> bool {
        self.informed_of_timeout
    }

    /// Kind of the signal raised on timeout.
    #[must_use]
    pub fn signal_kind(&self) -> &str {
        &self.signal_kind
    }

    #[must_use]
    pub const fn concurrency_version(&self) -> u32 {
        self.concurrency_version
    }

    pub(crate) const fn set_concurrency_version(&mut self, concurrency_version: u32) {
        self.concurrency_version = concurrency_version;
    }

    /// Mark the tracked process as finished; scanners skip it from now on.
    pub const fn completed(&mut self) {
        self.completed = true;
    }

    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.completed
    }

    #[must_use]
    pub fn has_timed_out_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.timeout_occurs_on
    }

    #[must_use]
    pub fn has_timed_out(&self) -> bool {
        self.has_timed_out_at(Utc::now())
    }

    /// [`inform_timed_out_at`](Self::inform_timed_out_at) the current time.
    ///
    /// # Errors
    ///
    /// See [`inform_timed_out_at`](Self::inform_timed_out_at).
    pub fn inform_timed_out<Sig>(&mut self, registry: &SignalRegistry<Sig>) -> Result<Option<Sig>, Error> {
        self.inform_timed_out_at(Utc::now(), registry)
    }

    /// Raise the timeout signal if the deadline has passed at `now`.
    ///
    /// Returns `Ok(None)` when already informed or not yet timed out. Without
    /// retries the first signal is final. With retries each signal counts one
    /// retry and moves the deadline forward by the allowable duration, until
    /// the budget is spent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownSignalKind`] if `registry` cannot build this
    /// tracker's signal; the tracker is left unchanged.
    #[tracing::instrument(
        skip(self, registry),
        fields(process = %self.process_id, retry = self.retry_count)
    )]
    pub fn inform_timed_out_at<Sig>(
        &mut self,
        now: DateTime<Utc>,
        registry: &SignalRegistry<Sig>,
    ) -> Result<Option<Sig>, Error> {
        if self.informed_of_timeout || !self.has_timed_out_at(now) {
            return Ok(None);
        }

        let retry_count = if self.total_retries_permitted == 0 {
            0
        } else {
            self.retry_count.saturating_add(1)
        };
        let signal = registry.build(
            &self.signal_kind,
            ProcessTimedOut {
                tenant_id: self.tenant_id.clone(),
                process_id: self.process_id.clone(),
                total_retries_permitted: self.total_retries_permitted,
                retry_count,
                occurred_on: now,
            },
        )?;

        self.retry_count = retry_count;
        if retry_count >= self.total_retries_permitted {
            self.informed_of_timeout = true;
        } else {
            match self.timeout_occurs_on.checked_add_signed(self.allowable_duration) {
                Some(next) => self.timeout_occurs_on = next,
                None => self.informed_of_timeout = true,
            }
        }
        tracing::debug!(
            retry_count,
            informed = self.informed_of_timeout,
            "process timed out"
        );
        Ok(Some(signal))
    }
}
