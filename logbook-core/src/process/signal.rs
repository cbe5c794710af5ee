//! Timeout signals.
//!
//! Every process type names its own timeout signal. Trackers only persist the
//! signal's kind string, so a [`SignalRegistry`] maps that kind back to a
//! construction function. Registration happens in code, per signal type.

use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, event::DomainEvent, process::ProcessId};

/// Data every timeout signal carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessTimedOut {
    pub tenant_id: String,
    pub process_id: ProcessId,
    pub total_retries_permitted: u32,
    pub retry_count: u32,
    pub occurred_on: DateTime<Utc>,
}

impl ProcessTimedOut {
    #[must_use]
    pub const fn allows_retries(&self) -> bool {
        self.total_retries_permitted > 0
    }

    /// No further retry will follow this signal.
    #[must_use]
    pub const fn has_fully_timed_out(&self) -> bool {
        !self.allows_retries() || self.total_retries_reached()
    }

    #[must_use]
    pub const fn total_retries_reached(&self) -> bool {
        self.retry_count >= self.total_retries_permitted
    }
}

impl DomainEvent for ProcessTimedOut {
    const KIND: &'static str = "process-timed-out";

    fn occurred_on(&self) -> DateTime<Utc> {
        self.occurred_on
    }
}

/// A concrete timeout signal built from [`ProcessTimedOut`] data.
pub trait TimeoutSignal: DomainEvent {
    fn from_timed_out(timed_out: ProcessTimedOut) -> Self;
}

impl TimeoutSignal for ProcessTimedOut {
    fn from_timed_out(timed_out: ProcessTimedOut) -> Self {
        timed_out
    }
}

/// Builds signals of type `Sig` by kind.
///
/// `Sig` is usually an event-set enum over every signal type a service knows.
///
/// ```
/// use logbook_core::process::{ProcessTimedOut, SignalRegistry};
///
/// let registry = SignalRegistry::<ProcessTimedOut>::new().register::<ProcessTimedOut>();
/// assert!(registry.contains("process-timed-out"));
/// ```
pub struct SignalRegistry<Sig> {
    builders: HashMap<&'static str, fn(ProcessTimedOut) -> Sig>,
}

impl<Sig> SignalRegistry<Sig> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Make signals of kind `T::KIND` buildable.
    #[must_use]
    pub fn register<T>(mut self) -> Self
    where
        T: TimeoutSignal + Into<Sig>,
    {
        self.builders.insert(T::KIND, build::<T, Sig>);
        self
    }

    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.builders.contains_key(kind)
    }

    /// Build the signal registered under `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownSignalKind`] if nothing is registered under
    /// `kind`.
    pub fn build(&self, kind: &str, timed_out: ProcessTimedOut) -> Result<Sig, Error> {
        let builder = self
            .builders
            .get(kind)
            .ok_or_else(|| Error::UnknownSignalKind(kind.to_owned()))?;
        Ok(builder(timed_out))
    }
}

impl<Sig> Default for SignalRegistry<Sig> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Sig> fmt::Debug for SignalRegistry<Sig> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.builders.keys().collect();
        kinds.sort_unstable();
        f.debug_struct("SignalRegistry").field("kinds", &kinds).finish()
    }
}

fn build<T, Sig>(timed_out: ProcessTimedOut) -> Sig
where
    T: TimeoutSignal + Into<Sig>,
{
    T::from_timed_out(timed_out).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{ReviewTimedOut, fixed_time};

    fn timed_out(retry_count: u32, total_retries_permitted: u32) -> ProcessTimedOut {
        ProcessTimedOut {
            tenant_id: "acme".into(),
            process_id: ProcessId::existing("p-1"),
            total_retries_permitted,
            retry_count,
            occurred_on: fixed_time(),
        }
    }

    #[test]
    fn retry_predicates() {
        let final_without_retries = timed_out(0, 0);
        assert!(!final_without_retries.allows_retries());
        assert!(final_without_retries.has_fully_timed_out());

        let first_of_three = timed_out(1, 3);
        assert!(first_of_three.allows_retries());
        assert!(!first_of_three.total_retries_reached());
        assert!(!first_of_three.has_fully_timed_out());

        assert!(timed_out(3, 3).has_fully_timed_out());
    }

    #[test]
    fn registry_builds_registered_kinds_only() {
        let registry = SignalRegistry::<ReviewTimedOut>::new().register::<ReviewTimedOut>();

        let signal = registry.build("review-timed-out", timed_out(1, 2)).unwrap();
        assert_eq!(signal.0.retry_count, 1);

        let err = registry.build("process-timed-out", timed_out(0, 0)).unwrap_err();
        assert!(matches!(err, Error::UnknownSignalKind(ref kind) if kind == "process-timed-out"));
        assert_eq!(format!("{registry:?}"), r#"SignalRegistry { kinds: ["review-timed-out"] }"#);
    }
}
