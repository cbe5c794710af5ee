//! Notification log pages and their ids.

use std::{fmt, str::FromStr};

use crate::{Error, notification::Notification};

/// Inclusive sequence range `low..=high` covered by one page.
///
/// Ids are pure functions of the page size: neighbours can be computed without
/// touching the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotificationLogId {
    low: u64,
    high: u64,
}

impl NotificationLogId {
    #[must_use]
    pub const fn new(low: u64, high: u64) -> Self {
        Self { low, high }
    }

    /// The first page: `1..=page_size`.
    #[must_use]
    pub fn first(page_size: u64) -> Self {
        Self::new(1, page_size)
    }

    #[must_use]
    pub const fn low(&self) -> u64 {
        self.low
    }

    #[must_use]
    pub const fn high(&self) -> u64 {
        self.high
    }

    /// The page after this one, or `None` if it would be this page again.
    #[must_use]
    pub fn next(&self, page_size: u64) -> Option<Self> {
        let low = self.high.saturating_add(1);
        let next = Self::new(low, (low + page_size).saturating_sub(1));
        (next != *self).then_some(next)
    }

    /// The page before this one, clamped to start at 1; `None` if that is this
    /// page again.
    #[must_use]
    pub fn previous(&self, page_size: u64) -> Option<Self> {
        let low = self.low.saturating_sub(page_size).max(1);
        let previous = Self::new(low, (low + page_size).saturating_sub(1));
        (previous != *self).then_some(previous)
    }

    /// Whether this id covers exactly one page boundary-to-boundary.
    #[must_use]
    pub const fn is_page(&self, page_size: u64) -> bool {
        page_size > 0
            && self.low > 0
            && self.high >= self.low
            && self.high - self.low + 1 == page_size
            && (self.low - 1) % page_size == 0
    }

    /// `"low,high"`.
    #[must_use]
    pub fn encoded(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for NotificationLogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.low, self.high)
    }
}

impl FromStr for NotificationLogId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidLogId(s.to_owned());
        let (low, high) = s.split_once(',').ok_or_else(invalid)?;
        let low: u64 = low.trim().parse().map_err(|_| invalid())?;
        let high: u64 = high.trim().parse().map_err(|_| invalid())?;
        if low == 0 || high < low {
            return Err(invalid());
        }
        Ok(Self::new(low, high))
    }
}

/// One page of notifications.
///
/// Recomputed on every read. A page is archived once a later event exists, and
/// its contents never change after that.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationLog<E> {
    pub id: NotificationLogId,
    /// Present only for archived pages.
    pub next_id: Option<NotificationLogId>,
    pub previous_id: Option<NotificationLogId>,
    pub notifications: Vec<Notification<E>>,
    pub archived: bool,
}

impl<E> NotificationLog<E> {
    #[must_use]
    pub fn has_next(&self) -> bool {
        self.next_id.is_some()
    }

    #[must_use]
    pub fn has_previous(&self) -> bool {
        self.previous_id.is_some()
    }

    #[must_use]
    pub fn total_notifications(&self) -> usize {
        self.notifications.len()
    }
}
