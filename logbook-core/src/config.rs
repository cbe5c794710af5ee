//! Runtime configuration.
//!
//! [`LogConfig`] gathers the tunables of the log engine. It deserializes from
//! any serde format; every field is optional and falls back to its default.
//!
//! ```
//! use logbook_core::LogConfig;
//!
//! let config: LogConfig = serde_json::from_str(r#"{ "page_size": 50 }"#).unwrap();
//! assert_eq!(config.page_size, 50);
//! assert_eq!(config.repair_watermark, 100_000);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Number of notifications in one notification log page.
pub const DEFAULT_PAGE_SIZE: u64 = 20;

/// Consecutive missing journal keys after which a repair scan stops.
pub const DEFAULT_REPAIR_WATERMARK: u64 = 100_000;

/// Tunables for journals, notification logs and units of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Notifications per notification log page.
    pub page_size: u64,
    /// Consecutive missing sequence keys that end a repair scan.
    pub repair_watermark: u64,
    /// Upper bound on waiting for a key lock. `None` waits forever.
    ///
    /// Stores pick it up through
    /// [`inmemory::Store::from_config`](crate::kv::inmemory::Store::from_config)
    /// or the SQLite pool configuration.
    #[serde(rename = "lock_timeout_ms", with = "optional_millis")]
    pub lock_timeout: Option<Duration>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            repair_watermark: DEFAULT_REPAIR_WATERMARK,
            lock_timeout: None,
        }
    }
}

impl LogConfig {
    #[must_use]
    pub const fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub const fn with_repair_watermark(mut self, repair_watermark: u64) -> Self {
        self.repair_watermark = repair_watermark;
        self
    }

    #[must_use]
    pub const fn with_lock_timeout(mut self, lock_timeout: Option<Duration>) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Check the values are usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the page size or the repair
    /// watermark is zero.
    pub fn validate(&self) -> Result<(), Error> {
        if self.page_size == 0 {
            return Err(Error::invalid("page_size must be greater than zero"));
        }
        if self.repair_watermark == 0 {
            return Err(Error::invalid("repair_watermark must be greater than zero"));
        }
        Ok(())
    }
}

/// `Option<Duration>` as whole milliseconds.
mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option, reason = "signature fixed by serde(with)")]
    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => {
                serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: LogConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, LogConfig::default());
        assert_eq!(config.page_size, 20);
        assert_eq!(config.lock_timeout, None);
    }

    #[test]
    fn lock_timeout_reads_milliseconds() {
        let config: LogConfig = serde_json::from_str(r#"{ "lock_timeout_ms": 1500 }"#).unwrap();
        assert_eq!(config.lock_timeout, Some(Duration::from_millis(1500)));

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["lock_timeout_ms"], 1500);
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let err = LogConfig::default().with_page_size(0).validate().unwrap_err();
        assert!(err.to_string().contains("page_size"));
        assert!(LogConfig::default().with_repair_watermark(0).validate().is_err());
        assert!(LogConfig::default().validate().is_ok());
    }
}
