#![doc = include_str!("../README.md")]

pub use chrono;
#[cfg(feature = "test-util")]
pub use logbook_core::test;
pub use logbook_core::{
    Error, LogConfig, concurrency, config, error, event,
    event::{DomainEvent, EventDecodeError, EventKind, EventSet},
    journal,
    journal::Journal,
    notification,
    notification::{NotificationLog, NotificationLogFactory, NotificationLogId, NotificationPublisher},
    process,
    process::{Process, ProcessId, TimeConstrainedProcessTracker},
    store,
    store::{EventStore, EventStreamId},
};
// Re-export proc macro derives so consumers only depend on `logbook`.
pub use logbook_macros::{DomainEvent, EventSet};

pub mod kv {
    pub use logbook_core::kv::*;

    #[cfg(feature = "sqlite")]
    #[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
    pub mod sqlite {
        pub use logbook_sqlite::{Error, PoolConfig, Store, pool};
    }
}
