//! SQLite-backed durable storage for logbook.
//!
//! [`Store`] implements [`logbook_core::kv::KeyValueStore`] over a single
//! table, so every durable component (the journal, the publication trackers
//! and the process trackers) can share one database file.
//!
//! ```ignore
//! use logbook_core::{LogConfig, journal::durable, store::EventStore};
//! use logbook_sqlite::{PoolConfig, Store};
//!
//! let kv = Store::open("sqlite://events.db", &PoolConfig::default()).await?;
//! let journal = durable::Journal::open(kv.clone(), &LogConfig::default()).await?;
//! let events = EventStore::new(journal);
//! ```

mod error;
pub mod pool;
mod store;

pub use error::Error;
pub use pool::PoolConfig;
pub use store::Store;
