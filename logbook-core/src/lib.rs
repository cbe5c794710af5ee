//! Core traits and types for the logbook reliable event log.
//!
//! This crate provides the building blocks of an integration event log:
//!
//! - [`event`] - Event traits (`DomainEvent`, `EventKind`, `EventSet`)
//! - [`journal`] - Append-only journals (in-memory and durable with repair)
//! - [`store`] - The event store over a journal (`EventStore`)
//! - [`kv`] - Key-value substrate (`Key`, `KeyValueStore`, `UnitOfWork`)
//! - [`notification`] - Paged notification logs, publication tracking and
//!   publishing
//! - [`process`] - Time-constrained process trackers and timeout signals
//! - [`concurrency`] - Key locks and concurrency-version checks
//! - [`config`] - Runtime tunables (`LogConfig`)
//!
//! # Example
//!
//! ```
//! use logbook_core::{journal::inmemory, store::EventStore};
//!
//! let store = EventStore::new(inmemory::Journal::new());
//! assert_eq!(store.count(), 0);
//! ```
//!
//! Most users should depend on the `logbook` crate, which re-exports these
//! types and the derive macros.

pub mod concurrency;
pub mod config;
pub mod error;
pub mod event;
pub mod journal;
pub mod kv;
pub mod notification;
pub mod process;
pub mod store;

pub use config::LogConfig;
pub use error::Error;
