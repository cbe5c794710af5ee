//! Key-value persistence substrate.
//!
//! This module describes the storage contract ([`KeyValueStore`]), the key
//! model ([`Key`]), batched writes ([`WriteBatch`]) and the
//! [`UnitOfWork`] that groups reads, locks and writes into one atomic commit.
//!
//! Keys are encoded as `category:segment:segment`. A key may carry a primary
//! key; such reference keys name a set-valued secondary index whose members are
//! encoded primary keys.

use std::{fmt, future::Future, sync::Arc};

use crate::{Error, concurrency::KeyLocks};

pub mod inmemory;
mod unit_of_work;

pub use unit_of_work::UnitOfWork;

const SEGMENT_DELIMITER: char = ':';

/// Structured key of the form `category:segment:segment`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    category: String,
    segments: Vec<String>,
    primary: Option<Box<Key>>,
}

impl Key {
    /// Create a key with no segments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the category is blank.
    pub fn new(category: impl Into<String>) -> Result<Self, Error> {
        let category = category.into();
        if category.trim().is_empty() {
            return Err(Error::invalid("key category must be provided"));
        }
        Ok(Self {
            category,
            segments: Vec::new(),
            primary: None,
        })
    }

    /// Create a key with the given segments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the category is blank.
    pub fn with_segments<I, T>(category: impl Into<String>, segments: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut key = Self::new(category)?;
        key.segments = segments.into_iter().map(Into::into).collect();
        Ok(key)
    }

    /// Create a reference key whose index holds `primary`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the category is blank.
    pub fn reference<I, T>(primary: &Self, category: impl Into<String>, segments: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut key = Self::with_segments(category, segments)?;
        key.primary = Some(Box::new(primary.clone()));
        Ok(key)
    }

    /// Append one more segment.
    #[must_use]
    pub fn segment(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    #[must_use]
    pub fn category(&self) -> &str {
        &self.category
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The encoded key text.
    #[must_use]
    pub fn encoded(&self) -> String {
        self.to_string()
    }

    /// The encoded key as stored by a [`KeyValueStore`].
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// The value a reference key contributes to its index, if it has one.
    #[must_use]
    pub fn primary_key_value(&self) -> Option<String> {
        self.primary.as_deref().map(Self::encoded)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.category)?;
        for segment in &self.segments {
            write!(f, "{SEGMENT_DELIMITER}{segment}")?;
        }
        Ok(())
    }
}

/// A single mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    /// Remove every key starting with the prefix.
    DeletePrefix { prefix: Vec<u8> },
}

/// Ordered set of mutations applied atomically by a [`KeyValueStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    #[must_use]
    pub const fn new() -> Self {
        Self { ops: Vec::new() }
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    pub fn delete_prefix(&mut self, prefix: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::DeletePrefix {
            prefix: prefix.into(),
        });
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BatchOp> {
        self.ops.iter()
    }
}

impl IntoIterator for WriteBatch {
    type IntoIter = std::vec::IntoIter<BatchOp>;
    type Item = BatchOp;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

impl<'a> IntoIterator for &'a WriteBatch {
    type IntoIter = std::slice::Iter<'a, BatchOp>;
    type Item = &'a BatchOp;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.iter()
    }
}

/// Smallest byte string greater than every string starting with `prefix`.
///
/// `None` when no such bound exists (the prefix is empty or all `0xff`).
#[must_use]
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.pop() {
        if last < u8::MAX {
            bound.push(last + 1);
            return Some(bound);
        }
    }
    None
}

/// Byte-keyed storage used by the durable journal and the tracker stores.
///
/// Implementations must apply a [`WriteBatch`] all-or-nothing and must hand
/// out one shared [`KeyLocks`] registry per logical store, so every handle
/// clone serializes on the same keys.
pub trait KeyValueStore: Clone + Send + Sync + 'static {
    /// Read the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the backend cannot be read.
    fn get<'a>(&'a self, key: &'a [u8]) -> impl Future<Output = Result<Option<Vec<u8>>, Error>> + Send + 'a;

    /// The smallest key starting with `prefix`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the backend cannot be read.
    fn first_key_with_prefix<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> impl Future<Output = Result<Option<Vec<u8>>, Error>> + Send + 'a;

    /// Apply every operation of `batch` atomically, in order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the batch could not be applied;
    /// in that case none of it is visible.
    fn write_batch(&self, batch: WriteBatch) -> impl Future<Output = Result<(), Error>> + Send + '_;

    /// The advisory lock registry shared by all handles to this store.
    fn locks(&self) -> &Arc<KeyLocks>;
}
