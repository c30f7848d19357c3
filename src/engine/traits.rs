//! CELLAR - Engine Handle Contract
//! The capabilities the storage facade consumes from a transactional
//! embedded engine:
//!
//! - [`Engine`] - store-level handle: transactions, backup/restore,
//!   space reclamation, drops
//! - [`EngineTxn`] - point reads/writes, prefix iteration, commit/discard
//! - [`EngineIterator`] - ordered, seekable cursor over a transaction snapshot
//!
//! Dropping a transaction without committing discards it.

use std::io::{Read, Write};

use bytes::Bytes;

use crate::error::{display_key, EngineError};

/// A write staged in a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Absolute expiry in Unix seconds; `0` never expires.
    pub expires_at: u64,
    pub user_meta: u8,
}

impl Entry {
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            expires_at: 0,
            user_meta: 0,
        }
    }

    pub fn with_expires_at(mut self, expires_at: u64) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn with_user_meta(mut self, meta: u8) -> Self {
        self.user_meta = meta;
        self
    }
}

/// A committed (or pending) version of a key as seen by a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    key: Vec<u8>,
    value: Option<Bytes>,
    version: u64,
    expires_at: u64,
    user_meta: u8,
}

impl Item {
    pub fn new(
        key: Vec<u8>,
        value: Option<Bytes>,
        version: u64,
        expires_at: u64,
        user_meta: u8,
    ) -> Self {
        Self {
            key,
            value,
            version,
            expires_at,
            user_meta,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn key_copy(&self) -> Vec<u8> {
        self.key.clone()
    }

    /// Borrow the value; fails if the iterator did not prefetch values.
    pub fn value(&self) -> Result<&[u8], EngineError> {
        self.value
            .as_deref()
            .ok_or_else(|| EngineError::ValueNotLoaded(display_key(&self.key)))
    }

    pub fn value_copy(&self) -> Result<Vec<u8>, EngineError> {
        self.value().map(|v| v.to_vec())
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    pub fn user_meta(&self) -> u8 {
        self.user_meta
    }
}

/// Iteration parameters.
#[derive(Debug, Clone, Default)]
pub struct IteratorOptions {
    /// Only keys starting with this prefix are visited.
    pub prefix: Vec<u8>,
    pub reverse: bool,
    /// Items fetched per internal page (performance hint, 0 = default).
    pub prefetch_size: usize,
    /// Load values alongside keys.
    pub prefetch_values: bool,
}

/// A transactional embedded key-value engine.
pub trait Engine: Send + Sync {
    /// The transaction type for this engine.
    type Txn<'a>: EngineTxn
    where
        Self: 'a;

    /// Begin a read-only (`writable = false`) or read-write transaction.
    fn begin(&self, writable: bool) -> Result<Self::Txn<'_>, EngineError>;

    /// Stream every change with version >= `since` to `sink`; returns the
    /// watermark to pass to the next incremental backup.
    fn backup(&self, sink: &mut dyn Write, since: u64) -> Result<u64, EngineError>;

    /// Load a backup stream, buffering at most `max_pending_writes` records.
    fn restore(&self, source: &mut dyn Read, max_pending_writes: usize)
        -> Result<(), EngineError>;

    /// Reclaim space held by superseded/expired data. Returns
    /// [`EngineError::NoRewrite`] when nothing crossed `discard_ratio`.
    fn run_space_reclamation(&self, discard_ratio: f64) -> Result<(), EngineError>;

    fn drop_all(&self) -> Result<(), EngineError>;

    fn drop_prefix(&self, prefix: &[u8]) -> Result<(), EngineError>;

    fn close(&self) -> Result<(), EngineError>;
}

/// A transaction over an [`Engine`].
pub trait EngineTxn {
    /// The iterator type for this transaction.
    type Iter<'a>: EngineIterator
    where
        Self: 'a;

    /// Point read. Returns [`EngineError::KeyNotFound`] for absent,
    /// deleted or expired keys.
    fn get(&mut self, key: &[u8]) -> Result<Item, EngineError>;

    fn set(&mut self, entry: Entry) -> Result<(), EngineError>;

    fn delete(&mut self, key: &[u8]) -> Result<(), EngineError>;

    /// Iterate the transaction snapshot. The iterator starts unpositioned;
    /// call [`EngineIterator::seek`] first.
    fn iter(&self, options: IteratorOptions) -> Self::Iter<'_>;

    /// Commit staged writes. The transaction is released either way.
    fn commit(self) -> Result<(), EngineError>;

    /// Release the transaction without writing.
    fn discard(self);

    fn is_writable(&self) -> bool;
}

/// Ordered cursor over a transaction snapshot.
pub trait EngineIterator {
    /// Position at the first key >= `key` (<= `key` when reversed) that
    /// carries the iterator prefix. An empty key starts at the prefix.
    fn seek(&mut self, key: &[u8]);

    fn valid(&self) -> bool;

    fn item(&self) -> Option<&Item>;

    fn next(&mut self);

    /// Take the error that stopped iteration, if any.
    fn take_error(&mut self) -> Option<EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_builder() {
        let entry = Entry::new(b"k".to_vec(), b"v".to_vec())
            .with_expires_at(42)
            .with_user_meta(1);
        assert_eq!(entry.expires_at, 42);
        assert_eq!(entry.user_meta, 1);
    }

    #[test]
    fn test_item_without_value() {
        let item = Item::new(b"k".to_vec(), None, 3, 0, 0);
        assert!(matches!(item.value(), Err(EngineError::ValueNotLoaded(_))));
        assert_eq!(item.version(), 3);

        let item = Item::new(b"k".to_vec(), Some(Bytes::from_static(b"v")), 3, 0, 0);
        assert_eq!(item.value_copy().unwrap(), b"v".to_vec());
    }
}
