//! CELLAR - Storage Facade
//! Named, transaction-bounded operations over an [`Engine`]. Every call
//! opens its own transaction and releases it before returning; engine
//! errors are wrapped with the operation (and key) they came from.
//!
//! Keys are namespaced by concatenating `prefix + key`. Entries handed to
//! enumeration callbacks carry the full engine key.

use std::io::{Read, Write};

use crate::config::{StorageConfig, DEFAULT_MAX_PENDING_WRITES};
use crate::engine::ttl::{derive_ttl, expires_at, now_secs};
use crate::engine::{Engine, EngineIterator, EngineTxn, Entry, IteratorOptions, Item, LogEngine};
use crate::error::{EngineError, Result, StorageError};
use crate::lifecycle::open_database;
use crate::ops::{
    CompareAndSetOperation, EnumerateOperation, GetOperation, IncrementOperation, RemoveOperation,
    SetOperation,
};
use crate::types::{Key, RawEntry, Value};

/// Storage facade over an engine handle.
pub struct Storage<E: Engine = LogEngine> {
    name: String,
    engine: E,
    max_pending_writes: usize,
}

impl Storage<LogEngine> {
    /// Open (or provision) the database described by `config`.
    pub fn new(name: impl Into<String>, config: &StorageConfig) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(StorageError::Config("storage name must not be empty".into()));
        }
        let engine = open_database(config)?;
        Ok(Self {
            name,
            max_pending_writes: config.options.max_pending_writes,
            engine,
        })
    }
}

impl<E: Engine> Storage<E> {
    /// Wrap an already opened engine.
    pub fn from_engine(name: impl Into<String>, engine: E) -> Self {
        Self {
            name: name.into(),
            engine,
            max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
        }
    }

    /// Records buffered per batch while restoring.
    pub fn with_max_pending_writes(mut self, value: usize) -> Self {
        self.max_pending_writes = value;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying engine handle.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn get(&self) -> GetOperation<'_, E> {
        GetOperation::new(self)
    }

    pub fn set(&self) -> SetOperation<'_, E> {
        SetOperation::new(self)
    }

    pub fn compare_and_set(&self) -> CompareAndSetOperation<'_, E> {
        CompareAndSetOperation::new(self)
    }

    pub fn increment(&self) -> IncrementOperation<'_, E> {
        IncrementOperation::new(self)
    }

    pub fn remove(&self) -> RemoveOperation<'_, E> {
        RemoveOperation::new(self)
    }

    pub fn enumerate(&self) -> EnumerateOperation<'_, E> {
        EnumerateOperation::new(self)
    }

    /// Read `prefix + key`. Absent keys yield `Ok(None)`, or `NotFound`
    /// when `required`.
    pub fn get_raw(&self, prefix: &[u8], key: &[u8], required: bool) -> Result<Option<RawEntry>> {
        let raw_key = join_key(prefix, key);
        let mut txn = self
            .engine
            .begin(false)
            .map_err(|err| StorageError::engine("get", &raw_key, err))?;

        let result = match txn.get(&raw_key) {
            Ok(item) => entry_from_item(&item, true)
                .map(Some)
                .map_err(|err| StorageError::engine("get", &raw_key, err)),
            Err(EngineError::KeyNotFound) if required => Err(StorageError::not_found(&raw_key)),
            Err(EngineError::KeyNotFound) => Ok(None),
            Err(err) => Err(StorageError::engine("get", &raw_key, err)),
        };
        txn.discard();
        result
    }

    /// Write `prefix + key`; `ttl_seconds > 0` sets an expiry.
    pub fn set_raw(&self, prefix: &[u8], key: &[u8], value: &[u8], ttl_seconds: i32) -> Result<()> {
        let raw_key = join_key(prefix, key);
        let mut txn = self
            .engine
            .begin(true)
            .map_err(|err| StorageError::engine("set", &raw_key, err))?;
        let entry = Entry::new(raw_key.clone(), value.to_vec())
            .with_expires_at(expires_at(ttl_seconds, now_secs()));
        txn.set(entry)
            .map_err(|err| StorageError::engine("set", &raw_key, err))?;
        txn.commit()
            .map_err(|err| StorageError::engine("set", &raw_key, err))
    }

    /// Write only if the current version equals `expected_version`.
    ///
    /// An absent key counts as version `0`, so `expected_version == 0`
    /// creates it. Returns `Ok(false)` when the precondition fails.
    pub fn compare_and_set_raw(
        &self,
        prefix: &[u8],
        key: &[u8],
        value: &[u8],
        ttl_seconds: i32,
        expected_version: i64,
    ) -> Result<bool> {
        let raw_key = join_key(prefix, key);
        let mut txn = self
            .engine
            .begin(true)
            .map_err(|err| StorageError::engine("compare_and_set", &raw_key, err))?;

        let current = match txn.get(&raw_key) {
            Ok(item) => item.version() as i64,
            Err(EngineError::KeyNotFound) => 0,
            Err(err) => return Err(StorageError::engine("compare_and_set", &raw_key, err)),
        };
        if current != expected_version {
            return Ok(false);
        }

        let entry = Entry::new(raw_key.clone(), value.to_vec())
            .with_expires_at(expires_at(ttl_seconds, now_secs()));
        txn.set(entry)
            .map_err(|err| StorageError::engine("compare_and_set", &raw_key, err))?;
        txn.commit()
            .map_err(|err| StorageError::engine("compare_and_set", &raw_key, err))?;
        Ok(true)
    }

    /// Read-modify-write `prefix + key` in one transaction.
    ///
    /// The callback sees the current entry (or an absent one with version
    /// `0`) and may edit it in place. Returning `false` aborts with
    /// `Canceled`; otherwise the entry is written under its `key` with the
    /// callback's value and ttl.
    pub fn atomic_update_raw<F>(&self, prefix: &[u8], key: &[u8], update: F) -> Result<()>
    where
        F: FnOnce(&mut RawEntry) -> bool,
    {
        let raw_key = join_key(prefix, key);
        let mut txn = self
            .engine
            .begin(true)
            .map_err(|err| StorageError::engine("atomic_update", &raw_key, err))?;

        let mut entry = match txn.get(&raw_key) {
            Ok(item) => entry_from_item(&item, true)
                .map_err(|err| StorageError::engine("atomic_update", &raw_key, err))?,
            Err(EngineError::KeyNotFound) => RawEntry::absent(raw_key.clone()),
            Err(err) => return Err(StorageError::engine("atomic_update", &raw_key, err)),
        };

        if !update(&mut entry) {
            return Err(StorageError::Canceled);
        }

        let RawEntry { key, value, ttl, .. } = entry;
        let staged = Entry::new(key, value).with_expires_at(expires_at(ttl, now_secs()));
        txn.set(staged)
            .map_err(|err| StorageError::engine("atomic_update", &raw_key, err))?;
        txn.commit()
            .map_err(|err| StorageError::engine("atomic_update", &raw_key, err))
    }

    /// Delete `prefix + key`. Deleting an absent key succeeds.
    pub fn remove_raw(&self, prefix: &[u8], key: &[u8]) -> Result<()> {
        let raw_key = join_key(prefix, key);
        let mut txn = self
            .engine
            .begin(true)
            .map_err(|err| StorageError::engine("remove", &raw_key, err))?;
        txn.delete(&raw_key)
            .map_err(|err| StorageError::engine("remove", &raw_key, err))?;
        txn.commit()
            .map_err(|err| StorageError::engine("remove", &raw_key, err))
    }

    /// Visit entries under `prefix` in key order, starting at `seek` (a full
    /// key; empty starts at the prefix), until the callback returns `false`.
    pub fn enumerate_raw<F>(
        &self,
        prefix: &[u8],
        seek: &[u8],
        batch_size: usize,
        only_keys: bool,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(&RawEntry) -> bool,
    {
        let txn = self
            .engine
            .begin(false)
            .map_err(|err| StorageError::engine("enumerate", prefix, err))?;
        let mut iter = txn.iter(IteratorOptions {
            prefix: prefix.to_vec(),
            reverse: false,
            prefetch_size: batch_size,
            prefetch_values: !only_keys,
        });

        iter.seek(seek);
        while let Some(item) = iter.item() {
            let entry = entry_from_item(item, !only_keys)
                .map_err(|err| StorageError::engine("enumerate", item.key(), err))?;
            if !visit(&entry) {
                break;
            }
            iter.next();
        }
        match iter.take_error() {
            Some(err) => Err(StorageError::engine("enumerate", prefix, err)),
            None => Ok(()),
        }
    }

    /// Every key under `prefix`, in key order.
    pub fn fetch_keys_raw(&self, prefix: &[u8], batch_size: usize) -> Result<Vec<Key>> {
        let mut keys = Vec::new();
        self.enumerate_raw(prefix, prefix, batch_size, true, |entry| {
            keys.push(entry.key.clone());
            true
        })?;
        Ok(keys)
    }

    /// Run one round of engine space reclamation. Returns `false` when the
    /// engine found nothing worth rewriting.
    pub fn compact(&self, discard_ratio: f64) -> Result<bool> {
        match self.engine.run_space_reclamation(discard_ratio) {
            Ok(()) => Ok(true),
            Err(EngineError::NoRewrite) => Ok(false),
            Err(EngineError::InvalidRequest(msg)) => Err(StorageError::Config(msg)),
            Err(err) => Err(StorageError::engine_op("compact", err)),
        }
    }

    /// Stream changes with version >= `since`; returns the next watermark.
    pub fn backup(&self, sink: &mut dyn Write, since: u64) -> Result<u64> {
        self.engine
            .backup(sink, since)
            .map_err(|err| StorageError::engine_op("backup", err))
    }

    pub fn restore(&self, source: &mut dyn Read) -> Result<()> {
        self.engine
            .restore(source, self.max_pending_writes)
            .map_err(|err| StorageError::engine_op("restore", err))
    }

    /// Irreversibly delete everything.
    pub fn drop_all(&self) -> Result<()> {
        self.engine
            .drop_all()
            .map_err(|err| StorageError::engine_op("drop_all", err))
    }

    /// Irreversibly delete every key starting with `prefix`.
    pub fn drop_with_prefix(&self, prefix: &[u8]) -> Result<()> {
        self.engine
            .drop_prefix(prefix)
            .map_err(|err| StorageError::engine("drop_prefix", prefix, err))
    }

    pub fn close(&self) -> Result<()> {
        self.engine
            .close()
            .map_err(|err| StorageError::engine_op("close", err))
    }
}

fn join_key(prefix: &[u8], key: &[u8]) -> Key {
    let mut raw = Vec::with_capacity(prefix.len() + key.len());
    raw.extend_from_slice(prefix);
    raw.extend_from_slice(key);
    raw
}

fn entry_from_item(item: &Item, with_value: bool) -> std::result::Result<RawEntry, EngineError> {
    let value: Value = if with_value {
        item.value_copy()?
    } else {
        Vec::new()
    };
    Ok(RawEntry {
        key: item.key_copy(),
        value,
        ttl: derive_ttl(item.expires_at(), now_secs()),
        version: item.version() as i64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineOptions;

    fn storage() -> Storage {
        Storage::from_engine("test", LogEngine::open(EngineOptions::in_memory()).unwrap())
    }

    #[test]
    fn test_get_absent_and_required() {
        let s = storage();
        assert_eq!(s.get_raw(b"", b"missing", false).unwrap(), None);
        assert!(s.get_raw(b"", b"missing", true).unwrap_err().is_not_found());
    }

    #[test]
    fn test_set_get_with_prefix() {
        let s = storage();
        s.set_raw(b"p:", b"k", b"v", 0).unwrap();
        let entry = s.get_raw(b"p:", b"k", true).unwrap().unwrap();
        assert_eq!(entry.key, b"p:k".to_vec());
        assert_eq!(entry.value, b"v".to_vec());
        assert_eq!(entry.ttl, 0);
        assert_eq!(entry.version, 1);
        assert_eq!(s.get_raw(b"", b"k", false).unwrap(), None);
    }

    #[test]
    fn test_empty_value_is_not_absence() {
        let s = storage();
        s.set_raw(b"", b"k", b"", 0).unwrap();
        let entry = s.get_raw(b"", b"k", true).unwrap().unwrap();
        assert!(entry.value.is_empty());
        assert!(entry.exists());
    }

    #[test]
    fn test_compare_and_set_absent_key() {
        let s = storage();
        assert!(!s.compare_and_set_raw(b"", b"k", b"v", 0, 3).unwrap());
        assert_eq!(s.get_raw(b"", b"k", false).unwrap(), None);
        assert!(s.compare_and_set_raw(b"", b"k", b"v", 0, 0).unwrap());
        assert_eq!(s.get_raw(b"", b"k", true).unwrap().unwrap().version, 1);
    }

    #[test]
    fn test_atomic_update_changes_ttl_and_value() {
        let s = storage();
        s.atomic_update_raw(b"", b"k", |entry| {
            assert!(!entry.exists());
            entry.value = b"first".to_vec();
            entry.ttl = 100;
            true
        })
        .unwrap();
        let entry = s.get_raw(b"", b"k", true).unwrap().unwrap();
        assert_eq!(entry.value, b"first".to_vec());
        assert!(entry.ttl > 0 && entry.ttl <= 100);
    }

    #[test]
    fn test_atomic_update_cancel() {
        let s = storage();
        s.set_raw(b"", b"k", b"keep", 0).unwrap();
        let err = s
            .atomic_update_raw(b"", b"k", |entry| {
                entry.value = b"lost".to_vec();
                false
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::Canceled));
        let entry = s.get_raw(b"", b"k", true).unwrap().unwrap();
        assert_eq!(entry.value, b"keep".to_vec());
        assert_eq!(entry.version, 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let s = storage();
        s.remove_raw(b"", b"never").unwrap();
        s.set_raw(b"", b"k", b"v", 0).unwrap();
        s.remove_raw(b"", b"k").unwrap();
        assert_eq!(s.get_raw(b"", b"k", false).unwrap(), None);
    }

    #[test]
    fn test_engine_errors_carry_context() {
        let s = storage();
        let err = s.set_raw(b"", b"", b"v", 0).unwrap_err();
        assert!(err.to_string().starts_with("set failed"));
    }

    #[test]
    fn test_compact_maps_outcomes() {
        let s = storage();
        assert!(!s.compact(0.5).unwrap());
        assert!(matches!(s.compact(0.0), Err(StorageError::Config(_))));
    }

    #[test]
    fn test_closed_storage() {
        let s = storage();
        s.close().unwrap();
        assert!(matches!(
            s.get_raw(b"", b"k", false),
            Err(StorageError::Engine { source: EngineError::Closed, .. })
        ));
    }

    #[test]
    fn test_new_rejects_empty_name() {
        let config = StorageConfig::new("unused").with_options(|_| EngineOptions::in_memory());
        assert!(matches!(Storage::new("", &config), Err(StorageError::Config(_))));
        assert_eq!(Storage::new("db", &config).unwrap().name(), "db");
    }
}
