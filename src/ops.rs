//! CELLAR - Operation Builders
//! Fluent requests over the storage facade. Builders borrow the `Storage`
//! and end in a terminal call that runs exactly one raw operation.
//!
//! ```no_run
//! use cellar::{Storage, StorageConfig};
//!
//! let storage = Storage::new("users", &StorageConfig::new("./data")).unwrap();
//! storage.set().with_prefix(b"user:").by_key(b"42").with_value(b"alice").execute().unwrap();
//! let name = storage.get().with_prefix(b"user:").by_key(b"42").to_text().unwrap();
//! assert_eq!(name.as_deref(), Some("alice"));
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::engine::Engine;
use crate::error::{Result, StorageError};
use crate::storage::Storage;
use crate::types::{Key, RawEntry, Value, NO_TTL, NO_VERSION};

/// Default number of entries prefetched per page while enumerating.
pub const DEFAULT_BATCH_SIZE: usize = 256;

/// Point read.
pub struct GetOperation<'s, E: Engine> {
    storage: &'s Storage<E>,
    prefix: Vec<u8>,
    key: Key,
    required: bool,
}

impl<'s, E: Engine> GetOperation<'s, E> {
    pub(crate) fn new(storage: &'s Storage<E>) -> Self {
        Self {
            storage,
            prefix: Vec::new(),
            key: Vec::new(),
            required: false,
        }
    }

    pub fn with_prefix(mut self, prefix: impl AsRef<[u8]>) -> Self {
        self.prefix = prefix.as_ref().to_vec();
        self
    }

    pub fn by_key(mut self, key: impl AsRef<[u8]>) -> Self {
        self.key = key.as_ref().to_vec();
        self
    }

    /// Fail with `NotFound` instead of returning `None`.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn to_entry(self) -> Result<Option<RawEntry>> {
        self.storage.get_raw(&self.prefix, &self.key, self.required)
    }

    pub fn to_bytes(self) -> Result<Option<Value>> {
        Ok(self.to_entry()?.map(|entry| entry.value))
    }

    /// Value as UTF-8 text.
    pub fn to_text(self) -> Result<Option<String>> {
        match self.to_bytes()? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|err| StorageError::Codec(err.to_string())),
            None => Ok(None),
        }
    }

    /// Value decoded from its bincode encoding.
    pub fn to_value<T: DeserializeOwned>(self) -> Result<Option<T>> {
        match self.to_bytes()? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Value as a counter written by [`IncrementOperation`].
    pub fn to_counter(self) -> Result<Option<u64>> {
        match self.to_bytes()? {
            Some(bytes) => decode_counter(&bytes).map(Some),
            None => Ok(None),
        }
    }
}

/// Unconditional write.
pub struct SetOperation<'s, E: Engine> {
    storage: &'s Storage<E>,
    prefix: Vec<u8>,
    key: Key,
    value: Value,
    ttl: i32,
    encode_error: Option<StorageError>,
}

impl<'s, E: Engine> SetOperation<'s, E> {
    pub(crate) fn new(storage: &'s Storage<E>) -> Self {
        Self {
            storage,
            prefix: Vec::new(),
            key: Vec::new(),
            value: Vec::new(),
            ttl: NO_TTL,
            encode_error: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl AsRef<[u8]>) -> Self {
        self.prefix = prefix.as_ref().to_vec();
        self
    }

    pub fn by_key(mut self, key: impl AsRef<[u8]>) -> Self {
        self.key = key.as_ref().to_vec();
        self
    }

    pub fn with_value(mut self, value: impl AsRef<[u8]>) -> Self {
        self.value = value.as_ref().to_vec();
        self
    }

    /// Store `object` bincode-encoded. Encoding errors surface at `execute`.
    pub fn with_object<T: Serialize>(mut self, object: &T) -> Self {
        match bincode::serialize(object) {
            Ok(bytes) => self.value = bytes,
            Err(err) => self.encode_error = Some(err.into()),
        }
        self
    }

    /// Expire after `seconds`; `0` keeps the entry forever.
    pub fn with_ttl(mut self, seconds: i32) -> Self {
        self.ttl = seconds;
        self
    }

    pub fn execute(self) -> Result<()> {
        if let Some(err) = self.encode_error {
            return Err(err);
        }
        self.storage
            .set_raw(&self.prefix, &self.key, &self.value, self.ttl)
    }
}

/// Write gated on the current version.
pub struct CompareAndSetOperation<'s, E: Engine> {
    storage: &'s Storage<E>,
    prefix: Vec<u8>,
    key: Key,
    value: Value,
    ttl: i32,
    version: i64,
}

impl<'s, E: Engine> CompareAndSetOperation<'s, E> {
    pub(crate) fn new(storage: &'s Storage<E>) -> Self {
        Self {
            storage,
            prefix: Vec::new(),
            key: Vec::new(),
            value: Vec::new(),
            ttl: NO_TTL,
            version: NO_VERSION,
        }
    }

    pub fn with_prefix(mut self, prefix: impl AsRef<[u8]>) -> Self {
        self.prefix = prefix.as_ref().to_vec();
        self
    }

    pub fn by_key(mut self, key: impl AsRef<[u8]>) -> Self {
        self.key = key.as_ref().to_vec();
        self
    }

    pub fn with_value(mut self, value: impl AsRef<[u8]>) -> Self {
        self.value = value.as_ref().to_vec();
        self
    }

    pub fn with_ttl(mut self, seconds: i32) -> Self {
        self.ttl = seconds;
        self
    }

    /// Expected current version; `0` means the key must not exist yet.
    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    /// Returns whether the write was applied.
    pub fn execute(self) -> Result<bool> {
        self.storage.compare_and_set_raw(
            &self.prefix,
            &self.key,
            &self.value,
            self.ttl,
            self.version,
        )
    }
}

/// Atomic counter stored as an 8-byte big-endian integer.
pub struct IncrementOperation<'s, E: Engine> {
    storage: &'s Storage<E>,
    prefix: Vec<u8>,
    key: Key,
    initial: u64,
    delta: u64,
    ttl: i32,
}

impl<'s, E: Engine> IncrementOperation<'s, E> {
    pub(crate) fn new(storage: &'s Storage<E>) -> Self {
        Self {
            storage,
            prefix: Vec::new(),
            key: Vec::new(),
            initial: 0,
            delta: 1,
            ttl: NO_TTL,
        }
    }

    pub fn with_prefix(mut self, prefix: impl AsRef<[u8]>) -> Self {
        self.prefix = prefix.as_ref().to_vec();
        self
    }

    pub fn by_key(mut self, key: impl AsRef<[u8]>) -> Self {
        self.key = key.as_ref().to_vec();
        self
    }

    /// Starting value for a missing counter.
    pub fn with_initial(mut self, initial: u64) -> Self {
        self.initial = initial;
        self
    }

    pub fn with_delta(mut self, delta: u64) -> Self {
        self.delta = delta;
        self
    }

    pub fn with_ttl(mut self, seconds: i32) -> Self {
        self.ttl = seconds;
        self
    }

    /// Apply the increment and return the new value.
    pub fn execute(self) -> Result<u64> {
        let mut outcome = Ok(0);
        let (initial, delta, ttl) = (self.initial, self.delta, self.ttl);

        let result = self.storage.atomic_update_raw(&self.prefix, &self.key, |entry| {
            let current = if entry.exists() {
                match decode_counter(&entry.value) {
                    Ok(value) => value,
                    Err(err) => {
                        outcome = Err(err);
                        return false;
                    }
                }
            } else {
                initial
            };
            let next = current.wrapping_add(delta);
            entry.value = next.to_be_bytes().to_vec();
            entry.ttl = ttl;
            outcome = Ok(next);
            true
        });

        match result {
            Ok(()) => outcome,
            Err(StorageError::Canceled) => outcome,
            Err(err) => Err(err),
        }
    }
}

/// Delete.
pub struct RemoveOperation<'s, E: Engine> {
    storage: &'s Storage<E>,
    prefix: Vec<u8>,
    key: Key,
}

impl<'s, E: Engine> RemoveOperation<'s, E> {
    pub(crate) fn new(storage: &'s Storage<E>) -> Self {
        Self {
            storage,
            prefix: Vec::new(),
            key: Vec::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl AsRef<[u8]>) -> Self {
        self.prefix = prefix.as_ref().to_vec();
        self
    }

    pub fn by_key(mut self, key: impl AsRef<[u8]>) -> Self {
        self.key = key.as_ref().to_vec();
        self
    }

    pub fn execute(self) -> Result<()> {
        self.storage.remove_raw(&self.prefix, &self.key)
    }
}

/// Ordered scan of one prefix.
pub struct EnumerateOperation<'s, E: Engine> {
    storage: &'s Storage<E>,
    prefix: Vec<u8>,
    seek: Vec<u8>,
    batch_size: usize,
    only_keys: bool,
}

impl<'s, E: Engine> EnumerateOperation<'s, E> {
    pub(crate) fn new(storage: &'s Storage<E>) -> Self {
        Self {
            storage,
            prefix: Vec::new(),
            seek: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            only_keys: false,
        }
    }

    pub fn with_prefix(mut self, prefix: impl AsRef<[u8]>) -> Self {
        self.prefix = prefix.as_ref().to_vec();
        self
    }

    /// Start at this full key instead of the beginning of the prefix.
    pub fn with_seek(mut self, seek: impl AsRef<[u8]>) -> Self {
        self.seek = seek.as_ref().to_vec();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Skip loading values.
    pub fn only_keys(mut self) -> Self {
        self.only_keys = true;
        self
    }

    /// Visit entries until `visit` returns `false`.
    pub fn for_each<F>(self, visit: F) -> Result<()>
    where
        F: FnMut(&RawEntry) -> bool,
    {
        self.storage
            .enumerate_raw(&self.prefix, &self.seek, self.batch_size, self.only_keys, visit)
    }

    pub fn to_vec(self) -> Result<Vec<RawEntry>> {
        let mut entries = Vec::new();
        self.for_each(|entry| {
            entries.push(entry.clone());
            true
        })?;
        Ok(entries)
    }

    pub fn keys(self) -> Result<Vec<Key>> {
        let mut keys = Vec::new();
        self.only_keys().for_each(|entry| {
            keys.push(entry.key.clone());
            true
        })?;
        Ok(keys)
    }
}

fn decode_counter(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| {
        StorageError::Codec(format!("counter must be 8 bytes, found {}", bytes.len()))
    })?;
    Ok(u64::from_be_bytes(raw))
}
