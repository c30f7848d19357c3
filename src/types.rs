//! CELLAR - Core Type Definitions
//! Defines the unit of exchange across the storage facade boundary.

/// Key type for the storage facade.
/// Using Vec<u8> allows arbitrary binary keys.
pub type Key = Vec<u8>;

/// Value type for the storage facade.
/// An empty value is a valid value, distinct from absence.
pub type Value = Vec<u8>;

/// TTL of an entry that never expires.
pub const NO_TTL: i32 = 0;

/// TTL reported for an entry whose expiry falls within the current second.
pub const EXPIRING_TTL: i32 = -1;

/// Version of a key that has never been written.
pub const NO_VERSION: i64 = 0;

/// A request-scoped view of one stored entry.
///
/// `ttl` is derived from the engine's absolute expiry at read time:
/// `0` means no expiry, a positive value is the number of seconds left and
/// `-1` means the entry expires within the current second. `version` is
/// assigned by the engine on commit; `0` means the key does not exist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEntry {
    pub key: Key,
    pub value: Value,
    pub ttl: i32,
    pub version: i64,
}

impl RawEntry {
    /// Zero-value entry for a key with no engine record.
    pub fn absent(key: Key) -> Self {
        Self {
            key,
            value: Vec::new(),
            ttl: NO_TTL,
            version: NO_VERSION,
        }
    }

    /// Returns true if the entry was materialized from an engine record.
    pub fn exists(&self) -> bool {
        self.version != NO_VERSION
    }
}
