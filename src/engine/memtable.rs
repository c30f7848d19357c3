//! CELLAR - MemTable (Multi-Version Sorted Map)
//! Every committed write to a key is kept as a version in that key's chain
//! until space reclamation proves no reader can observe it any more.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use bytes::Bytes;

use super::ttl::is_expired;
use super::wal::LogRecord;
use crate::types::Key;

/// One committed version of a key.
/// A `None` value represents a tombstone (deletion marker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub version: u64,
    pub value: Option<Bytes>,
    pub expires_at: u64,
    pub user_meta: u8,
    /// Value-log segment holding this version (0 when not persisted).
    pub segment: u32,
}

impl VersionedValue {
    pub fn from_record(record: LogRecord, segment: u32) -> (Key, Self) {
        let value = Self {
            version: record.version,
            value: record.value.map(Bytes::from),
            expires_at: record.expires_at,
            user_meta: record.user_meta,
            segment,
        };
        (record.key, value)
    }

    pub fn to_record(&self, key: &[u8]) -> LogRecord {
        LogRecord {
            key: key.to_vec(),
            value: self.value.as_ref().map(|v| v.to_vec()),
            version: self.version,
            expires_at: self.expires_at,
            user_meta: self.user_meta,
        }
    }

    /// Returns true if this version is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Deleted or expired versions hide the key from readers.
    pub fn is_visible(&self, now: u64) -> bool {
        !self.is_tombstone() && !is_expired(self.expires_at, now)
    }

    fn size(&self) -> usize {
        self.value.as_ref().map_or(0, |v| v.len())
    }
}

/// In-memory sorted multi-version store backed by a BTreeMap.
/// Version chains are kept in ascending version order.
pub struct MemTable {
    entries: BTreeMap<Key, Vec<VersionedValue>>,
    /// Approximate size in bytes (keys once per version plus values).
    size_bytes: usize,
    versions: usize,
}

impl MemTable {
    /// Create a new, empty MemTable.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            size_bytes: 0,
            versions: 0,
        }
    }

    /// Returns the approximate size of the MemTable in bytes.
    pub fn size(&self) -> usize {
        self.size_bytes
    }

    /// Number of keys with at least one retained version.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the MemTable is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of retained versions across all keys.
    pub fn version_count(&self) -> usize {
        self.versions
    }

    /// Insert a version. Restored or replayed versions may arrive out of
    /// order; a version equal to an existing one replaces it.
    pub fn insert(&mut self, key: Key, value: VersionedValue) {
        let key_len = key.len();
        let added = key_len + value.size();
        let chain = self.entries.entry(key).or_default();
        match chain.binary_search_by_key(&value.version, |v| v.version) {
            Ok(pos) => {
                let old = std::mem::replace(&mut chain[pos], value);
                self.size_bytes = self.size_bytes.saturating_sub(key_len + old.size()) + added;
            }
            Err(pos) => {
                chain.insert(pos, value);
                self.size_bytes += added;
                self.versions += 1;
            }
        }
    }

    /// Newest version of `key` visible at `read_ts`, tombstones included.
    pub fn get(&self, key: &[u8], read_ts: u64) -> Option<&VersionedValue> {
        self.entries
            .get(key)?
            .iter()
            .rev()
            .find(|v| v.version <= read_ts)
    }

    /// Newest committed version of `key` (0 if there is none).
    pub fn latest_version(&self, key: &[u8]) -> u64 {
        self.entries
            .get(key)
            .and_then(|chain| chain.last())
            .map_or(0, |v| v.version)
    }

    /// Highest version held by any key.
    pub fn max_version(&self) -> u64 {
        self.entries
            .values()
            .filter_map(|chain| chain.last())
            .map(|v| v.version)
            .max()
            .unwrap_or(0)
    }

    /// Collect up to `limit` visible entries under `prefix`, in key order
    /// (descending when `reverse`), starting from `from`.
    pub fn page(
        &self,
        prefix: &[u8],
        from: Bound<Key>,
        read_ts: u64,
        now: u64,
        limit: usize,
        reverse: bool,
    ) -> Vec<(Key, VersionedValue)> {
        let visible = |(key, chain): (&Key, &Vec<VersionedValue>)| {
            chain
                .iter()
                .rev()
                .find(|v| v.version <= read_ts)
                .filter(|v| v.is_visible(now))
                .map(|v| (key.clone(), v.clone()))
        };

        if reverse {
            let lower = Bound::Included(prefix.to_vec());
            if !range_is_valid(&lower, &from) {
                return Vec::new();
            }
            self.entries
                .range((lower, from))
                .rev()
                .skip_while(|(k, _)| !k.starts_with(prefix))
                .take_while(|(k, _)| k.starts_with(prefix))
                .filter_map(visible)
                .take(limit)
                .collect()
        } else {
            let from = match from {
                Bound::Unbounded => Bound::Included(prefix.to_vec()),
                bound => bound,
            };
            self.entries
                .range((from, Bound::Unbounded))
                .take_while(|(k, _)| k.starts_with(prefix))
                .filter_map(visible)
                .take(limit)
                .collect()
        }
    }

    /// Newest version of every key at `read_ts` with version >= `since`.
    ///
    /// Tombstones and expired versions are included: either may shadow an
    /// older value a previous backup already carried.
    pub fn latest_since(&self, since: u64, read_ts: u64) -> Vec<LogRecord> {
        self.entries
            .iter()
            .filter_map(|(key, chain)| {
                chain
                    .iter()
                    .rev()
                    .find(|v| v.version <= read_ts)
                    .filter(|v| v.version >= since)
                    .map(|v| v.to_record(key))
            })
            .collect()
    }

    /// Every retained version, in key then version order.
    pub fn all_records(&self) -> Vec<LogRecord> {
        self.entries
            .iter()
            .flat_map(|(key, chain)| chain.iter().map(move |v| v.to_record(key)))
            .collect()
    }

    /// Retained versions stored in `segment`.
    pub fn records_in_segment(&self, segment: u32) -> Vec<LogRecord> {
        self.entries
            .iter()
            .flat_map(|(key, chain)| {
                chain
                    .iter()
                    .filter(move |v| v.segment == segment)
                    .map(move |v| v.to_record(key))
            })
            .collect()
    }

    /// Live record count per value-log segment.
    pub fn segment_usage(&self) -> HashMap<u32, u64> {
        let mut usage = HashMap::new();
        for v in self.entries.values().flatten() {
            *usage.entry(v.segment).or_insert(0) += 1;
        }
        usage
    }

    /// Point a retained version at the segment it was rewritten into.
    pub fn relocate(&mut self, key: &[u8], version: u64, segment: u32) {
        if let Some(chain) = self.entries.get_mut(key) {
            if let Ok(pos) = chain.binary_search_by_key(&version, |v| v.version) {
                chain[pos].segment = segment;
            }
        }
    }

    /// Drop versions no reader at or after `discard_ts` can observe.
    ///
    /// Versions newer than `discard_ts` are always kept. Of the rest, the
    /// newest `keep` survive unless the newest is a tombstone or expired. A
    /// dead newest version is kept as a marker while an older segment than
    /// its own (`oldest_segment` is the oldest one on disk) could still
    /// replay a version it shadows. Returns the number of versions removed.
    pub fn prune(&mut self, discard_ts: u64, keep: usize, now: u64, oldest_segment: u32) -> usize {
        let keep = keep.max(1);
        let mut removed = 0;
        let mut freed = 0;
        self.entries.retain(|key, chain| {
            let split = chain.partition_point(|v| v.version <= discard_ts);
            if split == 0 {
                return true;
            }
            let newest_old = &chain[split - 1];
            let drop_count = if newest_old.is_visible(now) {
                split.saturating_sub(keep)
            } else if newest_old.segment <= oldest_segment {
                split
            } else {
                split - 1
            };
            for v in chain.drain(..drop_count) {
                freed += key.len() + v.size();
                removed += 1;
            }
            !chain.is_empty()
        });
        self.size_bytes = self.size_bytes.saturating_sub(freed);
        self.versions -= removed;
        removed
    }

    /// Remove every key starting with `prefix`. Returns the keys removed.
    pub fn remove_prefix(&mut self, prefix: &[u8]) -> usize {
        let doomed: Vec<Key> = self
            .entries
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            if let Some(chain) = self.entries.remove(key) {
                self.versions -= chain.len();
                let freed: usize = chain.iter().map(|v| key.len() + v.size()).sum();
                self.size_bytes = self.size_bytes.saturating_sub(freed);
            }
        }
        doomed.len()
    }

    /// Clear all entries from the MemTable and reset size.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.size_bytes = 0;
        self.versions = 0;
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

/// `BTreeMap::range` panics when the lower bound sorts after the upper one.
fn range_is_valid(lower: &Bound<Key>, upper: &Bound<Key>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l <= u,
        (Bound::Included(l), Bound::Excluded(u)) => l <= u,
        _ => true,
    }
}

/// Smallest key greater than every key starting with `prefix`, if any.
pub fn prefix_successor(prefix: &[u8]) -> Option<Key> {
    let mut next = prefix.to_vec();
    while let Some(last) = next.pop() {
        if last < u8::MAX {
            next.push(last + 1);
            return Some(next);
        }
    }
    None
}
