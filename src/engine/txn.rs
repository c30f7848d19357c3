//! CELLAR - Transactions & Iterators
//! A `LogTxn` reads a fixed snapshot of the engine and buffers its writes
//! until commit. Writable transactions remember the keys they read so the
//! engine can reject the commit when one of them changed underneath.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::ops::Bound;

use bytes::Bytes;

use super::memtable::prefix_successor;
use super::traits::{EngineIterator, EngineTxn, Entry, IteratorOptions, Item};
use super::ttl::now_secs;
use super::LogEngine;
use crate::error::EngineError;
use crate::types::Key;

/// Items fetched per page when the caller gives no prefetch size.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// A write staged in a transaction; `value: None` deletes the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub value: Option<Vec<u8>>,
    pub expires_at: u64,
    pub user_meta: u8,
}

/// Transaction over a [`LogEngine`] snapshot.
pub struct LogTxn<'e> {
    engine: &'e LogEngine,
    read_ts: u64,
    writable: bool,
    pending: BTreeMap<Key, PendingWrite>,
    reads: HashSet<Key>,
    committed: bool,
}

impl<'e> LogTxn<'e> {
    pub(crate) fn new(engine: &'e LogEngine, read_ts: u64, writable: bool) -> Self {
        Self {
            engine,
            read_ts,
            writable,
            pending: BTreeMap::new(),
            reads: HashSet::new(),
            committed: false,
        }
    }

    /// Snapshot timestamp this transaction reads at.
    pub fn read_ts(&self) -> u64 {
        self.read_ts
    }

    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    fn stage(&mut self, key: Key, write: PendingWrite) -> Result<(), EngineError> {
        if !self.writable {
            return Err(EngineError::ReadOnly);
        }
        if key.is_empty() {
            return Err(EngineError::EmptyKey);
        }
        self.pending.insert(key, write);
        Ok(())
    }
}

impl<'e> EngineTxn for LogTxn<'e> {
    type Iter<'a> = LogIterator<'a> where Self: 'a;

    fn get(&mut self, key: &[u8]) -> Result<Item, EngineError> {
        if key.is_empty() {
            return Err(EngineError::EmptyKey);
        }
        if self.writable {
            if let Some(write) = self.pending.get(key) {
                return match &write.value {
                    Some(value) => Ok(Item::new(
                        key.to_vec(),
                        Some(Bytes::copy_from_slice(value)),
                        self.read_ts,
                        write.expires_at,
                        write.user_meta,
                    )),
                    None => Err(EngineError::KeyNotFound),
                };
            }
            self.reads.insert(key.to_vec());
        }

        let found = self.engine.read_version(key, self.read_ts)?;
        let metrics = self.engine.metrics();
        match found {
            Some(v) if v.is_visible(now_secs()) => {
                metrics.record_get(v.value.as_ref().map(|b| b.len()));
                Ok(Item::new(key.to_vec(), v.value, v.version, v.expires_at, v.user_meta))
            }
            _ => {
                metrics.record_get(None);
                Err(EngineError::KeyNotFound)
            }
        }
    }

    fn set(&mut self, entry: Entry) -> Result<(), EngineError> {
        self.stage(
            entry.key,
            PendingWrite {
                value: Some(entry.value),
                expires_at: entry.expires_at,
                user_meta: entry.user_meta,
            },
        )
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), EngineError> {
        self.stage(
            key.to_vec(),
            PendingWrite {
                value: None,
                expires_at: 0,
                user_meta: 0,
            },
        )
    }

    /// Iterates the snapshot only; this transaction's own pending writes are
    /// not merged in.
    fn iter(&self, options: IteratorOptions) -> Self::Iter<'_> {
        LogIterator::new(self.engine, self.read_ts, options)
    }

    fn commit(mut self) -> Result<(), EngineError> {
        if self.writable && !self.pending.is_empty() {
            let writes = std::mem::take(&mut self.pending);
            self.engine.commit_writes(self.read_ts, &self.reads, writes)?;
        }
        self.committed = true;
        Ok(())
    }

    fn discard(self) {}

    fn is_writable(&self) -> bool {
        self.writable
    }
}

impl Drop for LogTxn<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.engine.metrics().record_discard();
        }
        self.engine.release(self.read_ts);
    }
}

/// Prefix-bounded cursor that fetches the snapshot a page at a time.
pub struct LogIterator<'a> {
    engine: &'a LogEngine,
    read_ts: u64,
    options: IteratorOptions,
    page_size: usize,
    buffer: VecDeque<Item>,
    /// Where the next page starts.
    cursor: Bound<Key>,
    exhausted: bool,
    error: Option<EngineError>,
}

impl<'a> LogIterator<'a> {
    fn new(engine: &'a LogEngine, read_ts: u64, options: IteratorOptions) -> Self {
        let page_size = if options.prefetch_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            options.prefetch_size
        };
        Self {
            engine,
            read_ts,
            options,
            page_size,
            buffer: VecDeque::new(),
            cursor: Bound::Unbounded,
            exhausted: true,
            error: None,
        }
    }

    fn fill(&mut self) {
        while self.buffer.is_empty() && !self.exhausted {
            let page = match self.engine.read_page(
                &self.options.prefix,
                self.cursor.clone(),
                self.read_ts,
                self.page_size,
                self.options.reverse,
            ) {
                Ok(page) => page,
                Err(err) => {
                    self.error = Some(err);
                    self.exhausted = true;
                    return;
                }
            };

            if page.len() < self.page_size {
                self.exhausted = true;
            }
            if let Some((last, _)) = page.last() {
                self.cursor = Bound::Excluded(last.clone());
            }

            let with_values = self.options.prefetch_values;
            let metrics = self.engine.metrics();
            for (key, v) in page {
                let value = if with_values {
                    metrics.record_read(v.value.as_ref().map_or(0, |b| b.len()));
                    v.value
                } else {
                    None
                };
                self.buffer
                    .push_back(Item::new(key, value, v.version, v.expires_at, v.user_meta));
            }
        }
    }
}

impl EngineIterator for LogIterator<'_> {
    fn seek(&mut self, key: &[u8]) {
        self.buffer.clear();
        self.error = None;
        self.exhausted = false;
        self.engine.metrics().record_seek();

        let prefix = self.options.prefix.as_slice();
        self.cursor = if self.options.reverse {
            if key.is_empty() {
                match prefix_successor(prefix) {
                    Some(upper) => Bound::Excluded(upper),
                    None => Bound::Unbounded,
                }
            } else {
                Bound::Included(key.to_vec())
            }
        } else if key < prefix {
            Bound::Included(prefix.to_vec())
        } else {
            Bound::Included(key.to_vec())
        };
        self.fill();
    }

    fn valid(&self) -> bool {
        !self.buffer.is_empty()
    }

    fn item(&self) -> Option<&Item> {
        self.buffer.front()
    }

    fn next(&mut self) {
        self.buffer.pop_front();
        self.fill();
    }

    fn take_error(&mut self) -> Option<EngineError> {
        self.error.take()
    }
}
