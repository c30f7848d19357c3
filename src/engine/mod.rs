//! CELLAR - Storage Engine Module
//! `LogEngine` is the built-in implementation of the engine contract in
//! [`traits`]: an MVCC memtable rebuilt on open from a segmented,
//! checksummed, optionally encrypted value log.

pub mod backup;
pub mod compaction;
pub mod crypto;
pub mod memtable;
pub mod metrics;
pub mod oracle;
pub mod traits;
pub mod ttl;
pub mod txn;
pub mod wal;

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{Read, Write};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::config::EngineOptions;
use crate::error::EngineError;
use crate::logger::SharedLogger;
use crate::types::Key;

use self::backup::{write_backup, BackupReader};
use self::compaction::{segment_stats, DiscardRatioStrategy, ReclamationStrategy};
use self::crypto::KeyRegistry;
use self::memtable::{MemTable, VersionedValue};
use self::metrics::EngineMetrics;
use self::oracle::Oracle;
use self::ttl::now_secs;
use self::txn::PendingWrite;
use self::wal::{LogRecord, ValueLog, ValueLogConfig};

pub use self::traits::{Engine, EngineIterator, EngineTxn, Entry, IteratorOptions, Item};
pub use self::txn::{LogIterator, LogTxn};

/// Everything guarded by the state lock.
struct State {
    memtable: MemTable,
    /// `None` for in-memory engines and after close.
    vlog: Option<ValueLog>,
    registry: KeyRegistry,
}

/// The built-in transactional engine.
///
/// Lock order is the state lock first, then the oracle. Beginning and
/// releasing a transaction only touch the oracle.
pub struct LogEngine {
    options: EngineOptions,
    logger: SharedLogger,
    state: RwLock<State>,
    oracle: Mutex<Oracle>,
    metrics: EngineMetrics,
    closed: AtomicBool,
}

impl LogEngine {
    /// Open (or create) the engine described by `options`, replaying the
    /// value log into memory.
    pub fn open(options: EngineOptions) -> Result<Self, EngineError> {
        let logger = options.logger.clone();
        let metrics = EngineMetrics::new();
        let mut memtable = MemTable::new();

        let (registry, vlog) = if options.in_memory {
            let registry = KeyRegistry::open(
                None,
                options.encryption_key.as_deref(),
                options.encryption_key_rotation,
                options.read_only,
            )?;
            (registry, None)
        } else {
            if !options.read_only {
                fs::create_dir_all(&options.dir)?;
                fs::create_dir_all(&options.value_dir)?;
            }
            let registry = KeyRegistry::open(
                Some(&options.dir),
                options.encryption_key.as_deref(),
                options.encryption_key_rotation,
                options.read_only,
            )?;
            let config = ValueLogConfig {
                max_entries: options.value_log_max_entries.max(1),
                max_file_size: options.value_log_file_size.max(1),
                sync_writes: options.sync_writes,
                verify_checksums: options.checksum_verification_mode.verifies()
                    || options.verify_value_checksum,
                truncate: options.truncate,
                read_only: options.read_only,
                logger: logger.clone(),
            };
            let (vlog, stats) = ValueLog::open(&options.value_dir, config, &registry, |segment, record| {
                let (key, value) = VersionedValue::from_record(record, segment);
                memtable.insert(key, value);
            })?;
            metrics.record_replay(stats.records);
            if stats.truncated_bytes > 0 {
                logger.warn(&format!(
                    "value log tail truncated: {} bytes dropped",
                    stats.truncated_bytes
                ));
            }
            logger.info(&format!(
                "value log replayed: {} records in {} frames from {} segments",
                stats.records, stats.frames, stats.segments
            ));
            (registry, Some(vlog))
        };

        let committed_ts = memtable.max_version();
        logger.info(&format!(
            "engine opened at {:?} ({} keys, version {}, encrypted: {}, read-only: {})",
            options.value_dir,
            memtable.len(),
            committed_ts,
            registry.is_encrypted(),
            options.read_only
        ));

        Ok(Self {
            logger,
            state: RwLock::new(State {
                memtable,
                vlog,
                registry,
            }),
            oracle: Mutex::new(Oracle::new(committed_ts)),
            metrics,
            closed: AtomicBool::new(false),
            options,
        })
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Transactions begun and not yet committed, discarded or dropped.
    pub fn open_transactions(&self) -> usize {
        self.oracle.lock().open_txns()
    }

    /// Version assigned to the most recent commit.
    pub fn last_version(&self) -> u64 {
        self.oracle.lock().committed_ts()
    }

    /// Keys with at least one retained version, tombstones included.
    pub fn key_count(&self) -> usize {
        self.state.read().memtable.len()
    }

    /// Approximate bytes held by retained key versions.
    pub fn memory_bytes(&self) -> usize {
        self.state.read().memtable.size()
    }

    /// Value-log segments on disk (0 for in-memory engines).
    pub fn segment_count(&self) -> usize {
        self.state
            .read()
            .vlog
            .as_ref()
            .map_or(0, |vlog| vlog.segment_count())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), EngineError> {
        self.ensure_open()?;
        if self.options.read_only {
            return Err(EngineError::ReadOnly);
        }
        Ok(())
    }

    pub(crate) fn release(&self, read_ts: u64) {
        self.oracle.lock().release(read_ts);
    }

    pub(crate) fn read_version(
        &self,
        key: &[u8],
        read_ts: u64,
    ) -> Result<Option<VersionedValue>, EngineError> {
        self.ensure_open()?;
        Ok(self.state.read().memtable.get(key, read_ts).cloned())
    }

    pub(crate) fn read_page(
        &self,
        prefix: &[u8],
        from: Bound<Key>,
        read_ts: u64,
        limit: usize,
        reverse: bool,
    ) -> Result<Vec<(Key, VersionedValue)>, EngineError> {
        self.ensure_open()?;
        let state = self.state.read();
        Ok(state
            .memtable
            .page(prefix, from, read_ts, now_secs(), limit, reverse))
    }

    /// Make a transaction's writes durable and visible under one new version.
    pub(crate) fn commit_writes(
        &self,
        read_ts: u64,
        reads: &HashSet<Key>,
        writes: BTreeMap<Key, PendingWrite>,
    ) -> Result<u64, EngineError> {
        let mut state = self.state.write();
        self.ensure_writable()?;

        if self.options.detect_conflicts {
            let conflicted = reads
                .iter()
                .any(|key| state.memtable.latest_version(key) > read_ts);
            if conflicted {
                self.metrics.record_conflict();
                self.logger.debug("commit rejected: read set changed");
                return Err(EngineError::Conflict);
            }
        }

        let commit_ts = self.oracle.lock().committed_ts() + 1;
        let records: Vec<LogRecord> = writes
            .into_iter()
            .map(|(key, write)| LogRecord {
                key,
                value: write.value,
                version: commit_ts,
                expires_at: write.expires_at,
                user_meta: write.user_meta,
            })
            .collect();

        let State {
            memtable,
            vlog,
            registry,
        } = &mut *state;
        let segment = match vlog.as_mut() {
            Some(vlog) => vlog.append(&records, registry, now_secs())?,
            None => 0,
        };

        for record in records {
            match &record.value {
                Some(value) => self.metrics.record_put(record.key.len(), value.len()),
                None => self.metrics.record_delete(record.key.len()),
            }
            let (key, value) = VersionedValue::from_record(record, segment);
            memtable.insert(key, value);
        }
        self.oracle.lock().advance_to(commit_ts);
        self.metrics.record_commit();
        Ok(commit_ts)
    }

    /// Apply one restored batch with its original versions.
    fn apply_restored(&self, batch: &mut Vec<LogRecord>) -> Result<(), EngineError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write();
        self.ensure_writable()?;
        let State {
            memtable,
            vlog,
            registry,
        } = &mut *state;

        let segments = match vlog.as_mut() {
            Some(vlog) => vlog.append_chunked(batch, registry, now_secs())?,
            None => vec![0; batch.len()],
        };
        let mut max_version = 0;
        for (record, segment) in batch.drain(..).zip(segments) {
            max_version = max_version.max(record.version);
            let (key, value) = VersionedValue::from_record(record, segment);
            memtable.insert(key, value);
        }
        self.oracle.lock().advance_to(max_version);
        Ok(())
    }
}

impl Engine for LogEngine {
    type Txn<'a> = LogTxn<'a> where Self: 'a;

    fn begin(&self, writable: bool) -> Result<Self::Txn<'_>, EngineError> {
        self.ensure_open()?;
        if writable && self.options.read_only {
            return Err(EngineError::ReadOnly);
        }
        let read_ts = self.oracle.lock().begin();
        Ok(LogTxn::new(self, read_ts, writable))
    }

    fn backup(&self, sink: &mut dyn Write, since: u64) -> Result<u64, EngineError> {
        self.ensure_open()?;
        let records = {
            let state = self.state.read();
            let read_ts = self.oracle.lock().committed_ts();
            state.memtable.latest_since(since, read_ts)
        };
        let next = write_backup(sink, &records, since)?;
        self.logger.info(&format!(
            "backup written: {} records since version {}",
            records.len(),
            since
        ));
        Ok(next)
    }

    fn restore(&self, source: &mut dyn Read, max_pending_writes: usize) -> Result<(), EngineError> {
        self.ensure_writable()?;
        let limit = max_pending_writes.max(1);
        let mut reader = BackupReader::open(source)?;
        let mut batch = Vec::with_capacity(limit);
        let mut restored = 0usize;

        while let Some(record) = reader.next_record()? {
            batch.push(record);
            if batch.len() >= limit {
                restored += batch.len();
                self.apply_restored(&mut batch)?;
                self.logger.debug(&format!("restore progress: {} records", restored));
            }
        }
        restored += batch.len();
        self.apply_restored(&mut batch)?;
        self.logger.info(&format!("restore finished: {} records", restored));
        Ok(())
    }

    fn run_space_reclamation(&self, discard_ratio: f64) -> Result<(), EngineError> {
        let strategy = DiscardRatioStrategy::new(discard_ratio)?;
        let mut state = self.state.write();
        self.ensure_writable()?;

        let discard_ts = self.oracle.lock().discard_ts();
        let now = now_secs();
        let State {
            memtable,
            vlog,
            registry,
        } = &mut *state;

        let oldest = vlog.as_ref().map_or(0, |vlog| vlog.oldest_segment());
        let pruned = memtable.prune(discard_ts, self.options.num_versions_to_keep, now, oldest);
        if pruned > 0 {
            self.logger
                .debug(&format!("pruned {} versions at or below {}", pruned, discard_ts));
        }

        let vlog = match vlog.as_mut() {
            Some(vlog) => vlog,
            None if pruned > 0 => return Ok(()),
            None => return Err(EngineError::NoRewrite),
        };

        let stats = segment_stats(&vlog.sealed_segments(), &memtable.segment_usage());
        let id = match strategy.select_segment(&stats) {
            Some(id) => id,
            None => return Err(EngineError::NoRewrite),
        };

        let live = memtable.records_in_segment(id);
        let placed = vlog.append_chunked(&live, registry, now)?;
        for (record, segment) in live.iter().zip(placed) {
            memtable.relocate(&record.key, record.version, segment);
        }
        vlog.remove_segment(id)?;
        self.metrics.record_reclaim();
        self.logger.info(&format!(
            "{} reclaimed segment {} ({} live records moved)",
            strategy.name(),
            id,
            live.len()
        ));
        Ok(())
    }

    fn drop_all(&self) -> Result<(), EngineError> {
        let mut state = self.state.write();
        self.ensure_writable()?;
        let keys = state.memtable.len();
        state.memtable.clear();
        if let Some(vlog) = state.vlog.as_mut() {
            vlog.reset()?;
        }
        self.logger.info(&format!("dropped all data ({} keys)", keys));
        Ok(())
    }

    fn drop_prefix(&self, prefix: &[u8]) -> Result<(), EngineError> {
        let mut state = self.state.write();
        self.ensure_writable()?;
        let State {
            memtable,
            vlog,
            registry,
        } = &mut *state;

        let removed = memtable.remove_prefix(prefix);
        if let Some(vlog) = vlog.as_mut() {
            let records = memtable.all_records();
            let placed = vlog.rewrite_all(&records, registry, now_secs())?;
            for (record, segment) in records.iter().zip(placed) {
                memtable.relocate(&record.key, record.version, segment);
            }
        }
        self.logger.info(&format!(
            "dropped {} keys with prefix '{}'",
            removed,
            String::from_utf8_lossy(prefix)
        ));
        Ok(())
    }

    fn close(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            return Ok(());
        }
        if self.options.compact_l0_on_close && !self.options.read_only {
            match self.run_space_reclamation(0.5) {
                Ok(()) | Err(EngineError::NoRewrite) => {}
                Err(err) => self.logger.warn(&format!("reclamation on close failed: {}", err)),
            }
        }

        let mut state = self.state.write();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let open = self.oracle.lock().open_txns();
        if open > 0 {
            self.logger
                .warn(&format!("closing with {} open transactions", open));
        }
        if let Some(mut vlog) = state.vlog.take() {
            vlog.sync()?;
        }
        self.logger.info("engine closed");
        self.logger.debug(&self.metrics.report());
        Ok(())
    }
}

impl Drop for LogEngine {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            self.logger.error(&format!("close on drop failed: {}", err));
        }
    }
}
