//! CELLAR - Engine Metrics & Observability
//! Atomic counters for engine operations, updated lock-free from any
//! transaction thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Atomic operation counters for the log engine.
///
/// All counters use `Ordering::Relaxed`; they are only ever read for
/// reporting.
#[derive(Debug)]
pub struct EngineMetrics {
    /// Committed puts (one per key per commit).
    pub puts: AtomicU64,
    /// Point reads, hits and misses.
    pub gets: AtomicU64,
    /// Committed deletes.
    pub deletes: AtomicU64,
    /// Iterator seeks.
    pub seeks: AtomicU64,
    pub commits: AtomicU64,
    /// Commits rejected by conflict detection.
    pub conflicts: AtomicU64,
    /// Transactions released without committing.
    pub discards: AtomicU64,
    /// Total bytes committed (keys + values).
    pub bytes_written: AtomicU64,
    /// Total value bytes returned by reads and iterators.
    pub bytes_read: AtomicU64,
    /// Value-log segments rewritten by space reclamation.
    pub segments_reclaimed: AtomicU64,
    /// Records replayed from the value log at open.
    pub records_replayed: AtomicU64,
    /// Timestamp when the engine was opened.
    engine_started: Instant,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            puts: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            seeks: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            discards: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            segments_reclaimed: AtomicU64::new(0),
            records_replayed: AtomicU64::new(0),
            engine_started: Instant::now(),
        }
    }

    /// Record a committed put.
    pub fn record_put(&self, key_size: usize, value_size: usize) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add((key_size + value_size) as u64, Ordering::Relaxed);
    }

    /// Record a point read; `None` is a miss.
    pub fn record_get(&self, value_size: Option<usize>) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if let Some(size) = value_size {
            self.record_read(size);
        }
    }

    pub fn record_read(&self, value_size: usize) {
        self.bytes_read
            .fetch_add(value_size as u64, Ordering::Relaxed);
    }

    /// Record a committed delete.
    pub fn record_delete(&self, key_size: usize) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(key_size as u64, Ordering::Relaxed);
    }

    pub fn record_seek(&self) {
        self.seeks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discard(&self) {
        self.discards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reclaim(&self) {
        self.segments_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay(&self, records: usize) {
        self.records_replayed
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> f64 {
        self.engine_started.elapsed().as_secs_f64()
    }

    /// Point operations plus iterator seeks.
    pub fn total_ops(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
            + self.gets.load(Ordering::Relaxed)
            + self.deletes.load(Ordering::Relaxed)
            + self.seeks.load(Ordering::Relaxed)
    }

    /// Average rate since open; zero during the first millisecond.
    pub fn ops_per_sec(&self) -> f64 {
        let uptime = self.uptime_secs();
        if uptime < 0.001 {
            return 0.0;
        }
        self.total_ops() as f64 / uptime
    }

    /// Multi-line report printed by the shell's `info` command.
    pub fn report(&self) -> String {
        format!(
            "\n═══ CELLAR Engine Metrics ═══\n\
             Operations:\n\
               puts:      {}\n\
               gets:      {}\n\
               deletes:   {}\n\
               seeks:     {}\n\
             Transactions:\n\
               commits:   {}\n\
               conflicts: {}\n\
               discards:  {}\n\
             Throughput:\n\
               total ops: {}\n\
               ops/sec:   {:.2}\n\
             I/O:\n\
               written:   {} bytes\n\
               read:      {} bytes\n\
             Value log:\n\
               replayed:  {} records\n\
               reclaimed: {} segments\n\
             Uptime: {:.2}s",
            self.puts.load(Ordering::Relaxed),
            self.gets.load(Ordering::Relaxed),
            self.deletes.load(Ordering::Relaxed),
            self.seeks.load(Ordering::Relaxed),
            self.commits.load(Ordering::Relaxed),
            self.conflicts.load(Ordering::Relaxed),
            self.discards.load(Ordering::Relaxed),
            self.total_ops(),
            self.ops_per_sec(),
            self.bytes_written.load(Ordering::Relaxed),
            self.bytes_read.load(Ordering::Relaxed),
            self.records_replayed.load(Ordering::Relaxed),
            self.segments_reclaimed.load(Ordering::Relaxed),
            self.uptime_secs(),
        )
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
