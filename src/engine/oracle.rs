//! CELLAR - Timestamp Oracle
//! Hands out snapshot timestamps and keeps count of the transactions that
//! are still open, so space reclamation knows the oldest snapshot it must
//! preserve.

use std::collections::BTreeMap;

/// Commit counter plus the set of live snapshots.
#[derive(Debug, Default)]
pub struct Oracle {
    committed_ts: u64,
    /// read_ts -> number of open transactions reading at it.
    active_reads: BTreeMap<u64, usize>,
    open_txns: usize,
}

impl Oracle {
    pub fn new(committed_ts: u64) -> Self {
        Self {
            committed_ts,
            ..Self::default()
        }
    }

    /// Register a new transaction and return its read timestamp.
    pub fn begin(&mut self) -> u64 {
        let read_ts = self.committed_ts;
        *self.active_reads.entry(read_ts).or_insert(0) += 1;
        self.open_txns += 1;
        read_ts
    }

    /// Unregister a transaction that began at `read_ts`.
    pub fn release(&mut self, read_ts: u64) {
        if let Some(count) = self.active_reads.get_mut(&read_ts) {
            *count -= 1;
            if *count == 0 {
                self.active_reads.remove(&read_ts);
            }
            self.open_txns = self.open_txns.saturating_sub(1);
        }
    }

    /// Versions at or below this timestamp are only visible to snapshots no
    /// older than it.
    pub fn discard_ts(&self) -> u64 {
        self.active_reads
            .keys()
            .next()
            .copied()
            .unwrap_or(self.committed_ts)
    }

    pub fn committed_ts(&self) -> u64 {
        self.committed_ts
    }

    /// Move the counter forward to at least `ts` (restore, replay).
    pub fn advance_to(&mut self, ts: u64) {
        self.committed_ts = self.committed_ts.max(ts);
    }

    pub fn open_txns(&self) -> usize {
        self.open_txns
    }
}
