//! CELLAR - Space Reclamation Strategy
//! Decides which sealed value-log segment is worth rewriting.
//!
//! ## Value-Log Reclamation
//! Superseded, deleted and expired versions stay in their segment files
//! until the segment is rewritten. After the memtable drops versions no
//! reader needs, a segment's stale share is `1 - live / total` records.
//!
//! ## Discard-Ratio Strategy
//! - Measure the stale fraction of every sealed segment
//! - Pick the segment with the highest fraction
//! - Rewrite it only if that fraction reaches the configured ratio
//!
//! The head segment is never a candidate; it is still being appended to.

use std::collections::HashMap;

use super::wal::SegmentInfo;
use crate::error::EngineError;

/// Trait defining a reclamation strategy.
pub trait ReclamationStrategy {
    /// Select the segment to rewrite, if any.
    fn select_segment(&self, segments: &[SegmentStats]) -> Option<u32>;

    /// Returns the human-readable name of this strategy.
    fn name(&self) -> &str;
}

/// Live/total record counts of one sealed segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentStats {
    pub id: u32,
    /// Records ever written to the segment.
    pub total_records: u64,
    /// Records the memtable still references.
    pub live_records: u64,
}

impl SegmentStats {
    /// Share of the segment's records that are stale, in `[0, 1]`.
    pub fn discard_fraction(&self) -> f64 {
        if self.total_records == 0 {
            return 0.0;
        }
        let live = self.live_records.min(self.total_records);
        1.0 - live as f64 / self.total_records as f64
    }
}

/// Combine segment accounting with memtable usage.
pub fn segment_stats(sealed: &[SegmentInfo], usage: &HashMap<u32, u64>) -> Vec<SegmentStats> {
    sealed
        .iter()
        .map(|info| SegmentStats {
            id: info.id,
            total_records: info.records,
            live_records: usage.get(&info.id).copied().unwrap_or(0),
        })
        .collect()
}

/// Rewrite the most stale segment once its stale share reaches `ratio`.
#[derive(Debug, Clone, Copy)]
pub struct DiscardRatioStrategy {
    ratio: f64,
}

impl DiscardRatioStrategy {
    /// `ratio` must lie strictly between 0 and 1.
    pub fn new(ratio: f64) -> Result<Self, EngineError> {
        if !(ratio > 0.0 && ratio < 1.0) {
            return Err(EngineError::InvalidRequest(format!(
                "discard ratio must be in (0, 1), got {}",
                ratio
            )));
        }
        Ok(Self { ratio })
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }
}

impl ReclamationStrategy for DiscardRatioStrategy {
    fn select_segment(&self, segments: &[SegmentStats]) -> Option<u32> {
        segments
            .iter()
            .filter(|s| s.total_records > 0)
            .max_by(|a, b| a.discard_fraction().total_cmp(&b.discard_fraction()))
            .filter(|s| s.discard_fraction() >= self.ratio)
            .map(|s| s.id)
    }

    fn name(&self) -> &str {
        "DiscardRatio"
    }
}
