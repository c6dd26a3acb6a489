//! Watermark filtering of replayed mutations.

use crate::manifest::DiscardManifest;
use crate::types::{CommitLogPosition, TableId};
use std::collections::HashMap;

/// What to do with a mutation found during replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayDecision {
    /// Hand it to the handler.
    Replay,
    /// It lives in a segment older than the table's watermark segment.
    Discarded,
    /// It lives in the watermark segment, at or before the watermark.
    Skipped,
}

/// Per-table discard watermarks applied during replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayFilter {
    watermarks: HashMap<TableId, CommitLogPosition>,
}

impl ReplayFilter {
    /// Creates a filter that replays everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a filter from the upper bounds stored in `manifest`.
    #[must_use]
    pub fn from_manifest(manifest: &DiscardManifest) -> Self {
        let mut filter = Self::new();
        for (table, watermark) in manifest.watermarks() {
            filter.add_watermark(table, watermark.upper);
        }
        filter
    }

    /// Adds a watermark, keeping the higher one if `table` already has one.
    #[must_use]
    pub fn with_watermark(mut self, table: TableId, upper: CommitLogPosition) -> Self {
        self.add_watermark(table, upper);
        self
    }

    /// Adds a watermark, keeping the higher one if `table` already has one.
    pub fn add_watermark(&mut self, table: TableId, upper: CommitLogPosition) {
        self.watermarks
            .entry(table)
            .and_modify(|w| *w = (*w).max(upper))
            .or_insert(upper);
    }

    /// Returns the watermark of `table`.
    #[must_use]
    pub fn watermark(&self, table: TableId) -> Option<CommitLogPosition> {
        self.watermarks.get(&table).copied()
    }

    /// Classifies a mutation of `table` ending at `position`.
    #[must_use]
    pub fn classify(&self, table: TableId, position: CommitLogPosition) -> ReplayDecision {
        match self.watermarks.get(&table) {
            None => ReplayDecision::Replay,
            Some(w) if position.segment_id < w.segment_id => ReplayDecision::Discarded,
            Some(w) if position.segment_id == w.segment_id && position.offset <= w.offset => {
                ReplayDecision::Skipped
            }
            Some(_) => ReplayDecision::Replay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SegmentId;

    fn pos(segment: u64, offset: u32) -> CommitLogPosition {
        CommitLogPosition::new(SegmentId::new(segment), offset)
    }

    #[test]
    fn classify_against_watermark() {
        let table = TableId::new(1);
        let filter = ReplayFilter::new().with_watermark(table, pos(10, 500));

        assert_eq!(filter.classify(table, pos(9, 9_999)), ReplayDecision::Discarded);
        assert_eq!(filter.classify(table, pos(10, 100)), ReplayDecision::Skipped);
        assert_eq!(filter.classify(table, pos(10, 500)), ReplayDecision::Skipped);
        assert_eq!(filter.classify(table, pos(10, 501)), ReplayDecision::Replay);
        assert_eq!(filter.classify(table, pos(11, 0)), ReplayDecision::Replay);
    }

    #[test]
    fn other_tables_unaffected() {
        let filter = ReplayFilter::new().with_watermark(TableId::new(1), pos(10, 500));
        assert_eq!(
            filter.classify(TableId::new(2), pos(1, 32)),
            ReplayDecision::Replay
        );
    }

    #[test]
    fn keeps_highest_watermark() {
        let table = TableId::new(1);
        let filter = ReplayFilter::new()
            .with_watermark(table, pos(10, 500))
            .with_watermark(table, pos(9, 800));
        assert_eq!(filter.watermark(table), Some(pos(10, 500)));
    }

    #[test]
    fn built_from_manifest() {
        let mut manifest = DiscardManifest::new();
        manifest.record_discard(TableId::new(4), CommitLogPosition::NONE, pos(3, 64));
        let filter = ReplayFilter::from_manifest(&manifest);
        assert_eq!(filter.watermark(TableId::new(4)), Some(pos(3, 64)));
    }
}
