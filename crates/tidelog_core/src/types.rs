//! Core type definitions for the commit log.

use std::fmt;

/// Identifier of a segment file.
///
/// Segment ids strictly increase over the lifetime of a log directory, across
/// restarts. Id 0 is never assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SegmentId(pub u64);

impl SegmentId {
    /// Creates a new segment id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next segment id.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg:{}", self.0)
    }
}

/// Identifier of the table a mutation belongs to.
///
/// Discard watermarks are tracked per table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(pub u32);

impl TableId {
    /// Creates a new table id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table:{}", self.0)
    }
}

/// A point in the commit log: a segment and a logical byte offset within it.
///
/// Positions order by segment first, then offset. [`CommitLogPosition::NONE`]
/// precedes every position the log can hand out. The position returned for a
/// write is the offset just past its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CommitLogPosition {
    /// Segment holding the position.
    pub segment_id: SegmentId,
    /// Logical byte offset inside the segment.
    pub offset: u32,
}

impl CommitLogPosition {
    /// The position before any data.
    pub const NONE: Self = Self {
        segment_id: SegmentId(0),
        offset: 0,
    };

    /// Creates a new position.
    #[must_use]
    pub const fn new(segment_id: SegmentId, offset: u32) -> Self {
        Self { segment_id, offset }
    }

    /// Returns true for the [`NONE`](Self::NONE) sentinel.
    #[must_use]
    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

impl fmt::Display for CommitLogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.segment_id, self.offset)
    }
}
