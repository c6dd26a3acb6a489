//! Discard manifest: per-table watermarks persisted across restarts.
//!
//! ```text
//! | magic "TDSC" (4) | version (2) | last_segment_id (8) | count (4) |
//! | { table_id (4) | lower (12) | upper (12) } * count | crc32 (4) |
//! ```
//!
//! Positions are encoded as `segment_id (8) | offset (4)`.

use crate::error::{CoreError, CoreResult};
use crate::types::{CommitLogPosition, SegmentId, TableId};
use std::collections::BTreeMap;

/// Magic bytes for the manifest file.
pub const MANIFEST_MAGIC: [u8; 4] = *b"TDSC";

/// Current manifest version.
pub const MANIFEST_VERSION: u16 = 1;

const POSITION_SIZE: usize = 12;
const ENTRY_SIZE: usize = 4 + 2 * POSITION_SIZE;
const FIXED_SIZE: usize = 4 + 2 + 8 + 4;

/// The discarded range of one table.
///
/// Mutations of the table at or before `upper` are durable elsewhere and
/// must not be replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscardWatermark {
    /// Lowest lower bound ever recorded.
    pub lower: CommitLogPosition,
    /// Highest upper bound ever recorded.
    pub upper: CommitLogPosition,
}

/// Discard watermarks for every table, plus the highest segment id handed out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscardManifest {
    watermarks: BTreeMap<TableId, DiscardWatermark>,
    last_segment_id: SegmentId,
}

impl DiscardManifest {
    /// Creates an empty manifest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a discard for `table`, keeping the widest range.
    ///
    /// Returns true if the stored watermark changed.
    pub fn record_discard(
        &mut self,
        table: TableId,
        lower: CommitLogPosition,
        upper: CommitLogPosition,
    ) -> bool {
        match self.watermarks.get_mut(&table) {
            Some(existing) => {
                let merged = DiscardWatermark {
                    lower: existing.lower.min(lower),
                    upper: existing.upper.max(upper),
                };
                let changed = merged != *existing;
                *existing = merged;
                changed
            }
            None => {
                self.watermarks
                    .insert(table, DiscardWatermark { lower, upper });
                true
            }
        }
    }

    /// Returns the watermark of `table`.
    #[must_use]
    pub fn watermark(&self, table: TableId) -> Option<DiscardWatermark> {
        self.watermarks.get(&table).copied()
    }

    /// Iterates watermarks in table order.
    pub fn watermarks(&self) -> impl Iterator<Item = (TableId, DiscardWatermark)> + '_ {
        self.watermarks.iter().map(|(t, w)| (*t, *w))
    }

    /// Returns the highest segment id recorded.
    #[must_use]
    pub fn last_segment_id(&self) -> SegmentId {
        self.last_segment_id
    }

    /// Raises the recorded segment id high-water mark.
    pub fn note_segment(&mut self, id: SegmentId) {
        self.last_segment_id = self.last_segment_id.max(id);
    }

    /// Encodes the manifest to bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FIXED_SIZE + self.watermarks.len() * ENTRY_SIZE + 4);

        buf.extend_from_slice(&MANIFEST_MAGIC);
        buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.last_segment_id.as_u64().to_le_bytes());

        let count = u32::try_from(self.watermarks.len()).unwrap_or(u32::MAX);
        buf.extend_from_slice(&count.to_le_bytes());

        for (table, watermark) in self.watermarks.iter().take(count as usize) {
            buf.extend_from_slice(&table.as_u32().to_le_bytes());
            encode_position(&mut buf, watermark.lower);
            encode_position(&mut buf, watermark.upper);
        }

        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a manifest from bytes.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < 4 || data[0..4] != MANIFEST_MAGIC {
            return Err(CoreError::invalid_format("invalid manifest magic"));
        }
        if data.len() < FIXED_SIZE + 4 {
            return Err(CoreError::invalid_format("manifest too short"));
        }

        let (body, crc_bytes) = data.split_at(data.len() - 4);
        let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }

        let version = u16::from_le_bytes([body[4], body[5]]);
        if version > MANIFEST_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported manifest version: {version}"
            )));
        }

        let last_segment_id = SegmentId::new(read_u64(body, 6));
        let count = read_u32(body, 14) as usize;

        if body.len() != FIXED_SIZE + count * ENTRY_SIZE {
            return Err(CoreError::invalid_format(format!(
                "manifest declares {count} watermarks but holds {} bytes",
                body.len()
            )));
        }

        let mut watermarks = BTreeMap::new();
        let mut cursor = FIXED_SIZE;
        for _ in 0..count {
            let table = TableId::new(read_u32(body, cursor));
            let lower = decode_position(body, cursor + 4);
            let upper = decode_position(body, cursor + 4 + POSITION_SIZE);
            watermarks.insert(table, DiscardWatermark { lower, upper });
            cursor += ENTRY_SIZE;
        }

        Ok(Self {
            watermarks,
            last_segment_id,
        })
    }
}

fn encode_position(buf: &mut Vec<u8>, position: CommitLogPosition) {
    buf.extend_from_slice(&position.segment_id.as_u64().to_le_bytes());
    buf.extend_from_slice(&position.offset.to_le_bytes());
}

// Callers check bounds before reading.
fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn decode_position(data: &[u8], at: usize) -> CommitLogPosition {
    CommitLogPosition::new(SegmentId::new(read_u64(data, at)), read_u32(data, at + 8))
}
