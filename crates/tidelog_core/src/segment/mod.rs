//! Segment files.
//!
//! A segment is one append-only file plus the in-memory buffer of frames
//! not yet synced to it. Writers append frames to the buffer; the sync
//! service periodically encodes the buffer as one chunk and fsyncs it.
//!
//! ## File Layout
//!
//! ```text
//! | header (32) | chunk | chunk | ... | [end marker (16 zero bytes)] |
//! ```
//!
//! Each chunk carries a run of frames, compressed and optionally encrypted:
//!
//! ```text
//! | stored_len (4) | logical_start (4) | content_len (4) | crc32 (4) | stored bytes |
//! ```
//!
//! and each frame inside a decoded chunk is
//!
//! ```text
//! | length (4) | crc32 (4) | payload (length) |
//! ```
//!
//! Positions handed to writers are *logical* offsets: the header plus all
//! frame bytes before the end of the write. They do not depend on how well
//! chunks compress.

mod file;
mod header;
mod record;

pub use file::{AppendResult, Segment};
pub use header::{
    HeaderError, SegmentDescriptor, SegmentHeader, FORMAT_VERSION, HEADER_SIZE, SEGMENT_MAGIC,
};
pub use record::{
    encode_frame, frame_size, ChunkHeader, Frame, FrameError, FrameIter, CHUNK_HEADER_SIZE,
    FRAME_HEADER_SIZE,
};

use crate::types::SegmentId;

/// File name prefix of segment files.
pub const SEGMENT_PREFIX: &str = "CommitLog-";
/// File name suffix of segment files.
pub const SEGMENT_SUFFIX: &str = ".log";

/// Returns the file name of segment `id`.
#[must_use]
pub fn segment_file_name(id: SegmentId) -> String {
    format!("{SEGMENT_PREFIX}{FORMAT_VERSION}-{}{SEGMENT_SUFFIX}", id.as_u64())
}

/// Parses a segment file name into its format version and id.
#[must_use]
pub fn parse_segment_file_name(name: &str) -> Option<(u16, SegmentId)> {
    let rest = name.strip_prefix(SEGMENT_PREFIX)?.strip_suffix(SEGMENT_SUFFIX)?;
    let (version, id) = rest.split_once('-')?;
    Some((version.parse().ok()?, SegmentId::new(id.parse().ok()?)))
}
