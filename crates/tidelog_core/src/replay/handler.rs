//! Replay handler contract.

use crate::error::{CoreError, CoreResult};
use crate::mutation::Mutation;
use crate::segment::SegmentDescriptor;
use crate::types::SegmentId;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Kind of structural damage found in a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadErrorKind {
    /// The file could not be read.
    Io,
    /// The file ends inside the header.
    TruncatedHeader,
    /// Magic or header checksum is wrong.
    BadHeader,
    /// Written by a newer format version.
    UnsupportedVersion,
    /// Compression tag not known to this build.
    UnknownCodec,
    /// Chunks are encrypted but no key was supplied.
    EncryptionUnavailable,
    /// The supplied key is not the one the segment was written with.
    KeyMismatch,
    /// A chunk starts at an unexpected logical offset.
    ChunkOutOfOrder,
    /// A checksummed chunk failed to decrypt or decompress.
    DecodeFailure,
    /// A frame inside a checksummed chunk is malformed.
    FrameCorruption,
    /// A frame's payload is not a valid mutation.
    BadMutation,
}

impl fmt::Display for ReadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Io => "I/O error",
            Self::TruncatedHeader => "truncated header",
            Self::BadHeader => "bad header",
            Self::UnsupportedVersion => "unsupported version",
            Self::UnknownCodec => "unknown codec",
            Self::EncryptionUnavailable => "encryption key unavailable",
            Self::KeyMismatch => "encryption key mismatch",
            Self::ChunkOutOfOrder => "chunk out of order",
            Self::DecodeFailure => "chunk decode failure",
            Self::FrameCorruption => "frame corruption",
            Self::BadMutation => "bad mutation",
        };
        f.write_str(name)
    }
}

/// Structural damage in one segment, reported to the handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} in {}: {message}", .path.display())]
pub struct ReadError {
    /// What went wrong.
    pub kind: ReadErrorKind,
    /// Segment file.
    pub path: PathBuf,
    /// Segment id, if the header or file name gave one.
    pub segment_id: Option<SegmentId>,
    /// Details.
    pub message: String,
}

impl ReadError {
    pub(crate) fn new(
        kind: ReadErrorKind,
        path: impl Into<PathBuf>,
        segment_id: Option<SegmentId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            path: path.into(),
            segment_id,
            message: message.into(),
        }
    }
}

impl From<ReadError> for CoreError {
    fn from(error: ReadError) -> Self {
        CoreError::unrecoverable_segment(
            error.path.display().to_string(),
            format!("{}: {}", error.kind, error.message),
        )
    }
}

/// Receives the results of a replay.
///
/// Only [`handle_mutation`](Self::handle_mutation) is required. By default
/// structural damage aborts the replay.
pub trait CommitLogReadHandler {
    /// Returns true to skip the rest of a damaged segment and continue.
    fn should_skip_segment_on_error(&mut self, error: &ReadError) -> bool {
        let _ = error;
        false
    }

    /// Called for damage the handler chose not to skip. Returning an error
    /// aborts the replay; returning `Ok` moves on to the next segment.
    fn handle_unrecoverable_error(&mut self, error: ReadError) -> CoreResult<()> {
        Err(error.into())
    }

    /// Called for every mutation that survives filtering, in log order.
    ///
    /// `size` is the serialized mutation size and `entry_location` the
    /// logical offset just past its frame. Returning an error aborts the
    /// replay.
    fn handle_mutation(
        &mut self,
        mutation: Mutation,
        size: usize,
        entry_location: u32,
        descriptor: &SegmentDescriptor,
    ) -> CoreResult<()>;
}
