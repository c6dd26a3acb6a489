//! Segment reader.

use super::filter::{ReplayDecision, ReplayFilter};
use super::handler::{CommitLogReadHandler, ReadError, ReadErrorKind};
use crate::codec::ChunkCodec;
use crate::crypto::EncryptionKey;
use crate::dir::{list_segments_in, SegmentFile};
use crate::error::{CoreError, CoreResult};
use crate::mutation::Mutation;
use crate::segment::{
    parse_segment_file_name, ChunkHeader, FrameIter, HeaderError, SegmentDescriptor,
    SegmentHeader, CHUNK_HEADER_SIZE, HEADER_SIZE,
};
use crate::types::{CommitLogPosition, SegmentId};
use std::path::Path;
use tidelog_storage::{FileBackend, StorageBackend};
use tracing::{debug, warn};

/// Counters describing what a replay found.
///
/// `replayed + discarded + skipped` is the number of intact mutations
/// read. Non-zero `corrupt_tails`, `segments_skipped` or `unrecoverable`
/// means some data could not be recovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Segments whose header was read.
    pub segments_read: u64,
    /// Zero-length segment files.
    pub segments_empty: u64,
    /// Damaged segments the handler chose to skip.
    pub segments_skipped: u64,
    /// Damaged segments escalated to the handler.
    pub unrecoverable: u64,
    /// Mutations handed to the handler.
    pub replayed: u64,
    /// Mutations in segments older than their table's watermark segment.
    pub discarded: u64,
    /// Mutations at or before their table's watermark in the same segment.
    pub skipped: u64,
    /// Segments that ended in a truncated or checksum-failing chunk.
    pub corrupt_tails: u64,
    /// Bytes after the last valid chunk of those segments.
    pub tail_bytes_lost: u64,
}

impl ReplayStats {
    /// Returns true if every byte of every segment was accounted for.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.corrupt_tails == 0 && self.segments_skipped == 0 && self.unrecoverable == 0
    }
}

/// Reads segment files and replays their mutations.
///
/// # Example
///
/// ```rust,ignore
/// let mut reader = CommitLogReader::new().with_filter(filter);
/// reader.read_all_files(Path::new("commitlog"), &mut handler)?;
/// println!("replayed {}", reader.stats().replayed);
/// ```
#[derive(Debug, Default)]
pub struct CommitLogReader {
    key: Option<EncryptionKey>,
    filter: ReplayFilter,
    stats: ReplayStats,
    tails: Vec<CoreError>,
}

impl CommitLogReader {
    /// Creates a reader with no key and no filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the key for encrypted segments.
    #[must_use]
    pub fn with_key(mut self, key: EncryptionKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Sets the discard watermarks to apply.
    #[must_use]
    pub fn with_filter(mut self, filter: ReplayFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Returns the counters accumulated so far.
    #[must_use]
    pub fn stats(&self) -> &ReplayStats {
        &self.stats
    }

    /// Returns one [`CoreError::CorruptFrame`] per damaged tail, naming the
    /// logical offset where valid data ended.
    #[must_use]
    pub fn corrupt_tails(&self) -> &[CoreError] {
        &self.tails
    }

    /// Replays every segment file in `dir`, in id order.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed, or whatever the
    /// handler returns to abort the replay.
    pub fn read_all_files<H>(&mut self, dir: &Path, handler: &mut H) -> CoreResult<()>
    where
        H: CommitLogReadHandler + ?Sized,
    {
        let files = list_segments_in(dir)?;
        self.read_files(&files, handler)
    }

    /// Replays `files` in id order.
    pub fn read_files<H>(&mut self, files: &[SegmentFile], handler: &mut H) -> CoreResult<()>
    where
        H: CommitLogReadHandler + ?Sized,
    {
        let mut ordered: Vec<&SegmentFile> = files.iter().collect();
        ordered.sort_by_key(|f| f.id);
        for file in ordered {
            self.read_segment(&file.path, handler)?;
        }
        Ok(())
    }

    /// Replays a single segment file.
    pub fn read_segment<H>(&mut self, path: &Path, handler: &mut H) -> CoreResult<()>
    where
        H: CommitLogReadHandler + ?Sized,
    {
        let name_id = path
            .file_name()
            .and_then(|n| parse_segment_file_name(&n.to_string_lossy()))
            .map(|(_, id)| id);

        let bytes = match FileBackend::open_read_only(path).and_then(|b| b.read_all()) {
            Ok(bytes) => bytes,
            Err(e) => {
                let error = ReadError::new(ReadErrorKind::Io, path, name_id, e.to_string());
                return self.damaged(handler, error);
            }
        };
        if bytes.is_empty() {
            debug!(path = %path.display(), "skipping empty segment file");
            self.stats.segments_empty += 1;
            return Ok(());
        }

        let header = match SegmentHeader::decode(&bytes) {
            Ok(header) => header,
            Err(e) => {
                let error = ReadError::new(header_error_kind(&e), path, name_id, e.to_string());
                return self.damaged(handler, error);
            }
        };
        let id = header.segment_id;
        if let Some(name_id) = name_id {
            if name_id != id {
                let error = ReadError::new(
                    ReadErrorKind::BadHeader,
                    path,
                    Some(name_id),
                    format!("file name says {name_id}, header says {id}"),
                );
                return self.damaged(handler, error);
            }
        }

        let codec = match self.codec_for(&header) {
            Ok(codec) => codec,
            Err((kind, message)) => {
                return self.damaged(handler, ReadError::new(kind, path, Some(id), message));
            }
        };

        let descriptor = SegmentDescriptor::from_header(&header, path);
        self.stats.segments_read += 1;
        debug!(segment = %descriptor, "replaying segment");

        let mut cursor = HEADER_SIZE;
        let mut expected_start = HEADER_SIZE as u32;
        while cursor < bytes.len() {
            let rest = &bytes[cursor..];
            let Some(chunk) = ChunkHeader::decode(rest) else {
                self.tail(id, expected_start, rest.len(), "truncated chunk header");
                return Ok(());
            };
            if chunk.is_end_marker() {
                break;
            }
            let Some(stored) = rest.get(CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + chunk.stored_len as usize)
            else {
                self.tail(id, expected_start, rest.len(), "truncated chunk");
                return Ok(());
            };
            if !chunk.verify(stored) {
                self.tail(id, expected_start, rest.len(), "chunk checksum mismatch");
                return Ok(());
            }

            if chunk.logical_start != expected_start {
                let message = format!(
                    "chunk at byte {cursor} starts at logical offset {}, expected {expected_start}",
                    chunk.logical_start
                );
                let error = ReadError::new(ReadErrorKind::ChunkOutOfOrder, path, Some(id), message);
                return self.damaged(handler, error);
            }

            let frames = match codec.decode(stored, id.as_u64(), chunk.logical_start, chunk.content_len) {
                Ok(frames) => frames,
                Err(e) => {
                    let message = format!("chunk at logical offset {}: {e}", chunk.logical_start);
                    let error = ReadError::new(ReadErrorKind::DecodeFailure, path, Some(id), message);
                    return self.damaged(handler, error);
                }
            };

            for frame in FrameIter::new(&frames, chunk.logical_start) {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        let error = ReadError::new(
                            ReadErrorKind::FrameCorruption,
                            path,
                            Some(id),
                            e.to_string(),
                        );
                        return self.damaged(handler, error);
                    }
                };
                let mutation = match Mutation::decode(frame.payload) {
                    Ok(mutation) => mutation,
                    Err(e) => {
                        let message = format!("frame at offset {}: {e}", frame.start);
                        let error = ReadError::new(ReadErrorKind::BadMutation, path, Some(id), message);
                        return self.damaged(handler, error);
                    }
                };

                let position = CommitLogPosition::new(id, frame.end);
                match self.filter.classify(mutation.table_id(), position) {
                    ReplayDecision::Replay => {
                        handler.handle_mutation(mutation, frame.payload.len(), frame.end, &descriptor)?;
                        self.stats.replayed += 1;
                    }
                    ReplayDecision::Discarded => self.stats.discarded += 1,
                    ReplayDecision::Skipped => self.stats.skipped += 1,
                }
            }

            expected_start = chunk.logical_start.saturating_add(chunk.content_len);
            cursor += CHUNK_HEADER_SIZE + stored.len();
        }

        Ok(())
    }

    fn codec_for(&self, header: &SegmentHeader) -> Result<ChunkCodec, (ReadErrorKind, String)> {
        let key = match (header.key_fingerprint, &self.key) {
            (None, _) => None,
            (Some(_), None) => {
                return Err((
                    ReadErrorKind::EncryptionUnavailable,
                    "segment is encrypted and no key was supplied".to_string(),
                ))
            }
            (Some(fingerprint), Some(key)) if key.fingerprint() != fingerprint => {
                return Err((
                    ReadErrorKind::KeyMismatch,
                    "segment was written with a different key".to_string(),
                ))
            }
            (Some(_), Some(key)) => Some(key),
        };
        ChunkCodec::new(header.compression, key)
            .map_err(|e| (ReadErrorKind::EncryptionUnavailable, e.to_string()))
    }

    fn tail(&mut self, id: SegmentId, offset: u32, lost: usize, reason: &str) {
        self.stats.corrupt_tails += 1;
        self.stats.tail_bytes_lost += lost as u64;
        let error = CoreError::corrupt_frame(id.as_u64(), offset, reason);
        warn!(bytes = lost, %error, "ignoring damaged segment tail");
        self.tails.push(error);
    }

    fn damaged<H>(&mut self, handler: &mut H, error: ReadError) -> CoreResult<()>
    where
        H: CommitLogReadHandler + ?Sized,
    {
        if handler.should_skip_segment_on_error(&error) {
            warn!(error = %error, "skipping damaged segment");
            self.stats.segments_skipped += 1;
            Ok(())
        } else {
            self.stats.unrecoverable += 1;
            handler.handle_unrecoverable_error(error)
        }
    }
}

fn header_error_kind(error: &HeaderError) -> ReadErrorKind {
    match error {
        HeaderError::Truncated(_) => ReadErrorKind::TruncatedHeader,
        HeaderError::BadMagic(_) | HeaderError::BadChecksum { .. } => ReadErrorKind::BadHeader,
        HeaderError::UnsupportedVersion(_) => ReadErrorKind::UnsupportedVersion,
        HeaderError::UnknownCompression(_) => ReadErrorKind::UnknownCodec,
    }
}
