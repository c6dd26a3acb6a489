//! A live segment: its file and its write buffer.

use super::header::{SegmentHeader, HEADER_SIZE};
use super::record::{ChunkHeader, CHUNK_HEADER_SIZE};
use crate::codec::ChunkCodec;
use crate::error::{CoreError, CoreResult};
use crate::types::{CommitLogPosition, SegmentId, TableId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tidelog_storage::StorageBackend;

/// Outcome of [`Segment::try_append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// The frame was buffered; the position is just past it.
    Appended(CommitLogPosition),
    /// The segment is sealed or lacks room for the frame.
    Full,
}

/// Logical range a table has written within a segment, and the parts of
/// the segment discards have covered for it so far.
#[derive(Debug, Clone)]
struct DirtyRange {
    first: u32,
    last: u32,
    /// Sorted, disjoint, non-adjacent `[start, end]` intervals.
    clean: Vec<(u32, u32)>,
}

impl DirtyRange {
    fn new(first: u32, last: u32) -> Self {
        Self {
            first,
            last,
            clean: Vec::new(),
        }
    }

    /// Merges `[start, end]` into the clean intervals.
    fn mark_clean(&mut self, start: u32, end: u32) {
        let mut merged = (start, end);
        self.clean.retain(|&(s, e)| {
            if s <= merged.1 && e >= merged.0 {
                merged = (merged.0.min(s), merged.1.max(e));
                false
            } else {
                true
            }
        });
        let at = self.clean.partition_point(|&(s, _)| s < merged.0);
        self.clean.insert(at, merged);
    }

    fn is_covered(&self) -> bool {
        self.clean
            .iter()
            .any(|&(s, e)| s <= self.first && e >= self.last)
    }
}

/// State shared by writers and the sync service.
#[derive(Debug)]
struct WriteBuffer {
    /// Frames not yet handed to the sync service.
    pending: Vec<u8>,
    /// Logical offset of `pending[0]`.
    pending_start: u32,
    /// Logical end of all frames appended so far.
    end: u32,
    sealed: bool,
    /// Tables with data in this segment that no discard has covered yet.
    dirty: HashMap<TableId, DirtyRange>,
}

/// One append-only segment file plus its in-memory buffer.
///
/// Writers call [`try_append`](Self::try_append) concurrently; the append is
/// a short critical section that reserves the range and copies the frame,
/// so frames never interleave. [`sync`](Self::sync) drains the buffer into
/// one chunk while holding the file lock, so chunks reach the file in
/// logical order.
pub struct Segment {
    id: SegmentId,
    path: PathBuf,
    capacity: u32,
    codec: ChunkCodec,
    /// Held for the whole of a sync, so chunks reach the file in order.
    file: Mutex<Box<dyn StorageBackend>>,
    buffer: Mutex<WriteBuffer>,
    end_marked: AtomicBool,
    synced: AtomicU32,
    content_size: AtomicU64,
    on_disk_size: AtomicU64,
}

impl Segment {
    /// Writes a fresh header to `backend` and returns the active segment.
    ///
    /// `backend` must be empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be written and synced.
    pub fn create(
        id: SegmentId,
        path: PathBuf,
        mut backend: Box<dyn StorageBackend>,
        capacity: u32,
        codec: ChunkCodec,
    ) -> CoreResult<Self> {
        let header = SegmentHeader::new(id, codec.compression(), codec.key_fingerprint());
        backend.append(&header.encode())?;
        backend.sync()?;

        Ok(Self {
            id,
            path,
            capacity,
            codec,
            file: Mutex::new(backend),
            buffer: Mutex::new(WriteBuffer {
                pending: Vec::new(),
                pending_start: HEADER_SIZE as u32,
                end: HEADER_SIZE as u32,
                sealed: false,
                dirty: HashMap::new(),
            }),
            end_marked: AtomicBool::new(false),
            synced: AtomicU32::new(HEADER_SIZE as u32),
            content_size: AtomicU64::new(HEADER_SIZE as u64),
            on_disk_size: AtomicU64::new(HEADER_SIZE as u64),
        })
    }

    /// Returns the segment id.
    #[must_use]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Returns the path of the segment file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the file name of the segment.
    #[must_use]
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| super::segment_file_name(self.id))
    }

    /// Returns the logical capacity, header included.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Buffers `frame` for `table` if it fits.
    #[must_use]
    pub fn try_append(&self, table: TableId, frame: &[u8]) -> AppendResult {
        let mut buffer = self.buffer.lock();
        if buffer.sealed {
            return AppendResult::Full;
        }
        let start = buffer.end;
        let Some(end) = u32::try_from(frame.len())
            .ok()
            .and_then(|len| start.checked_add(len))
            .filter(|end| *end <= self.capacity)
        else {
            return AppendResult::Full;
        };

        buffer.pending.extend_from_slice(frame);
        buffer.end = end;
        buffer
            .dirty
            .entry(table)
            .and_modify(|range| range.last = end)
            .or_insert_with(|| DirtyRange::new(start, end));

        AppendResult::Appended(CommitLogPosition::new(self.id, end))
    }

    /// Stops accepting appends. Buffered frames are still synced.
    pub fn seal(&self) {
        self.buffer.lock().sealed = true;
    }

    /// Returns true once the segment has been sealed.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.buffer.lock().sealed
    }

    /// Writes buffered frames as one chunk and fsyncs the file.
    ///
    /// Returns the logical offset up to which the segment is durable. A
    /// sealed segment with nothing left to write gets its end marker.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Write`] if encoding, writing or syncing fails.
    /// The frames taken for this chunk are lost; callers treat the failure
    /// as fatal.
    pub fn sync(&self) -> CoreResult<u32> {
        let mut backend = self.file.lock();

        let (frames, logical_start, end, sealed) = {
            let mut buffer = self.buffer.lock();
            let frames = std::mem::take(&mut buffer.pending);
            let start = buffer.pending_start;
            buffer.pending_start = buffer.end;
            (frames, start, buffer.end, buffer.sealed)
        };

        if !frames.is_empty() {
            let stored = self
                .codec
                .encode(&frames, self.id.as_u64(), logical_start)
                .map_err(|e| CoreError::write(format!("encoding chunk of {}: {e}", self.id)))?;
            let header = ChunkHeader::new(&stored, logical_start, frames.len() as u32);

            backend
                .append(&header.encode())
                .and_then(|_| backend.append(&stored))
                .and_then(|_| backend.sync())
                .map_err(|e| CoreError::write(format!("syncing {}: {e}", self.id)))?;

            let on_disk_len = (CHUNK_HEADER_SIZE + stored.len()) as u64;
            self.content_size
                .fetch_add(frames.len() as u64, Ordering::Release);
            self.on_disk_size
                .fetch_add(on_disk_len, Ordering::Release);
            self.synced.store(end, Ordering::Release);
        }

        if sealed && !self.end_marked.load(Ordering::Acquire) {
            backend
                .append(&ChunkHeader::END_MARKER)
                .and_then(|_| backend.sync())
                .map_err(|e| CoreError::write(format!("closing {}: {e}", self.id)))?;
            self.end_marked.store(true, Ordering::Release);
            self.on_disk_size
                .fetch_add(CHUNK_HEADER_SIZE as u64, Ordering::Release);
        }

        Ok(self.synced.load(Ordering::Acquire))
    }

    /// Returns the logical offset up to which the segment is durable.
    #[must_use]
    pub fn synced_offset(&self) -> u32 {
        self.synced.load(Ordering::Acquire)
    }

    /// Returns the position up to which the segment is durable.
    #[must_use]
    pub fn synced_position(&self) -> CommitLogPosition {
        CommitLogPosition::new(self.id, self.synced_offset())
    }

    /// Returns true if nothing is left to write, end marker included once
    /// sealed.
    #[must_use]
    pub fn is_fully_synced(&self) -> bool {
        let buffer = self.buffer.lock();
        buffer.pending.is_empty() && (!buffer.sealed || self.end_marked.load(Ordering::Acquire))
    }

    /// Records that `table`'s data between `lower` and `upper` is durable
    /// elsewhere.
    ///
    /// Positions in other segments widen the range to the whole segment on
    /// that side. Ranges from successive discards accumulate; the table
    /// stops pinning this segment once their union covers everything it
    /// wrote here.
    pub fn mark_clean(&self, table: TableId, lower: CommitLogPosition, upper: CommitLogPosition) {
        if lower.segment_id > self.id || upper.segment_id < self.id {
            return;
        }
        let start = if lower.segment_id == self.id { lower.offset } else { 0 };
        let end = if upper.segment_id == self.id {
            upper.offset
        } else {
            u32::MAX
        };

        let mut buffer = self.buffer.lock();
        if let Some(range) = buffer.dirty.get_mut(&table) {
            range.mark_clean(start, end);
            if range.is_covered() {
                buffer.dirty.remove(&table);
            }
        }
    }

    /// Returns true if every table that wrote here has been discarded.
    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.buffer.lock().dirty.is_empty()
    }

    /// Returns the synced logical size, header included.
    #[must_use]
    pub fn content_size(&self) -> u64 {
        self.content_size.load(Ordering::Acquire)
    }

    /// Returns the number of bytes written to the file.
    #[must_use]
    pub fn on_disk_size(&self) -> u64 {
        self.on_disk_size.load(Ordering::Acquire)
    }

    /// Returns `on_disk_size / content_size`.
    #[must_use]
    pub fn compression_ratio(&self) -> f64 {
        let content = self.content_size();
        if content == 0 {
            return 1.0;
        }
        self.on_disk_size() as f64 / content as f64
    }

    /// Swaps the file under a live segment, for fault injection.
    #[cfg(test)]
    pub(crate) fn replace_backend(&self, backend: Box<dyn StorageBackend>) {
        *self.file.lock() = backend;
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("synced", &self.synced_offset())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Compression;
    use crate::segment::record::{encode_frame, frame_size};
    use crate::segment::HEADER_SIZE;
    use tidelog_storage::InMemoryBackend;

    fn segment_with(capacity: u32, compression: Compression) -> (Segment, InMemoryBackend) {
        let backend = InMemoryBackend::new();
        let segment = Segment::create(
            SegmentId::new(1),
            PathBuf::from("CommitLog-1-1.log"),
            Box::new(backend.clone()),
            capacity,
            ChunkCodec::new(compression, None).unwrap(),
        )
        .unwrap();
        (segment, backend)
    }

    fn frame(len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        encode_frame(&vec![0xAB; len], &mut out).unwrap();
        out
    }

    #[test]
    fn create_writes_header() {
        let (segment, backend) = segment_with(4096, Compression::None);
        assert_eq!(backend.data().len(), HEADER_SIZE);
        assert_eq!(segment.on_disk_size(), HEADER_SIZE as u64);
        assert_eq!(segment.synced_offset(), HEADER_SIZE as u32);
        assert_eq!(segment.name(), "CommitLog-1-1.log");
    }

    #[test]
    fn append_returns_end_positions() {
        let (segment, _) = segment_with(4096, Compression::None);
        let f = frame(10);
        let first = segment.try_append(TableId::new(1), &f);
        let second = segment.try_append(TableId::new(1), &f);

        let expected = HEADER_SIZE as u32 + f.len() as u32;
        assert_eq!(
            first,
            AppendResult::Appended(CommitLogPosition::new(SegmentId::new(1), expected))
        );
        assert_eq!(
            second,
            AppendResult::Appended(CommitLogPosition::new(
                SegmentId::new(1),
                expected + f.len() as u32
            ))
        );
    }

    #[test]
    fn exact_fit_appends_one_over_is_full() {
        let capacity = 1024u32;
        let room = capacity as usize - HEADER_SIZE;

        let (segment, _) = segment_with(capacity, Compression::None);
        let exact = frame(room - frame_size(0));
        assert!(matches!(
            segment.try_append(TableId::new(1), &exact),
            AppendResult::Appended(_)
        ));

        let (segment, _) = segment_with(capacity, Compression::None);
        let over = frame(room - frame_size(0) + 1);
        assert_eq!(segment.try_append(TableId::new(1), &over), AppendResult::Full);
    }

    #[test]
    fn sealed_segment_rejects_appends() {
        let (segment, _) = segment_with(4096, Compression::None);
        segment.seal();
        assert_eq!(segment.try_append(TableId::new(1), &frame(1)), AppendResult::Full);
    }

    #[test]
    fn sync_writes_one_chunk_and_tracks_sizes() {
        let (segment, backend) = segment_with(64 * 1024, Compression::Lz4);
        let f = frame(500);
        for _ in 0..8 {
            let _ = segment.try_append(TableId::new(1), &f);
        }
        assert!(!segment.is_fully_synced());

        let synced = segment.sync().unwrap();
        assert_eq!(synced as usize, HEADER_SIZE + 8 * f.len());
        assert!(segment.is_fully_synced());
        assert_eq!(segment.on_disk_size(), backend.data().len() as u64);
        assert_eq!(segment.content_size(), synced as u64);
        assert!(segment.compression_ratio() < 1.0);

        // nothing pending: no new chunk
        let size = backend.data().len();
        segment.sync().unwrap();
        assert_eq!(backend.data().len(), size);
    }

    #[test]
    fn sealed_sync_appends_end_marker() {
        let (segment, backend) = segment_with(4096, Compression::None);
        let _ = segment.try_append(TableId::new(1), &frame(4));
        segment.seal();
        assert!(!segment.is_fully_synced());
        segment.sync().unwrap();
        assert!(segment.is_fully_synced());

        let data = backend.data();
        assert_eq!(&data[data.len() - CHUNK_HEADER_SIZE..], &ChunkHeader::END_MARKER);
        assert_eq!(segment.on_disk_size(), data.len() as u64);
    }

    #[test]
    fn sync_failure_is_a_write_error() {
        let (segment, backend) = segment_with(4096, Compression::None);
        let _ = segment.try_append(TableId::new(1), &frame(4));
        backend.fail_writes(true);
        assert!(matches!(segment.sync(), Err(CoreError::Write { .. })));
    }

    #[test]
    fn discard_tracking() {
        let (segment, _) = segment_with(4096, Compression::None);
        let id = segment.id();
        let f = frame(4);
        let AppendResult::Appended(a) = segment.try_append(TableId::new(1), &f) else {
            panic!("append failed");
        };
        let AppendResult::Appended(b) = segment.try_append(TableId::new(2), &f) else {
            panic!("append failed");
        };
        assert!(!segment.is_unused());

        // an upper bound short of the table's last write keeps it dirty
        segment.mark_clean(
            TableId::new(2),
            CommitLogPosition::NONE,
            CommitLogPosition::new(id, b.offset - 1),
        );
        assert!(!segment.is_unused());

        segment.mark_clean(TableId::new(1), CommitLogPosition::NONE, a);
        segment.mark_clean(
            TableId::new(2),
            CommitLogPosition::NONE,
            CommitLogPosition::new(id.next(), 0),
        );
        assert!(segment.is_unused());
    }

    #[test]
    fn lower_bound_inside_range_keeps_table_dirty() {
        let (segment, _) = segment_with(4096, Compression::None);
        let f = frame(4);
        let _ = segment.try_append(TableId::new(1), &f);
        let AppendResult::Appended(last) = segment.try_append(TableId::new(1), &f) else {
            panic!("append failed");
        };
        segment.mark_clean(
            TableId::new(1),
            CommitLogPosition::new(segment.id(), HEADER_SIZE as u32 + 1),
            last,
        );
        assert!(!segment.is_unused());
    }

    #[test]
    fn successive_discards_accumulate() {
        let (segment, _) = segment_with(4096, Compression::None);
        let f = frame(4);
        let mut positions = Vec::new();
        for _ in 0..4 {
            let AppendResult::Appended(p) = segment.try_append(TableId::new(1), &f) else {
                panic!("append failed");
            };
            positions.push(p);
        }

        // out of order, each alone too short, touching at their bounds
        segment.mark_clean(TableId::new(1), positions[1], positions[3]);
        assert!(!segment.is_unused());
        segment.mark_clean(TableId::new(1), CommitLogPosition::NONE, positions[0]);
        assert!(!segment.is_unused());
        segment.mark_clean(TableId::new(1), positions[0], positions[1]);
        assert!(segment.is_unused());
    }

    #[test]
    fn gap_between_discards_keeps_table_dirty() {
        let mut range = DirtyRange::new(32, 100);
        range.mark_clean(0, 50);
        range.mark_clean(60, 200);
        assert!(!range.is_covered());
        assert_eq!(range.clean, vec![(0, 50), (60, 200)]);
        range.mark_clean(40, 70);
        assert_eq!(range.clean, vec![(0, 200)]);
        assert!(range.is_covered());
    }
}
