//! Frame and chunk encoding.

use crate::error::{CoreError, CoreResult};
use std::fmt;

/// Bytes before a frame's payload: length and checksum.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Bytes before a chunk's stored data.
pub const CHUNK_HEADER_SIZE: usize = 16;

/// Returns the framed size of a payload.
#[must_use]
pub const fn frame_size(payload_len: usize) -> usize {
    FRAME_HEADER_SIZE + payload_len
}

fn frame_checksum(len_bytes: [u8; 4], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&len_bytes);
    hasher.update(payload);
    hasher.finalize()
}

/// Appends a frame holding `payload` to `out`.
///
/// # Errors
///
/// Returns an error if the payload is longer than `u32::MAX` bytes.
pub fn encode_frame(payload: &[u8], out: &mut Vec<u8>) -> CoreResult<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| CoreError::write("payload longer than u32::MAX bytes"))?;
    let len_bytes = len.to_le_bytes();
    out.reserve(frame_size(payload.len()));
    out.extend_from_slice(&len_bytes);
    out.extend_from_slice(&frame_checksum(len_bytes, payload).to_le_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// A frame read back from a decoded chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Logical offset of the frame's first byte.
    pub start: u32,
    /// Logical offset just past the frame. This is the position the writer
    /// was given.
    pub end: u32,
    /// Frame payload.
    pub payload: &'a [u8],
}

/// A frame that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameError {
    /// Logical offset of the bad frame.
    pub offset: u32,
    /// What was wrong with it.
    pub message: String,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bad frame at offset {}: {}", self.offset, self.message)
    }
}

/// Iterates the frames of one decoded chunk.
///
/// Stops after the first error.
#[derive(Debug)]
pub struct FrameIter<'a> {
    data: &'a [u8],
    cursor: usize,
    logical_start: u32,
    failed: bool,
}

impl<'a> FrameIter<'a> {
    /// Creates an iterator over `data`, whose first byte sits at
    /// `logical_start` in the segment.
    #[must_use]
    pub fn new(data: &'a [u8], logical_start: u32) -> Self {
        Self {
            data,
            cursor: 0,
            logical_start,
            failed: false,
        }
    }

    fn fail(&mut self, offset: u32, message: impl Into<String>) -> Option<Result<Frame<'a>, FrameError>> {
        self.failed = true;
        Some(Err(FrameError {
            offset,
            message: message.into(),
        }))
    }
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = Result<Frame<'a>, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor >= self.data.len() {
            return None;
        }

        let start = self.logical_start.saturating_add(self.cursor as u32);
        let remaining = &self.data[self.cursor..];
        if remaining.len() < FRAME_HEADER_SIZE {
            return self.fail(start, format!("{} trailing bytes", remaining.len()));
        }

        let len_bytes = [remaining[0], remaining[1], remaining[2], remaining[3]];
        let len = u32::from_le_bytes(len_bytes) as usize;
        let expected = u32::from_le_bytes([remaining[4], remaining[5], remaining[6], remaining[7]]);

        let Some(payload) = remaining.get(FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len) else {
            return self.fail(
                start,
                format!("length {len} overruns chunk ({} bytes left)", remaining.len()),
            );
        };

        let actual = frame_checksum(len_bytes, payload);
        if expected != actual {
            return self.fail(
                start,
                format!("checksum mismatch: expected {expected:08x}, got {actual:08x}"),
            );
        }

        self.cursor += frame_size(len);
        Some(Ok(Frame {
            start,
            end: self.logical_start.saturating_add(self.cursor as u32),
            payload,
        }))
    }
}

/// Header preceding each chunk's stored bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Length of the stored (compressed, encrypted) bytes.
    pub stored_len: u32,
    /// Logical offset of the chunk's first frame.
    pub logical_start: u32,
    /// Length of the frames before compression.
    pub content_len: u32,
    /// CRC32 over the first 12 header bytes and the stored bytes.
    pub crc: u32,
}

impl ChunkHeader {
    /// The marker written after the last chunk of a cleanly sealed segment.
    pub const END_MARKER: [u8; CHUNK_HEADER_SIZE] = [0; CHUNK_HEADER_SIZE];

    /// Creates a header for `stored`.
    #[must_use]
    pub fn new(stored: &[u8], logical_start: u32, content_len: u32) -> Self {
        let mut header = Self {
            stored_len: stored.len() as u32,
            logical_start,
            content_len,
            crc: 0,
        };
        header.crc = header.checksum(stored);
        header
    }

    fn checksum(&self, stored: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.stored_len.to_le_bytes());
        hasher.update(&self.logical_start.to_le_bytes());
        hasher.update(&self.content_len.to_le_bytes());
        hasher.update(stored);
        hasher.finalize()
    }

    /// Returns true if this is the end marker.
    #[must_use]
    pub fn is_end_marker(&self) -> bool {
        self.stored_len == 0
    }

    /// Checks the stored bytes against the header checksum.
    #[must_use]
    pub fn verify(&self, stored: &[u8]) -> bool {
        stored.len() == self.stored_len as usize && self.checksum(stored) == self.crc
    }

    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.stored_len.to_le_bytes());
        buf[4..8].copy_from_slice(&self.logical_start.to_le_bytes());
        buf[8..12].copy_from_slice(&self.content_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    /// Decodes a header, returning `None` if `bytes` is too short.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let buf = bytes.get(..CHUNK_HEADER_SIZE)?;
        let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Some(Self {
            stored_len: word(0),
            logical_start: word(4),
            content_len: word(8),
            crc: word(12),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frames(payloads: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for payload in payloads {
            encode_frame(payload, &mut out).unwrap();
        }
        out
    }

    #[test]
    fn frames_report_logical_positions() {
        let data = frames(&[b"one", b"three", b""]);
        let read: Vec<_> = FrameIter::new(&data, 32).collect::<Result<_, _>>().unwrap();

        assert_eq!(read.len(), 3);
        assert_eq!((read[0].start, read[0].end), (32, 32 + 11));
        assert_eq!(read[1].payload, b"three");
        assert_eq!(read[1].end, 32 + 11 + 13);
        assert_eq!(read[2].payload, b"");
        assert_eq!(read[2].end as usize, 32 + data.len());
    }

    #[test]
    fn checksum_mismatch_stops_iteration() {
        let mut data = frames(&[b"good", b"evil", b"after"]);
        data[frame_size(4) + FRAME_HEADER_SIZE] ^= 0xFF;

        let mut iter = FrameIter::new(&data, 0);
        assert_eq!(iter.next().unwrap().unwrap().payload, b"good");
        let err = iter.next().unwrap().unwrap_err();
        assert_eq!(err.offset, frame_size(4) as u32);
        assert!(err.message.contains("checksum"));
        assert!(iter.next().is_none());
    }

    #[test]
    fn overrunning_length_is_an_error() {
        let mut data = frames(&[b"abc"]);
        data[0..4].copy_from_slice(&100u32.to_le_bytes());
        let err = FrameIter::new(&data, 0).next().unwrap().unwrap_err();
        assert!(err.message.contains("overruns"));
    }

    #[test]
    fn short_tail_is_an_error() {
        let mut data = frames(&[b"abc"]);
        data.extend_from_slice(&[1, 2, 3]);
        let results: Vec<_> = FrameIter::new(&data, 0).collect();
        assert_eq!(results.len(), 2);
        assert!(results[1].is_err());
    }

    #[test]
    fn chunk_header_roundtrip_and_verify() {
        let stored = b"compressed bytes";
        let header = ChunkHeader::new(stored, 32, 100);
        let decoded = ChunkHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.verify(stored));
        assert!(!decoded.verify(b"compressed bytez"));
        assert!(!decoded.is_end_marker());
    }

    #[test]
    fn end_marker_decodes() {
        let header = ChunkHeader::decode(&ChunkHeader::END_MARKER).unwrap();
        assert!(header.is_end_marker());
        assert!(ChunkHeader::decode(&[0u8; 15]).is_none());
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            for frame in FrameIter::new(&data, 32).flatten() {
                prop_assert!(frame.end > frame.start);
            }
        }

        #[test]
        fn encoded_payloads_read_back(payloads in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..64), 0..16)
        ) {
            let mut data = Vec::new();
            for payload in &payloads {
                encode_frame(payload, &mut data).unwrap();
            }
            let read: Vec<Vec<u8>> = FrameIter::new(&data, 0)
                .map(|f| f.map(|f| f.payload.to_vec()))
                .collect::<Result<_, _>>()
                .unwrap();
            prop_assert_eq!(read, payloads);
        }
    }
}
