//! Segment header.

use crate::codec::Compression;
use crate::crypto::FINGERPRINT_SIZE;
use crate::types::SegmentId;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Magic bytes at the start of every segment file.
pub const SEGMENT_MAGIC: [u8; 4] = *b"TLOG";

/// Current segment format version.
pub const FORMAT_VERSION: u16 = 1;

/// Size of the encoded header in bytes.
pub const HEADER_SIZE: usize = 32;

/// Offset of the header checksum.
const CRC_OFFSET: usize = HEADER_SIZE - 4;

/// Reasons a segment header cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    /// Fewer than [`HEADER_SIZE`] bytes.
    #[error("truncated header: {0} bytes")]
    Truncated(usize),
    /// Magic bytes don't match.
    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 4]),
    /// Header checksum mismatch.
    #[error("header checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    BadChecksum {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },
    /// Written by a newer format.
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),
    /// Compression tag not known to this build.
    #[error("unknown compression tag {0}")]
    UnknownCompression(u8),
}

/// Header persisted at the start of each segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Format version.
    pub version: u16,
    /// Segment id.
    pub segment_id: SegmentId,
    /// Chunk compression.
    pub compression: Compression,
    /// Fingerprint of the encryption key, if chunks are encrypted.
    pub key_fingerprint: Option<[u8; FINGERPRINT_SIZE]>,
}

impl SegmentHeader {
    /// Creates a header for a new segment.
    #[must_use]
    pub fn new(
        segment_id: SegmentId,
        compression: Compression,
        key_fingerprint: Option<[u8; FINGERPRINT_SIZE]>,
    ) -> Self {
        Self {
            version: FORMAT_VERSION,
            segment_id,
            compression,
            key_fingerprint,
        }
    }

    /// Returns true if chunks are encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.key_fingerprint.is_some()
    }

    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        // 6..8: flags, reserved
        buf[8..16].copy_from_slice(&self.segment_id.as_u64().to_le_bytes());
        buf[16] = self.compression.as_byte();
        buf[17] = u8::from(self.key_fingerprint.is_some());
        // 18..20: reserved
        if let Some(fingerprint) = self.key_fingerprint {
            buf[20..28].copy_from_slice(&fingerprint);
        }
        let crc = crc32fast::hash(&buf[..CRC_OFFSET]);
        buf[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a header from the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() < HEADER_SIZE {
            return Err(HeaderError::Truncated(bytes.len()));
        }
        let buf = &bytes[..HEADER_SIZE];

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != SEGMENT_MAGIC {
            return Err(HeaderError::BadMagic(magic));
        }

        let expected = u32::from_le_bytes([buf[28], buf[29], buf[30], buf[31]]);
        let actual = crc32fast::hash(&buf[..CRC_OFFSET]);
        if expected != actual {
            return Err(HeaderError::BadChecksum { expected, actual });
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version == 0 || version > FORMAT_VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }

        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[8..16]);
        let compression =
            Compression::from_byte(buf[16]).ok_or(HeaderError::UnknownCompression(buf[16]))?;

        let key_fingerprint = (buf[17] != 0).then(|| {
            let mut fingerprint = [0u8; FINGERPRINT_SIZE];
            fingerprint.copy_from_slice(&buf[20..28]);
            fingerprint
        });

        Ok(Self {
            version,
            segment_id: SegmentId::new(u64::from_le_bytes(id)),
            compression,
            key_fingerprint,
        })
    }
}

/// Description of a segment file, handed to replay handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Segment id.
    pub id: SegmentId,
    /// Format version.
    pub version: u16,
    /// Chunk compression.
    pub compression: Compression,
    /// Whether chunks are encrypted.
    pub encrypted: bool,
    /// Path of the segment file.
    pub path: PathBuf,
}

impl SegmentDescriptor {
    /// Builds a descriptor from a decoded header.
    #[must_use]
    pub fn from_header(header: &SegmentHeader, path: &Path) -> Self {
        Self {
            id: header.segment_id,
            version: header.version,
            compression: header.compression,
            encrypted: header.is_encrypted(),
            path: path.to_path_buf(),
        }
    }
}

impl fmt::Display for SegmentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} v{} compression={} encrypted={}",
            self.id, self.version, self.compression, self.encrypted
        )
    }
}
