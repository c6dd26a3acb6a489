//! Chunk codecs: compression followed by optional encryption.
//!
//! Each segment picks one codec at creation and records it in its header.
//! A chunk is encoded as `encrypt(compress(frames))` and decoded in the
//! reverse order. Encryption binds every chunk to its segment id and
//! logical offset so chunks cannot be replayed elsewhere.

use crate::crypto::{CryptoManager, EncryptionKey, FINGERPRINT_SIZE};
use crate::error::{CoreError, CoreResult};
use std::fmt;
use std::sync::Arc;

/// Compression algorithm applied to chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Compression {
    /// Chunks are stored as-is.
    #[default]
    None = 0,
    /// LZ4 block format with a prepended size.
    Lz4 = 1,
    /// Snappy raw format.
    Snappy = 2,
    /// Zstandard at level 3.
    Zstd = 3,
}

impl Compression {
    /// All supported compressions, in tag order.
    pub const ALL: [Self; 4] = [Self::None, Self::Lz4, Self::Snappy, Self::Zstd];

    /// Decodes a header tag.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::None),
            1 => Some(Self::Lz4),
            2 => Some(Self::Snappy),
            3 => Some(Self::Zstd),
            _ => None,
        }
    }

    /// Returns the header tag.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns the codec name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Snappy => "snappy",
            Self::Zstd => "zstd",
        }
    }

    /// Looks up a codec by name, case-insensitively.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(name))
    }

    /// Compresses `src`.
    pub fn compress(self, src: &[u8]) -> CoreResult<Vec<u8>> {
        match self {
            Self::None => Ok(src.to_vec()),
            Self::Lz4 => Ok(lz4_flex::compress_prepend_size(src)),
            Self::Snappy => snap::raw::Encoder::new()
                .compress_vec(src)
                .map_err(|e| CoreError::compression(format!("snappy: {e}"))),
            Self::Zstd => {
                zstd::encode_all(src, 3).map_err(|e| CoreError::compression(format!("zstd: {e}")))
            }
        }
    }

    /// Decompresses `src`.
    pub fn decompress(self, src: &[u8]) -> CoreResult<Vec<u8>> {
        match self {
            Self::None => Ok(src.to_vec()),
            Self::Lz4 => lz4_flex::decompress_size_prepended(src)
                .map_err(|e| CoreError::compression(format!("lz4: {e}"))),
            Self::Snappy => snap::raw::Decoder::new()
                .decompress_vec(src)
                .map_err(|e| CoreError::compression(format!("snappy: {e}"))),
            Self::Zstd => {
                zstd::decode_all(src).map_err(|e| CoreError::compression(format!("zstd: {e}")))
            }
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The transform applied to every chunk of one segment.
#[derive(Clone, Default)]
pub struct ChunkCodec {
    compression: Compression,
    cipher: Option<Arc<CryptoManager>>,
    fingerprint: Option<[u8; FINGERPRINT_SIZE]>,
}

impl ChunkCodec {
    /// Creates a codec from the configured compression and key.
    pub fn new(compression: Compression, key: Option<&EncryptionKey>) -> CoreResult<Self> {
        let (cipher, fingerprint) = match key {
            Some(key) => (
                Some(Arc::new(CryptoManager::new(key.clone())?)),
                Some(key.fingerprint()),
            ),
            None => (None, None),
        };
        Ok(Self {
            compression,
            cipher,
            fingerprint,
        })
    }

    /// Returns the compression algorithm.
    #[must_use]
    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Returns true if chunks are encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Returns the fingerprint of the encryption key, if any.
    #[must_use]
    pub fn key_fingerprint(&self) -> Option<[u8; FINGERPRINT_SIZE]> {
        self.fingerprint
    }

    /// Encodes the frames of one chunk for storage.
    pub fn encode(&self, frames: &[u8], segment_id: u64, logical_start: u32) -> CoreResult<Vec<u8>> {
        let compressed = self.compression.compress(frames)?;
        match &self.cipher {
            Some(cipher) => cipher.encrypt_with_aad(&compressed, &chunk_aad(segment_id, logical_start)),
            None => Ok(compressed),
        }
    }

    /// Decodes stored chunk bytes, checking the result has `content_len` bytes.
    pub fn decode(
        &self,
        stored: &[u8],
        segment_id: u64,
        logical_start: u32,
        content_len: u32,
    ) -> CoreResult<Vec<u8>> {
        let compressed = match &self.cipher {
            Some(cipher) => cipher.decrypt_with_aad(stored, &chunk_aad(segment_id, logical_start))?,
            None => stored.to_vec(),
        };
        let frames = self.compression.decompress(&compressed)?;
        if frames.len() != content_len as usize {
            return Err(CoreError::invalid_format(format!(
                "chunk decoded to {} bytes, header says {content_len}",
                frames.len()
            )));
        }
        Ok(frames)
    }
}

impl fmt::Debug for ChunkCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkCodec")
            .field("compression", &self.compression)
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}

fn chunk_aad(segment_id: u64, logical_start: u32) -> [u8; 12] {
    let mut aad = [0u8; 12];
    aad[..8].copy_from_slice(&segment_id.to_le_bytes());
    aad[8..].copy_from_slice(&logical_start.to_le_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> Vec<u8> {
        b"mutation mutation mutation ".repeat(64)
    }

    #[test]
    fn names_roundtrip() {
        for compression in Compression::ALL {
            assert_eq!(Compression::from_name(compression.name()), Some(compression));
            assert_eq!(Compression::from_byte(compression.as_byte()), Some(compression));
        }
        assert_eq!(Compression::from_name("LZ4"), Some(Compression::Lz4));
        assert_eq!(Compression::from_name("deflate"), None);
        assert_eq!(Compression::from_byte(9), None);
    }

    #[test]
    fn compressors_shrink_repetitive_input() {
        let data = sample();
        for compression in [Compression::Lz4, Compression::Snappy, Compression::Zstd] {
            let packed = compression.compress(&data).unwrap();
            assert!(packed.len() < data.len(), "{compression} did not shrink");
            assert_eq!(compression.decompress(&packed).unwrap(), data);
        }
    }

    #[test]
    fn garbage_fails_to_decompress() {
        let garbage = [0xFFu8; 16];
        assert!(Compression::Lz4.decompress(&garbage).is_err());
        assert!(Compression::Zstd.decompress(&garbage).is_err());
    }

    #[test]
    fn plain_codec_is_identity() {
        let codec = ChunkCodec::new(Compression::None, None).unwrap();
        let data = sample();
        let stored = codec.encode(&data, 1, 32).unwrap();
        assert_eq!(stored, data);
        assert!(codec.key_fingerprint().is_none());
    }

    #[test]
    fn decode_checks_content_length() {
        let codec = ChunkCodec::new(Compression::Snappy, None).unwrap();
        let data = sample();
        let stored = codec.encode(&data, 1, 32).unwrap();
        assert!(codec.decode(&stored, 1, 32, data.len() as u32 + 1).is_err());
        assert_eq!(codec.decode(&stored, 1, 32, data.len() as u32).unwrap(), data);
    }

    #[cfg(feature = "encryption")]
    #[test]
    fn encrypted_chunk_is_bound_to_position() {
        let key = EncryptionKey::generate();
        let codec = ChunkCodec::new(Compression::Lz4, Some(&key)).unwrap();
        assert!(codec.is_encrypted());
        assert_eq!(codec.key_fingerprint(), Some(key.fingerprint()));

        let data = sample();
        let stored = codec.encode(&data, 7, 32).unwrap();
        assert_eq!(codec.decode(&stored, 7, 32, data.len() as u32).unwrap(), data);
        assert!(codec.decode(&stored, 8, 32, data.len() as u32).is_err());
        assert!(codec.decode(&stored, 7, 64, data.len() as u32).is_err());
    }

    proptest! {
        #[test]
        fn every_compression_roundtrips(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
            for compression in Compression::ALL {
                let packed = compression.compress(&data).unwrap();
                prop_assert_eq!(compression.decompress(&packed).unwrap(), data.clone());
            }
        }
    }
}
