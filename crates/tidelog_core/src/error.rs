//! Error types for the tidelog core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in commit log operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] tidelog_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A new segment could not be created. The log can no longer accept writes.
    #[error("segment allocation failed: {message}")]
    Allocation {
        /// Description of the failure.
        message: String,
    },

    /// A write or the flush backing it failed.
    #[error("write failed: {message}")]
    Write {
        /// Description of the failure.
        message: String,
    },

    /// A record does not fit into an empty segment.
    #[error("record of {size} bytes exceeds segment capacity of {max} bytes")]
    RecordTooLarge {
        /// Framed size of the record.
        size: usize,
        /// Largest framed record an empty segment can hold.
        max: usize,
    },

    /// A frame failed its length or checksum check during replay.
    #[error("corrupt frame in segment {segment_id} at offset {offset}: {message}")]
    CorruptFrame {
        /// Segment containing the frame.
        segment_id: u64,
        /// Logical offset of the frame.
        offset: u32,
        /// Description of the corruption.
        message: String,
    },

    /// A segment could not be interpreted at all.
    #[error("unrecoverable segment {path}: {message}")]
    UnrecoverableSegment {
        /// Path of the segment file.
        path: String,
        /// Description of the failure.
        message: String,
    },

    /// A reclaimed segment file could not be deleted.
    #[error("failed to delete segment {path}: {source}")]
    Deletion {
        /// Path of the segment file.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Replay was aborted by the read handler.
    #[error("replay aborted: {message}")]
    Replay {
        /// Description of the failure.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Invalid on-disk format.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Configuration rejected by validation.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// The log has been shut down or has failed.
    #[error("commit log is closed")]
    LogClosed,

    /// Another process holds the log directory.
    #[error("commit log directory locked: another process has exclusive access")]
    LogLocked,

    /// Compression or decompression failed.
    #[error("compression error: {message}")]
    Compression {
        /// Description of the failure.
        message: String,
    },

    /// Encryption is not enabled.
    #[error("encryption feature not enabled")]
    EncryptionNotEnabled,

    /// Encryption failed.
    #[error("encryption failed: {message}")]
    EncryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// Decryption failed.
    #[error("decryption failed: {message}")]
    DecryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// Invalid key size.
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize {
        /// Expected size in bytes.
        expected: usize,
        /// Actual size in bytes.
        actual: usize,
    },

    /// Key derivation failed.
    #[error("key derivation failed: {message}")]
    KeyDerivationFailed {
        /// Description of the failure.
        message: String,
    },
}

impl CoreError {
    /// Creates an allocation error.
    pub fn allocation(message: impl Into<String>) -> Self {
        Self::Allocation {
            message: message.into(),
        }
    }

    /// Creates a write error.
    pub fn write(message: impl Into<String>) -> Self {
        Self::Write {
            message: message.into(),
        }
    }

    /// Creates a corrupt frame error.
    pub fn corrupt_frame(segment_id: u64, offset: u32, message: impl Into<String>) -> Self {
        Self::CorruptFrame {
            segment_id,
            offset,
            message: message.into(),
        }
    }

    /// Creates an unrecoverable segment error.
    pub fn unrecoverable_segment(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UnrecoverableSegment {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a replay aborted error.
    pub fn replay(message: impl Into<String>) -> Self {
        Self::Replay {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates a compression error.
    pub fn compression(message: impl Into<String>) -> Self {
        Self::Compression {
            message: message.into(),
        }
    }

    /// Creates an encryption not enabled error.
    pub fn encryption_not_enabled() -> Self {
        Self::EncryptionNotEnabled
    }

    /// Creates an encryption failed error.
    pub fn encryption_failed(message: impl Into<String>) -> Self {
        Self::EncryptionFailed {
            message: message.into(),
        }
    }

    /// Creates a decryption failed error.
    pub fn decryption_failed(message: impl Into<String>) -> Self {
        Self::DecryptionFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid key size error.
    pub fn invalid_key_size(actual: usize, expected: usize) -> Self {
        Self::InvalidKeySize { expected, actual }
    }

    /// Creates a key derivation failed error.
    pub fn key_derivation_failed(message: impl Into<String>) -> Self {
        Self::KeyDerivationFailed {
            message: message.into(),
        }
    }

    /// Returns true if the error leaves the log unable to accept writes.
    ///
    /// Replay-time errors and failed deletions are contained and never fatal.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Allocation { .. } | Self::Write { .. } | Self::LogClosed | Self::Storage(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_too_large_display() {
        let error = CoreError::RecordTooLarge {
            size: 70_000,
            max: 65_504,
        };
        let message = error.to_string();
        assert!(message.contains("70000"));
        assert!(message.contains("65504"));
    }

    #[test]
    fn corrupt_frame_display() {
        let error = CoreError::corrupt_frame(42, 128, "bad crc");
        let message = format!("{error}");
        assert!(message.contains("segment 42"));
        assert!(message.contains("offset 128"));
    }

    #[test]
    fn fatal_classification() {
        assert!(CoreError::allocation("disk full").is_fatal());
        assert!(CoreError::write("fsync failed").is_fatal());
        assert!(CoreError::LogClosed.is_fatal());
        assert!(!CoreError::corrupt_frame(1, 0, "x").is_fatal());
        assert!(!CoreError::unrecoverable_segment("a.log", "x").is_fatal());
        assert!(!CoreError::Deletion {
            path: "a.log".into(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        }
        .is_fatal());
    }
}
