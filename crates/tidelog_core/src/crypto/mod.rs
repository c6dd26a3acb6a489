//! Chunk encryption for segment files.
//!
//! Segments can be encrypted at rest with AES-256-GCM. Encryption is
//! optional and must be enabled via the `encryption` feature.
//!
//! ## Security Model
//!
//! - AES-256-GCM authenticated encryption, one random nonce per chunk
//! - Each chunk is bound to its segment id and logical offset through AAD,
//!   so chunks cannot be swapped between segments or positions
//! - Keys are zeroized on drop and never written to disk; segment headers
//!   carry only a truncated SHA-256 fingerprint to detect a wrong key
//!
//! ## Usage
//!
//! ```ignore
//! use tidelog_core::crypto::{EncryptionKey, CryptoManager};
//!
//! let key = EncryptionKey::generate();
//! let manager = CryptoManager::new(key)?;
//!
//! let sealed = manager.encrypt_with_aad(b"frames", b"segment:1")?;
//! let plain = manager.decrypt_with_aad(&sealed, b"segment:1")?;
//! ```

#[cfg(feature = "encryption")]
mod encrypted;

#[cfg(feature = "encryption")]
pub use encrypted::*;

/// Length of the key fingerprint stored in segment headers.
pub const FINGERPRINT_SIZE: usize = 8;

/// Module contents when encryption feature is disabled.
#[cfg(not(feature = "encryption"))]
mod stub {
    use super::FINGERPRINT_SIZE;
    use crate::error::{CoreError, CoreResult};

    /// Encryption key (stub when encryption disabled).
    #[derive(Debug, Clone)]
    pub struct EncryptionKey {
        _private: (),
    }

    impl EncryptionKey {
        /// Always returns an error when encryption is disabled.
        pub fn generate() -> CoreResult<Self> {
            Err(CoreError::encryption_not_enabled())
        }

        /// Always returns an error when encryption is disabled.
        pub fn from_bytes(_bytes: &[u8]) -> CoreResult<Self> {
            Err(CoreError::encryption_not_enabled())
        }

        /// Always returns an error when encryption is disabled.
        pub fn derive_from_password(_password: &[u8], _salt: &[u8]) -> CoreResult<Self> {
            Err(CoreError::encryption_not_enabled())
        }

        /// Unreachable: a stub key cannot be constructed.
        #[must_use]
        pub fn fingerprint(&self) -> [u8; FINGERPRINT_SIZE] {
            [0; FINGERPRINT_SIZE]
        }
    }

    /// Crypto manager (stub when encryption disabled).
    #[derive(Debug)]
    pub struct CryptoManager {
        _private: (),
    }

    impl CryptoManager {
        /// Always returns an error when encryption is disabled.
        pub fn new(_key: EncryptionKey) -> CoreResult<Self> {
            Err(CoreError::encryption_not_enabled())
        }

        /// Always returns an error when encryption is disabled.
        pub fn encrypt_with_aad(&self, _data: &[u8], _aad: &[u8]) -> CoreResult<Vec<u8>> {
            Err(CoreError::encryption_not_enabled())
        }

        /// Always returns an error when encryption is disabled.
        pub fn decrypt_with_aad(&self, _data: &[u8], _aad: &[u8]) -> CoreResult<Vec<u8>> {
            Err(CoreError::encryption_not_enabled())
        }
    }
}

#[cfg(not(feature = "encryption"))]
pub use stub::*;
