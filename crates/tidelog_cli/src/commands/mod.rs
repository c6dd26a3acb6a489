//! CLI command implementations.

pub mod dump;
pub mod inspect;
pub mod stress;
pub mod verify;

use crate::error::CliResult;
use std::fs;
use std::path::Path;
use tidelog_core::EncryptionKey;

/// Reads a raw 32-byte key from `path`, if one was given.
pub fn load_key(path: Option<&Path>) -> CliResult<Option<EncryptionKey>> {
    match path {
        Some(path) => {
            let bytes = fs::read(path)?;
            Ok(Some(EncryptionKey::from_bytes(&bytes)?))
        }
        None => Ok(None),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
