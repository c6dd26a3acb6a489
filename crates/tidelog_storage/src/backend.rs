//! Storage backend trait definition.

use crate::error::StorageResult;

/// An append-only byte store holding the bytes of one segment.
///
/// The commit log writes a segment header once, then appends one chunk per
/// sync. Backends never interpret those bytes.
///
/// # Invariants
///
/// - `append` returns the offset at which the data starts
/// - `read_at` returns exactly the bytes previously appended at that offset
/// - after `sync` returns, every appended byte survives process termination
/// - `size` never exceeds the number of bytes appended
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ReadPastEnd`](crate::StorageError::ReadPastEnd)
    /// if the range extends past the current size, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data at the end of the store and returns its starting offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Returns the current size in bytes (the offset of the next append).
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Forces all appended data and file metadata to stable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails. A failed sync leaves the
    /// durability of the unsynced tail unknown.
    fn sync(&mut self) -> StorageResult<()>;

    /// Reads the whole store into memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined or the read fails.
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        let len = usize::try_from(size).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "store too large to read")
        })?;
        self.read_at(0, len)
    }
}
