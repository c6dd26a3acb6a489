//! # tidelog storage
//!
//! Byte-store backends used by the tidelog commit log.
//!
//! A backend is an **opaque, append-only byte store**: it appends, reads back
//! and syncs. It knows nothing about segment headers, chunks or
//! frames; `tidelog_core` owns every byte of the on-disk format.
//!
//! ## Available Backends
//!
//! - [`FileBackend`] - one segment file on the local file system
//! - [`InMemoryBackend`] - shared in-memory buffer with fault injection, for tests
//!
//! ## Example
//!
//! ```rust
//! use tidelog_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"chunk bytes").unwrap();
//! backend.sync().unwrap();
//! assert_eq!(backend.read_at(offset, 5).unwrap(), b"chunk");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
