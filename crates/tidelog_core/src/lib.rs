//! # tidelog core
//!
//! Segmented commit log engine.
//!
//! This crate provides:
//! - Segments: append buffers backed by one file each, written as
//!   checksummed, optionally compressed and encrypted chunks
//! - Segment management with a reserve pool, rollover and reclamation
//! - Periodic, batch and group sync policies
//! - The [`CommitLog`] facade for writers
//! - Replay of segment files with per-table discard watermarks
//!
//! ## Example
//!
//! ```rust,ignore
//! use tidelog_core::{CommitLog, Config, Mutation, SyncMode, TableId};
//!
//! let log = CommitLog::open(Config::new().directory("commitlog").sync_mode(SyncMode::batch()))?;
//! let position = log.add(&Mutation::new(TableId::new(7), "user:1", "alice"))?;
//! println!("durable at {position}");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
mod config;
pub mod crypto;
pub mod dir;
mod error;
mod log;
pub mod manager;
pub mod manifest;
mod mutation;
pub mod replay;
pub mod segment;
mod stats;
pub mod sync;
mod types;

pub use codec::{ChunkCodec, Compression};
pub use config::{Config, SyncMode, DEFAULT_SEGMENT_SIZE, MIN_SEGMENT_SIZE};
pub use crypto::EncryptionKey;
pub use error::{CoreError, CoreResult};
pub use log::CommitLog;
pub use manifest::{DiscardManifest, DiscardWatermark};
pub use mutation::Mutation;
pub use replay::{
    CommitLogReadHandler, CommitLogReader, ReadError, ReadErrorKind, ReplayDecision,
    ReplayFilter, ReplayStats,
};
pub use segment::{SegmentDescriptor, SegmentHeader};
pub use stats::{LogStats, StatsSnapshot};
pub use sync::SyncTicket;
pub use types::{CommitLogPosition, SegmentId, TableId};
