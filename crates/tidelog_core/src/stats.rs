//! Commit log statistics.
//!
//! Counters are updated by writers and background workers and can be read
//! at any time.
//!
//! # Usage
//!
//! ```rust,ignore
//! let log = CommitLog::open(config)?;
//! log.add(&mutation)?;
//!
//! let stats = log.stats();
//! println!("added: {}", stats.mutations_added);
//! println!("syncs: {}", stats.syncs);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Commit log counters.
///
/// All counters are atomic and monotonically increasing.
#[derive(Debug, Default)]
pub struct LogStats {
    // Write path
    /// Mutations accepted by `add`.
    mutations_added: AtomicU64,
    /// Framed bytes accepted by `add`.
    bytes_added: AtomicU64,
    /// Writers that had to wait for a sync.
    write_stalls: AtomicU64,
    /// Total time writers spent waiting for syncs.
    write_stall_micros: AtomicU64,

    // Sync service
    /// Completed sync cycles.
    syncs: AtomicU64,

    // Segment lifecycle
    /// Segments activated.
    segments_created: AtomicU64,
    /// Segments activated from a pre-created reserve file.
    segments_from_reserve: AtomicU64,
    /// Segments deleted after every table discarded them.
    segments_reclaimed: AtomicU64,
    /// Failed delete attempts.
    deletion_failures: AtomicU64,
}

impl LogStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_add(&self, bytes: u64) {
        self.mutations_added.fetch_add(1, Ordering::Relaxed);
        self.bytes_added.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_stall(&self, waited: Duration) {
        self.write_stalls.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(waited.as_micros()).unwrap_or(u64::MAX);
        self.write_stall_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub(crate) fn record_sync(&self) {
        self.syncs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_segment_created(&self, from_reserve: bool) {
        self.segments_created.fetch_add(1, Ordering::Relaxed);
        if from_reserve {
            self.segments_from_reserve.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_reclaimed(&self) {
        self.segments_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deletion_failure(&self) {
        self.deletion_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of mutations added.
    pub fn mutations_added(&self) -> u64 {
        self.mutations_added.load(Ordering::Relaxed)
    }

    /// Returns the number of completed sync cycles.
    pub fn syncs(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }

    /// Returns the number of segments reclaimed.
    pub fn segments_reclaimed(&self) -> u64 {
        self.segments_reclaimed.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            mutations_added: self.mutations_added(),
            bytes_added: self.bytes_added.load(Ordering::Relaxed),
            write_stalls: self.write_stalls.load(Ordering::Relaxed),
            write_stall_time: Duration::from_micros(self.write_stall_micros.load(Ordering::Relaxed)),
            syncs: self.syncs(),
            segments_created: self.segments_created.load(Ordering::Relaxed),
            segments_from_reserve: self.segments_from_reserve.load(Ordering::Relaxed),
            segments_reclaimed: self.segments_reclaimed(),
            deletion_failures: self.deletion_failures.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of [`LogStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Mutations accepted by `add`.
    pub mutations_added: u64,
    /// Framed bytes accepted by `add`.
    pub bytes_added: u64,
    /// Writers that waited for a sync.
    pub write_stalls: u64,
    /// Total time spent waiting.
    pub write_stall_time: Duration,
    /// Completed sync cycles.
    pub syncs: u64,
    /// Segments activated.
    pub segments_created: u64,
    /// Segments activated from the reserve pool.
    pub segments_from_reserve: u64,
    /// Segments deleted by reclamation.
    pub segments_reclaimed: u64,
    /// Failed delete attempts.
    pub deletion_failures: u64,
}
