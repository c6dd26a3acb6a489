//! Commit log facade.

use crate::codec::ChunkCodec;
use crate::config::Config;
use crate::dir::{LogDir, SegmentFile};
use crate::error::{CoreError, CoreResult};
use crate::manager::{ManagerOptions, SegmentManager};
use crate::manifest::DiscardManifest;
use crate::mutation::Mutation;
use crate::replay::{CommitLogReadHandler, CommitLogReader, ReplayFilter, ReplayStats};
use crate::segment::{encode_frame, frame_size};
use crate::stats::{LogStats, StatsSnapshot};
use crate::sync::{SyncService, SyncTicket};
use crate::types::{CommitLogPosition, SegmentId, TableId};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// A segmented, append-only commit log.
///
/// `CommitLog` is the entry point for writers. It hands each mutation to the
/// segment manager, lets the sync service make it durable according to the
/// configured [`SyncMode`](crate::SyncMode), and records discard watermarks
/// so obsolete segments can be reclaimed.
///
/// # Opening a Log
///
/// ```rust,ignore
/// use tidelog_core::{CommitLog, Config, Mutation, SyncMode, TableId};
///
/// let log = CommitLog::open(
///     Config::new()
///         .directory("commitlog")
///         .sync_mode(SyncMode::batch()),
/// )?;
///
/// let position = log.add(&Mutation::new(TableId::new(1), "key", "value"))?;
///
/// // once the storage engine has flushed table 1 up to `position`
/// log.discard_completed_segments(TableId::new(1), CommitLogPosition::NONE, position)?;
///
/// log.shutdown(true);
/// ```
///
/// # Recovery
///
/// Segment files found on open are not reused. Replay them with
/// [`recover`](Self::recover) and remove them with
/// [`delete_recovered_segments`](Self::delete_recovered_segments) once the
/// replayed mutations are durable elsewhere.
pub struct CommitLog {
    /// Configuration.
    config: Config,
    /// Log directory (holds the lock).
    dir: Arc<LogDir>,
    /// Persisted discard watermarks.
    manifest: Mutex<DiscardManifest>,
    /// Segment files left by a previous run.
    recovered: Mutex<Vec<SegmentFile>>,
    /// Segment manager.
    manager: Arc<SegmentManager>,
    /// Sync service.
    sync: SyncService,
    /// Counters.
    stats: Arc<LogStats>,
    /// Whether the log accepts writes.
    is_open: RwLock<bool>,
}

impl CommitLog {
    /// Opens a commit log in `config.directory`.
    ///
    /// The method:
    /// - Validates the configuration
    /// - Creates and locks the directory
    /// - Removes reserve files left by a crash
    /// - Loads the discard manifest
    /// - Records existing segment files for [`recover`](Self::recover)
    /// - Activates a fresh segment and starts the background threads
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid (`InvalidConfig`)
    /// - Another process has the directory locked (`LogLocked`)
    /// - The manifest is corrupt (`InvalidFormat`, `ChecksumMismatch`)
    /// - The first segment cannot be created (`Allocation`)
    pub fn open(config: Config) -> CoreResult<Self> {
        config.validate()?;

        let dir = Arc::new(LogDir::open(&config.directory, config.create_if_missing)?);
        let stale = dir.remove_stale_reserve_files()?;
        if stale > 0 {
            debug!(count = stale, "removed stale reserve files");
        }

        let manifest = dir.load_manifest()?.unwrap_or_default();
        let recovered = dir.list_segments()?;
        let first_segment_id = first_segment_id(&recovered, &manifest);

        let codec = ChunkCodec::new(config.compression, config.encryption.as_ref())?;
        let stats = Arc::new(LogStats::new());
        let options = ManagerOptions {
            segment_size: config.segment_size,
            reserve_segments: config.reserve_segments,
            deletion_retries: config.deletion_retries,
            first_segment_id,
        };
        let manager = Arc::new(SegmentManager::start(
            Arc::clone(&dir),
            codec,
            options,
            Arc::clone(&stats),
        )?);

        let sync = match SyncService::start(config.sync_mode, Arc::clone(&manager), Arc::clone(&stats)) {
            Ok(sync) => sync,
            Err(e) => {
                manager.shutdown(true);
                return Err(e);
            }
        };
        manager.enable_reserve_segment_creation();

        info!(
            path = %dir.path().display(),
            segment_id = %first_segment_id,
            recovered = recovered.len(),
            sync_mode = config.sync_mode.name(),
            compression = config.compression.name(),
            encrypted = config.encryption.is_some(),
            "opened commit log"
        );

        Ok(Self {
            config,
            dir,
            manifest: Mutex::new(manifest),
            recovered: Mutex::new(recovered),
            manager,
            sync,
            stats,
            is_open: RwLock::new(true),
        })
    }

    /// Appends a mutation and returns the position just past it.
    ///
    /// Under batch and group sync the call returns once that position is
    /// durable. Under periodic sync it returns immediately.
    ///
    /// # Errors
    ///
    /// - [`CoreError::RecordTooLarge`] if the framed mutation cannot fit in
    ///   an empty segment
    /// - [`CoreError::Write`] if a sync failed
    /// - [`CoreError::Allocation`] if no segment could be created
    /// - [`CoreError::LogClosed`] after shutdown
    pub fn add(&self, mutation: &Mutation) -> CoreResult<CommitLogPosition> {
        if !*self.is_open.read() {
            return Err(CoreError::LogClosed);
        }

        let mut payload = Vec::with_capacity(mutation.serialized_size());
        mutation.encode_into(&mut payload)?;
        let mut frame = Vec::with_capacity(frame_size(payload.len()));
        encode_frame(&payload, &mut frame)?;

        let allocation = self.manager.allocate(mutation.table_id(), &frame)?;
        self.stats.record_add(frame.len() as u64);

        if self.sync.mode().waits_for_sync() {
            let started = Instant::now();
            let _ticket = self.sync.request_sync();
            self.sync.wait_for_position(allocation.position)?;
            self.stats.record_stall(started.elapsed());
        } else {
            if allocation.rolled_over {
                let _ticket = self.sync.request_sync();
            }
            self.sync.check_healthy()?;
        }

        Ok(allocation.position)
    }

    /// Records that `table`'s mutations between `lower` and `upper` are
    /// durable in the storage engine, and reclaims segments nobody needs.
    ///
    /// The watermark is persisted before any segment is touched. Blocks until
    /// the resulting reclamation pass has run.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be saved, or
    /// [`CoreError::LogClosed`] after shutdown.
    pub fn discard_completed_segments(
        &self,
        table: TableId,
        lower: CommitLogPosition,
        upper: CommitLogPosition,
    ) -> CoreResult<()> {
        if !*self.is_open.read() {
            return Err(CoreError::LogClosed);
        }

        {
            let mut manifest = self.manifest.lock();
            if manifest.record_discard(table, lower, upper) {
                manifest.note_segment(self.manager.highest_segment_id());
                self.dir.save_manifest(&manifest)?;
            }
        }

        self.manager.discard_completed(table, lower, upper);
        self.manager.await_management_tasks_completion();
        Ok(())
    }

    /// Requests a sync outside the configured schedule.
    ///
    /// Waiting on the ticket returns once everything written before this
    /// call is durable.
    pub fn request_extra_sync(&self) -> SyncTicket {
        self.sync.request_sync()
    }

    /// Blocks until queued segment creation and reclamation have finished.
    pub fn await_management_tasks_completion(&self) {
        self.manager.await_management_tasks_completion();
    }

    /// Stops accepting writes, syncs everything written and stops the
    /// background threads.
    ///
    /// With `blocking` the call returns once the final sync and reclamation
    /// have finished. Calling it again does nothing.
    pub fn shutdown(&self, blocking: bool) {
        {
            let mut is_open = self.is_open.write();
            if !*is_open {
                return;
            }
            *is_open = false;
        }

        self.manager.close();
        self.sync.shutdown(blocking);
        self.manager.shutdown(blocking);

        if let Some(failure) = self.manager.failure() {
            warn!(error = %failure, "commit log shut down after failure");
        }
        info!(
            path = %self.dir.path().display(),
            durable = %self.sync.durable_position(),
            "commit log shut down"
        );
    }

    /// Returns true until [`shutdown`](Self::shutdown) is called.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    /// Replays the segment files found on open.
    ///
    /// Mutations covered by a persisted discard watermark are not handed to
    /// `handler`.
    ///
    /// # Errors
    ///
    /// Returns whatever the handler returns to abort the replay.
    pub fn recover<H>(&self, handler: &mut H) -> CoreResult<ReplayStats>
    where
        H: CommitLogReadHandler + ?Sized,
    {
        let filter = ReplayFilter::from_manifest(&self.manifest.lock());
        let mut reader = CommitLogReader::new().with_filter(filter);
        if let Some(key) = &self.config.encryption {
            reader = reader.with_key(key.clone());
        }

        let files = self.recovered.lock().clone();
        reader.read_files(&files, handler)?;

        let stats = *reader.stats();
        info!(
            segments = stats.segments_read,
            replayed = stats.replayed,
            discarded = stats.discarded,
            skipped = stats.skipped,
            corrupt_tails = stats.corrupt_tails,
            "replayed recovered segments"
        );
        Ok(stats)
    }

    /// Returns the segment files found on open that are still on disk.
    #[must_use]
    pub fn recovered_segments(&self) -> Vec<SegmentFile> {
        self.recovered.lock().clone()
    }

    /// Deletes the segment files found on open.
    ///
    /// Returns the number of files removed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Deletion`] if a file cannot be removed. Files not
    /// yet removed stay recorded.
    pub fn delete_recovered_segments(&self) -> CoreResult<usize> {
        let mut recovered = self.recovered.lock();
        if recovered.is_empty() {
            return Ok(0);
        }

        {
            let mut manifest = self.manifest.lock();
            manifest.note_segment(self.manager.highest_segment_id());
            self.dir.save_manifest(&manifest)?;
        }

        let mut removed = 0;
        while let Some(file) = recovered.first() {
            match fs::remove_file(&file.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(CoreError::Deletion {
                        path: file.path.display().to_string(),
                        source,
                    });
                }
            }
            debug!(segment_id = %file.id, "deleted recovered segment");
            recovered.remove(0);
            removed += 1;
        }

        self.dir.sync_directory()?;
        Ok(removed)
    }

    /// Returns the bytes written to live segment files.
    #[must_use]
    pub fn active_on_disk_size(&self) -> u64 {
        self.manager.active_on_disk_size()
    }

    /// Returns the synced logical size of live segments.
    #[must_use]
    pub fn active_content_size(&self) -> u64 {
        self.manager.active_content_size()
    }

    /// Returns each live segment's `on_disk / content` ratio by file name.
    #[must_use]
    pub fn active_segment_compression_ratios(&self) -> BTreeMap<String, f64> {
        self.manager.segment_compression_ratios()
    }

    /// Returns the file names of live segments, oldest first.
    #[must_use]
    pub fn active_segment_names(&self) -> Vec<String> {
        self.manager.active_segment_names()
    }

    /// Returns the position up to which the log is durable.
    #[must_use]
    pub fn durable_position(&self) -> CommitLogPosition {
        self.sync.durable_position()
    }

    /// Returns the id of the segment accepting writes.
    #[must_use]
    pub fn current_segment_id(&self) -> Option<SegmentId> {
        self.manager.current_segment().map(|s| s.id())
    }

    /// Returns the largest mutation payload `add` accepts.
    #[must_use]
    pub fn max_mutation_size(&self) -> usize {
        self.manager.max_frame_size() - frame_size(0)
    }

    /// Returns a snapshot of the log's counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the log directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl std::fmt::Debug for CommitLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitLog")
            .field("path", &self.dir.path())
            .field("sync_mode", &self.config.sync_mode)
            .field("is_open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Drop for CommitLog {
    fn drop(&mut self) {
        self.shutdown(true);
        // a non-blocking shutdown left both threads running
        self.sync.await_termination();
        self.manager.await_termination();
    }
}

/// Picks an id above every id this directory has ever used.
fn first_segment_id(recovered: &[SegmentFile], manifest: &DiscardManifest) -> SegmentId {
    let now_millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let on_disk = recovered.iter().map(|f| f.id.as_u64() + 1).max().unwrap_or(0);
    let manifest = manifest.last_segment_id().as_u64() + 1;
    SegmentId::new(now_millis.max(on_disk).max(manifest))
}
