//! Segment manager: allocation, rollover and reclamation.
//!
//! The manager owns every live segment. Writers ask it for room with
//! [`SegmentManager::allocate`]; when the active segment is full it seals
//! that segment and activates a new one, taken from the reserve pool when
//! one is ready.
//!
//! Writers only take a read lock on the active slot. Rollover is
//! serialized under its own lock, so creating and syncing a new file never
//! blocks writers that still fit into the current segment.
//!
//! Reserve creation and reclamation run on a single background worker fed
//! by a bounded queue. [`SegmentManager::await_management_tasks_completion`]
//! drains that queue, which is how callers reach a quiescent state.

use crate::codec::ChunkCodec;
use crate::dir::LogDir;
use crate::error::{CoreError, CoreResult};
use crate::segment::{AppendResult, Segment, HEADER_SIZE};
use crate::stats::LogStats;
use crate::types::{CommitLogPosition, SegmentId, TableId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tidelog_storage::FileBackend;
use tracing::{debug, error, info, warn};

/// Capacity of the management task queue.
const TASK_QUEUE_CAPACITY: usize = 64;

/// Base delay between delete attempts.
const DELETE_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Delay before a reclaim pass with failed deletions runs again.
const RECLAIM_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Where a write landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Position just past the write.
    pub position: CommitLogPosition,
    /// Whether this write rolled the log over to a new segment.
    pub rolled_over: bool,
}

/// Settings the manager needs from [`Config`](crate::Config).
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Logical segment capacity.
    pub segment_size: u32,
    /// Target reserve pool size.
    pub reserve_segments: usize,
    /// Delete attempts per reclaim pass.
    pub deletion_retries: u32,
    /// First segment id to hand out.
    pub first_segment_id: SegmentId,
}

enum ManagementTask {
    FillReserve,
    Reclaim,
    Barrier(SyncSender<()>),
    Shutdown,
}

#[derive(Debug, Clone)]
enum Failure {
    Allocation(String),
    Write(String),
}

impl Failure {
    fn to_error(&self) -> CoreError {
        match self {
            Self::Allocation(msg) => CoreError::allocation(msg.clone()),
            Self::Write(msg) => CoreError::write(msg.clone()),
        }
    }
}

#[derive(Debug, Default)]
struct ManagerState {
    /// Every live segment, active included.
    segments: BTreeMap<SegmentId, Arc<Segment>>,
    closed: bool,
    failed: Option<Failure>,
}

#[derive(Debug, Default)]
struct ReservePool {
    files: VecDeque<FileBackend>,
    next_file: u64,
    enabled: bool,
}

/// State shared with the background worker.
struct ManagerCore {
    dir: Arc<LogDir>,
    codec: ChunkCodec,
    options: ManagerOptions,
    stats: Arc<LogStats>,
    state: Mutex<ManagerState>,
    /// The segment accepting writes. Replaced only under `rollover`.
    active: RwLock<Option<Arc<Segment>>>,
    /// Set once the log is closed or has failed.
    stopped: AtomicBool,
    rollover: Mutex<()>,
    reserve: Mutex<ReservePool>,
    next_id: AtomicU64,
    reclaim_pending: AtomicBool,
    fill_pending: AtomicBool,
}

/// Owns the live segments and the background management worker.
pub struct SegmentManager {
    core: Arc<ManagerCore>,
    tasks: SyncSender<ManagementTask>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SegmentManager {
    /// Starts the manager and activates the first segment.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Allocation`] if the first segment or the worker
    /// thread cannot be created.
    pub fn start(
        dir: Arc<LogDir>,
        codec: ChunkCodec,
        options: ManagerOptions,
        stats: Arc<LogStats>,
    ) -> CoreResult<Self> {
        let (tasks, queue) = mpsc::sync_channel(TASK_QUEUE_CAPACITY);
        let core = Arc::new(ManagerCore {
            dir,
            codec,
            next_id: AtomicU64::new(options.first_segment_id.as_u64()),
            options,
            stats,
            state: Mutex::new(ManagerState::default()),
            active: RwLock::new(None),
            stopped: AtomicBool::new(false),
            rollover: Mutex::new(()),
            reserve: Mutex::new(ReservePool::default()),
            reclaim_pending: AtomicBool::new(false),
            fill_pending: AtomicBool::new(false),
        });

        let worker_core = Arc::clone(&core);
        let worker = thread::Builder::new()
            .name("tidelog-manager".into())
            .spawn(move || run_worker(&worker_core, &queue))
            .map_err(|e| CoreError::allocation(format!("spawning manager worker: {e}")))?;

        let manager = Self {
            core,
            tasks,
            worker: Mutex::new(Some(worker)),
        };

        {
            let _rollover = manager.core.rollover.lock();
            let first = manager.create_segment()?;
            info!(segment_id = %first.id(), path = %first.path().display(), "activated first segment");
            manager.core.state.lock().segments.insert(first.id(), Arc::clone(&first));
            *manager.core.active.write() = Some(first);
        }

        Ok(manager)
    }

    /// Finds room for `frame` in the active segment, rolling over if needed.
    ///
    /// # Errors
    ///
    /// - [`CoreError::RecordTooLarge`] if the frame cannot fit even in an
    ///   empty segment
    /// - [`CoreError::LogClosed`] after shutdown
    /// - [`CoreError::Allocation`] if a new segment cannot be created; the
    ///   log accepts no further writes
    pub fn allocate(&self, table: TableId, frame: &[u8]) -> CoreResult<Allocation> {
        let max = self.max_frame_size();
        if frame.len() > max {
            return Err(CoreError::RecordTooLarge {
                size: frame.len(),
                max,
            });
        }

        let mut rolled_over = false;
        loop {
            let segment = self.active_segment()?;
            match segment.try_append(table, frame) {
                AppendResult::Appended(position) => {
                    return Ok(Allocation {
                        position,
                        rolled_over,
                    })
                }
                AppendResult::Full => {
                    self.advance(&segment)?;
                    rolled_over = true;
                }
            }
        }
    }

    /// Returns the largest frame an empty segment can hold.
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.core.options.segment_size as usize - HEADER_SIZE
    }

    fn active_segment(&self) -> CoreResult<Arc<Segment>> {
        if self.core.stopped.load(Ordering::Acquire) {
            return Err(self.stop_error());
        }
        self.core.active.read().clone().ok_or(CoreError::LogClosed)
    }

    /// The error a stopped log hands to writers. A failure wins over a
    /// plain close.
    fn stop_error(&self) -> CoreError {
        self.core
            .state
            .lock()
            .failed
            .as_ref()
            .map_or(CoreError::LogClosed, Failure::to_error)
    }

    /// Replaces `full` as the active segment, unless another writer already
    /// did.
    fn advance(&self, full: &Arc<Segment>) -> CoreResult<()> {
        let _rollover = self.core.rollover.lock();
        if self.core.stopped.load(Ordering::Acquire) {
            return Err(self.stop_error());
        }
        match &*self.core.active.read() {
            Some(active) if active.id() == full.id() => {}
            _ => return Ok(()),
        }

        let next = match self.create_segment() {
            Ok(segment) => segment,
            Err(e) => {
                let message = e.to_string();
                error!(error = %message, "segment allocation failed, commit log stopped");
                self.record_failure(Failure::Allocation(message.clone()));
                return Err(CoreError::allocation(message));
            }
        };

        {
            let mut state = self.core.state.lock();
            state.segments.insert(next.id(), Arc::clone(&next));
            if state.closed {
                next.seal();
            }
            *self.core.active.write() = Some(Arc::clone(&next));
        }
        full.seal();
        info!(
            sealed = %full.id(),
            segment_id = %next.id(),
            "rolled over to new segment"
        );
        Ok(())
    }

    fn record_failure(&self, failure: Failure) {
        let mut state = self.core.state.lock();
        if state.failed.is_none() {
            state.failed = Some(failure);
        }
        self.core.stopped.store(true, Ordering::Release);
    }

    /// Creates the next segment file. Callers hold the rollover lock, which
    /// serializes creation.
    fn create_segment(&self) -> CoreResult<Arc<Segment>> {
        let core = &self.core;
        let id = SegmentId::new(core.next_id.fetch_add(1, Ordering::SeqCst));
        let path = core.dir.segment_path(id);

        let reserved = core.reserve.lock().files.pop_front();
        let from_reserve = reserved.is_some();
        let backend = match reserved {
            Some(mut file) => {
                file.rename_to(&path).map_err(|e| {
                    CoreError::allocation(format!("activating reserve file as {}: {e}", path.display()))
                })?;
                file
            }
            None => FileBackend::create_new(&path).map_err(|e| {
                CoreError::allocation(format!("creating {}: {e}", path.display()))
            })?,
        };

        let segment = Segment::create(
            id,
            path.clone(),
            Box::new(backend),
            core.options.segment_size,
            core.codec.clone(),
        )
        .map_err(|e| CoreError::allocation(format!("writing header of {}: {e}", path.display())))?;
        core.dir
            .sync_directory()
            .map_err(|e| CoreError::allocation(format!("syncing log directory: {e}")))?;

        core.stats.record_segment_created(from_reserve);
        debug!(segment_id = %id, from_reserve, "created segment");
        self.request_fill_reserve();
        Ok(Arc::new(segment))
    }

    /// Starts keeping pre-created segment files ready.
    pub fn enable_reserve_segment_creation(&self) {
        if self.core.options.reserve_segments == 0 {
            return;
        }
        self.core.reserve.lock().enabled = true;
        self.request_fill_reserve();
    }

    fn request_fill_reserve(&self) {
        if !self.core.reserve.lock().enabled {
            return;
        }
        if !self.core.fill_pending.swap(true, Ordering::AcqRel) {
            let _ = self.tasks.send(ManagementTask::FillReserve);
        }
    }

    /// Queues a reclamation pass.
    pub fn request_reclaim(&self) {
        if !self.core.reclaim_pending.swap(true, Ordering::AcqRel) {
            let _ = self.tasks.send(ManagementTask::Reclaim);
        }
    }

    /// Marks `table`'s data between `lower` and `upper` as durable elsewhere
    /// and queues reclamation of segments nobody needs anymore.
    pub fn discard_completed(&self, table: TableId, lower: CommitLogPosition, upper: CommitLogPosition) {
        let segments: Vec<Arc<Segment>> = {
            let state = self.core.state.lock();
            state
                .segments
                .range(..=upper.segment_id)
                .map(|(_, s)| Arc::clone(s))
                .collect()
        };
        for segment in &segments {
            segment.mark_clean(table, lower, upper);
        }
        debug!(%table, %lower, %upper, segments = segments.len(), "discarded");
        self.request_reclaim();
    }

    /// Syncs every segment with unwritten data, oldest first.
    ///
    /// Returns the position up to which the whole log is durable, or `None`
    /// if there are no segments.
    ///
    /// # Errors
    ///
    /// A sync failure stops the log; the error is returned here and to
    /// every later writer.
    pub fn sync_segments(&self) -> CoreResult<Option<CommitLogPosition>> {
        let active = active_id(&self.core);
        let segments: Vec<Arc<Segment>> = {
            let state = self.core.state.lock();
            state
                .segments
                .values()
                .filter(|s| Some(s.id()) == active || !s.is_fully_synced())
                .cloned()
                .collect()
        };

        let mut durable = None;
        let mut sealed_synced = false;
        for segment in segments {
            match segment.sync() {
                Ok(offset) => {
                    durable = Some(CommitLogPosition::new(segment.id(), offset));
                    sealed_synced |= segment.is_sealed();
                }
                Err(e) => {
                    self.fail_write(&e);
                    return Err(e);
                }
            }
        }

        if sealed_synced {
            self.request_reclaim();
        }
        Ok(durable)
    }

    fn fail_write(&self, e: &CoreError) {
        let message = e.to_string();
        error!(error = %message, "sync failed, commit log stopped");
        self.record_failure(Failure::Write(message));
    }

    /// Returns the error that stopped the log, if any.
    #[must_use]
    pub fn failure(&self) -> Option<CoreError> {
        self.core.state.lock().failed.as_ref().map(Failure::to_error)
    }

    /// Blocks until every queued management task has run.
    pub fn await_management_tasks_completion(&self) {
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        if self.tasks.send(ManagementTask::Barrier(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }

    /// Stops accepting writes and seals the active segment.
    ///
    /// The sealed segment still needs a final sync.
    pub fn close(&self) {
        let mut state = self.core.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        self.core.stopped.store(true, Ordering::Release);
        if let Some(active) = &*self.core.active.read() {
            active.seal();
        }
    }

    /// Returns true once [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.core.state.lock().closed
    }

    /// Stops the worker after a final reclamation pass and removes reserve
    /// files.
    ///
    /// With `blocking` the call waits for the worker to exit.
    pub fn shutdown(&self, blocking: bool) {
        self.close();
        self.request_reclaim();
        let _ = self.tasks.send(ManagementTask::Shutdown);
        if blocking {
            self.await_termination();
        }
    }

    /// Waits for the worker thread to exit.
    pub fn await_termination(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("segment manager worker panicked");
            }
        }
    }

    /// Returns the highest segment id handed out so far.
    #[must_use]
    pub fn highest_segment_id(&self) -> SegmentId {
        SegmentId::new(self.core.next_id.load(Ordering::SeqCst).saturating_sub(1))
    }

    /// Returns the live segments in id order.
    #[must_use]
    pub fn active_segments(&self) -> Vec<Arc<Segment>> {
        self.core.state.lock().segments.values().cloned().collect()
    }

    /// Returns the segment currently accepting writes.
    #[must_use]
    pub fn current_segment(&self) -> Option<Arc<Segment>> {
        self.core.active.read().clone()
    }

    /// Returns the file names of the live segments in id order.
    #[must_use]
    pub fn active_segment_names(&self) -> Vec<String> {
        self.active_segments().iter().map(|s| s.name()).collect()
    }

    /// Returns the bytes written to live segment files.
    #[must_use]
    pub fn active_on_disk_size(&self) -> u64 {
        self.active_segments().iter().map(|s| s.on_disk_size()).sum()
    }

    /// Returns the synced logical size of live segments.
    #[must_use]
    pub fn active_content_size(&self) -> u64 {
        self.active_segments().iter().map(|s| s.content_size()).sum()
    }

    /// Returns each live segment's `on_disk / content` ratio by file name.
    #[must_use]
    pub fn segment_compression_ratios(&self) -> BTreeMap<String, f64> {
        self.active_segments()
            .iter()
            .map(|s| (s.name(), s.compression_ratio()))
            .collect()
    }

    /// Returns the number of reserve files ready.
    #[must_use]
    pub fn reserve_len(&self) -> usize {
        self.core.reserve.lock().files.len()
    }
}

impl std::fmt::Debug for SegmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentManager")
            .field("dir", &self.core.dir.path())
            .field("segments", &self.core.state.lock().segments.len())
            .finish_non_exhaustive()
    }
}

fn active_id(core: &ManagerCore) -> Option<SegmentId> {
    core.active.read().as_ref().map(|s| s.id())
}

fn run_worker(core: &ManagerCore, queue: &Receiver<ManagementTask>) {
    let mut retry_at: Option<Instant> = None;
    loop {
        let task = match retry_at {
            Some(at) => match queue.recv_timeout(at.saturating_duration_since(Instant::now())) {
                Ok(task) => task,
                Err(RecvTimeoutError::Timeout) => ManagementTask::Reclaim,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match queue.recv() {
                Ok(task) => task,
                Err(_) => break,
            },
        };
        match task {
            ManagementTask::FillReserve => {
                core.fill_pending.store(false, Ordering::Release);
                fill_reserve(core);
            }
            ManagementTask::Reclaim => {
                core.reclaim_pending.store(false, Ordering::Release);
                retry_at = reclaim(core).then(|| Instant::now() + RECLAIM_RETRY_INTERVAL);
            }
            ManagementTask::Barrier(done) => {
                let _ = done.send(());
            }
            ManagementTask::Shutdown => break,
        }
    }
    drain_reserve(core);
    debug!("segment manager worker stopped");
}

fn fill_reserve(core: &ManagerCore) {
    loop {
        if core.state.lock().closed {
            return;
        }
        let n = {
            let mut reserve = core.reserve.lock();
            if !reserve.enabled || reserve.files.len() >= core.options.reserve_segments {
                return;
            }
            let n = reserve.next_file;
            reserve.next_file += 1;
            n
        };

        let path = core.dir.reserve_path(n);
        match FileBackend::create_new(&path) {
            Ok(file) => {
                if let Err(e) = core.dir.sync_directory() {
                    warn!(error = %e, "syncing log directory after reserve creation");
                }
                debug!(path = %path.display(), "created reserve segment file");
                core.reserve.lock().files.push_back(file);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "reserve segment creation failed");
                return;
            }
        }
    }
}

fn drain_reserve(core: &ManagerCore) {
    let files: Vec<FileBackend> = {
        let mut reserve = core.reserve.lock();
        reserve.enabled = false;
        reserve.files.drain(..).collect()
    };
    if files.is_empty() {
        return;
    }
    for file in files {
        let path = file.path().to_path_buf();
        drop(file);
        if let Err(e) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "removing reserve file");
        }
    }
    if let Err(e) = core.dir.sync_directory() {
        warn!(error = %e, "syncing log directory after reserve cleanup");
    }
}

/// Deletes sealed, fully synced segments that no table needs.
///
/// Returns true if a deletion failed. The worker then runs another pass
/// after [`RECLAIM_RETRY_INTERVAL`], even if nothing else asks for one.
fn reclaim(core: &ManagerCore) -> bool {
    let active = active_id(core);
    let candidates: Vec<Arc<Segment>> = {
        let state = core.state.lock();
        state
            .segments
            .values()
            .filter(|s| Some(s.id()) != active)
            .filter(|s| s.is_sealed() && s.is_unused() && s.is_fully_synced())
            .cloned()
            .collect()
    };

    let mut deleted = 0usize;
    let mut failed = false;
    for segment in candidates {
        match delete_with_retries(segment.path(), core.options.deletion_retries, &core.stats) {
            Ok(()) => {
                core.state.lock().segments.remove(&segment.id());
                core.stats.record_reclaimed();
                deleted += 1;
                info!(segment_id = %segment.id(), "reclaimed segment");
            }
            Err(e) => {
                warn!(segment_id = %segment.id(), error = %e, "segment deletion failed, will retry");
                failed = true;
            }
        }
    }

    if deleted > 0 {
        if let Err(e) = core.dir.sync_directory() {
            warn!(error = %e, "syncing log directory after reclamation");
        }
    }
    failed
}

fn delete_with_retries(path: &Path, attempts: u32, stats: &LogStats) -> CoreResult<()> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match fs::remove_file(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                stats.record_deletion_failure();
                if attempt >= attempts {
                    return Err(CoreError::Deletion {
                        path: path.display().to_string(),
                        source: e,
                    });
                }
                thread::sleep(DELETE_RETRY_DELAY * attempt);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Compression;
    use crate::segment::{encode_frame, frame_size};
    use tempfile::{tempdir, TempDir};
    use tidelog_storage::InMemoryBackend;

    fn manager(segment_size: u32, reserve: usize) -> (TempDir, SegmentManager) {
        let temp = tempdir().unwrap();
        let dir = Arc::new(LogDir::open(temp.path(), true).unwrap());
        let manager = SegmentManager::start(
            dir,
            ChunkCodec::new(Compression::None, None).unwrap(),
            ManagerOptions {
                segment_size,
                reserve_segments: reserve,
                deletion_retries: 3,
                first_segment_id: SegmentId::new(100),
            },
            Arc::new(LogStats::new()),
        )
        .unwrap();
        (temp, manager)
    }

    fn frame(payload_len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        encode_frame(&vec![7u8; payload_len], &mut out).unwrap();
        out
    }

    fn files_on_disk(temp: &TempDir) -> Vec<String> {
        let mut names: Vec<String> = crate::dir::list_segments_in(temp.path())
            .unwrap()
            .into_iter()
            .map(|s| s.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn starts_with_one_segment() {
        let (temp, manager) = manager(4096, 0);
        assert_eq!(manager.active_segment_names(), vec!["CommitLog-1-100.log"]);
        assert_eq!(files_on_disk(&temp), manager.active_segment_names());
        assert_eq!(manager.active_on_disk_size(), HEADER_SIZE as u64);
        manager.shutdown(true);
    }

    #[test]
    fn record_too_large_fails_deterministically() {
        let (_temp, manager) = manager(4096, 0);
        let too_big = frame(4096 - HEADER_SIZE - frame_size(0) + 1);
        for _ in 0..2 {
            assert!(matches!(
                manager.allocate(TableId::new(1), &too_big),
                Err(CoreError::RecordTooLarge { .. })
            ));
        }
        assert_eq!(manager.active_segments().len(), 1);

        let exact = frame(4096 - HEADER_SIZE - frame_size(0));
        let allocation = manager.allocate(TableId::new(1), &exact).unwrap();
        assert!(!allocation.rolled_over);
        assert_eq!(allocation.position.offset, 4096);
        manager.shutdown(true);
    }

    #[test]
    fn rolls_over_only_when_over_capacity() {
        let (_temp, manager) = manager(4096, 0);
        let room = 4096 - HEADER_SIZE;

        let first = manager.allocate(TableId::new(1), &frame(room / 2 - frame_size(0))).unwrap();
        assert!(!first.rolled_over);

        // exactly the remaining room: stays in the same segment
        let remaining = room - room / 2;
        let second = manager
            .allocate(TableId::new(1), &frame(remaining - frame_size(0)))
            .unwrap();
        assert!(!second.rolled_over);
        assert_eq!(second.position.segment_id, first.position.segment_id);

        let third = manager.allocate(TableId::new(1), &frame(1)).unwrap();
        assert!(third.rolled_over);
        assert_eq!(third.position.segment_id, first.position.segment_id.next());
        assert_eq!(manager.active_segments().len(), 2);
        assert!(manager.active_segments()[0].is_sealed());
        manager.shutdown(true);
    }

    #[test]
    fn sync_reports_durable_position() {
        let (_temp, manager) = manager(4096, 0);
        let allocation = manager.allocate(TableId::new(1), &frame(10)).unwrap();
        let durable = manager.sync_segments().unwrap().unwrap();
        assert_eq!(durable, allocation.position);
        manager.shutdown(true);
    }

    #[test]
    fn discard_reclaims_sealed_segments() {
        let (temp, manager) = manager(4096, 0);
        let big = frame(3000);
        let a = manager.allocate(TableId::new(1), &big).unwrap();
        let b = manager.allocate(TableId::new(1), &big).unwrap();
        assert!(b.rolled_over);
        manager.sync_segments().unwrap();

        manager.discard_completed(TableId::new(1), CommitLogPosition::NONE, a.position);
        manager.await_management_tasks_completion();

        assert_eq!(manager.active_segments().len(), 1);
        assert_eq!(manager.active_segments()[0].id(), b.position.segment_id);
        assert_eq!(files_on_disk(&temp), manager.active_segment_names());
        manager.shutdown(true);
    }

    #[test]
    fn segment_pinned_by_other_table_survives() {
        let (_temp, manager) = manager(4096, 0);
        let a = manager.allocate(TableId::new(1), &frame(1500)).unwrap();
        manager.allocate(TableId::new(2), &frame(1500)).unwrap();
        manager.allocate(TableId::new(1), &frame(1500)).unwrap();
        manager.sync_segments().unwrap();

        manager.discard_completed(TableId::new(1), CommitLogPosition::NONE, a.position);
        manager.await_management_tasks_completion();
        assert_eq!(manager.active_segments().len(), 2);
        manager.shutdown(true);
    }

    #[test]
    fn reserve_files_feed_rollover() {
        let (temp, manager) = manager(4096, 2);
        manager.enable_reserve_segment_creation();
        manager.await_management_tasks_completion();
        assert_eq!(manager.reserve_len(), 2);

        manager.allocate(TableId::new(1), &frame(3000)).unwrap();
        let rolled = manager.allocate(TableId::new(1), &frame(3000)).unwrap();
        assert!(rolled.rolled_over);
        manager.await_management_tasks_completion();
        assert_eq!(manager.reserve_len(), 2);
        assert_eq!(manager.core.stats.snapshot().segments_from_reserve, 1);

        manager.shutdown(true);
        let leftovers = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("reserve-"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn closed_manager_rejects_writes() {
        let (_temp, manager) = manager(4096, 0);
        manager.shutdown(true);
        assert!(matches!(
            manager.allocate(TableId::new(1), &frame(1)),
            Err(CoreError::LogClosed)
        ));
    }

    #[test]
    fn ratios_and_sizes_agree_with_disk() {
        let (temp, manager) = manager(8192, 0);
        for _ in 0..10 {
            manager.allocate(TableId::new(1), &frame(900)).unwrap();
        }
        manager.sync_segments().unwrap();
        manager.await_management_tasks_completion();

        let on_disk: u64 = crate::dir::list_segments_in(temp.path())
            .unwrap()
            .iter()
            .map(|s| fs::metadata(&s.path).unwrap().len())
            .sum();
        assert_eq!(on_disk, manager.active_on_disk_size());

        let ratios = manager.segment_compression_ratios();
        assert_eq!(ratios.len(), manager.active_segments().len());
        assert!(ratios.values().all(|r| *r >= 1.0));
        manager.shutdown(true);
    }

    #[test]
    fn successive_discards_reclaim_segment() {
        let (temp, manager) = manager(4096, 0);
        let a = manager.allocate(TableId::new(1), &frame(1500)).unwrap();
        let b = manager.allocate(TableId::new(1), &frame(1500)).unwrap();
        let c = manager.allocate(TableId::new(1), &frame(3000)).unwrap();
        assert_eq!(b.position.segment_id, a.position.segment_id);
        assert!(c.rolled_over);
        manager.sync_segments().unwrap();

        // the first discard covers only part of the sealed segment
        manager.discard_completed(TableId::new(1), CommitLogPosition::NONE, a.position);
        manager.await_management_tasks_completion();
        assert_eq!(manager.active_segments().len(), 2);

        manager.discard_completed(TableId::new(1), a.position, b.position);
        manager.await_management_tasks_completion();
        assert_eq!(manager.active_segments().len(), 1);
        assert_eq!(manager.active_segments()[0].id(), c.position.segment_id);
        assert_eq!(files_on_disk(&temp), manager.active_segment_names());
        manager.shutdown(true);
    }

    #[test]
    fn allocation_failure_stops_the_log() {
        let (_temp, manager) = manager(4096, 0);
        fs::create_dir(manager.core.dir.segment_path(SegmentId::new(101))).unwrap();

        manager.allocate(TableId::new(1), &frame(3000)).unwrap();
        assert!(matches!(
            manager.allocate(TableId::new(1), &frame(3000)),
            Err(CoreError::Allocation { .. })
        ));
        // a frame that would still fit is refused as well
        assert!(matches!(
            manager.allocate(TableId::new(1), &frame(1)),
            Err(CoreError::Allocation { .. })
        ));
        assert!(matches!(manager.failure(), Some(CoreError::Allocation { .. })));
        manager.shutdown(true);
    }

    #[test]
    fn sync_failure_stops_the_log() {
        let (_temp, manager) = manager(4096, 0);
        manager.allocate(TableId::new(1), &frame(10)).unwrap();
        let failing = InMemoryBackend::new();
        failing.fail_writes(true);
        manager.current_segment().unwrap().replace_backend(Box::new(failing));

        assert!(matches!(manager.sync_segments(), Err(CoreError::Write { .. })));
        assert!(matches!(
            manager.allocate(TableId::new(1), &frame(10)),
            Err(CoreError::Write { .. })
        ));
        assert!(matches!(manager.failure(), Some(CoreError::Write { .. })));
        manager.shutdown(true);
    }

    #[test]
    fn failed_deletion_is_counted_and_retried() {
        let (temp, manager) = manager(4096, 0);
        let a = manager.allocate(TableId::new(1), &frame(3000)).unwrap();
        manager.allocate(TableId::new(1), &frame(3000)).unwrap();
        manager.sync_segments().unwrap();

        // a non-empty directory in place of the sealed file cannot be unlinked
        let path = manager.core.dir.segment_path(a.position.segment_id);
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();
        fs::write(path.join("blocker"), b"x").unwrap();

        manager.discard_completed(TableId::new(1), CommitLogPosition::NONE, a.position);
        manager.await_management_tasks_completion();
        assert_eq!(manager.active_segments().len(), 2);
        assert!(manager.core.stats.snapshot().deletion_failures >= 3);
        assert!(manager.failure().is_none());
        manager.allocate(TableId::new(1), &frame(10)).unwrap();

        // nothing else requests reclamation: the worker retries on its own
        fs::remove_dir_all(&path).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while manager.active_segments().len() > 1 {
            assert!(Instant::now() < deadline, "failed deletion was never retried");
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(manager.core.stats.snapshot().segments_reclaimed, 1);
        assert_eq!(files_on_disk(&temp), manager.active_segment_names());
        manager.shutdown(true);
    }
}
