//! Sync service: makes buffered writes durable.
//!
//! One background thread drives every sync. Its pacing depends on the
//! [`SyncMode`]:
//!
//! - **Periodic**: a sync every `period`, or sooner when requested
//! - **Batch**: a sync as soon as one is requested, after waiting `window`
//!   so writers arriving together share one fsync
//! - **Group**: a sync when requested, but never sooner than `window` after
//!   the previous one started
//!
//! Callers wait in one of two ways. A [`SyncTicket`] completes when a sync
//! that *started after* the request has finished, so a single wait is a
//! precise barrier. [`SyncService::wait_for_position`] completes when the
//! durable position reaches a given position.

use crate::config::SyncMode;
use crate::error::{CoreError, CoreResult};
use crate::manager::SegmentManager;
use crate::stats::LogStats;
use crate::types::CommitLogPosition;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, trace};

#[derive(Debug)]
struct SyncState {
    /// Highest ticket handed out.
    requested: u64,
    /// Highest ticket covered by a finished sync.
    completed: u64,
    /// Everything at or before this position is on disk.
    durable: CommitLogPosition,
    failure: Option<String>,
    shutdown: bool,
    stopped: bool,
    last_sync_start: Option<Instant>,
}

struct SyncShared {
    mode: SyncMode,
    manager: Arc<SegmentManager>,
    stats: Arc<LogStats>,
    state: Mutex<SyncState>,
    /// Wakes the worker.
    work: Condvar,
    /// Wakes waiters after each sync.
    done: Condvar,
}

/// A pending sync request.
#[must_use = "a ticket does nothing unless waited on"]
pub struct SyncTicket {
    shared: Arc<SyncShared>,
    ticket: u64,
}

impl SyncTicket {
    /// Blocks until a sync that started after this request has finished.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Write`] if a sync failed, or
    /// [`CoreError::LogClosed`] if the service stopped first.
    pub fn wait(self) -> CoreResult<()> {
        let mut state = self.shared.state.lock();
        loop {
            if state.completed >= self.ticket {
                return Ok(());
            }
            if let Some(failure) = &state.failure {
                return Err(CoreError::write(failure.clone()));
            }
            if state.stopped {
                return Err(CoreError::LogClosed);
            }
            self.shared.done.wait(&mut state);
        }
    }

    /// Same as [`wait`](Self::wait). Waiting cannot be interrupted.
    pub fn await_uninterruptibly(self) -> CoreResult<()> {
        self.wait()
    }

    /// Returns the ticket number.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.ticket
    }
}

impl std::fmt::Debug for SyncTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTicket")
            .field("ticket", &self.ticket)
            .finish()
    }
}

/// Drives syncs of the segment manager's segments.
pub struct SyncService {
    shared: Arc<SyncShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncService {
    /// Starts the sync thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start(
        mode: SyncMode,
        manager: Arc<SegmentManager>,
        stats: Arc<LogStats>,
    ) -> CoreResult<Self> {
        let shared = Arc::new(SyncShared {
            mode,
            manager,
            stats,
            state: Mutex::new(SyncState {
                requested: 0,
                completed: 0,
                durable: CommitLogPosition::NONE,
                failure: None,
                shutdown: false,
                stopped: false,
                last_sync_start: None,
            }),
            work: Condvar::new(),
            done: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("tidelog-sync-{}", mode.name()))
            .spawn(move || run_sync(&worker_shared))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Returns the sync mode.
    #[must_use]
    pub fn mode(&self) -> SyncMode {
        self.shared.mode
    }

    /// Requests a sync and returns a ticket to wait on.
    pub fn request_sync(&self) -> SyncTicket {
        let ticket = {
            let mut state = self.shared.state.lock();
            state.requested += 1;
            state.requested
        };
        self.shared.work.notify_one();
        SyncTicket {
            shared: Arc::clone(&self.shared),
            ticket,
        }
    }

    /// Blocks until everything up to `position` is durable.
    ///
    /// Does not request a sync by itself.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Write`] if a sync failed, or
    /// [`CoreError::LogClosed`] if the service stopped first.
    pub fn wait_for_position(&self, position: CommitLogPosition) -> CoreResult<()> {
        let mut state = self.shared.state.lock();
        loop {
            if state.durable >= position {
                return Ok(());
            }
            if let Some(failure) = &state.failure {
                return Err(CoreError::write(failure.clone()));
            }
            if state.stopped {
                return Err(CoreError::LogClosed);
            }
            self.shared.done.wait(&mut state);
        }
    }

    /// Returns the position up to which the log is durable.
    #[must_use]
    pub fn durable_position(&self) -> CommitLogPosition {
        self.shared.state.lock().durable
    }

    /// Returns an error if a sync has failed.
    pub fn check_healthy(&self) -> CoreResult<()> {
        let state = self.shared.state.lock();
        match &state.failure {
            Some(failure) => Err(CoreError::write(failure.clone())),
            None if state.stopped => Err(CoreError::LogClosed),
            None => Ok(()),
        }
    }

    /// Stops the service after one final sync.
    ///
    /// With `blocking` the call waits until that sync has finished.
    pub fn shutdown(&self, blocking: bool) {
        self.shared.state.lock().shutdown = true;
        self.shared.work.notify_all();
        if blocking {
            self.await_termination();
        }
    }

    /// Waits for the sync thread to exit.
    pub fn await_termination(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("sync thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("mode", &self.shared.mode)
            .field("durable", &self.durable_position())
            .finish_non_exhaustive()
    }
}

fn has_work(state: &SyncState) -> bool {
    state.shutdown || state.requested > state.completed
}

/// Blocks until the next sync should start, per the mode's pacing.
fn wait_for_next_cycle(shared: &SyncShared, state: &mut MutexGuard<'_, SyncState>) {
    match shared.mode {
        SyncMode::Periodic { period } => {
            let deadline = state.last_sync_start.unwrap_or_else(Instant::now) + period;
            while !has_work(state) {
                if shared.work.wait_until(state, deadline).timed_out() {
                    break;
                }
            }
        }
        SyncMode::Batch { window } => {
            while !has_work(state) {
                shared.work.wait(state);
            }
            if !window.is_zero() && !state.shutdown {
                MutexGuard::unlocked(state, || thread::sleep(window));
            }
        }
        SyncMode::Group { window } => {
            while !has_work(state) {
                shared.work.wait(state);
            }
            if let Some(last) = state.last_sync_start {
                let ready = last + window;
                while !state.shutdown && Instant::now() < ready {
                    shared.work.wait_until(state, ready);
                }
            }
        }
    }
}

fn run_sync(shared: &SyncShared) {
    loop {
        let (target, last_cycle) = {
            let mut state = shared.state.lock();
            wait_for_next_cycle(shared, &mut state);
            state.last_sync_start = Some(Instant::now());
            (state.requested, state.shutdown)
        };

        let result = shared.manager.sync_segments();

        let stop = {
            let mut state = shared.state.lock();
            match result {
                Ok(durable) => {
                    if let Some(position) = durable {
                        state.durable = state.durable.max(position);
                    }
                    state.completed = state.completed.max(target);
                    shared.stats.record_sync();
                    trace!(ticket = target, durable = %state.durable, "sync complete");
                }
                Err(e) => {
                    error!(error = %e, "sync failed");
                    state.failure = Some(e.to_string());
                }
            }
            let stop = last_cycle || state.failure.is_some();
            if stop {
                state.stopped = true;
            }
            stop
        };
        shared.done.notify_all();

        if stop {
            debug!(mode = shared.mode.name(), "sync thread stopped");
            return;
        }
    }
}
