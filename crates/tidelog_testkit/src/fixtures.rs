//! Test fixtures and log helpers.
//!
//! Provides convenience functions for setting up commit logs in temporary
//! directories and collecting what a replay produces.

use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tidelog_core::dir::{list_segments_in, read_manifest_in};
use tidelog_core::{
    CommitLog, CommitLogPosition, CommitLogReadHandler, CommitLogReader, Config, CoreResult,
    EncryptionKey, Mutation, ReadError, ReplayFilter, ReplayStats, SegmentDescriptor, SyncMode,
};

/// A commit log in a temporary directory that is removed on drop.
pub struct TestLog {
    log: Option<CommitLog>,
    config: Config,
    temp_dir: TempDir,
}

impl TestLog {
    /// Opens a log with [`test_config`] and the given sync mode.
    pub fn open(mode: SyncMode) -> Self {
        Self::with_config(|config| config.sync_mode(mode))
    }

    /// Opens a log with [`test_config`] adjusted by `configure`.
    pub fn with_config(configure: impl FnOnce(Config) -> Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = configure(test_config(temp_dir.path()));
        let log = CommitLog::open(config.clone()).expect("Failed to open commit log");
        Self {
            log: Some(log),
            config,
            temp_dir,
        }
    }

    /// Returns the log directory.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Returns the configuration the log was opened with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shuts the log down and opens it again on the same directory.
    pub fn reopen(mut self) -> Self {
        if let Some(log) = self.log.take() {
            log.shutdown(true);
        }
        self.log = Some(CommitLog::open(self.config.clone()).expect("Failed to reopen commit log"));
        self
    }

    /// Shuts the log down and returns the directory for offline inspection.
    pub fn close(self) -> ClosedLog {
        let Self {
            log,
            config,
            temp_dir,
        } = self;
        if let Some(log) = log {
            log.shutdown(true);
        }
        ClosedLog { config, temp_dir }
    }
}

impl std::ops::Deref for TestLog {
    type Target = CommitLog;

    fn deref(&self) -> &Self::Target {
        self.log.as_ref().expect("log is open")
    }
}

/// The directory of a log that has been shut down.
pub struct ClosedLog {
    config: Config,
    temp_dir: TempDir,
}

impl ClosedLog {
    /// Returns the log directory.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Replays the directory with the persisted discard watermarks.
    pub fn replay(&self) -> CoreResult<(CollectingHandler, ReplayStats)> {
        replay_dir(self.path(), self.config.encryption.clone())
    }

    /// Opens the log again.
    pub fn reopen(self) -> TestLog {
        let log = CommitLog::open(self.config.clone()).expect("Failed to reopen commit log");
        TestLog {
            log: Some(log),
            config: self.config,
            temp_dir: self.temp_dir,
        }
    }
}

/// Small segments and a short batch window, suited to tests.
pub fn test_config(dir: &Path) -> Config {
    Config::new()
        .directory(dir)
        .segment_size(64 * 1024)
        .sync_mode(SyncMode::Batch {
            window: Duration::from_millis(1),
        })
        .reserve_segments(1)
}

/// One mutation as seen by a replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayedMutation {
    /// The mutation.
    pub mutation: Mutation,
    /// Position just past its frame.
    pub position: CommitLogPosition,
    /// Size of its serialized payload.
    pub size: usize,
}

/// A handler that records everything it is given.
#[derive(Debug, Default)]
pub struct CollectingHandler {
    /// Mutations in replay order.
    pub mutations: Vec<ReplayedMutation>,
    /// Segment errors seen.
    pub errors: Vec<ReadError>,
    /// Whether damaged segments are skipped rather than escalated.
    pub skip_damaged: bool,
}

impl CollectingHandler {
    /// Creates a handler that skips damaged segments.
    pub fn lenient() -> Self {
        Self {
            skip_damaged: true,
            ..Self::default()
        }
    }

    /// Returns just the mutations.
    pub fn into_mutations(self) -> Vec<Mutation> {
        self.mutations.into_iter().map(|m| m.mutation).collect()
    }
}

impl CommitLogReadHandler for CollectingHandler {
    fn should_skip_segment_on_error(&mut self, error: &ReadError) -> bool {
        self.errors.push(error.clone());
        self.skip_damaged
    }

    fn handle_mutation(
        &mut self,
        mutation: Mutation,
        size: usize,
        entry_location: u32,
        descriptor: &SegmentDescriptor,
    ) -> CoreResult<()> {
        self.mutations.push(ReplayedMutation {
            mutation,
            position: CommitLogPosition::new(descriptor.id, entry_location),
            size,
        });
        Ok(())
    }
}

/// Replays every segment in `dir` without opening the log.
///
/// Applies the persisted discard watermarks, if any. Damaged segments are
/// skipped and recorded in the handler.
pub fn replay_dir(
    dir: &Path,
    key: Option<EncryptionKey>,
) -> CoreResult<(CollectingHandler, ReplayStats)> {
    let filter = read_manifest_in(dir)?
        .map(|manifest| ReplayFilter::from_manifest(&manifest))
        .unwrap_or_default();
    let mut reader = CommitLogReader::new().with_filter(filter);
    if let Some(key) = key {
        reader = reader.with_key(key);
    }

    let mut handler = CollectingHandler::lenient();
    reader.read_files(&list_segments_in(dir)?, &mut handler)?;
    Ok((handler, *reader.stats()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidelog_core::TableId;

    #[test]
    fn reopen_keeps_data() {
        let log = TestLog::open(SyncMode::batch());
        log.add(&Mutation::new(TableId::new(1), "a", "1")).unwrap();
        let log = log.reopen();

        assert_eq!(log.recovered_segments().len(), 1);
        let mut handler = CollectingHandler::default();
        log.recover(&mut handler).unwrap();
        assert_eq!(handler.mutations.len(), 1);
        assert_eq!(handler.mutations[0].mutation.key(), b"a");
    }

    #[test]
    fn closed_log_replays() {
        let log = TestLog::open(SyncMode::group());
        for i in 0..5u8 {
            log.add(&Mutation::new(TableId::new(2), vec![i], vec![i; 10])).unwrap();
        }
        let closed = log.close();
        let (handler, stats) = closed.replay().unwrap();
        assert_eq!(stats.replayed, 5);
        assert_eq!(handler.mutations[4].mutation.value(), &[4u8; 10]);
    }
}
