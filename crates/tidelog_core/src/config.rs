//! Commit log configuration.

use crate::codec::Compression;
use crate::crypto::EncryptionKey;
use crate::error::{CoreError, CoreResult};
use std::path::PathBuf;
use std::time::Duration;

/// Smallest segment size accepted by [`Config::validate`].
pub const MIN_SEGMENT_SIZE: u32 = 4 * 1024;

/// Default segment size (32 MiB).
pub const DEFAULT_SEGMENT_SIZE: u32 = 32 * 1024 * 1024;

/// When buffered writes are made durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// A background timer syncs every `period`. Writers never wait.
    Periodic {
        /// Time between syncs.
        period: Duration,
    },
    /// Every write requests a sync and waits for it. Writers arriving
    /// within `window` of each other share one fsync.
    Batch {
        /// Coalescing window before each sync.
        window: Duration,
    },
    /// Like batch, but consecutive syncs start at least `window` apart,
    /// trading latency for larger groups.
    Group {
        /// Minimum spacing between sync starts.
        window: Duration,
    },
}

impl SyncMode {
    /// Periodic mode with the default 10 s period.
    #[must_use]
    pub const fn periodic() -> Self {
        Self::Periodic {
            period: Duration::from_secs(10),
        }
    }

    /// Batch mode with the default 2 ms window.
    #[must_use]
    pub const fn batch() -> Self {
        Self::Batch {
            window: Duration::from_millis(2),
        }
    }

    /// Group mode with the default 15 ms window.
    #[must_use]
    pub const fn group() -> Self {
        Self::Group {
            window: Duration::from_millis(15),
        }
    }

    /// Returns true if `add` blocks until its write is durable.
    #[must_use]
    pub const fn waits_for_sync(&self) -> bool {
        matches!(self, Self::Batch { .. } | Self::Group { .. })
    }

    /// Returns the mode's name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Periodic { .. } => "periodic",
            Self::Batch { .. } => "batch",
            Self::Group { .. } => "group",
        }
    }

    /// Returns the mode's timing parameter.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        match *self {
            Self::Periodic { period } => period,
            Self::Batch { window } | Self::Group { window } => window,
        }
    }
}

impl Default for SyncMode {
    fn default() -> Self {
        Self::periodic()
    }
}

/// Configuration for opening a commit log.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding segment files.
    pub directory: PathBuf,

    /// Maximum logical size of a segment, header included.
    pub segment_size: u32,

    /// Sync policy.
    pub sync_mode: SyncMode,

    /// Compression applied to each chunk.
    pub compression: Compression,

    /// Key for chunk encryption, if enabled.
    pub encryption: Option<EncryptionKey>,

    /// Number of pre-created segment files to keep ready.
    pub reserve_segments: usize,

    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Attempts made to delete a reclaimed segment per reclaim pass.
    pub deletion_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("commitlog"),
            segment_size: DEFAULT_SEGMENT_SIZE,
            sync_mode: SyncMode::default(),
            compression: Compression::None,
            encryption: None,
            reserve_segments: 2,
            create_if_missing: true,
            deletion_retries: 3,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the log directory.
    #[must_use]
    pub fn directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.directory = path.into();
        self
    }

    /// Sets the maximum segment size.
    #[must_use]
    pub const fn segment_size(mut self, size: u32) -> Self {
        self.segment_size = size;
        self
    }

    /// Sets the sync policy.
    #[must_use]
    pub const fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Sets the chunk compression.
    #[must_use]
    pub const fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Enables chunk encryption with `key`.
    #[must_use]
    pub fn encryption(mut self, key: EncryptionKey) -> Self {
        self.encryption = Some(key);
        self
    }

    /// Sets the reserve pool size. Zero disables pre-creation.
    #[must_use]
    pub const fn reserve_segments(mut self, count: usize) -> Self {
        self.reserve_segments = count;
        self
    }

    /// Sets whether to create the directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the number of delete attempts per reclaim pass.
    #[must_use]
    pub const fn deletion_retries(mut self, retries: u32) -> Self {
        self.deletion_retries = retries;
        self
    }

    /// Checks the configuration for values the log cannot run with.
    pub fn validate(&self) -> CoreResult<()> {
        if self.segment_size < MIN_SEGMENT_SIZE {
            return Err(CoreError::invalid_config(format!(
                "segment_size {} is below the minimum of {MIN_SEGMENT_SIZE}",
                self.segment_size
            )));
        }
        if self.sync_mode.interval().is_zero() {
            if let SyncMode::Periodic { .. } = self.sync_mode {
                return Err(CoreError::invalid_config("periodic sync period must be non-zero"));
            }
        }
        if self.deletion_retries == 0 {
            return Err(CoreError::invalid_config("deletion_retries must be at least 1"));
        }
        if self.directory.as_os_str().is_empty() {
            return Err(CoreError::invalid_config("directory must be set"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.segment_size, DEFAULT_SEGMENT_SIZE);
        assert_eq!(config.sync_mode, SyncMode::periodic());
        assert_eq!(config.compression, Compression::None);
        assert!(config.encryption.is_none());
        assert_eq!(config.reserve_segments, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .directory("/tmp/log")
            .segment_size(64 * 1024)
            .sync_mode(SyncMode::batch())
            .compression(Compression::Lz4)
            .reserve_segments(0)
            .create_if_missing(false);

        assert_eq!(config.directory, PathBuf::from("/tmp/log"));
        assert_eq!(config.segment_size, 64 * 1024);
        assert!(config.sync_mode.waits_for_sync());
        assert_eq!(config.compression, Compression::Lz4);
        assert_eq!(config.reserve_segments, 0);
        assert!(!config.create_if_missing);
    }

    #[test]
    fn sync_mode_defaults() {
        assert_eq!(SyncMode::batch().interval(), Duration::from_millis(2));
        assert_eq!(SyncMode::group().interval(), Duration::from_millis(15));
        assert!(!SyncMode::periodic().waits_for_sync());
        assert_eq!(SyncMode::group().name(), "group");
    }

    #[test]
    fn rejects_tiny_segments() {
        let config = Config::new().segment_size(512);
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn rejects_zero_period() {
        let config = Config::new().sync_mode(SyncMode::Periodic {
            period: Duration::ZERO,
        });
        assert!(config.validate().is_err());

        let batch = Config::new().sync_mode(SyncMode::Batch {
            window: Duration::ZERO,
        });
        assert!(batch.validate().is_ok());
    }

    #[test]
    fn rejects_zero_deletion_retries() {
        assert!(Config::new().deletion_retries(0).validate().is_err());
    }
}
