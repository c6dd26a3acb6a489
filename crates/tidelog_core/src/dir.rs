//! Log directory management.
//!
//! This module handles the file system layout of a commit log:
//!
//! ```text
//! <log_dir>/
//! ├─ LOCK                          # Advisory lock for single-writer
//! ├─ DISCARDS                      # Discard watermarks and last segment id
//! ├─ CommitLog-<version>-<id>.log  # Segment files
//! └─ reserve-<n>.tmp               # Pre-created, empty segment files
//! ```
//!
//! The LOCK file ensures only one process can append to the log at a time.

use crate::error::{CoreError, CoreResult};
use crate::manifest::DiscardManifest;
use crate::segment::{parse_segment_file_name, segment_file_name};
use crate::types::SegmentId;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// File names within the log directory.
const MANIFEST_FILE: &str = "DISCARDS";
const MANIFEST_TEMP: &str = "DISCARDS.tmp";
const LOCK_FILE: &str = "LOCK";
const RESERVE_PREFIX: &str = "reserve-";
const RESERVE_SUFFIX: &str = ".tmp";

/// A segment file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    /// Id parsed from the file name.
    pub id: SegmentId,
    /// Format version parsed from the file name.
    pub version: u16,
    /// Full path.
    pub path: PathBuf,
}

/// Owns a log directory and holds an exclusive lock on it.
///
/// # Example
///
/// ```rust,ignore
/// use tidelog_core::dir::LogDir;
/// use std::path::Path;
///
/// let dir = LogDir::open(Path::new("commitlog"), true)?;
/// for segment in dir.list_segments()? {
///     println!("{}", segment.path.display());
/// }
/// ```
#[derive(Debug)]
pub struct LogDir {
    /// Root directory path.
    path: PathBuf,
    /// Lock file handle (held for exclusive access).
    _lock_file: File,
}

impl LogDir {
    /// Opens or creates a log directory and locks it.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns `LogLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_config(format!(
                    "log directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_config(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_path = path.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::LogLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the path to the log directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path of segment `id`.
    #[must_use]
    pub fn segment_path(&self, id: SegmentId) -> PathBuf {
        self.path.join(segment_file_name(id))
    }

    /// Returns the path of reserve file `n`.
    #[must_use]
    pub fn reserve_path(&self, n: u64) -> PathBuf {
        self.path.join(format!("{RESERVE_PREFIX}{n}{RESERVE_SUFFIX}"))
    }

    /// Returns the path to the DISCARDS file.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE)
    }

    /// Lists segment files in ascending id order.
    pub fn list_segments(&self) -> CoreResult<Vec<SegmentFile>> {
        list_segments_in(&self.path)
    }

    /// Removes reserve files left behind by an earlier run.
    ///
    /// Returns the number of files removed.
    pub fn remove_stale_reserve_files(&self) -> CoreResult<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(RESERVE_PREFIX) && name.ends_with(RESERVE_SUFFIX) {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            self.sync_directory()?;
        }
        Ok(removed)
    }

    /// Loads the discard manifest.
    ///
    /// Returns `None` if the file doesn't exist (new log).
    pub fn load_manifest(&self) -> CoreResult<Option<DiscardManifest>> {
        read_manifest_in(&self.path)
    }

    /// Saves the discard manifest atomically.
    ///
    /// 1. Write to temporary file
    /// 2. Sync temporary file to disk
    /// 3. Rename temporary file to DISCARDS
    /// 4. Fsync the directory so the rename is durable
    pub fn save_manifest(&self, manifest: &DiscardManifest) -> CoreResult<()> {
        let manifest_path = self.manifest_path();
        let temp_path = self.path.join(MANIFEST_TEMP);

        let data = manifest.encode();
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &manifest_path)?;
        self.sync_directory()?;

        Ok(())
    }

    /// Syncs the directory so created, renamed and deleted entries are durable.
    ///
    /// NTFS journals metadata, so this is a no-op on Windows.
    #[cfg(unix)]
    pub fn sync_directory(&self) -> CoreResult<()> {
        let dir = File::open(&self.path)?;
        dir.sync_all()?;
        Ok(())
    }

    /// Syncs the directory so created, renamed and deleted entries are durable.
    ///
    /// NTFS journals metadata, so this is a no-op on Windows.
    #[cfg(not(unix))]
    pub fn sync_directory(&self) -> CoreResult<()> {
        Ok(())
    }
}

/// Reads the discard manifest in `path` without locking.
///
/// Returns `None` if the log has never recorded a discard.
pub fn read_manifest_in(path: &Path) -> CoreResult<Option<DiscardManifest>> {
    let manifest_path = path.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        return Ok(None);
    }

    let mut file = File::open(&manifest_path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    if data.is_empty() {
        return Ok(None);
    }

    DiscardManifest::decode(&data).map(Some)
}

/// Lists segment files in `path` in ascending id order, without locking.
///
/// Used by read-only tools that inspect a log another process may own.
pub fn list_segments_in(path: &Path) -> CoreResult<Vec<SegmentFile>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if let Some((version, id)) = parse_segment_file_name(&name.to_string_lossy()) {
            segments.push(SegmentFile {
                id,
                version,
                path: entry.path(),
            });
        }
    }
    segments.sort_by_key(|s| s.id);
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CommitLogPosition, TableId};
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let log_path = temp.path().join("new_log");

        assert!(!log_path.exists());
        let dir = LogDir::open(&log_path, true).unwrap();
        assert!(log_path.is_dir());
        assert_eq!(dir.path(), log_path);
    }

    #[test]
    fn open_fails_if_not_exists_and_no_create() {
        let temp = tempdir().unwrap();
        let result = LogDir::open(&temp.path().join("nonexistent"), false);
        assert!(matches!(result, Err(CoreError::InvalidConfig { .. })));
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let _dir1 = LogDir::open(temp.path(), true).unwrap();
        let result = LogDir::open(temp.path(), true);
        assert!(matches!(result, Err(CoreError::LogLocked)));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        {
            let _dir = LogDir::open(temp.path(), true).unwrap();
        }
        let _dir2 = LogDir::open(temp.path(), true).unwrap();
    }

    #[test]
    fn lists_segments_in_id_order() {
        let temp = tempdir().unwrap();
        let dir = LogDir::open(temp.path(), true).unwrap();

        for id in [30, 4, 100] {
            File::create(dir.segment_path(SegmentId::new(id))).unwrap();
        }
        File::create(dir.reserve_path(0)).unwrap();
        File::create(temp.path().join("notes.txt")).unwrap();

        let ids: Vec<u64> = dir
            .list_segments()
            .unwrap()
            .iter()
            .map(|s| s.id.as_u64())
            .collect();
        assert_eq!(ids, vec![4, 30, 100]);
    }

    #[test]
    fn stale_reserve_files_removed() {
        let temp = tempdir().unwrap();
        let dir = LogDir::open(temp.path(), true).unwrap();
        File::create(dir.reserve_path(0)).unwrap();
        File::create(dir.reserve_path(1)).unwrap();
        File::create(dir.segment_path(SegmentId::new(1))).unwrap();

        assert_eq!(dir.remove_stale_reserve_files().unwrap(), 2);
        assert!(!dir.reserve_path(0).exists());
        assert!(dir.segment_path(SegmentId::new(1)).exists());
    }

    #[test]
    fn manifest_round_trip() {
        let temp = tempdir().unwrap();
        let dir = LogDir::open(temp.path(), true).unwrap();

        assert!(dir.load_manifest().unwrap().is_none());

        let mut manifest = DiscardManifest::new();
        manifest.record_discard(
            TableId::new(1),
            CommitLogPosition::NONE,
            CommitLogPosition::new(SegmentId::new(8), 512),
        );
        manifest.note_segment(SegmentId::new(9));
        dir.save_manifest(&manifest).unwrap();

        assert_eq!(dir.load_manifest().unwrap(), Some(manifest));
        assert!(!temp.path().join(MANIFEST_TEMP).exists());
    }
}
