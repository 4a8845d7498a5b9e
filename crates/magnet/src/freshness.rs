//! Filesystem metadata used for the cache's freshness check.

use std::fs;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Kind of filesystem object a path names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Anything that is not a directory (regular files, devices, ...).
    File,
    /// A directory.
    Directory,
}

/// Result of a successful stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// What the path names.
    pub kind: FileKind,
    /// Last modification time in whole seconds since the Unix epoch.
    ///
    /// Sub-second changes are invisible to the freshness check.
    pub mtime: i64,
}

impl FileStat {
    /// Whether the path names a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// Source of existence, kind and modification time for script paths.
pub trait FreshnessOracle {
    /// Stat `path`, following symlinks.
    ///
    /// # Errors
    ///
    /// Returns the filesystem error unchanged so the caller can classify it.
    fn stat(&self, path: &Path) -> io::Result<FileStat>;
}

/// [`FreshnessOracle`] backed by the real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsOracle;

impl FreshnessOracle for FsOracle {
    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let metadata = fs::metadata(path)?;
        let kind = if metadata.is_dir() {
            FileKind::Directory
        } else {
            FileKind::File
        };

        Ok(FileStat {
            kind,
            mtime: unix_seconds(metadata.modified()?),
        })
    }
}

/// Truncate a timestamp to whole seconds relative to the Unix epoch.
fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_secs()).unwrap_or(i64::MAX),
        Err(before) => {
            let before = before.duration();
            let secs = i64::try_from(before.as_secs()).unwrap_or(i64::MAX);
            // Round towards negative infinity like st_mtime does.
            if before.subsec_nanos() > 0 {
                -secs - 1
            } else {
                -secs
            }
        }
    }
}
