// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Free-space probing.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

/// One gigabyte, in bytes.
pub const GB: u64 = 1_000_000_000;

/// Free-space query for a filesystem path.
pub trait DiskUsage: Send + Sync {
    /// Bytes available to an unprivileged writer on the filesystem holding
    /// `path`.
    fn free_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// [`DiskUsage`] backed by `statvfs(3)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsDiskUsage;

impl DiskUsage for StatvfsDiskUsage {
    fn free_bytes(&self, path: &Path) -> io::Result<u64> {
        use std::os::unix::ffi::OsStrExt;

        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        // SAFETY: `c_path` is a valid NUL-terminated string and `stat` is a
        // plain C struct that statvfs fully initializes on success.
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        #[allow(clippy::unnecessary_cast)]
        let free = stat.f_bavail as u64 * stat.f_frsize as u64;
        Ok(free)
    }
}

/// Fixed free-space figures per root, for tests and dry runs.
///
/// Paths are matched by longest root prefix; unknown paths report
/// `NotFound`.
#[derive(Debug, Default)]
pub struct FixedDiskUsage {
    free: Mutex<HashMap<PathBuf, u64>>,
}

impl FixedDiskUsage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(self, root: impl Into<PathBuf>, free_bytes: u64) -> Self {
        self.set(root, free_bytes);
        self
    }

    /// Set (or change) the free space reported under `root`.
    pub fn set(&self, root: impl Into<PathBuf>, free_bytes: u64) {
        self.free.lock().insert(root.into(), free_bytes);
    }
}

impl DiskUsage for FixedDiskUsage {
    fn free_bytes(&self, path: &Path) -> io::Result<u64> {
        let free = self.free.lock();
        free.iter()
            .filter(|(root, _)| path.starts_with(root))
            .max_by_key(|(root, _)| root.components().count())
            .map(|(_, bytes)| *bytes)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no disk figure for {}", path.display()),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statvfs_reports_temp_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let free = StatvfsDiskUsage.free_bytes(dir.path()).expect("statvfs");
        assert!(free > 0);
    }

    #[test]
    fn test_statvfs_missing_path_errors() {
        assert!(StatvfsDiskUsage
            .free_bytes(Path::new("/definitely/not/a/mount/point"))
            .is_err());
    }

    #[test]
    fn test_fixed_longest_prefix_wins() {
        let disk = FixedDiskUsage::new()
            .with("/mnt", 1)
            .with("/mnt/ssd", 50 * GB);

        assert_eq!(disk.free_bytes(Path::new("/mnt/ssd/recordings")).expect("ssd"), 50 * GB);
        assert_eq!(disk.free_bytes(Path::new("/mnt/hdd")).expect("mnt"), 1);
        assert!(disk.free_bytes(Path::new("/srv")).is_err());

        disk.set("/mnt/ssd", 0);
        assert_eq!(disk.free_bytes(Path::new("/mnt/ssd")).expect("ssd"), 0);
    }
}
