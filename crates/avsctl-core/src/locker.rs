//! Advisory file locks on directories
//!
//! Every mutating operation on an instance directory (and the monitoring
//! directory) is bracketed by an exclusive lock on its `.lock` file.
//! Exclusion is process-wide among cooperating processes; re-entry is not
//! supported and never needed here.

use crate::{CoreError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// An exclusive lock on a directory, held through a lockfile inside it.
/// Released on drop; `release()` surfaces unlock errors when they matter.
#[derive(Debug)]
pub struct DirLock {
    file: Option<File>,
    path: PathBuf,
}

impl DirLock {
    /// Acquire the lock, blocking until it is available. Creates the
    /// lockfile if missing.
    pub fn acquire(lock_path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path)
            .map_err(|e| CoreError::Lock {
                path: lock_path.to_path_buf(),
                source: e,
            })?;

        file.lock_exclusive().map_err(|e| CoreError::Lock {
            path: lock_path.to_path_buf(),
            source: e,
        })?;

        Ok(Self {
            file: Some(file),
            path: lock_path.to_path_buf(),
        })
    }

    /// The lockfile path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly, surfacing unlock errors
    pub fn release(mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.unlock().map_err(|e| CoreError::Lock {
                path: self.path.clone(),
                source: e,
            })?;
        }
        Ok(())
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.unlock() {
                tracing::warn!("Failed to unlock {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Probe whether some other handle currently holds the lock
pub fn is_locked(lock_path: &Path) -> bool {
    let Ok(file) = OpenOptions::new().write(true).open(lock_path) else {
        return false;
    };
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.unlock();
            false
        }
        Err(_) => true,
    }
}
