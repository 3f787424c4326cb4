//! File-based locking for single-writer safety.
//!
//! Cross-platform (fs2) advisory locks. Exactly one backup or restore may
//! be active per vault root; a second request must fail fast instead of
//! queueing silently.
//!
//! Lock file path: <root>/LOCK
//! Lock is released on Drop.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::errors::AlreadyInProgressError;

pub struct LockGuard {
    file: std::fs::File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // fs2 unlock errors on drop are ignored deliberately.
        let _ = self.file.unlock();
    }
}

fn lock_file_path(root: &Path) -> PathBuf {
    root.join("LOCK")
}

fn open_lock_file(root: &Path) -> Result<std::fs::File> {
    let path = lock_file_path(root);
    let f = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("open lock file {}", path.display()))?;
    Ok(f)
}

/// Try to take the exclusive per-target lock. Contention maps to
/// AlreadyInProgressError so callers can distinguish "busy" from IO failure.
pub fn try_acquire_exclusive_lock(root: &Path) -> Result<LockGuard> {
    let file = open_lock_file(root)?;
    if file.try_lock_exclusive().is_err() {
        return Err(AlreadyInProgressError(root.display().to_string()).into());
    }
    Ok(LockGuard {
        file,
        path: lock_file_path(root),
    })
}
