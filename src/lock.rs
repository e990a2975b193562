//! One-controller-per-repo mutual exclusion.
//!
//! A kernel-enforced advisory lock on `cs.lock` inside the state directory.
//! The lock dies with the process, so there is no stale-lock cleanup.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;

const LOCK_FILE: &str = "cs.lock";

#[derive(Debug, Error)]
pub enum LockError {
    /// The grep-pable "someone else owns this repo" error.
    #[error("another cs instance is running in this repo (PID {holder})")]
    Held { holder: String },
    #[error("failed to open lock file at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Exclusive lock on a repository's state directory.
///
/// Held from controller startup to controller exit; dropping it releases the
/// kernel lock and unlinks the file. On crash the kernel releases the lock
/// and the leftover file is harmless (the PID inside is only advisory).
#[derive(Debug)]
pub struct ProcessLock {
    // NOTE(lifetime): held to maintain the exclusive file lock; released on drop
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl ProcessLock {
    /// Acquire the non-blocking exclusive lock for `state_dir`, writing our
    /// PID into the lock file.
    ///
    /// Fails with [`LockError::Held`] when another process holds it; the
    /// holder's PID is read from the file when possible.
    pub fn acquire(state_dir: &Path) -> Result<Self, LockError> {
        let path = state_dir.join(LOCK_FILE);
        // Avoid truncating before we hold the lock, which would wipe the
        // running controller's PID.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;

        if file.try_lock_exclusive().is_err() {
            let holder = fs::read_to_string(&path)
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(LockError::Held { holder });
        }

        // Truncate and write our PID now that the lock is ours.
        let write = |file: &mut File| -> std::io::Result<()> {
            file.set_len(0)?;
            writeln!(file, "{}", std::process::id())?;
            file.flush()
        };
        write(&mut file).map_err(|source| LockError::Io {
            path: path.clone(),
            source,
        })?;

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}
