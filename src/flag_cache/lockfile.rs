//! Advisory lock on a signal's cache directory.
//!
//! Two flagging runs writing the same cache key interleave their leaf
//! writes. Jobs with `lock_cache` enabled take this lock first; without it
//! the cache is last-writer-wins.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error(
        "cache directory {} is locked by another epiflag run (PID: {pid}); \
         if no such run exists remove {}",
        dir.display(),
        lock_path.display()
    )]
    Held {
        pid: u32,
        dir: PathBuf,
        lock_path: PathBuf,
    },

    #[error("lock file I/O ({}): {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Held for the lifetime of one flagging job; released on drop.
#[derive(Debug)]
pub struct CacheLock {
    lock_path: PathBuf,
    owned: bool,
}

impl CacheLock {
    const LOCK_FILE_NAME: &'static str = ".epiflag.lock";

    /// Acquire the lock for `dir`, creating the directory if needed.
    ///
    /// A lock file left by a process that is no longer running is removed.
    pub fn acquire<P: AsRef<Path>>(dir: P) -> Result<Self, LockError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|source| LockError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let lock_path = dir.join(Self::LOCK_FILE_NAME);

        if lock_path.exists() {
            match Self::check_existing_lock(&lock_path) {
                Ok(Some(pid)) => {
                    return Err(LockError::Held {
                        pid,
                        dir: dir.to_path_buf(),
                        lock_path,
                    });
                }
                Ok(None) => {
                    tracing::info!(path = %lock_path.display(), "Removing stale cache lock");
                    fs::remove_file(&lock_path).map_err(|source| LockError::Io {
                        path: lock_path.clone(),
                        source,
                    })?;
                }
                Err(e) => {
                    tracing::warn!(path = %lock_path.display(), error = %e, "Unreadable cache lock, replacing it");
                    let _ = fs::remove_file(&lock_path);
                }
            }
        }

        let pid = std::process::id();
        let io_err = |source| LockError::Io {
            path: lock_path.clone(),
            source,
        };
        let mut file = File::create(&lock_path).map_err(io_err)?;
        writeln!(file, "{pid}").map_err(io_err)?;

        tracing::debug!(pid, path = %lock_path.display(), "Acquired cache lock");

        Ok(Self {
            lock_path,
            owned: true,
        })
    }

    /// `Ok(Some(pid))` if a running process holds the lock, `Ok(None)` if
    /// the lock is stale.
    fn check_existing_lock(lock_path: &Path) -> std::io::Result<Option<u32>> {
        let mut contents = String::new();
        File::open(lock_path)?.read_to_string(&mut contents)?;
        let pid: u32 = contents
            .trim()
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        if pid == std::process::id() || Self::is_process_running(pid) {
            Ok(Some(pid))
        } else {
            Ok(None)
        }
    }

    #[cfg(unix)]
    fn is_process_running(pid: u32) -> bool {
        fs::read_to_string(format!("/proc/{pid}/cmdline"))
            .map(|cmdline| cmdline.contains("epiflag"))
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    fn is_process_running(_pid: u32) -> bool {
        true
    }

    /// Release the lock (called automatically on drop).
    pub fn release(&mut self) {
        if self.owned {
            if let Err(e) = fs::remove_file(&self.lock_path) {
                tracing::warn!(error = %e, "Failed to remove cache lock");
            } else {
                tracing::debug!(path = %self.lock_path.display(), "Released cache lock");
            }
            self.owned = false;
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        self.release();
    }
}
