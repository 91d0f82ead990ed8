//! Singleton lock: at most one live instance per role.
//!
//! The lock file holds the owner's pid. A lock whose pid is no longer alive
//! (or whose contents do not parse) is stale and is taken over.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::group;
use crate::error::LockError;

/// Held lock. Dropping it removes the file if it still names this process.
#[derive(Debug)]
pub struct SingletonLock {
    path: PathBuf,
    pid: u32,
}

impl SingletonLock {
    /// Acquire the lock for the current process.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        Self::acquire_as(path, std::process::id())
    }

    /// Acquire the lock on behalf of `pid`.
    pub fn acquire_as(path: impl Into<PathBuf>, pid: u32) -> Result<Self, LockError> {
        let path = path.into();
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        // Two rounds: a stale lock is removed once, then creation is retried.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(pid.to_string().as_bytes()).map_err(io_err)?;
                    file.sync_all().map_err(io_err)?;
                    info!(path = %path.display(), pid, "Acquired singleton lock");
                    return Ok(Self { path, pid });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(io_err(e)),
            }

            match read_holder(&path) {
                Some(holder) if group::is_alive(holder) => {
                    return Err(LockError::AlreadyRunning { pid: holder, path });
                }
                holder => {
                    warn!(path = %path.display(), stale_pid = ?holder, "Removing stale lock");
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(io_err(e)),
                    }
                }
            }
        }

        // Someone else recreated it between our removal and retry.
        match read_holder(&path) {
            Some(pid) => Err(LockError::AlreadyRunning { pid, path }),
            None => Err(io_err(std::io::Error::from(ErrorKind::AlreadyExists))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        if read_holder(&self.path) == Some(self.pid) {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to remove lock file");
            }
        }
    }
}

/// Pid recorded in a lock file, if it exists and parses.
pub fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Pid of a live holder, if any.
pub fn live_holder(path: &Path) -> Option<u32> {
    read_holder(path).filter(|pid| group::is_alive(*pid))
}
