//! Host-local exclusive run lock backed by `flock(2)`.
//!
//! The lock lives on an open file description, so the kernel drops it when the
//! holding process exits for any reason, SIGKILL included. A second acquire of
//! the same name from the same process opens a new description and therefore
//! fails like any other contender.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

const LOCK_FILE_PREFIX: &str = "park_";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock '{name}' is held by another run (holder pid: {holder_pid:?})")]
    Held {
        name: String,
        path: PathBuf,
        holder_pid: Option<u32>,
    },
    #[error("invalid lock name {0:?}: use ASCII letters, digits, '-' or '_'")]
    InvalidName(String),
    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Named job lock, e.g. `sync-parking`.
#[derive(Debug, Clone)]
pub struct RunLock {
    name: String,
    path: PathBuf,
}

impl RunLock {
    pub fn new(name: &str, lock_dir: impl AsRef<Path>) -> Result<Self, LockError> {
        let valid = !name.is_empty()
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(LockError::InvalidName(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            path: lock_dir
                .as_ref()
                .join(format!("{LOCK_FILE_PREFIX}{name}.lock")),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock without waiting. Contention fails with [`LockError::Held`].
    pub fn acquire(&self) -> Result<RunGuard, LockError> {
        let io_err = |source| LockError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        // No truncation here: the current holder's pid must survive a failed attempt.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(io_err)?;

        match try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                return Err(LockError::Held {
                    name: self.name.clone(),
                    path: self.path.clone(),
                    holder_pid: read_holder_pid(&mut file),
                });
            }
            Err(err) => return Err(io_err(err)),
        }

        let pid = std::process::id();
        if let Err(err) = write_pid(&mut file, pid) {
            let _ = unlock(&file);
            return Err(io_err(err));
        }

        debug!(lock = %self.name, pid, path = %self.path.display(), "run lock acquired");
        Ok(RunGuard {
            name: self.name.clone(),
            path: self.path.clone(),
            file: Some(file),
        })
    }
}

/// Proof of lock ownership. Released by [`RunGuard::release`] or, failing that, on drop.
#[derive(Debug)]
pub struct RunGuard {
    name: String,
    path: PathBuf,
    file: Option<File>,
}

impl RunGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> Result<(), LockError> {
        self.unlock_held()
    }

    fn unlock_held(&mut self) -> Result<(), LockError> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        unlock(&file).map_err(|source| LockError::Io {
            path: self.path.clone(),
            source,
        })?;
        debug!(lock = %self.name, "run lock released");
        Ok(())
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Err(err) = self.unlock_held() {
            // Closing the descriptor still drops the flock.
            warn!(lock = %self.name, error = %err, "explicit unlock failed");
        }
    }
}

fn write_pid(file: &mut File, pid: u32) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "{pid}")?;
    file.flush()
}

fn read_holder_pid(file: &mut File) -> Option<u32> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut text).ok()?;
    text.trim().parse().ok()
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: as above.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "run locks require flock(2)",
    ))
}

#[cfg(not(unix))]
fn unlock(_file: &File) -> io::Result<()> {
    Ok(())
}
