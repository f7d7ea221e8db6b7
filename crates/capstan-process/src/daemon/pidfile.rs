//! Pid files as lock-backed liveness records.
//!
//! The kernel lock, not the number in the file, is what proves a daemon is
//! alive: the text merely names the pid for humans and for
//! [`read_locked_pid_file`]. A crashed daemon leaves its file behind, but
//! the lock dies with it, so stale files cost nothing beyond disk bytes.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use capstan_sync::{LockError, LockHandle, WaitMode};
use tracing::{debug, warn};

use super::DAEMON_TARGET;
use super::errors::DaemonError;

/// Pid files are private to the owning user.
const PID_FILE_MODE: u32 = 0o600;

/// A claimed pid file: its path, the recorded pid, and the exclusive lock
/// backing the claim.
///
/// Dropping the record releases the lock but leaves the file behind;
/// [`super::DaemonSupervisor::remove_pid_file`] deletes it.
#[derive(Debug)]
pub struct PidFileRecord {
    path: PathBuf,
    pid: i32,
    lock: LockHandle,
}

impl PidFileRecord {
    /// Path of the claimed pid file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pid recorded in the file.
    #[must_use]
    pub const fn pid(&self) -> i32 {
        self.pid
    }

    /// Raw descriptor of the held lock, for pre-exec plumbing.
    pub(crate) fn lock_fd(&self) -> Option<RawFd> {
        self.lock.file().ok().map(AsRawFd::as_raw_fd)
    }
}

/// Opens `path` without truncating, takes the exclusive lock, and only
/// then rewrites the content with `pid`.
///
/// Truncating before the lock is held would wipe a live daemon's record,
/// which is why the open leaves existing bytes alone. Runs in forked
/// children before exec, so it must not touch the tracing subscriber;
/// parent-side callers log the outcome themselves.
pub(crate) fn claim_pid_file(path: &Path, pid: i32) -> Result<PidFileRecord, DaemonError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(PID_FILE_MODE)
        .open(path)
        .map_err(|source| DaemonError::PidFileOpen {
            path: path.to_path_buf(),
            source,
        })?;
    let mut lock = LockHandle::from_file(file, path);
    match lock.exclusive(WaitMode::Immediate) {
        Ok(()) => {}
        Err(LockError::Contended { .. }) => {
            return Err(DaemonError::AlreadyLocked {
                path: path.to_path_buf(),
                owner: parse_pid(path),
            });
        }
        Err(source) => return Err(source.into()),
    }
    write_through(&lock, pid).map_err(|source| DaemonError::PidFileWrite {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(PidFileRecord {
        path: path.to_path_buf(),
        pid,
        lock,
    })
}

/// Deletes `path`, tolerating absence.
pub(crate) fn remove_pid_file(path: &Path) -> Result<(), DaemonError> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(target: DAEMON_TARGET, file = %path.display(), "pid file removed");
            Ok(())
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(DaemonError::PidFileRemove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Reads the pid recorded in `path`.
///
/// Returns `0` when the file is missing or holds nothing parseable; other
/// read failures are logged and also yield `0`. The pid is advisory:
/// whether anything still holds the file locked is a separate question,
/// answered by [`read_locked_pid_file`].
#[must_use]
pub fn read_pid_file(path: &Path) -> i32 {
    match fs::read_to_string(path) {
        Ok(content) => match content.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => pid,
            Ok(_) | Err(_) => {
                debug!(target: DAEMON_TARGET, file = %path.display(), "pid file holds no usable pid");
                0
            }
        },
        Err(error) if error.kind() == io::ErrorKind::NotFound => 0,
        Err(error) => {
            warn!(target: DAEMON_TARGET, file = %path.display(), %error, "failed to read pid file");
            0
        }
    }
}

/// Reads the pid from `path` only if some process holds the file locked.
///
/// `Ok(None)` means there is no live owner: the file is missing, or
/// nothing holds its lock and any recorded pid is stale. A locked file
/// whose content is garbage is logged and also reported as `Ok(None)`.
/// The probe takes the lock momentarily when it can, so callers must not
/// use this on a file they themselves hold.
///
/// # Errors
/// [`DaemonError::PidFileRead`] when the file exists but cannot be
/// opened; [`DaemonError::Lock`] when the probe itself fails.
pub fn read_locked_pid_file(path: &Path) -> Result<Option<i32>, DaemonError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(DaemonError::PidFileRead {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let mut probe = LockHandle::from_file(file, path);
    match probe.exclusive(WaitMode::Immediate) {
        // The lock was free, so whatever the file says is stale.
        Ok(()) => Ok(None),
        Err(LockError::Contended { .. }) => match parse_pid(path) {
            Some(pid) => Ok(Some(pid)),
            None => {
                warn!(target: DAEMON_TARGET, file = %path.display(), "locked pid file holds no usable pid");
                Ok(None)
            }
        },
        Err(source) => Err(source.into()),
    }
}

/// Truncates and rewrites the locked file; only meaningful under the lock.
fn write_through(lock: &LockHandle, pid: i32) -> Result<(), io::Error> {
    let file = lock.file().map_err(io::Error::other)?;
    file.set_len(0)?;
    let mut writer = file;
    writeln!(writer, "{pid}")?;
    file.sync_all()?;
    Ok(())
}

/// Pid parse without logging; the fork-side claim path depends on that.
fn parse_pid(path: &Path) -> Option<i32> {
    let content = fs::read_to_string(path).ok()?;
    content.trim().parse().ok().filter(|pid| *pid > 0)
}
