//! Whole-file advisory locking with an explicit state machine.
//!
//! A [`LockHandle`] owns one open descriptor and moves between `Unlocked`,
//! `Shared`, and `Exclusive` on request, finishing in the terminal `Closed`
//! state. Locks are cooperative `flock(2)` locks: they bind other processes
//! only when those processes also take the lock, and they never prevent raw
//! reads or writes. Mode conversion follows `flock(2)` semantics and is not
//! atomic; a failed non-blocking conversion may leave the descriptor briefly
//! unlocked even though the handle still reports its previous mode.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use thiserror::Error;

use crate::retry::Backoff;

/// First pause between acquisition attempts on a contended lock.
const ACQUIRE_PAUSE_INITIAL: Duration = Duration::from_millis(100);
/// Growth factor applied to the acquisition pause.
const ACQUIRE_PAUSE_FACTOR: f64 = 1.2;
/// Longest pause between acquisition attempts.
const ACQUIRE_PAUSE_CEILING: Duration = Duration::from_secs(1);

/// Mode for lock files created by [`LockHandle::open`].
const LOCK_FILE_MODE: u32 = 0o664;

/// Externally visible state of a [`LockHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// The descriptor is open but no lock is held.
    Unlocked,
    /// A shared lock is held; other shared holders are admitted.
    Shared,
    /// An exclusive lock is held; every other holder is excluded.
    Exclusive,
    /// The descriptor has been released; the handle is finished.
    Closed,
}

/// How long an acquisition may wait when the lock is contended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// One attempt; contention surfaces as [`LockError::Contended`].
    Immediate,
    /// Poll until the deadline, then fail with [`LockError::Timeout`].
    Bounded(Duration),
    /// Block in the kernel until the lock is granted.
    Indefinite,
}

/// Failure modes of [`LockHandle`] operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// Opening or creating the lock file failed.
    #[error("failed to open lock file '{path}': {source}")]
    Open {
        /// File that could not be opened.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// A single non-blocking attempt found the lock held elsewhere.
    #[error("lock on '{path}' is held elsewhere")]
    Contended {
        /// Contended lock file.
        path: PathBuf,
    },
    /// The lock stayed contended for the whole bounded wait.
    #[error("lock on '{path}' still contended after {timeout:?}")]
    Timeout {
        /// Contended lock file.
        path: PathBuf,
        /// Bounded wait that lapsed.
        timeout: Duration,
    },
    /// The handle was used after [`LockHandle::close`]. This is caller
    /// misuse, not contention, and no retry will clear it.
    #[error("lock handle for '{path}' is closed")]
    Closed {
        /// File the handle used to manage.
        path: PathBuf,
    },
    /// The locking syscall failed for a reason other than contention.
    #[error("lock operation on '{path}' failed: {source}")]
    Os {
        /// Lock file involved.
        path: PathBuf,
        /// Underlying OS error.
        source: Errno,
    },
}

#[derive(Clone, Copy)]
enum Mode {
    Shared,
    Exclusive,
}

impl Mode {
    const fn flock_arg(self, blocking: bool) -> FlockArg {
        match (self, blocking) {
            (Self::Shared, true) => FlockArg::LockShared,
            (Self::Shared, false) => FlockArg::LockSharedNonblock,
            (Self::Exclusive, true) => FlockArg::LockExclusive,
            (Self::Exclusive, false) => FlockArg::LockExclusiveNonblock,
        }
    }

    fn wrap(self, lock: Flock<File>) -> Inner {
        match self {
            Self::Shared => Inner::Shared(lock),
            Self::Exclusive => Inner::Exclusive(lock),
        }
    }
}

enum Inner {
    Unlocked(File),
    Shared(Flock<File>),
    Exclusive(Flock<File>),
    Closed,
}

enum StepError {
    Contended,
    Closed,
    Os(Errno),
}

impl From<Errno> for StepError {
    fn from(errno: Errno) -> Self {
        if errno == Errno::EWOULDBLOCK || errno == Errno::EAGAIN {
            Self::Contended
        } else {
            Self::Os(errno)
        }
    }
}

/// Advisory whole-file lock over one open descriptor.
pub struct LockHandle {
    path: PathBuf,
    inner: Inner,
}

impl LockHandle {
    /// Opens (creating if absent, never truncating) `path` for locking.
    ///
    /// The file content is left untouched so a lock file may double as a
    /// data-bearing file, such as a pid file.
    ///
    /// # Errors
    /// [`LockError::Open`] when the file cannot be opened or created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let lock_path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(LOCK_FILE_MODE)
            .open(&lock_path)
            .map_err(|source| LockError::Open {
                path: lock_path.clone(),
                source,
            })?;
        Ok(Self::from_file(file, lock_path))
    }

    /// Wraps an already-open descriptor; `path` is kept for diagnostics.
    #[must_use]
    pub fn from_file(file: File, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: Inner::Unlocked(file),
        }
    }

    /// File this handle locks.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current state of the handle.
    #[must_use]
    pub const fn state(&self) -> LockState {
        match self.inner {
            Inner::Unlocked(_) => LockState::Unlocked,
            Inner::Shared(_) => LockState::Shared,
            Inner::Exclusive(_) => LockState::Exclusive,
            Inner::Closed => LockState::Closed,
        }
    }

    /// Borrows the underlying file for reading or writing alongside the
    /// lock, as pid-file owners do.
    ///
    /// # Errors
    /// [`LockError::Closed`] once the handle has been closed.
    pub fn file(&self) -> Result<&File, LockError> {
        match &self.inner {
            Inner::Unlocked(file) => Ok(file),
            Inner::Shared(lock) | Inner::Exclusive(lock) => Ok(lock),
            Inner::Closed => Err(LockError::Closed {
                path: self.path.clone(),
            }),
        }
    }

    /// Acquires (or converts to) a shared lock.
    ///
    /// Any number of shared holders, across processes, are admitted at once.
    /// An exclusive holder elsewhere blocks the acquisition according to
    /// `wait`.
    ///
    /// Converting a held lock is not atomic: `flock(2)` drops the old lock
    /// before checking for conflicts, so a failed non-blocking conversion
    /// can leave the file unlocked in the kernel while the handle still
    /// reports its previous mode.
    ///
    /// # Errors
    /// [`LockError::Contended`] or [`LockError::Timeout`] on contention, per
    /// `wait`; [`LockError::Closed`] after [`Self::close`]; [`LockError::Os`]
    /// for other syscall failures.
    pub fn shared(&mut self, wait: WaitMode) -> Result<(), LockError> {
        self.transition(Mode::Shared, wait)
    }

    /// Acquires (or converts to) an exclusive lock, excluding every other
    /// holder including shared ones.
    ///
    /// Converting from a held shared lock carries the same `flock(2)`
    /// non-atomicity caveat as [`Self::shared`].
    ///
    /// # Errors
    /// As for [`Self::shared`].
    pub fn exclusive(&mut self, wait: WaitMode) -> Result<(), LockError> {
        self.transition(Mode::Exclusive, wait)
    }

    /// Releases the held lock, keeping the descriptor open for reuse.
    ///
    /// Releasing an unlocked handle is a no-op. Release cannot contend,
    /// which is why this operation takes no [`WaitMode`] unlike
    /// [`Self::shared`] and [`Self::exclusive`]: `flock(2)` grants
    /// `LOCK_UN` unconditionally.
    ///
    /// # Errors
    /// [`LockError::Closed`] after [`Self::close`]; [`LockError::Os`] for
    /// syscall failures.
    pub fn unlock(&mut self) -> Result<(), LockError> {
        let previous = mem::replace(&mut self.inner, Inner::Closed);
        let (inner, outcome) = match previous {
            Inner::Closed => (Inner::Closed, Err(StepError::Closed)),
            Inner::Unlocked(file) => (Inner::Unlocked(file), Ok(())),
            Inner::Shared(lock) => match lock.unlock() {
                Ok(file) => (Inner::Unlocked(file), Ok(())),
                Err((lock, errno)) => (Inner::Shared(lock), Err(StepError::Os(errno))),
            },
            Inner::Exclusive(lock) => match lock.unlock() {
                Ok(file) => (Inner::Unlocked(file), Ok(())),
                Err((lock, errno)) => (Inner::Exclusive(lock), Err(StepError::Os(errno))),
            },
        };
        self.inner = inner;
        outcome.map_err(|step| self.lock_error(step))
    }

    /// Releases the lock and the descriptor; the handle becomes `Closed`.
    ///
    /// Closing twice is permitted and does nothing; any other operation on a
    /// closed handle is a contract violation reported as
    /// [`LockError::Closed`].
    pub fn close(&mut self) {
        self.inner = Inner::Closed;
    }

    fn transition(&mut self, target: Mode, wait: WaitMode) -> Result<(), LockError> {
        match wait {
            WaitMode::Indefinite => self
                .step(target, true)
                .map_err(|step| self.lock_error(step)),
            WaitMode::Immediate => self
                .step(target, false)
                .map_err(|step| self.lock_error(step)),
            WaitMode::Bounded(timeout) => {
                let deadline = Instant::now() + timeout;
                let mut pauses = Backoff::Exponential {
                    initial: ACQUIRE_PAUSE_INITIAL,
                    factor: ACQUIRE_PAUSE_FACTOR,
                    ceiling: ACQUIRE_PAUSE_CEILING,
                }
                .schedule();
                loop {
                    match self.step(target, false) {
                        Ok(()) => return Ok(()),
                        Err(StepError::Contended) => {
                            let now = Instant::now();
                            if now >= deadline {
                                return Err(LockError::Timeout {
                                    path: self.path.clone(),
                                    timeout,
                                });
                            }
                            thread::sleep(pauses.step().min(deadline - now));
                        }
                        Err(step) => return Err(self.lock_error(step)),
                    }
                }
            }
        }
    }

    /// One locking attempt; restores the previous state when it fails.
    fn step(&mut self, target: Mode, blocking: bool) -> Result<(), StepError> {
        let arg = target.flock_arg(blocking);
        let previous = mem::replace(&mut self.inner, Inner::Closed);
        let (inner, outcome) = match previous {
            Inner::Closed => (Inner::Closed, Err(StepError::Closed)),
            Inner::Unlocked(file) => match Flock::lock(file, arg) {
                Ok(lock) => (target.wrap(lock), Ok(())),
                Err((file, errno)) => (Inner::Unlocked(file), Err(errno.into())),
            },
            Inner::Shared(lock) => match lock.relock(arg) {
                Ok(()) => (target.wrap(lock), Ok(())),
                Err(errno) => (Inner::Shared(lock), Err(errno.into())),
            },
            Inner::Exclusive(lock) => match lock.relock(arg) {
                Ok(()) => (target.wrap(lock), Ok(())),
                Err(errno) => (Inner::Exclusive(lock), Err(errno.into())),
            },
        };
        self.inner = inner;
        outcome
    }

    fn lock_error(&self, step: StepError) -> LockError {
        match step {
            StepError::Contended => LockError::Contended {
                path: self.path.clone(),
            },
            StepError::Closed => LockError::Closed {
                path: self.path.clone(),
            },
            StepError::Os(source) => LockError::Os {
                path: self.path.clone(),
                source,
            },
        }
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("path", &self.path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;
    use std::path::PathBuf;
    use std::thread;
    use std::time::{Duration, Instant};

    use rstest::rstest;
    use tempfile::TempDir;

    use super::{LockError, LockHandle, LockState, WaitMode};

    fn lock_path(dir: &TempDir) -> PathBuf {
        dir.path().join("resource.lock")
    }

    #[test]
    fn open_creates_file_in_unlocked_state() {
        let dir = TempDir::new().expect("temp dir");
        let path = lock_path(&dir);
        let handle = LockHandle::open(&path).expect("open lock");
        assert_eq!(handle.state(), LockState::Unlocked);
        assert!(path.exists());
    }

    #[test]
    fn open_preserves_existing_content() {
        let dir = TempDir::new().expect("temp dir");
        let path = lock_path(&dir);
        fs::write(&path, "4721\n").expect("seed content");
        let mut handle = LockHandle::open(&path).expect("open lock");
        handle.exclusive(WaitMode::Immediate).expect("lock");
        assert_eq!(fs::read_to_string(&path).expect("read back"), "4721\n");
    }

    #[rstest]
    #[case(false, false, true)]
    #[case(false, true, false)]
    #[case(true, false, false)]
    #[case(true, true, false)]
    fn contention_matrix(
        #[case] holder_exclusive: bool,
        #[case] probe_exclusive: bool,
        #[case] probe_succeeds: bool,
    ) {
        let dir = TempDir::new().expect("temp dir");
        let path = lock_path(&dir);
        let mut holder = LockHandle::open(&path).expect("holder open");
        if holder_exclusive {
            holder.exclusive(WaitMode::Immediate).expect("holder lock");
        } else {
            holder.shared(WaitMode::Immediate).expect("holder lock");
        }

        let mut probe = LockHandle::open(&path).expect("probe open");
        let outcome = if probe_exclusive {
            probe.exclusive(WaitMode::Immediate)
        } else {
            probe.shared(WaitMode::Immediate)
        };
        if probe_succeeds {
            outcome.expect("probe admitted");
        } else {
            assert!(matches!(outcome, Err(LockError::Contended { .. })));
            assert_eq!(probe.state(), LockState::Unlocked);
        }
    }

    #[test]
    fn converts_between_modes_without_unlocking() {
        let dir = TempDir::new().expect("temp dir");
        let mut handle = LockHandle::open(lock_path(&dir)).expect("open lock");
        handle.shared(WaitMode::Immediate).expect("shared");
        assert_eq!(handle.state(), LockState::Shared);
        handle.exclusive(WaitMode::Immediate).expect("upgrade");
        assert_eq!(handle.state(), LockState::Exclusive);
        handle.shared(WaitMode::Immediate).expect("downgrade");
        assert_eq!(handle.state(), LockState::Shared);
    }

    #[test]
    fn downgrade_admits_other_shared_holders() {
        let dir = TempDir::new().expect("temp dir");
        let path = lock_path(&dir);
        let mut holder = LockHandle::open(&path).expect("holder open");
        holder.exclusive(WaitMode::Immediate).expect("exclusive");
        holder.shared(WaitMode::Immediate).expect("downgrade");

        let mut probe = LockHandle::open(&path).expect("probe open");
        probe.shared(WaitMode::Immediate).expect("shared admitted");
    }

    #[test]
    fn failed_upgrade_restores_state_but_surrenders_the_kernel_lock() {
        let dir = TempDir::new().expect("temp dir");
        let path = lock_path(&dir);
        let mut first = LockHandle::open(&path).expect("first open");
        first.shared(WaitMode::Immediate).expect("first shared");
        let mut second = LockHandle::open(&path).expect("second open");
        second.shared(WaitMode::Immediate).expect("second shared");

        let outcome = first.exclusive(WaitMode::Immediate);
        assert!(matches!(outcome, Err(LockError::Contended { .. })));
        assert_eq!(first.state(), LockState::Shared);

        // flock(2) dropped the first holder's lock before detecting the
        // conflict, so only the second holder's lock remains in the kernel
        // and its own upgrade now goes through.
        second.exclusive(WaitMode::Immediate).expect("second upgrade");
        assert_eq!(second.state(), LockState::Exclusive);
    }

    #[test]
    fn unlock_releases_for_other_handles() {
        let dir = TempDir::new().expect("temp dir");
        let path = lock_path(&dir);
        let mut holder = LockHandle::open(&path).expect("holder open");
        holder.exclusive(WaitMode::Immediate).expect("exclusive");
        holder.unlock().expect("unlock");
        assert_eq!(holder.state(), LockState::Unlocked);

        let mut probe = LockHandle::open(&path).expect("probe open");
        probe.exclusive(WaitMode::Immediate).expect("now free");
    }

    #[test]
    fn unlock_when_already_unlocked_is_a_no_op() {
        let dir = TempDir::new().expect("temp dir");
        let mut handle = LockHandle::open(lock_path(&dir)).expect("open lock");
        handle.unlock().expect("no-op unlock");
        assert_eq!(handle.state(), LockState::Unlocked);
    }

    #[test]
    fn unlock_succeeds_immediately_even_while_others_hold_the_lock() {
        let dir = TempDir::new().expect("temp dir");
        let path = lock_path(&dir);
        let mut leaver = LockHandle::open(&path).expect("leaver open");
        leaver.shared(WaitMode::Immediate).expect("leaver shared");
        let mut stayer = LockHandle::open(&path).expect("stayer open");
        stayer.shared(WaitMode::Immediate).expect("stayer shared");

        leaver.unlock().expect("release never contends");
        assert_eq!(leaver.state(), LockState::Unlocked);
        assert_eq!(stayer.state(), LockState::Shared);
    }

    #[test]
    fn bounded_wait_times_out_against_live_holder() {
        let dir = TempDir::new().expect("temp dir");
        let path = lock_path(&dir);
        let mut holder = LockHandle::open(&path).expect("holder open");
        holder.exclusive(WaitMode::Immediate).expect("exclusive");

        let timeout = Duration::from_millis(150);
        let mut probe = LockHandle::open(&path).expect("probe open");
        let started = Instant::now();
        let outcome = probe.exclusive(WaitMode::Bounded(timeout));
        let elapsed = started.elapsed();
        assert!(matches!(outcome, Err(LockError::Timeout { .. })));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(500));
    }

    #[test]
    fn bounded_wait_succeeds_once_holder_releases() {
        let dir = TempDir::new().expect("temp dir");
        let path = lock_path(&dir);
        let mut holder = LockHandle::open(&path).expect("holder open");
        holder.exclusive(WaitMode::Immediate).expect("exclusive");

        let contended_path = path.clone();
        let waiter = thread::spawn(move || {
            let mut probe = LockHandle::open(&contended_path).expect("probe open");
            probe.exclusive(WaitMode::Bounded(Duration::from_secs(10)))
        });
        thread::sleep(Duration::from_millis(50));
        drop(holder);
        let outcome = waiter.join().expect("waiter thread");
        outcome.expect("lock granted after release");
    }

    #[test]
    fn closed_handle_rejects_every_operation() {
        let dir = TempDir::new().expect("temp dir");
        let mut handle = LockHandle::open(lock_path(&dir)).expect("open lock");
        handle.exclusive(WaitMode::Immediate).expect("exclusive");
        handle.close();
        assert_eq!(handle.state(), LockState::Closed);
        assert!(matches!(
            handle.shared(WaitMode::Immediate),
            Err(LockError::Closed { .. })
        ));
        assert!(matches!(
            handle.exclusive(WaitMode::Indefinite),
            Err(LockError::Closed { .. })
        ));
        assert!(matches!(handle.unlock(), Err(LockError::Closed { .. })));
        assert!(matches!(handle.file(), Err(LockError::Closed { .. })));
        // Idempotent.
        handle.close();
        assert_eq!(handle.state(), LockState::Closed);
    }

    #[test]
    fn close_releases_the_lock_for_others() {
        let dir = TempDir::new().expect("temp dir");
        let path = lock_path(&dir);
        let mut holder = LockHandle::open(&path).expect("holder open");
        holder.exclusive(WaitMode::Immediate).expect("exclusive");
        holder.close();

        let mut probe = LockHandle::open(&path).expect("probe open");
        probe.exclusive(WaitMode::Immediate).expect("freed by close");
    }

    #[test]
    fn from_file_wraps_a_caller_opened_descriptor() {
        let dir = TempDir::new().expect("temp dir");
        let path = lock_path(&dir);
        fs::write(&path, "content").expect("seed file");
        let file = fs::File::open(&path).expect("read-only open");
        let mut handle = LockHandle::from_file(file, &path);
        handle.exclusive(WaitMode::Immediate).expect("lock via fd");
        assert_eq!(handle.state(), LockState::Exclusive);
    }

    #[test]
    fn locked_file_accepts_io_through_the_handle() {
        let dir = TempDir::new().expect("temp dir");
        let path = lock_path(&dir);
        let mut handle = LockHandle::open(&path).expect("open lock");
        handle.exclusive(WaitMode::Immediate).expect("exclusive");
        let mut file = handle.file().expect("borrow file");
        file.write_all(b"817\n").expect("write through lock");
        file.sync_all().expect("sync");
        assert_eq!(fs::read_to_string(&path).expect("read back"), "817\n");
    }
}
