//! Liveness probes and graceful-then-forced termination.

use std::thread;
use std::time::{Duration, Instant};

use capstan_sync::Backoff;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::DAEMON_TARGET;
use super::errors::DaemonError;

/// Grace period [`KillOptions::default`] allows before SIGKILL.
const KILL_GRACE_TIMEOUT: Duration = Duration::from_secs(30);
/// Liveness poll pause curve while waiting out a termination.
const KILL_POLL_INITIAL: Duration = Duration::from_millis(10);
const KILL_POLL_FACTOR: f64 = 1.5;
const KILL_POLL_CEILING: Duration = Duration::from_millis(100);

/// Tuning for [`kill_process`].
#[derive(Debug)]
pub struct KillOptions {
    /// Signal sent first, before any escalation.
    pub signal: Signal,
    /// Grace period before escalating to `SIGKILL`. Zero sends the first
    /// signal and returns without waiting.
    pub timeout: Duration,
    /// Reap the target with `waitpid` when it is a direct child; without
    /// this a terminated child sits as a zombie and keeps reading as
    /// alive.
    pub reap: bool,
}

impl Default for KillOptions {
    fn default() -> Self {
        Self {
            signal: Signal::SIGTERM,
            timeout: KILL_GRACE_TIMEOUT,
            reap: false,
        }
    }
}

/// Whether `pid` names a live process.
///
/// Probes with the null signal; a permission refusal still proves the
/// process exists. Non-positive pids address process groups rather than
/// single processes and always report dead here.
#[must_use]
pub fn is_process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

/// Terminates `pid`, escalating to SIGKILL when it lingers.
///
/// Sends `options.signal`, polls liveness on a short exponential schedule
/// until `options.timeout` has passed, and force-kills whatever is still
/// alive at the deadline. A target that is already dead is a success.
///
/// # Errors
/// [`DaemonError::InvalidPid`] for non-positive pids, which would address
/// a whole process group; [`DaemonError::Signal`] when the kernel refuses
/// a delivery.
pub fn kill_process(pid: i32, options: &KillOptions) -> Result<(), DaemonError> {
    if pid <= 0 {
        return Err(DaemonError::InvalidPid { pid });
    }
    let target = Pid::from_raw(pid);
    if !is_process_alive(pid) {
        if options.reap {
            reap_nonblocking(target);
        }
        debug!(target: DAEMON_TARGET, pid, "process already dead");
        return Ok(());
    }
    send(target, options.signal)?;
    debug!(target: DAEMON_TARGET, pid, signal = %options.signal, "termination signal sent");
    if options.timeout.is_zero() {
        return Ok(());
    }

    let deadline = Instant::now() + options.timeout;
    let mut pauses = Backoff::Exponential {
        initial: KILL_POLL_INITIAL,
        factor: KILL_POLL_FACTOR,
        ceiling: KILL_POLL_CEILING,
    }
    .schedule();
    loop {
        if options.reap {
            reap_nonblocking(target);
        }
        if !is_process_alive(pid) {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(pauses.step().min(deadline - now));
    }

    warn!(target: DAEMON_TARGET, pid, "termination signal ignored, escalating to SIGKILL");
    send(target, Signal::SIGKILL)?;
    if options.reap {
        reap_nonblocking(target);
    }
    Ok(())
}

/// Signal delivery where a target that died first counts as delivered.
fn send(target: Pid, signal: Signal) -> Result<(), DaemonError> {
    match kill(target, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(DaemonError::Signal {
            pid: target.as_raw(),
            source,
        }),
    }
}

/// Collects a zombie child without blocking. Failure means the target is
/// not our child; the liveness probe stays authoritative either way.
fn reap_nonblocking(target: Pid) {
    let _ = waitpid(target, Some(WaitPidFlag::WNOHANG));
}
