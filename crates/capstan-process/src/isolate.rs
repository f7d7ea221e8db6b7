//! Runs an operation in a disposable forked child.
//!
//! [`run_isolated`] forks, computes the operation in the child, and ships
//! the outcome back through a pipe as one JSON document. The child always
//! leaves through `_exit(0)`: its exit status is never authoritative, only
//! the pipe payload is. Operations with process-wide side effects, such as
//! taking an advisory lock to probe contention, can therefore run without
//! perturbing any state in the caller.

use std::fs::File;
use std::io::{self, Read};
use std::panic::{self, AssertUnwindSafe};

use nix::errno::Errno;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, pipe};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::fdio;

const ISOLATE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::isolate");

/// Wire form of the child's outcome, one JSON document on the pipe.
#[derive(Debug, Serialize, Deserialize)]
enum Verdict<T, E> {
    Completed(T),
    Raised(E),
}

/// Failure modes of [`run_isolated`].
#[derive(Debug, Error)]
pub enum IsolationError<E> {
    /// The isolated operation itself reported an error; this is its
    /// decoded equivalent.
    #[error("isolated operation failed: {0}")]
    Raised(E),
    /// Fork or pipe creation failed; nothing ran.
    #[error("failed to launch isolated child: {source}")]
    Launch {
        /// Underlying OS error.
        source: Errno,
    },
    /// Reading the verdict or reaping the child failed in the caller.
    #[error("failed to collect isolated verdict: {source}")]
    Collect {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The child died by signal or delivered no decodable verdict. The
    /// operation may have run partially; nothing can be assumed about it.
    #[error("isolated child terminated abnormally: {detail}")]
    Abnormal {
        /// Signal, exit, or decoding detail.
        detail: String,
    },
}

/// Runs `op` in a forked child and returns its outcome.
///
/// The value and error types cross the process boundary as JSON, so both
/// must serialise; a panic inside `op` is not transported and surfaces as
/// [`IsolationError::Abnormal`]. The child inherits only the calling
/// thread; operations must not depend on the caller's other threads.
///
/// # Errors
/// [`IsolationError::Raised`] re-raises the operation's own error;
/// [`IsolationError::Launch`]/[`IsolationError::Collect`] report plumbing
/// failures; [`IsolationError::Abnormal`] reports a child that died by
/// signal or wrote no valid verdict.
pub fn run_isolated<T, E, F>(op: F) -> Result<T, IsolationError<E>>
where
    T: Serialize + DeserializeOwned,
    E: Serialize + DeserializeOwned,
    F: FnOnce() -> Result<T, E>,
{
    let (read_end, write_end) =
        pipe().map_err(|source| IsolationError::Launch { source })?;

    // SAFETY: the child only serialises the verdict, writes it, and _exits;
    // it never returns into the caller's frames.
    match unsafe { fork() } {
        Err(source) => Err(IsolationError::Launch { source }),
        Ok(ForkResult::Child) => {
            drop(read_end);
            // No logging in the child: the subscriber's locks may be held
            // by another thread at fork time.
            let verdict: Verdict<T, E> = match panic::catch_unwind(AssertUnwindSafe(op)) {
                Ok(Ok(value)) => Verdict::Completed(value),
                Ok(Err(error)) => Verdict::Raised(error),
                // A panic carries no transportable error; an empty payload
                // lets the caller classify this as abnormal.
                Err(_) => unsafe { libc::_exit(0) },
            };
            let payload = serde_json::to_vec(&verdict).unwrap_or_default();
            fdio::write_fully(&write_end, &payload);
            drop(write_end);
            // SAFETY: _exit skips unwinding and the caller's atexit and
            // buffer state, which a forked child must not touch.
            unsafe { libc::_exit(0) }
        }
        Ok(ForkResult::Parent { child }) => {
            drop(write_end);
            debug!(target: ISOLATE_TARGET, child = %child, "isolated child forked");
            let mut payload = Vec::new();
            let read_outcome = File::from(read_end).read_to_end(&mut payload);
            // Drain the pipe before reaping so a verdict larger than the
            // pipe buffer cannot wedge the child mid-write.
            let status = await_child(child)
                .map_err(|errno| IsolationError::Collect { source: errno.into() })?;
            read_outcome.map_err(|source| IsolationError::Collect { source })?;
            decode_verdict(&payload, status)
        }
    }
}

fn decode_verdict<T, E>(payload: &[u8], status: WaitStatus) -> Result<T, IsolationError<E>>
where
    T: DeserializeOwned,
    E: DeserializeOwned,
{
    if let WaitStatus::Signaled(_, signal, _) = status {
        return Err(IsolationError::Abnormal {
            detail: format!("killed by signal {signal}"),
        });
    }
    if payload.is_empty() {
        let detail = match status {
            WaitStatus::Exited(_, code) => format!("exited with status {code} without a verdict"),
            other => format!("finished without a verdict ({other:?})"),
        };
        return Err(IsolationError::Abnormal { detail });
    }
    match serde_json::from_slice::<Verdict<T, E>>(payload) {
        Ok(Verdict::Completed(value)) => Ok(value),
        Ok(Verdict::Raised(error)) => Err(IsolationError::Raised(error)),
        Err(decode) => Err(IsolationError::Abnormal {
            detail: format!("undecodable verdict: {decode}"),
        }),
    }
}

fn await_child(child: Pid) -> Result<WaitStatus, Errno> {
    loop {
        match waitpid(child, None) {
            Err(Errno::EINTR) => {}
            other => return other,
        }
    }
}
