//! Synchronisation leaves for the Capstan toolkit.
//!
//! The `capstan-sync` crate holds the two self-contained primitives the
//! process layer builds on: cooperative whole-file locking with an explicit
//! state machine ([`LockHandle`]), and a bounded retry loop for transient
//! conditions ([`retry`]). Both are synchronous and carry no logging; every
//! outcome is reported through their error types.
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use capstan_sync::{Attempt, LockError, LockHandle, RetryPolicy, WaitMode, retry};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut guard = LockHandle::open("/var/run/capstan/state.lock")?;
//! let policy = RetryPolicy::fixed(Duration::from_millis(100), Duration::from_secs(5));
//! retry(policy, || match guard.exclusive(WaitMode::Immediate) {
//!     Ok(()) => Attempt::Done(()),
//!     Err(LockError::Contended { .. }) => Attempt::TryAgain,
//!     Err(error) => Attempt::Failed(error),
//! })?;
//! # Ok(()) }
//! ```
//!
//! Locks are advisory: they constrain only processes that also take the
//! lock, and never prevent raw access to the file.

#[cfg(not(unix))]
compile_error!("capstan-sync relies on POSIX advisory locks and supports Unix targets only");

mod filelock;
mod retry;

pub use filelock::{LockError, LockHandle, LockState, WaitMode};
pub use retry::{Attempt, Backoff, RetryError, RetryPolicy, Schedule, retry};
