//! Daemon lifecycle: detached launch, pid files, liveness, termination.
//!
//! The model throughout is the lock-backed pid file: a daemon proves it is
//! alive by holding an exclusive advisory lock on its pid file, and every
//! consumer judges liveness by the lock rather than by trusting the number
//! in the file. [`DaemonSupervisor`] roots the files in one runtime
//! directory and launches daemons that claim them before exec; the free
//! functions probe and terminate processes by pid.

mod control;
mod errors;
mod pidfile;
mod start;
mod supervisor;

pub use control::{KillOptions, is_process_alive, kill_process};
pub use errors::DaemonError;
pub use nix::sys::signal::Signal;
pub use pidfile::{PidFileRecord, read_locked_pid_file, read_pid_file};
pub use start::{DaemonHandle, DaemonSpec};
pub use supervisor::DaemonSupervisor;

pub(crate) const DAEMON_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::daemon");
