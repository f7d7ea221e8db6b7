//! Process supervision for long-lived Unix services.
//!
//! The crate covers four tightly related jobs:
//!
//! - [`run`] executes one command synchronously with explicit environment
//!   policy and output routing, capturing stdout and stderr separately as
//!   well as interleaved;
//! - [`DaemonSupervisor`] launches detached daemons whose liveness is
//!   proven by an exclusively locked pid file, and [`kill_process`] and
//!   friends manage them afterwards;
//! - [`run_parts`] runs a directory of hook scripts in deterministic
//!   order, one report per entry;
//! - [`run_isolated`] evaluates an operation in a disposable forked child
//!   and ships its verdict back over a pipe.
//!
//! Everything is synchronous and Unix-only; advisory locking and retry
//! loops come from [`capstan_sync`].
//!
//! ```rust,no_run
//! use capstan_process::{CommandSpec, DaemonSpec, DaemonSupervisor, run};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let result = run(CommandSpec::shell("printf ready"))?;
//! assert_eq!(result.stdout, "ready");
//!
//! let supervisor = DaemonSupervisor::discover()?;
//! let handle = supervisor.start_daemon(
//!     DaemonSpec::argv(["sleep", "3600"]),
//!     Some("sleeper"),
//! )?;
//! println!("daemon running as {}", handle.pid());
//! # Ok(())
//! # }
//! ```

#[cfg(not(unix))]
compile_error!("capstan-process relies on fork, exec, and advisory file locks");

mod daemon;
mod exec;
mod fdio;
mod hooks;
mod isolate;

pub use daemon::{
    DaemonError, DaemonHandle, DaemonSpec, DaemonSupervisor, KillOptions, PidFileRecord, Signal,
    is_process_alive, kill_process, read_locked_pid_file, read_pid_file,
};
pub use exec::{
    CommandResult, CommandSpec, EnvPolicy, ExecError, Invocation, OutputSink, run,
};
pub use hooks::{HookOutcome, HookResult, run_parts};
pub use isolate::{IsolationError, run_isolated};

#[cfg(test)]
mod tests;
