//! Named-daemon bookkeeping rooted in one runtime directory.

use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use nix::unistd::{geteuid, getpid};
use tracing::{debug, info};

use super::DAEMON_TARGET;
use super::errors::DaemonError;
use super::pidfile::{self, PidFileRecord};
use super::start::{self, DaemonHandle, DaemonSpec};

/// Runtime directories are private to the owning user.
const RUN_DIR_MODE: u32 = 0o700;

/// Manages named daemons' pid files under one runtime directory and
/// launches daemons that claim them.
///
/// Names map to files as `<run_dir>/<name>.pid`; the supervisor holds no
/// other state, so clones are interchangeable.
#[derive(Debug, Clone)]
pub struct DaemonSupervisor {
    run_dir: PathBuf,
}

impl DaemonSupervisor {
    /// Supervisor over an explicit runtime directory, taken as-is.
    ///
    /// Give an absolute path. A launched daemon claims its pid file after
    /// detaching with `/` as its working directory, while the caller-side
    /// operations resolve against the current directory, so a relative
    /// `run_dir` would name two different locations.
    /// [`DaemonSupervisor::discover`] derives and creates an absolute one
    /// instead.
    #[must_use]
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    /// Derives the per-user runtime directory and creates it `0700`.
    ///
    /// Prefers the platform runtime directory (`$XDG_RUNTIME_DIR` on
    /// Linux) and falls back to a uid-scoped directory under the system
    /// temp dir for environments without one.
    ///
    /// # Errors
    /// [`DaemonError::RuntimeDirectory`] when creation fails.
    pub fn discover() -> Result<Self, DaemonError> {
        let run_dir = dirs::runtime_dir().map_or_else(
            || std::env::temp_dir().join(format!("capstan-{}", geteuid())),
            |dir| dir.join("capstan"),
        );
        let mut builder = DirBuilder::new();
        builder.recursive(true).mode(RUN_DIR_MODE);
        builder
            .create(&run_dir)
            .map_err(|source| DaemonError::RuntimeDirectory {
                path: run_dir.clone(),
                source,
            })?;
        debug!(target: DAEMON_TARGET, dir = %run_dir.display(), "runtime directory ready");
        Ok(Self { run_dir })
    }

    /// Directory the pid files live in.
    #[must_use]
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Pid-file path for a daemon name: `<run_dir>/<name>.pid`.
    #[must_use]
    pub fn pid_file_path(&self, name: &str) -> PathBuf {
        self.run_dir.join(format!("{name}.pid"))
    }

    /// Claims `name`'s pid file for the calling process.
    ///
    /// The returned record holds the exclusive lock; keep it alive for as
    /// long as the claim should stand. Dropping it releases the lock but
    /// leaves the file behind.
    ///
    /// # Errors
    /// [`DaemonError::AlreadyLocked`] when a live process holds the file,
    /// other [`DaemonError`] variants for IO and locking failures.
    pub fn write_pid_file(&self, name: &str) -> Result<PidFileRecord, DaemonError> {
        let path = self.pid_file_path(name);
        let record = pidfile::claim_pid_file(&path, getpid().as_raw())?;
        info!(target: DAEMON_TARGET, pid = record.pid(), file = %path.display(), "pid file written");
        Ok(record)
    }

    /// Removes `name`'s pid file; a missing file is not an error.
    ///
    /// # Errors
    /// [`DaemonError::PidFileRemove`] for IO failures other than absence.
    pub fn remove_pid_file(&self, name: &str) -> Result<(), DaemonError> {
        pidfile::remove_pid_file(&self.pid_file_path(name))
    }

    /// Launches `spec` as a detached daemon.
    ///
    /// With a `pidfile` name, the daemon claims that pid file before its
    /// exec and the launch fails when the file is already locked; the
    /// claim then lives exactly as long as the daemon does.
    ///
    /// # Errors
    /// [`DaemonError::ConflictingOutputs`] and
    /// [`DaemonError::EmptyCommand`] for contract violations;
    /// [`DaemonError::ChildFailed`], [`DaemonError::NoPidReported`], and
    /// the plumbing variants when the detach handshake fails.
    pub fn start_daemon(
        &self,
        spec: DaemonSpec,
        pidfile: Option<&str>,
    ) -> Result<DaemonHandle, DaemonError> {
        start::launch(spec, pidfile.map(|name| self.pid_file_path(name)))
    }
}
