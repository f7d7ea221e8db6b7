//! Error types for daemon launch, pid files, and termination.

use std::io;
use std::path::PathBuf;

use capstan_sync::LockError;
use nix::errno::Errno;
use thiserror::Error;

/// Failures across the daemon lifecycle.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// A daemon spec asked for both an output file and a raw descriptor.
    #[error("daemon output can go to a file or a descriptor, not both")]
    ConflictingOutputs,
    /// The command resolved to an empty argument vector.
    #[error("daemon command is empty")]
    EmptyCommand,
    /// An argument or environment entry held an interior NUL byte.
    #[error("command or environment contains an interior NUL byte")]
    CommandEncoding,
    /// A caller passed a pid this API refuses to signal. Non-positive
    /// pids address process groups, not single processes.
    #[error("refusing to signal pid {pid}")]
    InvalidPid {
        /// The rejected pid.
        pid: i32,
    },
    /// The pid file is exclusively locked by a live process.
    #[error("pid file '{path}' is locked by another process{}", owner_hint(.owner))]
    AlreadyLocked {
        /// Pid file that was contended.
        path: PathBuf,
        /// Owner pid parsed from the file, when its content was readable.
        owner: Option<i32>,
    },
    /// Locking machinery failed underneath a pid-file operation.
    #[error("pid file lock failed: {source}")]
    Lock {
        /// Underlying lock error; it carries the path.
        #[from]
        source: LockError,
    },
    /// A pid file could not be opened for claiming.
    #[error("failed to open pid file '{path}': {source}")]
    PidFileOpen {
        /// Pid file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Writing a claimed pid file failed.
    #[error("failed to write pid file '{path}': {source}")]
    PidFileWrite {
        /// Pid file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Reading a pid file failed for a reason other than absence.
    #[error("failed to read pid file '{path}': {source}")]
    PidFileRead {
        /// Pid file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Deleting a pid file failed.
    #[error("failed to remove pid file '{path}': {source}")]
    PidFileRemove {
        /// Pid file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The per-user runtime directory could not be created.
    #[error("failed to prepare runtime directory '{path}': {source}")]
    RuntimeDirectory {
        /// Directory that was being created.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Fork or pipe plumbing failed before any daemon code ran.
    #[error("failed to launch daemon: {source}")]
    Launch {
        /// Underlying OS error.
        source: Errno,
    },
    /// Reading the launch handshake pipes failed in the caller.
    #[error("failed to collect daemon handshake: {source}")]
    Handshake {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The daemon side failed before exec; `message` is its own report.
    #[error("daemon failed to start: {message}")]
    ChildFailed {
        /// Text the daemon wrote on its error pipe.
        message: String,
    },
    /// The daemon neither reported a pid nor an error.
    #[error("daemon exited without reporting a pid")]
    NoPidReported,
    /// Delivering a signal failed.
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        /// Target pid.
        pid: i32,
        /// Underlying OS error.
        source: Errno,
    },
}

fn owner_hint(owner: &Option<i32>) -> String {
    match owner {
        Some(pid) => format!(" (owner pid {pid})"),
        None => String::new(),
    }
}
