//! Synchronous external-command execution.
//!
//! [`run`] launches one command described by a [`CommandSpec`] and waits for
//! it to finish. Output is either captured (both streams drained
//! concurrently through one poll loop, so neither can deadlock on a full
//! pipe buffer) or redirected wholesale to a file or descriptor. A command
//! that ran and failed is a normal [`CommandResult`]; only failing to launch
//! at all is an [`ExecError`].

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use thiserror::Error;
use tracing::debug;

const EXEC_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::exec");

/// Shell used for [`Invocation::Shell`] commands.
pub(crate) const SHELL: &str = "/bin/sh";
/// Working directory applied when a spec names none.
pub(crate) const DEFAULT_WORKDIR: &str = "/";

/// Command text: a shell line or an explicit argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// One line handed to `/bin/sh -c`, with full shell interpretation.
    Shell(String),
    /// Programme and arguments executed directly; nothing is interpreted.
    Argv(Vec<String>),
}

impl Invocation {
    /// Argv actually executed, with the shell wrapper applied.
    pub(crate) fn argv_vec(&self) -> Vec<String> {
        match self {
            Self::Shell(line) => vec![SHELL.to_owned(), "-c".to_owned(), line.clone()],
            Self::Argv(argv) => argv.clone(),
        }
    }

    /// One-line rendering for logs and error messages.
    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Shell(line) => line.clone(),
            Self::Argv(argv) => argv.join(" "),
        }
    }
}

/// How the child's environment derives from the caller's.
///
/// `Inherit` and `Merge` pin `LC_ALL=C` on top of the inherited variables so
/// locale-sensitive tool output stays parseable; `Reset` yields exactly the
/// overrides and nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EnvPolicy {
    /// The caller's environment with the locale pinned.
    #[default]
    Inherit,
    /// An empty environment containing only the given overrides.
    Reset(BTreeMap<String, String>),
    /// The caller's environment with the locale pinned, then the overrides.
    Merge(BTreeMap<String, String>),
}

impl EnvPolicy {
    /// Full environment the child receives.
    pub(crate) fn resolve(&self) -> BTreeMap<OsString, OsString> {
        match self {
            Self::Inherit => inherited_environment(),
            Self::Reset(overrides) => overrides.iter().map(os_pair).collect(),
            Self::Merge(overrides) => {
                let mut resolved = inherited_environment();
                resolved.extend(overrides.iter().map(os_pair));
                resolved
            }
        }
    }
}

fn inherited_environment() -> BTreeMap<OsString, OsString> {
    let mut resolved: BTreeMap<OsString, OsString> = env::vars_os().collect();
    resolved.insert(OsString::from("LC_ALL"), OsString::from("C"));
    resolved
}

fn os_pair((key, value): (&String, &String)) -> (OsString, OsString) {
    (OsString::from(key), OsString::from(value))
}

/// Where the command's stdout and stderr go.
#[derive(Debug, Default)]
pub enum OutputSink {
    /// Pipe both streams back and populate the result's text fields.
    #[default]
    Captured,
    /// Append both streams to the named file; text fields stay empty.
    File(PathBuf),
    /// Send both streams to this descriptor; text fields stay empty.
    Descriptor(OwnedFd),
}

/// Everything needed to launch one external command.
///
/// Built with [`CommandSpec::shell`] or [`CommandSpec::argv`] and refined
/// with the chained setters. Defaults: working directory `/`, inherited
/// environment with the locale pinned, captured output, stdin from
/// `/dev/null`.
#[derive(Debug)]
pub struct CommandSpec {
    invocation: Invocation,
    cwd: Option<PathBuf>,
    env: EnvPolicy,
    output: OutputSink,
}

impl CommandSpec {
    /// Spec for a shell line interpreted by `/bin/sh -c`.
    #[must_use]
    pub fn shell(line: impl Into<String>) -> Self {
        Self::new(Invocation::Shell(line.into()))
    }

    /// Spec for an argv executed directly, without shell interpretation.
    #[must_use]
    pub fn argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Invocation::Argv(argv.into_iter().map(Into::into).collect()))
    }

    fn new(invocation: Invocation) -> Self {
        Self {
            invocation,
            cwd: None,
            env: EnvPolicy::default(),
            output: OutputSink::default(),
        }
    }

    /// Runs the command from `dir` instead of `/`.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Applies an environment policy other than the default `Inherit`.
    #[must_use]
    pub fn env_policy(mut self, env: EnvPolicy) -> Self {
        self.env = env;
        self
    }

    /// Sends output somewhere other than the capture buffers.
    #[must_use]
    pub fn output(mut self, output: OutputSink) -> Self {
        self.output = output;
        self
    }

    pub(crate) fn into_parts(self) -> (Invocation, Option<PathBuf>, EnvPolicy, OutputSink) {
        (self.invocation, self.cwd, self.env, self.output)
    }
}

/// Outcome of a command that actually ran.
///
/// Exactly one of `exit_code` and `signal` is populated: a process either
/// exited or was killed by a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Captured standard output; empty unless the sink was `Captured`.
    pub stdout: String,
    /// Captured standard error; empty unless the sink was `Captured`.
    pub stderr: String,
    /// Both streams in arrival order; empty unless the sink was `Captured`.
    pub combined: String,
    /// Exit code, when the process exited of its own accord.
    pub exit_code: Option<i32>,
    /// Signal number, when a signal terminated the process.
    pub signal: Option<i32>,
}

impl CommandResult {
    /// Whether the command failed: a nonzero exit or death by signal.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.signal.is_some() || self.exit_code != Some(0)
    }

    fn from_status(status: ExitStatus, capture: CaptureBuffers) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&capture.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&capture.stderr).into_owned(),
            combined: String::from_utf8_lossy(&capture.combined).into_owned(),
            exit_code: status.code(),
            signal: status.signal(),
        }
    }
}

/// Errors raised when a command cannot be launched or supervised.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The argv form contained no entries.
    #[error("command has no argv entries")]
    EmptyArgv,
    /// The output file could not be opened or duplicated.
    #[error("failed to open output file '{path}': {source}")]
    OutputFile {
        /// File that was meant to receive the output.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The output descriptor could not be duplicated for the second stream.
    #[error("failed to duplicate output descriptor: {source}")]
    OutputDescriptor {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Spawning failed: missing executable, bad working directory, or
    /// resource exhaustion. Never reported as a `CommandResult`.
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        /// Command that did not start.
        command: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Reading the captured output streams failed.
    #[error("failed to capture output of '{command}': {source}")]
    Capture {
        /// Command whose output was being read.
        command: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Waiting for the command to finish failed.
    #[error("failed to await '{command}': {source}")]
    Wait {
        /// Command being awaited.
        command: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Runs `spec` to completion, synchronously.
///
/// # Errors
/// [`ExecError`] when the command cannot be launched or its output cannot be
/// collected. A command that launches and then fails is a successful call
/// returning a [`CommandResult`] whose [`CommandResult::failed`] is true.
pub fn run(spec: CommandSpec) -> Result<CommandResult, ExecError> {
    let (invocation, cwd, env_policy, output) = spec.into_parts();
    let argv = invocation.argv_vec();
    let Some((programme, arguments)) = argv.split_first() else {
        return Err(ExecError::EmptyArgv);
    };
    let description = invocation.describe();
    let workdir = cwd.unwrap_or_else(|| PathBuf::from(DEFAULT_WORKDIR));

    let mut command = Command::new(programme);
    command
        .args(arguments)
        .env_clear()
        .envs(&env_policy.resolve())
        .current_dir(&workdir)
        .stdin(Stdio::null());

    match output {
        OutputSink::Captured => {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
            let mut child = spawn(&mut command, &description)?;
            debug!(
                target: EXEC_TARGET,
                command = %description,
                pid = child.id(),
                "command started"
            );
            let capture = drain_captured(&mut child).map_err(|source| ExecError::Capture {
                command: description.clone(),
                source,
            })?;
            let status = wait_for_exit(&mut child, &description)?;
            let result = CommandResult::from_status(status, capture);
            debug!(
                target: EXEC_TARGET,
                command = %description,
                exit_code = ?result.exit_code,
                signal = ?result.signal,
                "command finished"
            );
            Ok(result)
        }
        OutputSink::File(path) => {
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(&path)
                .map_err(|source| ExecError::OutputFile {
                    path: path.clone(),
                    source,
                })?;
            let second = file.try_clone().map_err(|source| ExecError::OutputFile {
                path: path.clone(),
                source,
            })?;
            command.stdout(Stdio::from(second)).stderr(Stdio::from(file));
            run_redirected(&mut command, &description)
        }
        OutputSink::Descriptor(fd) => {
            let second = fd
                .try_clone()
                .map_err(|source| ExecError::OutputDescriptor { source })?;
            command.stdout(Stdio::from(second)).stderr(Stdio::from(fd));
            run_redirected(&mut command, &description)
        }
    }
}

fn run_redirected(command: &mut Command, description: &str) -> Result<CommandResult, ExecError> {
    let mut child = spawn(command, description)?;
    debug!(
        target: EXEC_TARGET,
        command = %description,
        pid = child.id(),
        "command started with redirected output"
    );
    let status = wait_for_exit(&mut child, description)?;
    Ok(CommandResult::from_status(status, CaptureBuffers::default()))
}

fn spawn(command: &mut Command, description: &str) -> Result<Child, ExecError> {
    command.spawn().map_err(|source| ExecError::Spawn {
        command: description.to_owned(),
        source,
    })
}

fn wait_for_exit(child: &mut Child, description: &str) -> Result<ExitStatus, ExecError> {
    child.wait().map_err(|source| ExecError::Wait {
        command: description.to_owned(),
        source,
    })
}

#[derive(Default)]
struct CaptureBuffers {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    combined: Vec<u8>,
}

impl CaptureBuffers {
    fn push(&mut self, stream: StreamKind, chunk: &[u8]) {
        match stream {
            StreamKind::Stdout => self.stdout.extend_from_slice(chunk),
            StreamKind::Stderr => self.stderr.extend_from_slice(chunk),
        }
        self.combined.extend_from_slice(chunk);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamStatus {
    Open,
    Eof,
}

/// Drains stdout and stderr together until both report end of file.
///
/// A single poll loop watches both pipes so a child filling one stream can
/// never stall the other; arrival order is preserved in the combined buffer.
fn drain_captured(child: &mut Child) -> io::Result<CaptureBuffers> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("child stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("child stderr was not piped"))?;
    let mut streams = vec![
        (StreamKind::Stdout, into_nonblocking(OwnedFd::from(stdout))?),
        (StreamKind::Stderr, into_nonblocking(OwnedFd::from(stderr))?),
    ];
    let mut capture = CaptureBuffers::default();

    while !streams.is_empty() {
        let mut poll_fds: Vec<PollFd> = streams
            .iter()
            .map(|(_, file)| PollFd::new(file.as_fd(), PollFlags::POLLIN))
            .collect();
        match poll(&mut poll_fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(io::Error::from(errno)),
        }
        let ready: Vec<bool> = poll_fds
            .iter()
            .map(|entry| entry.revents().is_some_and(|events| !events.is_empty()))
            .collect();
        drop(poll_fds);

        let mut finished = Vec::new();
        for (index, (kind, file)) in streams.iter_mut().enumerate() {
            if !ready.get(index).copied().unwrap_or(false) {
                continue;
            }
            if drain_ready(&mut capture, *kind, file)? == StreamStatus::Eof {
                finished.push(index);
            }
        }
        for index in finished.into_iter().rev() {
            streams.remove(index);
        }
    }
    Ok(capture)
}

fn drain_ready(
    capture: &mut CaptureBuffers,
    kind: StreamKind,
    file: &mut File,
) -> io::Result<StreamStatus> {
    let mut chunk = [0_u8; 4096];
    loop {
        match file.read(&mut chunk) {
            Ok(0) => return Ok(StreamStatus::Eof),
            Ok(count) => capture.push(kind, chunk.get(..count).unwrap_or_default()),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                return Ok(StreamStatus::Open);
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }
}

fn into_nonblocking(fd: OwnedFd) -> io::Result<File> {
    // SAFETY: the descriptor is owned and stays open across both calls.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above; only the O_NONBLOCK status flag is added.
    let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(File::from(fd))
}
