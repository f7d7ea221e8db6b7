//! Double-detach daemon launch.
//!
//! [`launch`] forks twice so the daemon ends up re-parented to init in its
//! own session, then hands the image over with `execvpe`. Two `O_CLOEXEC`
//! pipes make the handoff observable: the grandchild writes its pid on one
//! and any pre-exec failure on the other, and a successful exec closes
//! both. The caller therefore learns either a pid or a message, never a
//! guess.

use std::collections::BTreeMap;
use std::ffi::{CString, OsString};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::{Mode, umask};
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, chdir, execvpe, fork, getpid, pipe2, setsid};
use tracing::info;

use crate::exec::{DEFAULT_WORKDIR, EnvPolicy, Invocation};
use crate::fdio;

use super::DAEMON_TARGET;
use super::errors::DaemonError;
use super::pidfile::{self, PidFileRecord};

const DEV_NULL: &str = "/dev/null";
/// Output files are created private to the owning user.
const OUTPUT_FILE_MODE: u32 = 0o600;

/// What to launch and how to wire it, shaped like [`crate::CommandSpec`]
/// but for a process that outlives the caller.
#[derive(Debug)]
pub struct DaemonSpec {
    command: Invocation,
    cwd: Option<PathBuf>,
    env: EnvPolicy,
    output_file: Option<PathBuf>,
    output_fd: Option<OwnedFd>,
}

impl DaemonSpec {
    /// Daemon started through `/bin/sh -c`.
    #[must_use]
    pub fn shell(line: impl Into<String>) -> Self {
        Self::new(Invocation::Shell(line.into()))
    }

    /// Daemon started directly from an argument vector.
    #[must_use]
    pub fn argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Invocation::Argv(argv.into_iter().map(Into::into).collect()))
    }

    fn new(command: Invocation) -> Self {
        Self {
            command,
            cwd: None,
            env: EnvPolicy::default(),
            output_file: None,
            output_fd: None,
        }
    }

    /// Directory the daemon changes to before exec; default `/`.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Environment the daemon starts with.
    #[must_use]
    pub fn env_policy(mut self, env: EnvPolicy) -> Self {
        self.env = env;
        self
    }

    /// Appends the daemon's stdout and stderr to `path`, created `0600`.
    ///
    /// Mutually exclusive with [`DaemonSpec::output_descriptor`]; asking
    /// for both fails the launch.
    #[must_use]
    pub fn output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    /// Points the daemon's stdout and stderr at an open descriptor.
    #[must_use]
    pub fn output_descriptor(mut self, fd: OwnedFd) -> Self {
        self.output_fd = Some(fd);
        self
    }
}

/// A started daemon: its pid and, when one was claimed, its pid file.
#[derive(Debug)]
pub struct DaemonHandle {
    pid: i32,
    pid_file: Option<PathBuf>,
}

impl DaemonHandle {
    /// Pid of the detached daemon.
    #[must_use]
    pub const fn pid(&self) -> i32 {
        self.pid
    }

    /// Pid file the daemon claimed, when it was started with one.
    #[must_use]
    pub fn pid_file(&self) -> Option<&Path> {
        self.pid_file.as_deref()
    }
}

/// Where the daemon's stdout and stderr land, settled before forking.
#[derive(Debug)]
enum DaemonOutput {
    Null,
    File(PathBuf),
    Descriptor(OwnedFd),
}

/// Everything the forked side needs, assembled while allocation and
/// logging are still unrestricted.
struct ChildContext {
    argv: Vec<CString>,
    envp: Vec<CString>,
    workdir: PathBuf,
    output: DaemonOutput,
    pid_file: Option<PathBuf>,
    pid_write: OwnedFd,
    err_write: OwnedFd,
}

/// Launches `spec` as a detached daemon, claiming `pid_file` first when
/// one is given.
pub(crate) fn launch(
    spec: DaemonSpec,
    pid_file: Option<PathBuf>,
) -> Result<DaemonHandle, DaemonError> {
    let DaemonSpec {
        command,
        cwd,
        env,
        output_file,
        output_fd,
    } = spec;
    let output = match (output_file, output_fd) {
        (Some(_), Some(_)) => return Err(DaemonError::ConflictingOutputs),
        (Some(path), None) => DaemonOutput::File(path),
        (None, Some(fd)) => DaemonOutput::Descriptor(fd),
        (None, None) => DaemonOutput::Null,
    };
    let description = command.describe();
    let argv = command_cstrings(command.argv_vec())?;
    let envp = env_cstrings(&env.resolve())?;

    let (pid_read, pid_write) = pipe2(OFlag::O_CLOEXEC).map_err(launch_err)?;
    let (err_read, err_write) = pipe2(OFlag::O_CLOEXEC).map_err(launch_err)?;
    let context = ChildContext {
        argv,
        envp,
        workdir: cwd.unwrap_or_else(|| PathBuf::from(DEFAULT_WORKDIR)),
        output,
        pid_file: pid_file.clone(),
        pid_write,
        err_write,
    };

    // SAFETY: the child side runs fork-tolerant setup only and leaves
    // through exec or _exit; it never unwinds into the caller's frames.
    match unsafe { fork() }.map_err(launch_err)? {
        ForkResult::Parent { child } => {
            // Closing the parent's write ends is what lets the reads
            // below reach end-of-file.
            drop(context);
            collect_handshake(child, pid_read, err_read, &description, pid_file)
        }
        ForkResult::Child => detach_session(context),
    }
}

fn launch_err(source: Errno) -> DaemonError {
    DaemonError::Launch { source }
}

/// Parent side: drain both pipes, reap the intermediate child, and turn
/// the handshake into a handle or an error.
fn collect_handshake(
    intermediate: Pid,
    pid_read: OwnedFd,
    err_read: OwnedFd,
    description: &str,
    pid_file: Option<PathBuf>,
) -> Result<DaemonHandle, DaemonError> {
    // Error pipe first: a failing grandchild closes both pipes as it
    // dies, and its report must win over a half-written pid.
    let mut report = Vec::new();
    let report_outcome = File::from(err_read).read_to_end(&mut report);
    let mut pid_text = Vec::new();
    let pid_outcome = File::from(pid_read).read_to_end(&mut pid_text);
    reap_intermediate(intermediate);
    report_outcome.map_err(|source| DaemonError::Handshake { source })?;
    pid_outcome.map_err(|source| DaemonError::Handshake { source })?;
    if !report.is_empty() {
        return Err(DaemonError::ChildFailed {
            message: String::from_utf8_lossy(&report).trim().to_owned(),
        });
    }
    let pid = String::from_utf8_lossy(&pid_text)
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or(DaemonError::NoPidReported)?;
    info!(target: DAEMON_TARGET, pid, command = %description, "daemon started");
    Ok(DaemonHandle { pid, pid_file })
}

/// The intermediate stage exits as soon as it has forked again; reap it
/// so it cannot linger as a zombie.
fn reap_intermediate(child: Pid) {
    loop {
        match waitpid(child, None) {
            Err(Errno::EINTR) => {}
            _ => return,
        }
    }
}

/// First forked stage: new session, neutral filesystem state, then the
/// fork that leaves the daemon re-parented to init.
///
/// No logging anywhere on this side: the subscriber's locks may be held
/// by another thread at fork time.
fn detach_session(context: ChildContext) -> ! {
    if let Err(errno) = setsid() {
        report_and_exit(&context.err_write, &format!("setsid failed: {errno}"));
    }
    umask(Mode::from_bits_truncate(0o077));
    if let Err(errno) = chdir(Path::new("/")) {
        report_and_exit(&context.err_write, &format!("chdir '/' failed: {errno}"));
    }
    // SAFETY: same contract as the first fork.
    match unsafe { fork() } {
        // SAFETY: _exit skips atexit handlers and buffer state duplicated
        // from the original parent.
        Ok(ForkResult::Parent { .. }) => unsafe { libc::_exit(0) },
        Ok(ForkResult::Child) => daemon_stage(context),
        Err(errno) => {
            report_and_exit(&context.err_write, &format!("second fork failed: {errno}"));
        }
    }
}

/// Final stage before exec: claim the pid file, move to the requested
/// directory, wire stdio, report the pid, and hand over the image.
fn daemon_stage(context: ChildContext) -> ! {
    let pid = getpid().as_raw();
    let _record = match claim(context.pid_file.as_deref(), pid) {
        Ok(record) => record,
        Err(message) => report_and_exit(&context.err_write, &message),
    };
    // The working directory moves before the output file opens, so a
    // relative output path lands where the daemon runs.
    if let Err(errno) = chdir(context.workdir.as_path()) {
        report_and_exit(
            &context.err_write,
            &format!("chdir '{}' failed: {errno}", context.workdir.display()),
        );
    }
    if let Err(message) = wire_stdio(&context.output) {
        report_and_exit(&context.err_write, &message);
    }
    fdio::write_fully(&context.pid_write, format!("{pid}\n").as_bytes());
    let Some(program) = context.argv.first() else {
        report_and_exit(&context.err_write, "empty argv");
    };
    // The pid-file descriptor survives exec; everything else closes
    // itself via O_CLOEXEC.
    let errno = match execvpe(program, &context.argv, &context.envp) {
        Ok(infallible) => match infallible {},
        Err(errno) => errno,
    };
    report_and_exit(&context.err_write, &format!("exec failed: {errno}"))
}

/// Claims the pid file, when one was requested, and keeps its descriptor
/// usable across exec.
fn claim(pid_file: Option<&Path>, pid: i32) -> Result<Option<PidFileRecord>, String> {
    let Some(path) = pid_file else {
        return Ok(None);
    };
    let record = pidfile::claim_pid_file(path, pid)
        .map_err(|error| format!("pid file claim failed: {error}"))?;
    let Some(fd) = record.lock_fd() else {
        return Err("pid file descriptor unavailable".to_owned());
    };
    fdio::clear_cloexec(fd)
        .map_err(|errno| format!("clearing close-on-exec on the pid file failed: {errno}"))?;
    Ok(Some(record))
}

/// Stdin from `/dev/null`, stdout and stderr onto the requested sink.
fn wire_stdio(output: &DaemonOutput) -> Result<(), String> {
    let stdin = File::open(DEV_NULL)
        .map_err(|error| format!("opening {DEV_NULL} for stdin failed: {error}"))?;
    redirect_into(stdin.as_raw_fd(), libc::STDIN_FILENO)?;
    match output {
        DaemonOutput::Null => {
            let sink = OpenOptions::new()
                .write(true)
                .open(DEV_NULL)
                .map_err(|error| format!("opening {DEV_NULL} for output failed: {error}"))?;
            redirect_output(sink.as_raw_fd())
        }
        DaemonOutput::File(path) => {
            let sink = OpenOptions::new()
                .append(true)
                .create(true)
                .mode(OUTPUT_FILE_MODE)
                .open(path)
                .map_err(|error| {
                    format!("opening output file '{}' failed: {error}", path.display())
                })?;
            redirect_output(sink.as_raw_fd())
        }
        DaemonOutput::Descriptor(fd) => redirect_output(fd.as_raw_fd()),
    }
}

/// Duplicates `fd` over both stdout and stderr. The duplicates shed
/// close-on-exec, so they survive into the daemon.
fn redirect_output(fd: RawFd) -> Result<(), String> {
    redirect_into(fd, libc::STDOUT_FILENO)?;
    redirect_into(fd, libc::STDERR_FILENO)
}

fn redirect_into(fd: RawFd, target: RawFd) -> Result<(), String> {
    fdio::redirect(fd, target).map_err(|errno| format!("redirect onto fd {target} failed: {errno}"))
}

/// Ships `message` up the error pipe and abandons the forked image.
fn report_and_exit(err_write: &OwnedFd, message: &str) -> ! {
    fdio::write_fully(err_write, message.as_bytes());
    // SAFETY: _exit skips unwinding, atexit handlers, and buffer state
    // duplicated from the parent.
    unsafe { libc::_exit(1) }
}

/// Converts the resolved argv for `execvpe`, rejecting empty commands.
fn command_cstrings(argv: Vec<String>) -> Result<Vec<CString>, DaemonError> {
    if argv.is_empty() {
        return Err(DaemonError::EmptyCommand);
    }
    argv.into_iter()
        .map(|arg| CString::new(arg).map_err(|_| DaemonError::CommandEncoding))
        .collect()
}

/// Flattens the resolved environment into `KEY=value` entries.
fn env_cstrings(env: &BTreeMap<OsString, OsString>) -> Result<Vec<CString>, DaemonError> {
    env.iter()
        .map(|(key, value)| {
            let mut entry = key.as_bytes().to_vec();
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            CString::new(entry).map_err(|_| DaemonError::CommandEncoding)
        })
        .collect()
}
