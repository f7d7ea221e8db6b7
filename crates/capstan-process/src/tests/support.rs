//! Shared fixtures and helpers for the supervision test suites.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;

use capstan_sync::{Attempt, RetryError, RetryPolicy, retry};
use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

use crate::{KillOptions, Signal, kill_process};

/// How long probes may poll before a test gives up.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause between probe attempts.
pub const POLL_INTERVAL: Duration = Duration::from_millis(25);

static TRACING: OnceCell<()> = OnceCell::new();

/// Installs a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Writes an executable `/bin/sh` script under `dir` and returns its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("script should be writable");
    let mut permissions = fs::metadata(&path)
        .expect("script metadata should be readable")
        .permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(&path, permissions).expect("script permissions should apply");
    path
}

/// Writes a non-executable file under `dir` and returns its path.
pub fn write_plain_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).expect("file should be writable");
    path
}

/// Polls `condition` until it holds or [`WAIT_TIMEOUT`] passes.
pub fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    let waited: Result<(), RetryError<()>> =
        retry(RetryPolicy::fixed(POLL_INTERVAL, WAIT_TIMEOUT), || {
            if condition() {
                Attempt::Done(())
            } else {
                Attempt::TryAgain
            }
        });
    assert!(waited.is_ok(), "timed out waiting for {description}");
}

/// Spawns a plain child that sleeps long enough to outlive any test.
pub fn spawn_sleeper() -> Child {
    Command::new("sleep")
        .arg("600")
        .spawn()
        .expect("sleep should spawn")
}

/// Best-effort SIGKILL for processes a test started.
pub fn force_kill(pid: i32) {
    let options = KillOptions {
        signal: Signal::SIGKILL,
        timeout: Duration::ZERO,
        reap: false,
    };
    let _ = kill_process(pid, &options);
}

/// Kills the process when dropped, so failed tests do not leak sleepers.
pub struct DaemonGuard(pub i32);

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        force_kill(self.0);
    }
}
