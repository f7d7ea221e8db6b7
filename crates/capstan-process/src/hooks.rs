//! Deterministic execution of hook-script directories.
//!
//! [`run_parts`] runs every eligible script directly inside a directory in
//! lexicographic name order, in the manner of `run-parts(8)`. One hook's
//! failure never aborts the batch: each directory entry yields exactly one
//! [`HookResult`], and the batch itself cannot fail. An unlistable
//! directory is logged and yields an empty batch.

use std::fs;
use std::path::{Path, PathBuf};

use nix::unistd::{AccessFlags, access};
use tracing::{debug, warn};

use crate::exec::{CommandResult, CommandSpec, EnvPolicy, ExecError, run};

const HOOKS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::hooks");

/// What happened to one directory entry in a hook batch.
#[derive(Debug)]
pub enum HookOutcome {
    /// Entry was filtered out: unacceptable name, not a regular file, or
    /// not executable.
    Skipped,
    /// Hook launched and finished; its result may still report failure.
    Ran(CommandResult),
    /// Hook was eligible but could not be launched at all.
    Error(ExecError),
}

/// One entry of a [`run_parts`] batch, in execution order.
#[derive(Debug)]
pub struct HookResult {
    /// Directory entry name.
    pub name: String,
    /// What became of it.
    pub outcome: HookOutcome,
}

/// Runs every eligible script in `dir`, sorted by name.
///
/// Eligibility requires a name of letters, digits, underscores, and hyphens
/// only (dotted or otherwise punctuated names are skipped, which keeps
/// editor backups and package leftovers inert), a regular file, and execute
/// permission. Each hook runs with no arguments, output captured, under the
/// given environment policy.
pub fn run_parts(dir: &Path, env: &EnvPolicy) -> Vec<HookResult> {
    let mut entries = match list_entries(dir) {
        Ok(entries) => entries,
        Err(error) => {
            warn!(
                target: HOOKS_TARGET,
                directory = %dir.display(),
                error = %error,
                "cannot list hooks directory; running nothing"
            );
            return Vec::new();
        }
    };
    entries.sort_by(|left, right| left.0.cmp(&right.0));

    entries
        .into_iter()
        .map(|(name, path)| {
            let outcome = dispatch_hook(&name, &path, env);
            HookResult { name, outcome }
        })
        .collect()
}

fn list_entries(dir: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let item = entry?;
        let name = item.file_name().to_string_lossy().into_owned();
        entries.push((name, item.path()));
    }
    Ok(entries)
}

fn dispatch_hook(name: &str, path: &Path, env: &EnvPolicy) -> HookOutcome {
    if !eligible(name, path) {
        debug!(target: HOOKS_TARGET, hook = name, "skipping ineligible entry");
        return HookOutcome::Skipped;
    }
    debug!(target: HOOKS_TARGET, hook = name, "running hook");
    let spec = CommandSpec::argv([path.to_string_lossy().into_owned()])
        .env_policy(env.clone());
    match run(spec) {
        Ok(result) => {
            if result.failed() {
                debug!(
                    target: HOOKS_TARGET,
                    hook = name,
                    exit_code = ?result.exit_code,
                    signal = ?result.signal,
                    "hook ran and failed"
                );
            }
            HookOutcome::Ran(result)
        }
        Err(error) => {
            warn!(target: HOOKS_TARGET, hook = name, error = %error, "hook failed to launch");
            HookOutcome::Error(error)
        }
    }
}

fn eligible(name: &str, path: &Path) -> bool {
    acceptable_name(name)
        && fs::metadata(path).is_ok_and(|meta| meta.is_file())
        && access(path, AccessFlags::X_OK).is_ok()
}

/// Conservative hook-name mask: ASCII letters, digits, `_`, and `-` only.
fn acceptable_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
