//! Tests for hook-directory execution.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use rstest::rstest;
use tempfile::TempDir;

use crate::tests::support::{write_plain_file, write_script};
use crate::{EnvPolicy, HookOutcome, HookResult, run_parts};

/// Builds the canonical mixed hook directory: passing and failing scripts,
/// a non-executable file, an empty-but-executable file, a bad name, and a
/// subdirectory.
fn populate_mixed_hooks(dir: &Path) {
    write_script(dir, "00test", "exit 1");
    write_plain_file(dir, "42test", "#!/bin/sh\ntrue\n");
    let empty = write_plain_file(dir, "64test", "");
    let mut permissions = fs::metadata(&empty)
        .expect("metadata should be readable")
        .permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(&empty, permissions).expect("permissions should apply");
    write_script(dir, "99test", "echo ciao");
    write_script(dir, "a_b-c", "echo ok");
    write_plain_file(dir, "dot.file", "ignored");
    fs::create_dir(dir.join("sub")).expect("subdirectory should create");
}

fn outcome_of<'a>(results: &'a [HookResult], name: &str) -> &'a HookOutcome {
    &results
        .iter()
        .find(|result| result.name == name)
        .unwrap_or_else(|| panic!("no result for hook {name}"))
        .outcome
}

#[rstest]
fn mixed_directory_yields_one_result_per_entry_in_name_order() {
    let dir = TempDir::new().expect("tempdir");
    populate_mixed_hooks(dir.path());

    let results = run_parts(dir.path(), &EnvPolicy::Inherit);

    let names: Vec<&str> = results.iter().map(|result| result.name.as_str()).collect();
    assert_eq!(
        names,
        ["00test", "42test", "64test", "99test", "a_b-c", "dot.file", "sub"]
    );

    match outcome_of(&results, "00test") {
        HookOutcome::Ran(result) => {
            assert_eq!(result.exit_code, Some(1));
            assert!(result.failed(), "00test exits nonzero");
        }
        other => panic!("00test should have run: {other:?}"),
    }
    assert!(matches!(outcome_of(&results, "42test"), HookOutcome::Skipped));
    assert!(
        matches!(outcome_of(&results, "64test"), HookOutcome::Error(_)),
        "an empty executable cannot be exec'd"
    );
    match outcome_of(&results, "99test") {
        HookOutcome::Ran(result) => {
            assert_eq!(result.stdout, "ciao\n");
            assert!(!result.failed());
        }
        other => panic!("99test should have run: {other:?}"),
    }
    assert!(matches!(
        outcome_of(&results, "a_b-c"),
        HookOutcome::Ran(_)
    ));
    assert!(matches!(
        outcome_of(&results, "dot.file"),
        HookOutcome::Skipped
    ));
    assert!(matches!(outcome_of(&results, "sub"), HookOutcome::Skipped));
}

#[rstest]
fn one_failing_hook_does_not_stop_later_hooks() {
    let dir = TempDir::new().expect("tempdir");
    write_script(dir.path(), "10-fail", "exit 7");
    write_script(dir.path(), "20-after", "echo survived");

    let results = run_parts(dir.path(), &EnvPolicy::Inherit);

    assert_eq!(results.len(), 2);
    match outcome_of(&results, "20-after") {
        HookOutcome::Ran(result) => assert_eq!(result.stdout, "survived\n"),
        other => panic!("20-after should have run: {other:?}"),
    }
}

#[rstest]
fn environment_policy_reaches_the_hooks() {
    let dir = TempDir::new().expect("tempdir");
    write_script(dir.path(), "50-env", "printf \"$CAPSTAN_HOOK_MARK\"");
    let mut overrides = BTreeMap::new();
    overrides.insert("CAPSTAN_HOOK_MARK".to_owned(), "present".to_owned());

    let results = run_parts(dir.path(), &EnvPolicy::Merge(overrides));

    match outcome_of(&results, "50-env") {
        HookOutcome::Ran(result) => assert_eq!(result.stdout, "present"),
        other => panic!("50-env should have run: {other:?}"),
    }
}

#[rstest]
fn unlistable_directory_yields_an_empty_batch() {
    let results = run_parts(
        Path::new("/nonexistent/capstan-hooks"),
        &EnvPolicy::Inherit,
    );
    assert!(results.is_empty());
}
