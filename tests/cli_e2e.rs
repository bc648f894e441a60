//! End-to-end CLI tests for the `modelvault-fetch` binary.

use assert_cmd::Command;
use predicates::prelude::*;

/// Test that --help displays usage information and exits with code 0.
#[test]
fn test_binary_help_displays_usage() {
    let mut cmd = Command::cargo_bin("modelvault-fetch").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Bulk-download models"));
}

/// Test that --version displays version and exits with code 0.
#[test]
fn test_binary_version_displays_version() {
    let mut cmd = Command::cargo_bin("modelvault-fetch").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("modelvault-fetch"));
}

/// `--target` is required (§6.1); omitting it must fail before any network I/O.
#[test]
fn test_binary_missing_target_returns_usage_error() {
    let mut cmd = Command::cargo_bin("modelvault-fetch").unwrap();
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("--target"));
}

/// Invalid flags cause a non-zero exit with clap's usage error on stderr.
#[test]
fn test_binary_invalid_flag_returns_error() {
    let mut cmd = Command::cargo_bin("modelvault-fetch").unwrap();
    cmd.arg("--invalid-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

/// Concurrency outside the 1-32 range is rejected by clap before `app::run` starts.
#[test]
fn test_binary_concurrency_zero_returns_error() {
    let mut cmd = Command::cargo_bin("modelvault-fetch").unwrap();
    cmd.arg("--target")
        .arg("model:1")
        .arg("-c")
        .arg("0")
        .assert()
        .failure();
}

/// A malformed `--target` value is rejected by `Config::from_args` (exit code 2,
/// per `exit_code_for`'s "any `AppError`" mapping) without attempting a request.
#[test]
fn test_binary_malformed_target_returns_app_error_exit_code() {
    let mut cmd = Command::cargo_bin("modelvault-fetch").unwrap();
    let assert = cmd
        .arg("--target")
        .arg("not-a-valid-target")
        .arg("--output-dir")
        .arg(std::env::temp_dir())
        .assert()
        .failure();
    assert_eq!(assert.get_output().status.code(), Some(2));
}
