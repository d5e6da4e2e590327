//! CLI smoke tests.

use assert_cmd::Command;
use predicates::prelude::*;

fn kiln() -> Command {
    Command::cargo_bin("kiln").unwrap()
}

#[test]
fn help_lists_output_modes() {
    kiln()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("push"))
        .stdout(predicate::str::contains("docker"))
        .stdout(predicate::str::contains("tar"))
        .stdout(predicate::str::contains("cache"));
}

#[test]
fn cache_stats_reports_both_caches() {
    let dir = tempfile::tempdir().unwrap();
    kiln()
        .env("KILN_CACHE_DIR", dir.path())
        .args(["cache", "stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Base layers"))
        .stdout(predicate::str::contains("Application layers"))
        .stdout(predicate::str::contains("0 B"));
}

#[test]
fn cache_clear_with_yes_does_not_prompt() {
    let dir = tempfile::tempdir().unwrap();
    kiln()
        .env("KILN_CACHE_DIR", dir.path())
        .args(["cache", "clear", "--yes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleared Base layers cache"));
}

#[test]
fn missing_build_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    kiln()
        .current_dir(dir.path())
        .env_remove("KILN_CONFIG")
        .args(["tar", "--output", "image.tar"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read build file"));
}

#[test]
fn tar_without_output_is_a_usage_error() {
    kiln()
        .arg("tar")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--output"));
}

#[test]
fn docker_output_needs_a_runnable_docker() {
    let dir = tempfile::tempdir().unwrap();
    kiln()
        .current_dir(dir.path())
        .env_remove("KILN_CONFIG")
        .args(["docker", "--docker-executable"])
        .arg(dir.path().join("no-such-docker"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("install Docker"));
}
