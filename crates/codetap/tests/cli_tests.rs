//! End-to-end CLI tests against the compiled `codetap` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn codetap() -> Command {
    Command::cargo_bin("codetap").unwrap()
}

/// Point every path the binary resolves at a scratch directory.
fn sandbox(cmd: &mut Command, dir: &TempDir) {
    cmd.env("CODETAP_HOME", dir.path());
    cmd.env("CODETAP_SOCKET_DIR", dir.path().join("sockets"));
}

#[test]
fn help_lists_subcommands() {
    codetap()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("run")
                .and(predicate::str::contains("relay"))
                .and(predicate::str::contains("list"))
                .and(predicate::str::contains("clean")),
        );
}

#[test]
fn version_flag_prints_version() {
    codetap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn list_reports_no_sessions_for_empty_dir() {
    let dir = TempDir::new().unwrap();
    let mut cmd = codetap();
    sandbox(&mut cmd, &dir);
    cmd.arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No sessions found."));
}

#[test]
fn clean_succeeds_on_empty_dir() {
    let dir = TempDir::new().unwrap();
    let mut cmd = codetap();
    sandbox(&mut cmd, &dir);
    cmd.arg("clean").assert().success();
}

#[test]
fn list_shows_stale_session_as_dead() {
    let dir = TempDir::new().unwrap();
    let sockets = dir.path().join("sockets");
    std::fs::create_dir_all(&sockets).unwrap();
    std::fs::write(sockets.join("ghost.ctl.sock"), b"").unwrap();

    let mut cmd = codetap();
    sandbox(&mut cmd, &dir);
    cmd.arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("ghost").and(predicate::str::contains("dead")));
}

#[test]
fn clean_removes_stale_session_files() {
    let dir = TempDir::new().unwrap();
    let sockets = dir.path().join("sockets");
    std::fs::create_dir_all(&sockets).unwrap();
    std::fs::write(sockets.join("ghost.ctl.sock"), b"").unwrap();
    std::fs::write(sockets.join("ghost.sock"), b"").unwrap();

    let mut cmd = codetap();
    sandbox(&mut cmd, &dir);
    cmd.arg("clean").assert().success();

    assert!(!sockets.join("ghost.ctl.sock").exists());
    assert!(!sockets.join("ghost.sock").exists());
}

#[test]
fn relay_requires_a_command() {
    let dir = TempDir::new().unwrap();
    let mut cmd = codetap();
    sandbox(&mut cmd, &dir);
    cmd.args(["relay", "--name", "dev"]).assert().failure();
}

#[test]
fn unknown_subcommand_fails() {
    codetap().arg("bogus").assert().failure();
}
