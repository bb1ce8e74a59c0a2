//! CLI integration tests for the guard and the spindle commands.
//!
//! Each test uses an isolated temp directory, so tests can run in parallel.

#![allow(deprecated)] // Command::cargo_bin deprecation only affects custom build dirs

use assert_cmd::Command;
use assert_fs::TempDir;
use assert_fs::prelude::*;
use predicates::prelude::*;
use tangled::spindle::logger::LogLine;
use tangled::types::Status;

fn cmd() -> Command {
    let mut cmd = Command::cargo_bin("tangled").expect("failed to find binary");
    cmd.env("NO_COLOR", "1");
    cmd
}

fn guard(temp: &TempDir, original_command: &str) -> assert_cmd::assert::Assert {
    cmd()
        .args(["guard", "--user", "did:plc:alice", "--log-path"])
        .arg(temp.path().join("guard.log"))
        // nothing listens here; rejected commands never reach it
        .args(["--internal-api", "http://127.0.0.1:9"])
        .env("SSH_ORIGINAL_COMMAND", original_command)
        .assert()
}

#[test]
fn test_guard_greets_interactive_sessions() {
    let temp = TempDir::new().unwrap();
    guard(&temp, "")
        .failure()
        .stderr(predicate::str::contains(
            "Hi @did:plc:alice! You've successfully authenticated.",
        ));
    temp.child("guard.log").assert(predicate::path::exists());
}

#[test]
fn test_guard_rejects_malformed_commands() {
    let temp = TempDir::new().unwrap();
    guard(&temp, "ls")
        .failure()
        .stderr(predicate::str::contains("invalid command format"));
    guard(&temp, "rm -rf /")
        .failure()
        .stderr(predicate::str::contains("access denied: invalid git command"));
    guard(&temp, "pijul clone did:plc:alice/proj")
        .failure()
        .stderr(predicate::str::contains("access denied: invalid pijul command"));
}

#[test]
fn test_guard_fails_when_knot_unreachable() {
    let temp = TempDir::new().unwrap();
    guard(&temp, "git-upload-pack 'did:plc:alice/proj'").failure();
}

#[test]
fn test_knot_init_requires_owner_non_interactive() {
    let temp = TempDir::new().unwrap();
    cmd()
        .args(["knot", "init", "--non-interactive", "--data-dir"])
        .arg(temp.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("--owner is required"));

    cmd()
        .args(["knot", "init", "--non-interactive", "--owner", "did:plc:op", "--data-dir"])
        .arg(temp.path())
        .assert()
        .success();
    temp.child("knot.db").assert(predicate::path::exists());

    cmd()
        .args(["knot", "init", "--non-interactive", "--owner", "did:plc:op", "--data-dir"])
        .arg(temp.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("already initialized"));
}

#[test]
fn test_spindle_run_local_workflows() {
    let temp = TempDir::new().unwrap();
    let repo = temp.child("proj");
    repo.child(".tangled/workflows/build.yml")
        .write_str(
            "when:\n  - event: [push]\n    branch: [main]\nsteps:\n  - name: greet\n    command: echo \"hello from $TANGLED_REF_NAME\"\n",
        )
        .unwrap();
    repo.child(".tangled/workflows/docs.yml")
        .write_str("when:\n  - branch: [docs]\nsteps:\n  - name: skip\n    command: 'false'\n")
        .unwrap();
    let data = temp.child("spindle");

    cmd()
        .args(["spindle", "run", "--ref", "refs/heads/main", "--data-dir"])
        .arg(data.path())
        .arg(repo.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("build.yml").and(predicate::str::contains("success")))
        .stdout(predicate::str::contains("docs.yml").not());

    let logs: Vec<_> = std::fs::read_dir(data.path().join("logs"))
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    assert_eq!(logs.len(), 1);
    let raw = std::fs::read_to_string(&logs[0]).unwrap();
    assert!(raw.contains("hello from main"), "{raw}");
}

#[test]
fn test_spindle_run_reports_failure() {
    let temp = TempDir::new().unwrap();
    let repo = temp.child("proj");
    repo.child(".tangled/workflows/ci.yml")
        .write_str("steps:\n  - name: boom\n    command: exit 4\n")
        .unwrap();
    let data = temp.child("spindle");

    cmd()
        .args(["spindle", "run", "--data-dir"])
        .arg(data.path())
        .arg(repo.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains(Status::Failed.as_str()));
}

#[test]
fn test_spindle_secrets_are_masked_in_logs() {
    let temp = TempDir::new().unwrap();
    let repo = temp.child("proj");
    repo.child(".tangled/workflows/ci.yml")
        .write_str("steps:\n  - name: leak\n    command: echo \"token=$API_TOKEN\"\n")
        .unwrap();
    let data = temp.child("spindle");

    cmd()
        .args(["spindle", "add-secret", "--repo", "did:plc:local/proj", "--data-dir"])
        .arg(data.path())
        .args(["API_TOKEN", "s3cr3t-value"])
        .assert()
        .success();

    cmd()
        .args(["spindle", "add-secret", "--repo", "did:plc:local/proj", "--data-dir"])
        .arg(data.path())
        .args(["TANGLED_REF", "nope"])
        .assert()
        .failure();

    cmd()
        .args(["spindle", "run", "--data-dir"])
        .arg(data.path())
        .arg(repo.path())
        .assert()
        .success();

    let log_dir = data.path().join("logs");
    let entry = std::fs::read_dir(&log_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .next()
        .expect("one log file");
    let raw = std::fs::read_to_string(entry.path()).unwrap();
    assert!(!raw.contains("s3cr3t-value"));
    assert!(raw.contains("token=***"));
}

#[test]
fn test_read_log_parses_written_lines() {
    let temp = TempDir::new().unwrap();
    let repo = temp.child("proj");
    repo.child(".tangled/workflows/ci.yml")
        .write_str("steps:\n  - name: one\n    command: echo one\n  - name: two\n    command: echo two\n")
        .unwrap();
    let data = temp.child("spindle");

    cmd()
        .args(["spindle", "run", "--data-dir"])
        .arg(data.path())
        .arg(repo.path())
        .assert()
        .success();

    let log_dir = data.path().join("logs");
    let entry = std::fs::read_dir(&log_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .next()
        .expect("one log file");
    let file_name = entry.file_name().to_string_lossy().into_owned();
    let raw = std::fs::read_to_string(entry.path()).unwrap();
    let lines: Vec<LogLine> = raw
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let steps: Vec<&str> = lines
        .iter()
        .filter_map(|l| match l {
            LogLine::Control { step_name, .. } => Some(step_name.as_str()),
            LogLine::Data { .. } => None,
        })
        .collect();
    assert_eq!(steps, vec!["one", "one", "two", "two"], "{file_name}");
}

#[test]
fn test_spindle_add_member() {
    let temp = TempDir::new().unwrap();

    cmd()
        .args(["spindle", "add-member", "--did", "knot.example.com", "--data-dir"])
        .arg(temp.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid DID"));

    cmd()
        .args(["spindle", "add-member", "--did", "did:plc:knot", "--data-dir"])
        .arg(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Added did:plc:knot as a spindle member"));
    temp.child("rbac.db").assert(predicate::path::exists());
}
