//! Smoke tests -- verify the binary runs and the admin commands round-trip.

use assert_cmd::Command;
use predicates::prelude::*;

fn bugtriage(dir: &tempfile::TempDir) -> Command {
    let config = dir.path().join("bugtriage.toml");
    std::fs::write(
        &config,
        format!(
            "[database]\npath = \"{}\"\n",
            dir.path().join("bugtriage.db").display()
        ),
    )
    .unwrap();

    let mut cmd = Command::cargo_bin("bugtriage").unwrap();
    cmd.arg("--config").arg(config);
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("bugtriage")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("bug-triage dashboard"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("bugtriage")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("bugtriage"));
}

#[test]
fn test_serve_subcommand_exists() {
    Command::cargo_bin("bugtriage")
        .unwrap()
        .args(["serve", "--help"])
        .assert()
        .success();
}

#[test]
fn test_status_offline_on_fresh_database() {
    let dir = tempfile::tempdir().unwrap();
    bugtriage(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicates::str::contains("scheduler: offline"));
}

#[test]
fn test_query_add_list_disable() {
    let dir = tempfile::tempdir().unwrap();
    bugtriage(&dir)
        .args(["query", "add", "--name", "nightly crashes", "--filter", "keywords=crash", "--every", "3600"])
        .assert()
        .success()
        .stdout(predicates::str::contains("added with id 1"));

    bugtriage(&dir)
        .args(["query", "list"])
        .assert()
        .success()
        .stdout(predicates::str::contains("nightly crashes").and(predicates::str::contains("3600s")));

    bugtriage(&dir).args(["query", "disable", "1"]).assert().success();
    bugtriage(&dir).args(["query", "disable", "42"]).assert().failure();
}

#[test]
fn test_column_add_and_list() {
    let dir = tempfile::tempdir().unwrap();
    bugtriage(&dir)
        .args(["column", "add", "--name", "Status", "--field", "bug_status"])
        .assert()
        .success();
    bugtriage(&dir)
        .args(["column", "list"])
        .assert()
        .success()
        .stdout(predicates::str::contains("bug_status"));
}

#[test]
fn test_history_empty_for_unknown_bug() {
    let dir = tempfile::tempdir().unwrap();
    bugtriage(&dir)
        .args(["history", "101", "status", "--json"])
        .assert()
        .success()
        .stdout(predicates::str::contains("[]"));
}

#[test]
fn test_execute_refuses_while_scheduler_online() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = bugtriage(&dir);
    let pool = bugtriage::storage::open_pool(&dir.path().join("bugtriage.db")).unwrap();
    bugtriage::storage::record_heartbeat(&pool, "scheduler", &chrono::Utc::now()).unwrap();

    cmd.args(["execute", "1"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("scheduler is online"));
}

#[test]
fn test_unloadable_env_config_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("bugtriage")
        .unwrap()
        .current_dir(dir.path())
        .env("BUGTRIAGE_CONFIG", dir.path().join("missing.toml"))
        .env_remove("RUST_LOG")
        .arg("status")
        .assert()
        .success()
        .stderr(predicates::str::contains("could not be loaded"));
}

#[test]
fn test_missing_config_file_fails() {
    Command::cargo_bin("bugtriage")
        .unwrap()
        .args(["--config", "/nonexistent/bugtriage.toml", "status"])
        .assert()
        .failure();
}
