//! Smoke tests -- verify the binary runs and key subcommands exist.

use assert_cmd::Command;

#[test]
fn test_cli_help() {
    Command::cargo_bin("loadcontrol")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("distributed load-test jobs"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("loadcontrol")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("loadcontrol"));
}

#[test]
fn test_schedule_list_subcommand_exists() {
    Command::cargo_bin("loadcontrol")
        .unwrap()
        .args(["schedule", "list", "--help"])
        .assert()
        .success();
}

#[test]
fn test_schedule_preview_subcommand_exists() {
    Command::cargo_bin("loadcontrol")
        .unwrap()
        .args(["schedule", "preview", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--days"));
}

#[test]
fn test_schedule_list_on_empty_store() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("loadcontrol.toml");
    let db_path = dir.path().join("data").join("loadcontrol.db");
    std::fs::write(
        &config_path,
        format!("[storage]\ndatabase_path = {:?}\n", db_path.to_string_lossy()),
    )
    .unwrap();

    Command::cargo_bin("loadcontrol")
        .unwrap()
        .args(["--config", config_path.to_str().unwrap(), "schedule", "list"])
        .assert()
        .success()
        .stdout(predicates::str::contains("No scheduled tests."));
}
