//! End-to-end tests for the runlog binary.

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn write_config(tmp: &TempDir, yaml: &str) -> PathBuf {
    let path = tmp.path().join("config.yml");
    fs::write(&path, yaml).unwrap();
    path
}

fn runlog(tmp: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("runlog").unwrap();
    cmd.current_dir(tmp.path())
        .env_remove("HASURA_URI")
        .env_remove("GRAPHQL_ENDPOINT")
        .env_remove("LOG_PATH")
        .env("RUST_LOG", "warn");
    cmd
}

#[test]
fn test_preview_lists_grid_in_order() {
    let tmp = TempDir::new().unwrap();
    write_config(&tmp, "lr: [0.1, 0.01]\nbatch: [32, 64]\n");

    runlog(&tmp)
        .arg("preview")
        .assert()
        .success()
        .stdout(predicate::str::contains("lr"))
        .stdout(predicate::str::contains("batch"))
        .stdout(predicate::str::contains("Total combinations: 4"));
}

#[test]
fn test_preview_respects_limit() {
    let tmp = TempDir::new().unwrap();
    write_config(&tmp, "a: [1, 2, 3]\nb: [1, 2, 3]\n");

    runlog(&tmp)
        .args(["preview", "--limit", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Total combinations: 9 (showing first 2)"));
}

#[test]
fn test_resolve_wraps_around() {
    let tmp = TempDir::new().unwrap();
    write_config(&tmp, "lr: [0.1, 0.01]\nbatch: [32, 64]\n");

    let output = runlog(&tmp)
        .args(["resolve", "--index", "5"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let assignment: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(assignment, serde_json::json!({"lr": 0.1, "batch": 64}));
}

#[test]
fn test_bare_list_is_an_unnamed_parameter() {
    let tmp = TempDir::new().unwrap();
    write_config(&tmp, "- small\n- large\n");

    let output = runlog(&tmp)
        .args(["resolve", "-i", "1"])
        .output()
        .unwrap();
    let assignment: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(assignment, serde_json::json!({"": "large"}));
}

#[test]
fn test_empty_candidates_are_rejected() {
    let tmp = TempDir::new().unwrap();
    write_config(&tmp, "lr: []\n");

    runlog(&tmp)
        .arg("preview")
        .assert()
        .failure()
        .stderr(predicate::str::contains("lr is empty"));
}

#[test]
fn test_create_sweep_with_jsonl_backend() {
    let tmp = TempDir::new().unwrap();
    write_config(&tmp, "lr: [0.1, 0.01]\n");

    runlog(&tmp)
        .args([
            "create-sweep",
            "--name",
            "lr sweep",
            "--method",
            "grid",
            "--logger",
            "jsonl",
            "--remaining-runs",
            "2",
        ])
        .arg("--log-dir")
        .arg(tmp.path())
        .env("RUST_LOG", "info")
        .assert()
        .success()
        .stdout(predicate::str::contains("Sweep ID: 0"))
        .stderr(predicate::str::contains("sweep registered"));
}

#[test]
fn test_create_sweep_without_endpoint_fails() {
    let tmp = TempDir::new().unwrap();
    write_config(&tmp, "lr: [0.1]\n");

    runlog(&tmp)
        .arg("create-sweep")
        .assert()
        .failure()
        .stderr(predicate::str::contains("needs an endpoint"));
}

#[test]
fn test_missing_config_is_reported() {
    let tmp = TempDir::new().unwrap();
    runlog(&tmp)
        .arg("preview")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Sweep config not found"));
}
