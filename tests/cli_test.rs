//! Command-line integration tests.

#![allow(clippy::unwrap_used)]

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

fn canopy(config_dir: &std::path::Path) -> Command {
    let mut cmd = cargo_bin_cmd!("canopy");
    cmd.env("CANOPY_CONFIG", config_dir.join("config.toml"))
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_lists_commands() {
    let dir = tempfile::tempdir().unwrap();
    canopy(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("process"))
        .stdout(predicate::str::contains("dedup"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_dedup_prints_survivors() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("boxes.json");
    std::fs::write(
        &input,
        r#"[
            {"bbox": [0, 0, 100, 100], "label": "tree", "score": 0.9},
            {"bbox": [1, 1, 99, 99], "label": "tree", "score": 0.8},
            {"bbox": [200, 0, 260, 50], "label": "bush", "score": 0.6}
        ]"#,
    )
    .unwrap();

    canopy(dir.path())
        .arg("-q")
        .arg("dedup")
        .arg(&input)
        .arg("--indices")
        .assert()
        .success()
        .stdout(predicate::str::diff("[0,2]\n"));
}

#[test]
fn test_dedup_accepts_parallel_arrays_on_stdin() {
    let dir = tempfile::tempdir().unwrap();
    canopy(dir.path())
        .args(["-q", "dedup", "-"])
        .write_stdin(
            r#"{"boxes": [[0, 0, 10, 10], [0, 0, 10, 10]], "scores": [0.4, 0.7], "labels": ["tree", "tree"]}"#,
        )
        .assert()
        .success()
        .stdout(predicate::str::contains("0.7"))
        .stdout(predicate::str::contains("0.4").not());
}

#[test]
fn test_dedup_rejects_mismatched_arrays() {
    let dir = tempfile::tempdir().unwrap();
    canopy(dir.path())
        .args(["-q", "dedup", "-"])
        .write_stdin(r#"{"boxes": [[0, 0, 10, 10]], "scores": [], "labels": ["tree"]}"#)
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_process_without_images_fails() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

    canopy(dir.path())
        .args(["-q", "process", "--no-progress"])
        .arg(dir.path())
        .env("CANOPY_DETECTOR_ENDPOINT", "http://127.0.0.1:9/detect")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no valid image files"));
}

#[test]
fn test_config_init_then_show() {
    let dir = tempfile::tempdir().unwrap();
    canopy(dir.path())
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created configuration file"));
    assert!(dir.path().join("config.toml").exists());

    canopy(dir.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("iou_threshold"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("config.toml"),
        "[dedup]\niou_threshold = 1.5\n",
    )
    .unwrap();

    canopy(dir.path())
        .args(["-q", "dedup", "-"])
        .write_stdin("[]")
        .assert()
        .failure();
}
