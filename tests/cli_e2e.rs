//! End-to-end CLI tests for the collector binary.

#![allow(deprecated)]

mod support;

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use support::fixtures::pdf_body;
use support::socket_guard::{socket_skip_return, start_mock_server_or_skip};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

/// Writes a config that keeps all paths inside `root` and never sleeps.
fn write_config(root: &Path) -> PathBuf {
    let config = serde_json::json!({
        "orchestrator": { "concurrency": 2, "save_every": 1 },
        "fetch": { "max_retries": 1, "retry_delay_ms": 0, "max_delay_ms": 0 },
        "rate_limits": { "default": { "base_delay_ms": 0 } },
        "paths": {
            "state_dir": root.join("state"),
            "local_dir": root.join("papers")
        }
    });
    let path = root.join("config.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&config).unwrap()).unwrap();
    path
}

fn collector(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("collector").unwrap();
    cmd.current_dir(root)
        .env("XDG_CONFIG_HOME", root.join("xdg-config"))
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_binary_help_displays_usage() {
    let tempdir = TempDir::new().unwrap();
    collector(tempdir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Resilient batch collector"));
}

#[test]
fn test_binary_requires_subcommand() {
    let tempdir = TempDir::new().unwrap();
    collector(tempdir.path()).assert().failure();
}

#[test]
fn test_binary_rejects_out_of_range_concurrency() {
    let tempdir = TempDir::new().unwrap();
    collector(tempdir.path())
        .args(["run", "items.json", "-c", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_check_state_missing_file_exits_with_failure() {
    let tempdir = TempDir::new().unwrap();
    let assert = collector(tempdir.path())
        .args(["check-state", "absent.json"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("Missing"));
    assert_eq!(assert.get_output().status.code(), Some(2));
}

#[test]
fn test_export_failures_without_checkpoint() {
    let tempdir = TempDir::new().unwrap();
    let config = write_config(tempdir.path());
    collector(tempdir.path())
        .arg("--config")
        .arg(&config)
        .arg("export-failures")
        .assert()
        .success()
        .stdout(predicate::str::contains("No failures recorded"));
}

#[test]
fn test_invalid_config_is_reported() {
    let tempdir = TempDir::new().unwrap();
    let config = tempdir.path().join("config.json");
    std::fs::write(&config, r#"{"orchestrator": {"concurrency": 500}}"#).unwrap();
    collector(tempdir.path())
        .arg("--config")
        .arg(&config)
        .arg("export-failures")
        .assert()
        .failure()
        .stderr(predicate::str::contains("orchestrator.concurrency"));
}

#[tokio::test]
async fn test_run_partial_success_exits_with_one() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return socket_skip_return();
    };
    Mock::given(method("GET"))
        .and(path("/ok.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(pdf_body())
                .insert_header("Content-Type", "application/pdf"),
        )
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gone.pdf"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let tempdir = TempDir::new().unwrap();
    let config = write_config(tempdir.path());
    let items = serde_json::json!([
        { "id": "ok", "url": format!("{}/ok.pdf", mock_server.uri()), "metadata": { "title": "Ok" } },
        { "id": "gone", "url": format!("{}/gone.pdf", mock_server.uri()), "metadata": { "title": "Gone" } }
    ]);
    let items_path = tempdir.path().join("items.json");
    std::fs::write(&items_path, serde_json::to_vec(&items).unwrap()).unwrap();

    let assert = collector(tempdir.path())
        .arg("--config")
        .arg(&config)
        .arg("-q")
        .arg("run")
        .arg(&items_path)
        .assert()
        .failure();
    assert_eq!(
        assert.get_output().status.code(),
        Some(1),
        "partial success must yield exit code 1"
    );

    let checkpoint = tempdir.path().join("state").join("download_checkpoint.json");
    assert!(checkpoint.exists(), "checkpoint must be written");
    collector(tempdir.path())
        .arg("check-state")
        .arg(&checkpoint)
        .assert()
        .success()
        .stdout(predicate::str::contains("Valid"));

    collector(tempdir.path())
        .arg("--config")
        .arg(&config)
        .arg("export-failures")
        .assert()
        .success()
        .stdout(predicate::str::contains("Exported 1 failures (1 permanent)"));

    collector(tempdir.path())
        .arg("--config")
        .arg(&config)
        .args(["clear-permanent", "gone"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleared permanent failure for gone"));
}

#[tokio::test]
async fn test_run_all_succeeded_exits_with_zero() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return socket_skip_return();
    };
    Mock::given(method("GET"))
        .and(path("/ok.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(pdf_body()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let tempdir = TempDir::new().unwrap();
    let config = write_config(tempdir.path());
    let items = serde_json::json!([
        { "id": "ok", "url": format!("{}/ok.pdf", mock_server.uri()), "metadata": { "title": "Ok" } }
    ]);
    let items_path = tempdir.path().join("items.json");
    std::fs::write(&items_path, serde_json::to_vec(&items).unwrap()).unwrap();

    for _ in 0..2 {
        collector(tempdir.path())
            .arg("--config")
            .arg(&config)
            .arg("-q")
            .arg("run")
            .arg(&items_path)
            .arg("--resume")
            .assert()
            .success();
    }
}

#[tokio::test]
async fn test_retry_failed_without_resume_skips_permanent_failures() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return socket_skip_return();
    };
    Mock::given(method("GET"))
        .and(path("/gone.pdf"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;

    let tempdir = TempDir::new().unwrap();
    let config = write_config(tempdir.path());
    let items = serde_json::json!([
        { "id": "gone", "url": format!("{}/gone.pdf", mock_server.uri()), "metadata": { "title": "Gone" } }
    ]);
    let items_path = tempdir.path().join("items.json");
    std::fs::write(&items_path, serde_json::to_vec(&items).unwrap()).unwrap();

    let first = collector(tempdir.path())
        .arg("--config")
        .arg(&config)
        .arg("-q")
        .arg("run")
        .arg(&items_path)
        .assert()
        .failure();
    assert_eq!(first.get_output().status.code(), Some(2));

    collector(tempdir.path())
        .arg("--config")
        .arg(&config)
        .arg("-q")
        .arg("run")
        .arg(&items_path)
        .arg("--retry-failed")
        .assert()
        .success();

    collector(tempdir.path())
        .arg("--config")
        .arg(&config)
        .arg("export-failures")
        .assert()
        .success()
        .stdout(predicate::str::contains("Exported 1 failures (1 permanent)"));
}
