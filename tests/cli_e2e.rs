//! End-to-end CLI tests for the mss-downloader binary.

mod support;

use std::io::Cursor;
use std::path::Path;

use assert_cmd::Command;
use assert_cmd::assert::OutputAssertExt;
use fs2::FileExt;
use predicates::prelude::*;
use serde_json::{Value, json};
use support::socket_guard::start_mock_server_or_skip;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

/// Binary pointed at a private state dir, output dir and config home.
fn cli(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("mss-downloader").unwrap();
    cmd.env("XDG_CONFIG_HOME", dir.path().join("config"))
        .env_remove("RUST_LOG")
        .arg("--state-dir")
        .arg(dir.path().join("state"))
        .arg("--output-dir")
        .arg(dir.path().join("out"));
    cmd
}

fn list_json(dir: &TempDir) -> Vec<Value> {
    let output = cli(dir).args(["list", "--json"]).output().unwrap();
    assert!(output.status.success());
    serde_json::from_slice(&output.stdout).unwrap()
}

fn write_config(dir: &Path, contents: &str) -> std::path::PathBuf {
    let path = dir.join("config.toml");
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_binary_help_displays_usage() {
    Command::cargo_bin("mss-downloader")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Download digitized manuscripts"));
}

#[test]
fn test_binary_version_displays_version() {
    Command::cargo_bin("mss-downloader")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("mss-downloader"));
}

#[test]
fn test_binary_without_subcommand_fails() {
    Command::cargo_bin("mss-downloader")
        .unwrap()
        .assert()
        .failure();
}

#[test]
fn test_binary_invalid_flag_returns_error() {
    Command::cargo_bin("mss-downloader")
        .unwrap()
        .args(["list", "--invalid-flag"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_add_then_list_shows_queued_job() {
    let dir = TempDir::new().unwrap();
    cli(&dir)
        .args(["add", "https://gallica.bnf.fr/iiif/ark:/12148/btv1b8449691v/manifest.json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("queued job 1"));

    let jobs = list_json(&dir);
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["id"], 1);
    assert_eq!(jobs[0]["status"], "queued");
    assert_eq!(
        jobs[0]["source_url"],
        "https://gallica.bnf.fr/iiif/ark:/12148/btv1b8449691v/manifest.json"
    );

    cli(&dir)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("queued"))
        .stdout(predicate::str::contains("gallica.bnf.fr"));
}

#[test]
fn test_add_with_pages_keeps_the_range() {
    let dir = TempDir::new().unwrap();
    cli(&dir)
        .args(["add", "--pages", "5-20", "https://digi.vatlib.it/iiif/MSS_Vat.lat.3867/manifest.json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("(pages 5-20)"));

    assert_eq!(list_json(&dir)[0]["page_range"], "5-20");
    cli(&dir)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("[pages 5-20]"));

    cli(&dir)
        .args(["add", "--pages", "0-3", "https://digi.vatlib.it/iiif/MSS_Vat.lat.3867/manifest.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("page numbers start at 1"));
    assert_eq!(list_json(&dir).len(), 1);
}

#[test]
fn test_pause_resume_delete_round_trip() {
    let dir = TempDir::new().unwrap();
    cli(&dir)
        .args(["add", "https://iiif.bl.uk/public/manifest/ark:/81055/vdc_100055984026.0x000001"])
        .assert()
        .success();

    cli(&dir).args(["pause", "1"]).assert().success();
    assert_eq!(list_json(&dir)[0]["status"], "paused");

    cli(&dir).args(["resume", "1"]).assert().success();
    assert_eq!(list_json(&dir)[0]["status"], "queued");

    cli(&dir).args(["delete", "1"]).assert().success();
    assert!(list_json(&dir).is_empty());
}

#[test]
fn test_unknown_job_id_exits_with_failure() {
    let dir = TempDir::new().unwrap();
    cli(&dir)
        .args(["pause", "42"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("job not found: id 42"));
}

#[test]
fn test_invalid_url_is_rejected_before_queueing() {
    let dir = TempDir::new().unwrap();
    cli(&dir)
        .args(["add", "not a url"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Invalid URL"));
    assert!(list_json(&dir).is_empty());
}

#[test]
fn test_retry_and_run_with_empty_queue_succeed() {
    let dir = TempDir::new().unwrap();
    cli(&dir)
        .arg("retry")
        .assert()
        .success()
        .stdout(predicate::str::contains("no failed jobs to retry"));
    cli(&dir).args(["-q", "run"]).assert().success();
}

#[test]
fn test_state_changes_are_refused_while_queue_is_running() {
    let dir = TempDir::new().unwrap();
    cli(&dir)
        .args(["add", "https://digi.vatlib.it/iiif/MSS_Vat.lat.3225/manifest.json"])
        .assert()
        .success();

    // Stand in for a `run` holding the state directory.
    let lock = std::fs::File::create(dir.path().join("state").join("queue.lock")).unwrap();
    lock.try_lock_exclusive().unwrap();

    for args in [
        vec!["pause", "1"],
        vec!["resume", "1"],
        vec!["delete", "1"],
        vec!["retry"],
        vec!["run"],
    ] {
        cli(&dir)
            .args(&args)
            .assert()
            .code(1)
            .stderr(predicate::str::contains("another mss-downloader process"));
    }
    let jobs = list_json(&dir);
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["status"], "queued");

    FileExt::unlock(&lock).unwrap();
    cli(&dir).args(["pause", "1"]).assert().success();
    assert_eq!(list_json(&dir)[0]["status"], "paused");
}

#[test]
fn test_unknown_config_key_is_reported() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "max_active_jobs = 1\nturbo_mode = true\n");
    cli(&dir)
        .arg("--config")
        .arg(&config)
        .arg("list")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Failed to parse config file"))
        .stderr(predicate::str::contains("turbo_mode"));
}

#[test]
fn test_unknown_library_override_is_reported() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "[libraries.atlantis]\nconcurrency = 2\n");
    cli(&dir)
        .arg("--config")
        .arg(&config)
        .arg("list")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Unknown library `atlantis`"));
}

fn png_bytes() -> Vec<u8> {
    let mut bytes = Vec::new();
    image::RgbImage::from_pixel(6, 9, image::Rgb([120, 110, 90]))
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_add_and_run_writes_pdf_and_reports_partial_exit() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let canvases: Vec<Value> = (1..=2)
        .map(|page| json!({"images": [{"resource": {"@id": format!("{}/img/{page}.png", server.uri())}}]}))
        .collect();
    Mock::given(method("GET"))
        .and(path("/iiif/leechbook/manifest.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "@context": "http://iiif.io/api/presentation/2/context.json",
            "label": "Bald's Leechbook",
            "sequences": [{"canvases": canvases}]
        })))
        .mount(&server)
        .await;
    for page in 1..=2 {
        Mock::given(method("GET"))
            .and(path(format!("/img/{page}.png")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(png_bytes()))
            .mount(&server)
            .await;
    }

    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "min_page_bytes = 8\n");
    let manifest_url = format!("{}/iiif/leechbook/manifest.json", server.uri());
    let mut cmd = cli(&dir);
    cmd.arg("--config")
        .arg(&config)
        .args(["-q", "add", "--run", &manifest_url, "https://example.org/about.html"]);

    let output = tokio::task::spawn_blocking(move || cmd.output())
        .await
        .unwrap()
        .unwrap();
    output
        .assert()
        .code(2)
        .stdout(predicate::str::contains("job 1 completed"))
        .stdout(predicate::str::contains("job 2 failed (unsupported_library)"));

    assert!(dir.path().join("out").join("Bald's_Leechbook.pdf").exists());
}
