//! Integration tests for the job orchestrator against a mock IIIF server.
//!
//! These run the real manifest loader, HTTP page client and PDF assembler.

mod support;

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mss_core::Database;
use mss_core::download::{
    BackoffPolicy, CircuitBreaker, CircuitBreakerSource, FetcherPool, HostLimiter, HttpClient,
};
use mss_core::library::{LibraryProfile, builtin_libraries};
use mss_core::manifest::ManifestResolver;
use mss_core::orchestrator::{
    JobErrorKind, JobStatus, JobStore, Orchestrator, OrchestratorConfig, OrchestratorHandle,
    QueueEvent, RunMode,
};
use serde_json::json;
use support::socket_guard::start_mock_server_or_skip;
use tempfile::TempDir;
use tokio_test::assert_ok;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WAIT: Duration = Duration::from_secs(30);
const MANIFEST_PATH: &str = "/iiif/ms-7/manifest.json";

fn png_bytes(shade: u8) -> Vec<u8> {
    let mut bytes = Vec::new();
    image::RgbImage::from_pixel(8, 12, image::Rgb([shade, 180, 150]))
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .expect("encode png");
    bytes
}

fn image_path(page: usize) -> String {
    format!("/img/f{page}.png")
}

/// IIIF Presentation 2 manifest with `pages` canvases served by `server`.
fn manifest(server: &MockServer, title: &str, pages: usize) -> serde_json::Value {
    let canvases: Vec<_> = (1..=pages)
        .map(|page| {
            json!({"images": [{"resource": {"@id": format!("{}{}", server.uri(), image_path(page))}}]})
        })
        .collect();
    json!({
        "@context": "http://iiif.io/api/presentation/2/context.json",
        "@type": "sc:Manifest",
        "label": title,
        "sequences": [{"canvases": canvases}]
    })
}

async fn mount_manifest(server: &MockServer, title: &str, pages: usize) {
    Mock::given(method("GET"))
        .and(path(MANIFEST_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(manifest(server, title, pages)))
        .mount(server)
        .await;
}

async fn mount_page(server: &MockServer, page: usize, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path(image_path(page)))
        .respond_with(response)
        .mount(server)
        .await;
}

fn page_ok(page: usize) -> ResponseTemplate {
    let shade = u8::try_from(page * 20).unwrap_or(u8::MAX);
    ResponseTemplate::new(200)
        .insert_header("Content-Type", "image/png")
        .set_body_bytes(png_bytes(shade))
}

async fn requests_for(server: &MockServer, request_path: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == request_path)
        .count()
}

/// Wires the production stack the way the binary does, with fast retries.
async fn start(db: Database, dir: &Path, tune: impl FnOnce(&mut LibraryProfile)) -> OrchestratorHandle {
    let http = HttpClient::new().expect("http client");
    let mut libraries = builtin_libraries(http.inner().clone());
    tune(libraries.profile_mut("iiif").expect("generic iiif profile"));
    let registry = libraries.build().expect("registry");

    let resolver = ManifestResolver::new(Arc::new(registry), Duration::from_secs(10));
    let source = CircuitBreakerSource::new(http, Arc::new(CircuitBreaker::default()));
    let pool = FetcherPool::new(Arc::new(source), Arc::new(HostLimiter::new(8)), 8);

    let mut config = OrchestratorConfig::new(dir.join("out"), dir.join("state"));
    config.watchdog_interval = Duration::from_millis(100);

    Orchestrator::new(config, resolver, pool, JobStore::new(db))
        .start(RunMode::Active)
        .await
        .expect("orchestrator start")
}

fn fast_retries(profile: &mut LibraryProfile) {
    profile.backoff = BackoffPolicy::default()
        .with_max_attempts(2)
        .with_delays(Duration::from_millis(10), Duration::from_millis(20))
        .with_jitter(0.0);
}

/// Waits until `completed` pages of `job_id` are on disk.
async fn wait_for_pages(events: &mut tokio::sync::broadcast::Receiver<QueueEvent>, job_id: i64, completed: usize) {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(QueueEvent::Progress(progress)) = events.recv().await
                && progress.job_id == job_id
                && progress.completed_pages >= completed
            {
                return;
            }
        }
    })
    .await
    .expect("pages did not arrive in time");
}

#[tokio::test]
async fn test_iiif_manuscript_downloads_into_pdf() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_manifest(&server, "Vercelli Book", 3).await;
    for page in 1..=3 {
        mount_page(&server, page, page_ok(page)).await;
    }
    let dir = TempDir::new().expect("temp dir");
    let db = Database::new_in_memory().await.expect("db");
    let handle = start(db, dir.path(), fast_retries).await;

    let job_id = assert_ok!(handle.enqueue(format!("{}{MANIFEST_PATH}", server.uri())).await);
    let summary = tokio::time::timeout(WAIT, handle.wait_until_settled(&[job_id]))
        .await
        .expect("job did not settle")
        .expect("orchestrator stopped")
        .remove(0);

    assert_eq!(summary.status, JobStatus::Completed, "{:?}", summary.last_error);
    assert_eq!(summary.library_id.as_deref(), Some("iiif"));
    assert_eq!(summary.display_name.as_deref(), Some("Vercelli Book"));
    assert_eq!(summary.total_pages, 3);
    assert_eq!(summary.completed_pages, 3);

    let pdf = dir.path().join("out").join("Vercelli_Book.pdf");
    assert_eq!(summary.outputs, vec![pdf.clone()]);
    let bytes = std::fs::read(&pdf).expect("pdf written");
    assert!(bytes.starts_with(b"%PDF"));

    // Scratch pages are removed in the background once the job completes.
    let scratch = dir.path().join("state").join("pages").join(format!("job_{job_id}"));
    tokio::time::timeout(WAIT, async {
        while scratch.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("scratch pages left behind");

    assert_ok!(handle.shutdown().await);
}

#[tokio::test]
async fn test_pause_and_resume_does_not_refetch_saved_pages() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_manifest(&server, "Exeter Book", 3).await;
    mount_page(&server, 1, page_ok(1)).await;
    mount_page(&server, 2, page_ok(2)).await;
    mount_page(&server, 3, page_ok(3).set_delay(Duration::from_secs(120))).await;

    let dir = TempDir::new().expect("temp dir");
    let db = Database::new_in_memory().await.expect("db");
    let handle = start(db, dir.path(), fast_retries).await;
    let mut events = handle.subscribe();

    let job_id = assert_ok!(handle.enqueue(format!("{}{MANIFEST_PATH}", server.uri())).await);
    wait_for_pages(&mut events, job_id, 2).await;

    assert_ok!(handle.pause(job_id).await);
    let paused = assert_ok!(handle.wait_until_settled(&[job_id]).await).remove(0);
    assert_eq!(paused.status, JobStatus::Paused);
    assert_eq!(paused.completed_pages, 2);

    server.reset().await;
    mount_manifest(&server, "Exeter Book", 3).await;
    for page in 1..=3 {
        mount_page(&server, page, page_ok(page)).await;
    }

    assert_ok!(handle.resume(job_id).await);
    let summary = tokio::time::timeout(WAIT, handle.wait_until_settled(&[job_id]))
        .await
        .expect("job did not settle")
        .expect("orchestrator stopped")
        .remove(0);

    assert_eq!(summary.status, JobStatus::Completed, "{:?}", summary.last_error);
    assert_eq!(requests_for(&server, &image_path(1)).await, 0);
    assert_eq!(requests_for(&server, &image_path(2)).await, 0);
    assert_eq!(requests_for(&server, &image_path(3)).await, 1);
    assert_ok!(handle.shutdown().await);
}

#[tokio::test]
async fn test_restart_continues_interrupted_job() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_manifest(&server, "Junius Manuscript", 4).await;
    for page in 1..=3 {
        mount_page(&server, page, page_ok(page)).await;
    }
    mount_page(&server, 4, page_ok(4).set_delay(Duration::from_secs(120))).await;

    let dir = TempDir::new().expect("temp dir");
    let db_path = dir.path().join("queue.db");
    let manifest_url = format!("{}{MANIFEST_PATH}", server.uri());

    let first = start(Database::new(&db_path).await.expect("db"), dir.path(), fast_retries).await;
    let mut events = first.subscribe();
    let job_id = assert_ok!(first.enqueue(manifest_url.as_str()).await);
    wait_for_pages(&mut events, job_id, 3).await;
    assert_ok!(first.shutdown().await);

    server.reset().await;
    mount_manifest(&server, "Junius Manuscript", 4).await;
    for page in 1..=4 {
        mount_page(&server, page, page_ok(page)).await;
    }

    let second = start(Database::new(&db_path).await.expect("db"), dir.path(), fast_retries).await;
    let summary = tokio::time::timeout(WAIT, second.wait_until_settled(&[job_id]))
        .await
        .expect("job did not settle")
        .expect("orchestrator stopped")
        .remove(0);

    assert_eq!(summary.status, JobStatus::Completed, "{:?}", summary.last_error);
    assert_eq!(summary.source_url, manifest_url);
    for page in 1..=3 {
        assert_eq!(requests_for(&server, &image_path(page)).await, 0, "page {page} refetched");
    }
    assert_eq!(requests_for(&server, &image_path(4)).await, 1);
    assert!(dir.path().join("out").join("Junius_Manuscript.pdf").exists());
    assert_ok!(second.shutdown().await);
}

#[tokio::test]
async fn test_exhausted_retries_fail_job_without_pdf() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_manifest(&server, "Nowell Codex", 3).await;
    mount_page(&server, 1, page_ok(1)).await;
    Mock::given(method("GET"))
        .and(path(image_path(2)))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;
    mount_page(&server, 3, page_ok(3)).await;

    let dir = TempDir::new().expect("temp dir");
    let db = Database::new_in_memory().await.expect("db");
    let handle = start(db, dir.path(), fast_retries).await;

    let job_id = assert_ok!(handle.enqueue(format!("{}{MANIFEST_PATH}", server.uri())).await);
    let summary = tokio::time::timeout(WAIT, handle.wait_until_settled(&[job_id]))
        .await
        .expect("job did not settle")
        .expect("orchestrator stopped")
        .remove(0);

    assert_eq!(summary.status, JobStatus::Failed);
    assert_eq!(summary.error_kind, Some(JobErrorKind::PartialFailure));
    assert_eq!(summary.completed_pages, 2);
    assert_eq!(summary.failed_pages, 1);
    let message = summary.last_error.expect("failure message");
    assert!(message.contains("HTTP 500"), "{message}");
    assert!(!dir.path().join("out").join("Nowell_Codex.pdf").exists());
    assert_ok!(handle.shutdown().await);
}

#[tokio::test]
async fn test_non_manuscript_url_is_unsupported() {
    let dir = TempDir::new().expect("temp dir");
    let db = Database::new_in_memory().await.expect("db");
    let handle = start(db, dir.path(), fast_retries).await;

    let job_id = assert_ok!(handle.enqueue("https://example.org/about.html").await);
    let summary = tokio::time::timeout(WAIT, handle.wait_until_settled(&[job_id]))
        .await
        .expect("job did not settle")
        .expect("orchestrator stopped")
        .remove(0);

    assert_eq!(summary.status, JobStatus::Failed);
    assert_eq!(summary.error_kind, Some(JobErrorKind::UnsupportedLibrary));
    assert_ok!(handle.shutdown().await);
}
