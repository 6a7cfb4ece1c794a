//! Bounded-concurrency page fetcher for one part.
//!
//! [`FetcherPool::run`] takes the pages of a part and returns a channel that
//! yields exactly one terminal [`PageResult`] per page:
//!
//! 1. Pages whose file already exists and validates are reported as
//!    [`PageOutcome::AlreadyPresent`] without touching the network.
//! 2. The rest are fetched with at most `concurrency` requests in flight.
//! 3. A failed fetch consults the library's [`BackoffPolicy`]. A page waiting
//!    out its delay does not hold a slot, so other pages keep flowing.
//!
//! Cancelling the token aborts in-flight requests and closes the channel early;
//! pages without a result are simply still pending.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::error::DownloadError;
use super::host_limiter::{HostLimiter, parse_retry_after};
use super::page_file::{is_valid_page, page_path};
use super::retry::{BackoffPolicy, ErrorKind, RetryDecision, classify_error};
use super::source::{PageRequest, PageSource};

/// One page to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageJob {
    /// 0-based page index within the manuscript.
    pub index: usize,
    /// Image URL.
    pub url: String,
}

/// The pages of one part plus the library settings to fetch them with.
#[derive(Debug, Clone)]
pub struct PartFetch {
    /// Library id, used for circuit breaking and logs.
    pub library: String,
    /// Directory page files are written to.
    pub dir: PathBuf,
    /// Pages to resolve, in any order.
    pub pages: Vec<PageJob>,
    /// Maximum requests in flight for this part.
    pub concurrency: usize,
    /// Library headers.
    pub headers: Vec<(String, String)>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retry policy for the library.
    pub backoff: BackoffPolicy,
}

/// Terminal outcome of one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    /// Fetched during this run.
    Downloaded,
    /// A valid file was already on disk; no request was made.
    AlreadyPresent,
    /// Retries exhausted or the error was permanent.
    Failed {
        /// Classification of the last error.
        kind: ErrorKind,
        /// Human-readable cause.
        message: String,
    },
}

impl PageOutcome {
    /// Returns true for outcomes that leave a usable page file.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Downloaded | Self::AlreadyPresent)
    }
}

/// Exactly one of these is emitted per page.
#[derive(Debug, Clone)]
pub struct PageResult {
    /// 0-based page index.
    pub page_index: usize,
    /// What happened.
    pub outcome: PageOutcome,
    /// Bytes on disk for the page (0 when failed).
    pub bytes: u64,
    /// Wall time from first attempt to terminal outcome, including backoff.
    pub elapsed: Duration,
    /// Number of requests made.
    pub attempts: u32,
}

/// Ephemeral per-page retry state.
#[derive(Debug)]
struct PageTask {
    job: PageJob,
    attempts: u32,
    started: Instant,
}

type FetchOutput = (PageTask, Result<u64, DownloadError>);

/// Shared fetcher; one [`FetcherPool::run`] per active part.
#[derive(Clone)]
pub struct FetcherPool {
    source: Arc<dyn PageSource>,
    hosts: Arc<HostLimiter>,
    min_page_bytes: u64,
}

impl std::fmt::Debug for FetcherPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetcherPool")
            .field("hosts", &self.hosts)
            .field("min_page_bytes", &self.min_page_bytes)
            .finish_non_exhaustive()
    }
}

impl FetcherPool {
    /// Creates a pool over `source`, sharing `hosts` with every other pool.
    #[must_use]
    pub fn new(source: Arc<dyn PageSource>, hosts: Arc<HostLimiter>, min_page_bytes: u64) -> Self {
        Self {
            source,
            hosts,
            min_page_bytes,
        }
    }

    /// Smallest file accepted as a page.
    #[must_use]
    pub fn min_page_bytes(&self) -> u64 {
        self.min_page_bytes
    }

    /// Starts fetching `part` and returns the result stream.
    ///
    /// The channel closes after the last page result, or early on cancellation.
    #[must_use]
    pub fn run(&self, part: PartFetch, cancel: CancellationToken) -> mpsc::Receiver<PageResult> {
        let capacity = part.pages.len().max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let pool = self.clone();
        tokio::spawn(async move {
            pool.drive(part, cancel, tx).await;
        });
        rx
    }

    #[instrument(skip_all, fields(library = %part.library, pages = part.pages.len()))]
    async fn drive(self, part: PartFetch, cancel: CancellationToken, tx: mpsc::Sender<PageResult>) {
        let concurrency = part.concurrency.max(1);
        let mut pending: VecDeque<PageTask> = VecDeque::new();

        for job in &part.pages {
            let path = page_path(&part.dir, job.index);
            if is_valid_page(&path, self.min_page_bytes).await {
                let bytes = tokio::fs::metadata(&path).await.map_or(0, |m| m.len());
                let result = PageResult {
                    page_index: job.index,
                    outcome: PageOutcome::AlreadyPresent,
                    bytes,
                    elapsed: Duration::ZERO,
                    attempts: 0,
                };
                if tx.send(result).await.is_err() {
                    return;
                }
            } else {
                pending.push_back(PageTask {
                    job: job.clone(),
                    attempts: 0,
                    started: Instant::now(),
                });
            }
        }

        let part = Arc::new(part);
        let mut in_flight: JoinSet<FetchOutput> = JoinSet::new();
        let mut waiting: JoinSet<PageTask> = JoinSet::new();

        loop {
            while in_flight.len() < concurrency {
                let Some(task) = pending.pop_front() else {
                    break;
                };
                in_flight.spawn(self.clone().fetch(Arc::clone(&part), task));
            }

            if in_flight.is_empty() && waiting.is_empty() {
                break;
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("fetch cancelled");
                    in_flight.shutdown().await;
                    waiting.shutdown().await;
                    return;
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    let Ok((task, outcome)) = joined else {
                        warn!("page fetch task panicked");
                        continue;
                    };
                    match self.settle(&part, task, outcome).await {
                        Settled::Done(result) => {
                            if tx.send(result).await.is_err() {
                                return;
                            }
                        }
                        Settled::RetryAfter(task, delay) => {
                            waiting.spawn(async move {
                                tokio::time::sleep(delay).await;
                                task
                            });
                        }
                    }
                }
                Some(joined) = waiting.join_next(), if !waiting.is_empty() => {
                    if let Ok(task) = joined {
                        pending.push_back(task);
                    }
                }
            }
        }

        info!("all pages resolved");
    }

    async fn fetch(self, part: Arc<PartFetch>, mut task: PageTask) -> FetchOutput {
        task.attempts += 1;
        let request = PageRequest {
            url: task.job.url.clone(),
            library: part.library.clone(),
            headers: part.headers.clone(),
            timeout: part.timeout,
            min_bytes: self.min_page_bytes,
        };
        let dest = page_path(&part.dir, task.job.index);

        let _permit = match self.hosts.acquire(&request.url).await {
            Ok(permit) => permit,
            Err(e) => {
                let err = DownloadError::io(&dest, std::io::Error::other(e));
                return (task, Err(err));
            }
        };
        let result = self.source.fetch_page(&request, &dest).await;
        (task, result)
    }

    async fn settle(
        &self,
        part: &PartFetch,
        task: PageTask,
        outcome: Result<u64, DownloadError>,
    ) -> Settled {
        let error = match outcome {
            Ok(bytes) => {
                return Settled::Done(PageResult {
                    page_index: task.job.index,
                    outcome: PageOutcome::Downloaded,
                    bytes,
                    elapsed: task.started.elapsed(),
                    attempts: task.attempts,
                });
            }
            Err(error) => error,
        };

        let kind = classify_error(&error);
        let retry_after = error.retry_after().and_then(parse_retry_after);
        if kind == ErrorKind::RateLimited
            && let Some(hint) = retry_after
        {
            self.hosts.record_rate_limit(&task.job.url, hint).await;
        }

        match part.backoff.next_delay(kind, task.attempts, retry_after) {
            RetryDecision::Retry { delay, .. } => {
                debug!(
                    page = task.job.index,
                    attempt = task.attempts,
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "requeueing page"
                );
                Settled::RetryAfter(task, delay)
            }
            RetryDecision::GiveUp { reason } => {
                warn!(
                    page = task.job.index,
                    attempts = task.attempts,
                    %kind,
                    error = %error,
                    "page failed: {reason}"
                );
                Settled::Done(PageResult {
                    page_index: task.job.index,
                    outcome: PageOutcome::Failed {
                        kind,
                        message: format!("{error} ({reason})"),
                    },
                    bytes: 0,
                    elapsed: task.started.elapsed(),
                    attempts: task.attempts,
                })
            }
        }
    }
}

enum Settled {
    Done(PageResult),
    RetryAfter(PageTask, Duration),
}

/// Drains a result stream into a vector; handy for callers that do not need
/// per-page progress.
pub async fn collect_results(mut rx: mpsc::Receiver<PageResult>) -> Vec<PageResult> {
    let mut results = Vec::new();
    while let Some(result) = rx.recv().await {
        results.push(result);
    }
    results
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    fn fake_image() -> Vec<u8> {
        let mut body = PNG_MAGIC.to_vec();
        body.resize(2048, 7);
        body
    }

    /// Scripted source: each URL fails with the queued errors, then succeeds.
    #[derive(Default)]
    struct Scripted {
        failures: Mutex<HashMap<String, VecDeque<DownloadError>>>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl Scripted {
        fn fail(&self, url: &str, errors: Vec<DownloadError>) {
            self.failures
                .lock()
                .unwrap()
                .insert(url.to_string(), errors.into());
        }
    }

    #[async_trait]
    impl PageSource for Scripted {
        async fn fetch_page(
            &self,
            request: &PageRequest,
            dest: &Path,
        ) -> Result<u64, DownloadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let next = self
                .failures
                .lock()
                .unwrap()
                .get_mut(&request.url)
                .and_then(VecDeque::pop_front);
            if let Some(error) = next {
                return Err(error);
            }
            tokio::fs::create_dir_all(dest.parent().unwrap()).await.unwrap();
            tokio::fs::write(dest, fake_image()).await.unwrap();
            Ok(2048)
        }
    }

    fn part(dir: &Path, pages: usize, concurrency: usize) -> PartFetch {
        PartFetch {
            library: "test".to_string(),
            dir: dir.to_path_buf(),
            pages: (0..pages)
                .map(|index| PageJob {
                    index,
                    url: format!("https://iiif.example.org/p{index}.jpg"),
                })
                .collect(),
            concurrency,
            headers: Vec::new(),
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::default()
                .with_delays(Duration::from_millis(10), Duration::from_millis(50)),
        }
    }

    fn pool(source: Arc<Scripted>) -> FetcherPool {
        FetcherPool::new(source, Arc::new(HostLimiter::new(64)), 1024)
    }

    #[tokio::test]
    async fn test_run_emits_one_result_per_page() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(Scripted::default());
        let results = collect_results(
            pool(Arc::clone(&source)).run(part(dir.path(), 12, 3), CancellationToken::new()),
        )
        .await;

        let mut indices: Vec<usize> = results.iter().map(|r| r.page_index).collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..12).collect::<Vec<_>>());
        assert!(results.iter().all(|r| r.outcome == PageOutcome::Downloaded));
        assert!(source.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_valid_files_are_not_refetched() {
        let dir = tempfile::tempdir().unwrap();
        for index in 0..5 {
            std::fs::write(page_path(dir.path(), index), fake_image()).unwrap();
        }
        let source = Arc::new(Scripted::default());
        let results = collect_results(
            pool(Arc::clone(&source)).run(part(dir.path(), 5, 2), CancellationToken::new()),
        )
        .await;

        assert_eq!(results.len(), 5);
        assert!(
            results
                .iter()
                .all(|r| r.outcome == PageOutcome::AlreadyPresent)
        );
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(Scripted::default());
        source.fail(
            "https://iiif.example.org/p0.jpg",
            vec![
                DownloadError::http_status("https://iiif.example.org/p0.jpg", 502),
                DownloadError::timeout("https://iiif.example.org/p0.jpg"),
            ],
        );

        let results = collect_results(
            pool(Arc::clone(&source)).run(part(dir.path(), 1, 1), CancellationToken::new()),
        )
        .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome, PageOutcome::Downloaded);
        assert_eq!(results[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_mark_page_failed() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(Scripted::default());
        let url = "https://iiif.example.org/p0.jpg";
        source.fail(
            url,
            (0..10).map(|_| DownloadError::http_status(url, 503)).collect(),
        );

        let results = collect_results(
            pool(Arc::clone(&source)).run(part(dir.path(), 1, 1), CancellationToken::new()),
        )
        .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].attempts, 10);
        match &results[0].outcome {
            PageOutcome::Failed { kind, message } => {
                assert_eq!(*kind, ErrorKind::TransientNetwork);
                assert!(message.contains("exhausted"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(Scripted::default());
        let url = "https://iiif.example.org/p0.jpg";
        source.fail(url, vec![DownloadError::http_status(url, 404)]);

        let results = collect_results(
            pool(Arc::clone(&source)).run(part(dir.path(), 1, 1), CancellationToken::new()),
        )
        .await;

        assert_eq!(results[0].attempts, 1);
        assert!(matches!(
            results[0].outcome,
            PageOutcome::Failed {
                kind: ErrorKind::Permanent,
                ..
            }
        ));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiting_page_does_not_block_others() {
        tokio::time::pause();
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(Scripted::default());
        let url = "https://iiif.example.org/p0.jpg";
        source.fail(
            url,
            vec![DownloadError::http_status_with_retry_after(
                url,
                429,
                Some("30".to_string()),
            )],
        );

        let mut rx =
            pool(Arc::clone(&source)).run(part(dir.path(), 4, 1), CancellationToken::new());

        let mut order = Vec::new();
        while let Some(result) = rx.recv().await {
            order.push(result.page_index);
        }
        assert_eq!(order.len(), 4);
        assert_eq!(*order.last().unwrap(), 0, "rate-limited page finishes last");
    }

    #[tokio::test]
    async fn test_cancel_closes_stream_early() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(Scripted::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let results =
            collect_results(pool(Arc::clone(&source)).run(part(dir.path(), 20, 2), cancel)).await;

        assert!(results.len() < 20);
    }
}
