//! Download queue orchestration.
//!
//! One actor task owns every [`Job`]. Callers talk to it through an
//! [`OrchestratorHandle`]; work the actor spawns (manifest loads, page
//! fetches, PDF assembly) reports back through the same mailbox tagged with a
//! run id, so results from a paused or deleted run are dropped on arrival.
//!
//! ```text
//! Queued → ResolvingManifest → Splitting → Downloading → Assembling → Completed
//!                │                              │              │
//!                └──────────────→ Failed ←──────┴──────────────┘
//! ```
//!
//! Any state short of `Completed`/`Failed` can be paused; resuming returns to
//! it. Every state change is persisted before it is broadcast.

mod error;
mod events;
mod job;
pub mod paths;
mod progress;
mod store;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::assemble::{AssemblyError, AssemblyRequest, PageInput, PdfAssembler};
use crate::download::constants::{MAX_CONCURRENCY, PAGE_TIMEOUT_SECS};
use crate::download::page_file::{is_valid_page, page_path};
use crate::download::{FetcherPool, PageJob, PageOutcome, PageResult, PartFetch};
use crate::library::LibraryProfile;
use crate::manifest::{ManifestResolver, PageRange, ResolveError, ResolvedManifest};
use crate::split::{SplitPolicy, split};

pub(crate) use events::Command;
use events::Reply;

pub use error::{OrchestratorError, StoreError, StoreErrorKind};
pub use events::QueueEvent;
pub use job::{Job, JobErrorKind, JobStatus, JobSummary, PageState, Part, PartStatus};
pub use progress::{ETA_WINDOW, Eta, EtaEstimator, MIN_ETA_SAMPLES, PartInfo, ProgressEvent};
pub use store::JobStore;

/// Time without a page result before a downloading job is failed.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(600);

/// How often the stall watchdog looks at active runs.
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(15);

/// Jobs processed at the same time.
pub const DEFAULT_MAX_ACTIVE_JOBS: usize = 1;

const MAILBOX_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 1024;

/// Page errors quoted in a job's failure message.
const REPORTED_PAGE_ERRORS: usize = 5;

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Where finished PDFs are written.
    pub output_dir: PathBuf,
    /// Root of the page scratch directories.
    pub state_dir: PathBuf,
    /// Jobs processed at the same time (at least 1).
    pub max_active_jobs: usize,
    /// Part size limits.
    pub split: SplitPolicy,
    /// A part is assembled only while its failed-page fraction stays below this.
    pub failure_tolerance: f64,
    /// Page request timeout before library multipliers.
    pub page_timeout: Duration,
    /// See [`DEFAULT_STALL_TIMEOUT`].
    pub stall_timeout: Duration,
    /// See [`DEFAULT_WATCHDOG_INTERVAL`].
    pub watchdog_interval: Duration,
}

impl OrchestratorConfig {
    /// Default settings writing PDFs to `output_dir` and scratch files under `state_dir`.
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            state_dir: state_dir.into(),
            max_active_jobs: DEFAULT_MAX_ACTIVE_JOBS,
            split: SplitPolicy::default(),
            failure_tolerance: 0.0,
            page_timeout: Duration::from_secs(PAGE_TIMEOUT_SECS),
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
        }
    }
}

/// Whether the orchestrator picks up work on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Schedule queued and interrupted jobs.
    Active,
    /// Only answer commands; used by one-shot CLI operations.
    Idle,
}

/// Owns the collaborators until [`Orchestrator::start`] hands them to the actor.
#[derive(Debug)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    resolver: ManifestResolver,
    pool: FetcherPool,
    store: JobStore,
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        resolver: ManifestResolver,
        pool: FetcherPool,
        store: JobStore,
    ) -> Self {
        Self {
            config,
            resolver,
            pool,
            store,
        }
    }

    /// Loads persisted jobs and spawns the actor.
    ///
    /// In [`RunMode::Active`], pages recorded as done whose file is missing or
    /// corrupt are reset to pending before anything is scheduled.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Store`] if jobs cannot be loaded or the rescan
    /// cannot be saved.
    #[instrument(skip(self))]
    pub async fn start(self, mode: RunMode) -> Result<OrchestratorHandle, OrchestratorError> {
        let mut jobs = self.store.load_jobs().await?;
        if mode == RunMode::Active {
            for job in &mut jobs {
                if rescan_pages(job, &self.config.state_dir, self.pool.min_page_bytes()).await {
                    self.store.save_job(job).await?;
                }
            }
        }

        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let actor = Actor {
            assembler: PdfAssembler::new(self.config.failure_tolerance),
            config: self.config,
            resolver: self.resolver,
            pool: self.pool,
            store: self.store,
            mode,
            mailbox: tx.downgrade(),
            events: events.clone(),
            jobs: jobs.into_iter().map(|job| (job.id, job)).collect(),
            runs: HashMap::new(),
            next_run: 0,
        };
        tokio::spawn(actor.run(rx));

        Ok(OrchestratorHandle { tx, events })
    }
}

/// Resets done pages whose file no longer validates. Returns true if anything changed.
async fn rescan_pages(job: &mut Job, state_dir: &Path, min_page_bytes: u64) -> bool {
    if !matches!(job.status, JobStatus::Downloading | JobStatus::Assembling) {
        return false;
    }

    let changed = revalidate_parts(job, state_dir, min_page_bytes).await > 0;
    if changed && job.status == JobStatus::Assembling {
        job.status = JobStatus::Downloading;
    }
    changed
}

/// Checks the files of done pages in every unfinished part. Pages whose file
/// is missing or not an image go back to pending, as does their part.
/// Returns the number of pages reset.
async fn revalidate_parts(job: &mut Job, state_dir: &Path, min_page_bytes: u64) -> usize {
    let mut total = 0;
    for part in &mut job.parts {
        if part.status == PartStatus::Completed {
            continue;
        }
        let dir = paths::part_work_dir(state_dir, job.id, part.index);
        let mut reset = 0;
        for index in part.start..=part.end {
            if part.page_state(index) == Some(PageState::Done)
                && !is_valid_page(&page_path(&dir, index), min_page_bytes).await
            {
                part.set_page(index, PageState::Pending);
                reset += 1;
            }
        }
        if reset > 0 {
            warn!(
                job_id = job.id,
                part = part.index + 1,
                reset,
                "page files missing or corrupt, refetching"
            );
            part.status = PartStatus::Pending;
            total += reset;
        }
    }
    total
}

/// Cloneable front door to a running orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<QueueEvent>,
}

impl OrchestratorHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| OrchestratorError::Stopped)?;
        rx.await.map_err(|_| OrchestratorError::Stopped)?
    }

    /// Queues a source URL and returns the new job id.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Store`] if the job cannot be persisted.
    pub async fn enqueue(&self, url: impl Into<String>) -> Result<i64, OrchestratorError> {
        self.enqueue_range(url, None).await
    }

    /// Queues a source URL limited to `page_range` (the whole manuscript when
    /// `None`) and returns the new job id.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Store`] if the job cannot be persisted.
    pub async fn enqueue_range(
        &self,
        url: impl Into<String>,
        page_range: Option<PageRange>,
    ) -> Result<i64, OrchestratorError> {
        let url = url.into();
        self.request(|reply| Command::Enqueue {
            url,
            page_range,
            reply,
        })
        .await
    }

    /// Stops a job's in-flight work and parks it.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::JobNotFound`], or
    /// [`OrchestratorError::InvalidTransition`] for finished or already paused jobs.
    pub async fn pause(&self, job_id: i64) -> Result<(), OrchestratorError> {
        self.request(|reply| Command::Pause { job_id, reply }).await
    }

    /// Returns a paused job to the state it was paused in.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::JobNotFound`], or
    /// [`OrchestratorError::InvalidTransition`] if the job is not paused.
    pub async fn resume(&self, job_id: i64) -> Result<(), OrchestratorError> {
        self.request(|reply| Command::Resume { job_id, reply }).await
    }

    /// Cancels a job and removes it with its scratch files. PDFs already
    /// written are kept.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::JobNotFound`] or [`OrchestratorError::Store`].
    pub async fn delete(&self, job_id: i64) -> Result<(), OrchestratorError> {
        self.request(|reply| Command::Delete { job_id, reply }).await
    }

    /// Requeues one failed job, or every retryable failed job when `job_id` is
    /// `None`. Returns the ids requeued.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::JobNotFound`], or
    /// [`OrchestratorError::InvalidTransition`] if the given job has not failed.
    pub async fn retry(&self, job_id: Option<i64>) -> Result<Vec<i64>, OrchestratorError> {
        self.request(|reply| Command::Retry { job_id, reply }).await
    }

    /// Snapshot of every job, oldest first.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Stopped`] if the actor is gone.
    pub async fn list(&self) -> Result<Vec<JobSummary>, OrchestratorError> {
        self.request(|reply| Command::List { reply }).await
    }

    /// Subscribes to status, progress and output events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Waits until none of `job_ids` is queued or active, then returns their
    /// summaries. Never returns in [`RunMode::Idle`] while a listed job is queued.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Stopped`] if the actor exits first.
    pub async fn wait_until_settled(
        &self,
        job_ids: &[i64],
    ) -> Result<Vec<JobSummary>, OrchestratorError> {
        let mut events = self.subscribe();
        loop {
            let jobs = self.list().await?;
            let busy = jobs.iter().any(|job| {
                job_ids.contains(&job.id)
                    && !job.status.is_terminal()
                    && job.status != JobStatus::Paused
            });
            if !busy {
                return Ok(jobs
                    .into_iter()
                    .filter(|job| job_ids.contains(&job.id))
                    .collect());
            }

            loop {
                match events.recv().await {
                    Ok(QueueEvent::StatusChanged { .. } | QueueEvent::Removed { .. })
                    | Err(RecvError::Lagged(_)) => break,
                    Ok(_) => {}
                    Err(RecvError::Closed) => return Err(OrchestratorError::Stopped),
                }
            }
        }
    }

    /// Cancels in-flight work and stops the actor. Interrupted jobs keep their
    /// persisted state and continue on the next start.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Stopped`] if the actor already exited.
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown { reply })
            .await
            .map_err(|_| OrchestratorError::Stopped)?;
        rx.await.map_err(|_| OrchestratorError::Stopped)
    }
}

/// Bookkeeping for one job's current stretch of work.
#[derive(Debug)]
struct Run {
    id: u64,
    cancel: CancellationToken,
    last_progress: Instant,
    eta: EtaEstimator,
    active_part: Option<usize>,
    page_errors: BTreeMap<usize, String>,
    assembly_errors: Vec<String>,
}

struct Actor {
    config: OrchestratorConfig,
    resolver: ManifestResolver,
    pool: FetcherPool,
    store: JobStore,
    assembler: PdfAssembler,
    mode: RunMode,
    mailbox: mpsc::WeakSender<Command>,
    events: broadcast::Sender<QueueEvent>,
    jobs: BTreeMap<i64, Job>,
    runs: HashMap<i64, Run>,
    next_run: u64,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        info!(jobs = self.jobs.len(), mode = ?self.mode, "orchestrator started");
        let mut watchdog = tokio::time::interval(self.config.watchdog_interval);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.schedule().await;
        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if !self.handle(command).await {
                        break;
                    }
                    self.schedule().await;
                }
                _ = watchdog.tick() => {
                    if self.check_stalls().await {
                        self.schedule().await;
                    }
                }
            }
        }

        self.stop_all();
        info!("orchestrator stopped");
    }

    /// Returns false once the actor should exit.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Enqueue {
                url,
                page_range,
                reply,
            } => {
                let _ = reply.send(self.enqueue(url, page_range).await);
            }
            Command::Pause { job_id, reply } => {
                let _ = reply.send(self.pause(job_id).await);
            }
            Command::Resume { job_id, reply } => {
                let _ = reply.send(self.resume(job_id).await);
            }
            Command::Delete { job_id, reply } => {
                let _ = reply.send(self.delete(job_id).await);
            }
            Command::Retry { job_id, reply } => {
                let _ = reply.send(self.retry(job_id).await);
            }
            Command::List { reply } => {
                let _ = reply.send(Ok(self.jobs.values().map(Job::summary).collect()));
            }
            Command::Shutdown { reply } => {
                self.stop_all();
                let _ = reply.send(());
                return false;
            }
            Command::ManifestResolved {
                job_id,
                run,
                result,
            } => self.on_manifest(job_id, run, result).await,
            Command::PageFinished {
                job_id,
                run,
                part,
                result,
            } => self.on_page(job_id, run, part, result).await,
            Command::PoolDrained { job_id, run, part } => {
                self.on_pool_drained(job_id, run, part).await;
            }
            Command::PartAssembled {
                job_id,
                run,
                part,
                result,
            } => self.on_assembled(job_id, run, part, result).await,
        }
        true
    }

    // ---- scheduling -------------------------------------------------------

    async fn schedule(&mut self) {
        if self.mode == RunMode::Idle {
            return;
        }
        let limit = self.config.max_active_jobs.max(1);
        while self.runs.len() < limit {
            // Interrupted work first, then the oldest queued job.
            let next = self
                .jobs
                .values()
                .find(|job| job.status.is_active() && !self.runs.contains_key(&job.id))
                .or_else(|| {
                    self.jobs
                        .values()
                        .find(|job| job.status == JobStatus::Queued)
                })
                .map(|job| job.id);
            let Some(job_id) = next else {
                break;
            };
            self.begin_run(job_id);
            self.drive(job_id).await;
        }
    }

    fn begin_run(&mut self, job_id: i64) {
        self.next_run += 1;
        self.runs.insert(
            job_id,
            Run {
                id: self.next_run,
                cancel: CancellationToken::new(),
                last_progress: Instant::now(),
                eta: EtaEstimator::default(),
                active_part: None,
                page_errors: BTreeMap::new(),
                assembly_errors: Vec::new(),
            },
        );
    }

    fn end_run(&mut self, job_id: i64) {
        if let Some(run) = self.runs.remove(&job_id) {
            run.cancel.cancel();
        }
    }

    fn stop_all(&mut self) {
        for (_, run) in self.runs.drain() {
            run.cancel.cancel();
        }
    }

    fn is_current(&self, job_id: i64, run: u64) -> bool {
        self.runs.get(&job_id).is_some_and(|r| r.id == run)
    }

    /// Continues a job from whatever state it is in.
    async fn drive(&mut self, job_id: i64) {
        let Some((status, has_manifest)) = self
            .jobs
            .get(&job_id)
            .map(|job| (job.status, job.manifest.is_some()))
        else {
            return;
        };

        match status {
            JobStatus::Queued => {
                if self.set_status(job_id, JobStatus::ResolvingManifest).await {
                    self.spawn_resolve(job_id);
                } else {
                    self.end_run(job_id);
                }
            }
            JobStatus::ResolvingManifest => self.spawn_resolve(job_id),
            JobStatus::Splitting | JobStatus::Downloading | JobStatus::Assembling
                if !has_manifest =>
            {
                warn!(job_id, %status, "stored job has no manifest, resolving again");
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.status = JobStatus::ResolvingManifest;
                }
                self.persist(job_id).await;
                self.emit_status(job_id);
                self.spawn_resolve(job_id);
            }
            JobStatus::Splitting => self.split_job(job_id).await,
            JobStatus::Downloading => self.download_next_part(job_id).await,
            JobStatus::Assembling => self.assemble_next_part(job_id).await,
            JobStatus::Paused | JobStatus::Completed | JobStatus::Failed => self.end_run(job_id),
        }
    }

    // ---- state changes ----------------------------------------------------

    async fn set_status(&mut self, job_id: i64, to: JobStatus) -> bool {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return false;
        };
        if let Err(e) = job.transition(to) {
            warn!(error = %e, "transition refused");
            return false;
        }
        debug!(job_id, status = %to, "job status changed");
        self.persist(job_id).await;
        self.emit_status(job_id);
        true
    }

    async fn fail_job(&mut self, job_id: i64, kind: JobErrorKind, message: String) {
        self.end_run(job_id);
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if let Err(e) = job.fail(kind, message.clone()) {
            warn!(error = %e, "could not mark job failed");
            return;
        }
        warn!(job_id, %kind, "job failed: {message}");
        self.persist(job_id).await;
        self.emit_status(job_id);
    }

    async fn persist(&self, job_id: i64) {
        if let Some(job) = self.jobs.get(&job_id)
            && let Err(e) = self.store.save_job(job).await
        {
            error!(job_id, error = %e, "failed to persist job");
        }
    }

    async fn persist_part(&self, job_id: i64, part_index: usize) {
        if let Some(part) = self
            .jobs
            .get(&job_id)
            .and_then(|job| job.parts.get(part_index))
            && let Err(e) = self.store.save_part(job_id, part).await
        {
            error!(job_id, part = part_index + 1, error = %e, "failed to persist part");
        }
    }

    fn emit_status(&self, job_id: i64) {
        if let Some(job) = self.jobs.get(&job_id) {
            let _ = self.events.send(QueueEvent::StatusChanged {
                job_id,
                status: job.status,
                error_kind: job.error_kind,
                error: job.last_error.clone(),
            });
        }
    }

    fn emit_progress(&self, job_id: i64) {
        let (Some(job), Some(run)) = (self.jobs.get(&job_id), self.runs.get(&job_id)) else {
            return;
        };
        let remaining = job
            .total_pages
            .saturating_sub(job.completed_pages() + job.failed_pages());
        let event = ProgressEvent::for_job(job, run.active_part, run.eta.estimate(remaining));
        let _ = self.events.send(QueueEvent::Progress(event));
    }

    fn profile_for(&self, library: &str) -> LibraryProfile {
        self.resolver
            .registry()
            .profile(library)
            .cloned()
            .unwrap_or_else(|| LibraryProfile::new(library, library))
    }

    // ---- manifest ---------------------------------------------------------

    fn spawn_resolve(&self, job_id: i64) {
        let (Some(job), Some(run)) = (self.jobs.get(&job_id), self.runs.get(&job_id)) else {
            return;
        };
        let Some(mailbox) = self.mailbox.upgrade() else {
            return;
        };
        let resolver = self.resolver.clone();
        let url = job.source_url.clone();
        let cancel = run.cancel.clone();
        let run = run.id;
        tokio::spawn(async move {
            let result = tokio::select! {
                result = resolver.resolve(&url) => result,
                () = cancel.cancelled() => return,
            };
            let _ = mailbox
                .send(Command::ManifestResolved {
                    job_id,
                    run,
                    result,
                })
                .await;
        });
    }

    async fn on_manifest(
        &mut self,
        job_id: i64,
        run: u64,
        result: Result<ResolvedManifest, ResolveError>,
    ) {
        if !self.is_current(job_id, run) {
            debug!(job_id, run, "dropping stale manifest result");
            return;
        }
        let mut resolved = match result {
            Ok(resolved) => resolved,
            Err(e) => {
                let kind = if e.is_unsupported() {
                    JobErrorKind::UnsupportedLibrary
                } else {
                    JobErrorKind::ManifestFetch
                };
                self.fail_job(job_id, kind, e.to_string()).await;
                return;
            }
        };

        let page_range = self.jobs.get(&job_id).and_then(|job| job.page_range);
        if let Some(range) = page_range {
            let available = resolved.manifest.page_count();
            match resolved.manifest.select(range) {
                Ok(selected) => {
                    debug!(job_id, %range, available, selected = selected.page_count(), "page range applied");
                    resolved.manifest = Arc::new(selected);
                }
                Err(e) => {
                    let message = format!("{e}\n  Suggestion: delete the job and add it again with a range inside 1-{available}");
                    self.fail_job(job_id, JobErrorKind::PageRange, message).await;
                    return;
                }
            }
        }
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        let page_count = resolved.manifest.page_count();
        let keep_parts = !job.parts.is_empty() && job.total_pages == page_count;
        let discard_pages = !job.parts.is_empty() && !keep_parts;
        if !keep_parts {
            job.parts.clear();
        }
        info!(
            job_id,
            library = %resolved.library_id,
            pages = page_count,
            title = %resolved.manifest.display_name,
            "manifest loaded"
        );
        job.library_id = Some(resolved.library_id);
        job.display_name = Some(resolved.manifest.display_name.clone())
            .filter(|name| !name.trim().is_empty());
        job.total_pages = page_count;
        job.manifest = Some(resolved.manifest);

        if discard_pages {
            info!(job_id, "page count changed since the last run, discarding pages");
            let dir = paths::job_work_dir(&self.config.state_dir, job_id);
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %dir.display(), error = %e, "could not remove stale pages");
            }
        }

        if self.set_status(job_id, JobStatus::Splitting).await {
            self.split_job(job_id).await;
        }
    }

    async fn split_job(&mut self, job_id: i64) {
        let library = self
            .jobs
            .get(&job_id)
            .and_then(|job| job.library_id.clone())
            .unwrap_or_default();
        let profile = self.profile_for(&library);
        let policy = SplitPolicy {
            max_pages_per_part: self.config.split.max_pages_per_part,
            max_bytes_per_part: profile
                .max_part_bytes
                .unwrap_or(self.config.split.max_bytes_per_part),
        };

        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if job.parts.is_empty() {
            let Some(manifest) = job.manifest.clone() else {
                return;
            };
            job.parts = split(&manifest, policy, profile.avg_page_bytes)
                .into_iter()
                .map(Part::from_spec)
                .collect();
            info!(job_id, parts = job.parts.len(), pages = job.total_pages, "manuscript split");
        }

        if self.set_status(job_id, JobStatus::Downloading).await {
            self.download_next_part(job_id).await;
        }
    }

    // ---- downloading ------------------------------------------------------

    /// Starts the first part with pending pages, or moves on once none remain.
    async fn download_next_part(&mut self, job_id: i64) {
        loop {
            let Some(job) = self.jobs.get(&job_id) else {
                return;
            };
            let Some(part_index) = job.next_download_part() else {
                self.finish_downloading(job_id).await;
                return;
            };
            let Some(manifest) = job.manifest.clone() else {
                return;
            };
            let library = job.library_id.clone().unwrap_or_default();
            let part = &job.parts[part_index];
            let pending: Vec<usize> = (part.start..=part.end)
                .filter(|&index| part.page_state(index) == Some(PageState::Pending))
                .collect();
            let pages: Vec<PageJob> = pending
                .iter()
                .filter_map(|&index| {
                    manifest.pages.get(index).map(|page| PageJob {
                        index,
                        url: page.url.clone(),
                    })
                })
                .collect();

            if pages.len() < pending.len() {
                let message = format!(
                    "manifest has no image for {} pending pages of part {}",
                    pending.len() - pages.len(),
                    part_index + 1
                );
                self.fail_job(job_id, JobErrorKind::PageFetch, message).await;
                return;
            }

            let Some(part) = self
                .jobs
                .get_mut(&job_id)
                .and_then(|job| job.parts.get_mut(part_index))
            else {
                return;
            };
            if pages.is_empty() {
                part.status = PartStatus::Downloaded;
                self.persist_part(job_id, part_index).await;
                continue;
            }
            part.status = PartStatus::Downloading;
            self.persist_part(job_id, part_index).await;
            self.start_fetch(job_id, part_index, library, pages);
            return;
        }
    }

    fn start_fetch(&mut self, job_id: i64, part_index: usize, library: String, pages: Vec<PageJob>) {
        let profile = self.profile_for(&library);
        let timeout = profile.scaled_timeout(self.config.page_timeout);
        let Some(mailbox) = self.mailbox.upgrade() else {
            return;
        };
        let Some(run) = self.runs.get_mut(&job_id) else {
            return;
        };
        run.active_part = Some(part_index);
        run.last_progress = Instant::now();
        let run_id = run.id;
        let cancel = run.cancel.clone();

        info!(job_id, part = part_index + 1, pages = pages.len(), %library, "downloading part");
        let fetch = PartFetch {
            library,
            dir: paths::part_work_dir(&self.config.state_dir, job_id, part_index),
            pages,
            concurrency: profile.concurrency.clamp(1, MAX_CONCURRENCY),
            headers: profile.headers,
            timeout,
            backoff: profile.backoff,
        };
        let mut results = self.pool.run(fetch, cancel.clone());
        tokio::spawn(async move {
            while let Some(result) = results.recv().await {
                let command = Command::PageFinished {
                    job_id,
                    run: run_id,
                    part: part_index,
                    result,
                };
                if mailbox.send(command).await.is_err() {
                    return;
                }
            }
            if !cancel.is_cancelled() {
                let _ = mailbox
                    .send(Command::PoolDrained {
                        job_id,
                        run: run_id,
                        part: part_index,
                    })
                    .await;
            }
        });
    }

    async fn on_page(&mut self, job_id: i64, run: u64, part_index: usize, result: PageResult) {
        if !self.is_current(job_id, run) {
            return;
        }
        let now = Instant::now();
        if let Some(run) = self.runs.get_mut(&job_id) {
            run.last_progress = now;
            match &result.outcome {
                PageOutcome::Downloaded => run.eta.record(now.into_std()),
                PageOutcome::AlreadyPresent => {}
                PageOutcome::Failed { kind, message } => {
                    run.page_errors.insert(
                        result.page_index,
                        format!("page {}: {kind}: {message}", result.page_index + 1),
                    );
                }
            }
        }

        let state = if result.outcome.is_success() {
            PageState::Done
        } else {
            PageState::Failed
        };
        let Some(part) = self
            .jobs
            .get_mut(&job_id)
            .and_then(|job| job.parts.get_mut(part_index))
        else {
            return;
        };
        if !part.set_page(result.page_index, state) {
            return;
        }
        debug!(
            job_id,
            page = result.page_index + 1,
            attempts = result.attempts,
            bytes = result.bytes,
            "page settled"
        );
        self.persist_part(job_id, part_index).await;
        self.emit_progress(job_id);
    }

    async fn on_pool_drained(&mut self, job_id: i64, run: u64, part_index: usize) {
        if !self.is_current(job_id, run) {
            return;
        }
        let Some(part) = self
            .jobs
            .get_mut(&job_id)
            .and_then(|job| job.parts.get_mut(part_index))
        else {
            return;
        };
        if !part.all_terminal() {
            let unresolved = part.len() - part.completed_pages() - part.failed_pages();
            let message = format!(
                "fetcher stopped with {unresolved} pages unresolved in part {}",
                part_index + 1
            );
            self.fail_job(job_id, JobErrorKind::PageFetch, message).await;
            return;
        }
        part.status = PartStatus::Downloaded;
        self.persist_part(job_id, part_index).await;
        self.download_next_part(job_id).await;
    }

    /// Applies the failure tolerance to every part, then assembles or fails.
    async fn finish_downloading(&mut self, job_id: i64) {
        let assembler = self.assembler;
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        let mut over_tolerance = 0;
        for part in &mut job.parts {
            if part.status == PartStatus::Completed {
                continue;
            }
            if assembler
                .check_tolerance(part.failed_pages(), part.len())
                .is_err()
            {
                part.status = PartStatus::Failed;
                over_tolerance += 1;
            }
        }

        if over_tolerance == 0 {
            if self.set_status(job_id, JobStatus::Assembling).await {
                self.assemble_next_part(job_id).await;
            }
            return;
        }

        let failed = job.failed_pages();
        let total = job.total_pages;
        let kind = if failed >= total {
            JobErrorKind::PageFetch
        } else {
            JobErrorKind::PartialFailure
        };
        let mut lines = vec![format!(
            "{failed} of {total} pages failed permanently (tolerance {:.1}%)",
            assembler.failure_tolerance() * 100.0
        )];
        if let Some(run) = self.runs.get(&job_id) {
            lines.extend(run.page_errors.values().take(REPORTED_PAGE_ERRORS).cloned());
            let unlisted = run.page_errors.len().saturating_sub(REPORTED_PAGE_ERRORS);
            if unlisted > 0 {
                lines.push(format!("... and {unlisted} more"));
            }
        }
        lines.push("Suggestion: run `retry` once the library is reachable again".to_string());
        self.fail_job(job_id, kind, lines.join("\n  ")).await;
    }

    // ---- assembly ---------------------------------------------------------

    async fn assemble_next_part(&mut self, job_id: i64) {
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        let Some(part_index) = job
            .parts
            .iter()
            .position(|part| part.status == PartStatus::Downloaded)
        else {
            self.finish_assembling(job_id).await;
            return;
        };

        let part = &job.parts[part_index];
        let dir = paths::part_work_dir(&self.config.state_dir, job_id, part_index);
        let offset = job.page_offset();
        let file_name = paths::part_file_name(
            job.title(),
            part_index,
            job.parts.len(),
            (part.start + offset)..=(part.end + offset),
            job.page_range.is_some(),
        );
        let request = AssemblyRequest {
            title: job.title().to_string(),
            pages: (part.start..=part.end)
                .map(|index| PageInput {
                    index,
                    file: (part.page_state(index) == Some(PageState::Done))
                        .then(|| page_path(&dir, index)),
                })
                .collect(),
            output_path: self.config.output_dir.join(file_name),
            page_dir: Some(dir),
        };

        let Some(mailbox) = self.mailbox.upgrade() else {
            return;
        };
        let Some(run) = self.runs.get_mut(&job_id) else {
            return;
        };
        run.active_part = Some(part_index);
        let run_id = run.id;
        let assembler = self.assembler;

        info!(
            job_id,
            part = part_index + 1,
            output = %request.output_path.display(),
            "assembling part"
        );
        tokio::spawn(async move {
            let output = request.output_path.clone();
            let result = tokio::task::spawn_blocking(move || assembler.assemble(&request))
                .await
                .unwrap_or_else(|e| Err(AssemblyError::pdf(output, e)));
            let _ = mailbox
                .send(Command::PartAssembled {
                    job_id,
                    run: run_id,
                    part: part_index,
                    result,
                })
                .await;
        });
    }

    async fn on_assembled(
        &mut self,
        job_id: i64,
        run: u64,
        part_index: usize,
        result: Result<PathBuf, AssemblyError>,
    ) {
        if !self.is_current(job_id, run) {
            return;
        }
        let Some(part) = self
            .jobs
            .get_mut(&job_id)
            .and_then(|job| job.parts.get_mut(part_index))
        else {
            return;
        };
        match result {
            Ok(path) => {
                info!(job_id, part = part_index + 1, path = %path.display(), "part written");
                part.status = PartStatus::Completed;
                part.output_path = Some(path.clone());
                self.persist_part(job_id, part_index).await;
                let _ = self.events.send(QueueEvent::PartCompleted {
                    job_id,
                    part: part_index,
                    path,
                });
            }
            Err(e) => {
                warn!(job_id, part = part_index + 1, error = %e, "part assembly failed");
                part.status = PartStatus::Failed;
                self.persist_part(job_id, part_index).await;
                if let Some(run) = self.runs.get_mut(&job_id) {
                    run.assembly_errors
                        .push(format!("part {}: {e}", part_index + 1));
                }
            }
        }
        self.assemble_next_part(job_id).await;
    }

    async fn finish_assembling(&mut self, job_id: i64) {
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        if job.all_parts_completed() {
            let outputs = job.parts.len();
            if self.set_status(job_id, JobStatus::Completed).await {
                info!(job_id, outputs, "job completed");
            }
            self.end_run(job_id);
            remove_work_dir(paths::job_work_dir(&self.config.state_dir, job_id));
            return;
        }

        let failed = job
            .parts
            .iter()
            .filter(|part| part.status == PartStatus::Failed)
            .count();
        let mut lines = vec![format!(
            "{failed} of {} parts could not be assembled",
            job.parts.len()
        )];
        if let Some(run) = self.runs.get(&job_id) {
            lines.extend(run.assembly_errors.iter().cloned());
        }
        self.fail_job(job_id, JobErrorKind::Assembly, lines.join("\n  "))
            .await;
    }

    // ---- watchdog ---------------------------------------------------------

    /// Fails downloading jobs whose last page result is older than the stall
    /// timeout. Returns true if any job was failed.
    async fn check_stalls(&mut self) -> bool {
        let now = Instant::now();
        let stalled: Vec<(i64, usize, Duration)> = self
            .runs
            .iter()
            .filter_map(|(&job_id, run)| {
                let job = self.jobs.get(&job_id)?;
                let idle = now.saturating_duration_since(run.last_progress);
                (job.status == JobStatus::Downloading && idle > self.config.stall_timeout)
                    .then(|| (job_id, run.active_part.unwrap_or(0), idle))
            })
            .collect();

        for &(job_id, part, idle) in &stalled {
            let message = format!(
                "no page finished in part {} for {}s\n  Suggestion: the library may be throttling; run `retry` later",
                part + 1,
                idle.as_secs()
            );
            self.fail_job(job_id, JobErrorKind::StallDetected, message)
                .await;
        }
        !stalled.is_empty()
    }

    // ---- commands ---------------------------------------------------------

    async fn enqueue(
        &mut self,
        url: String,
        page_range: Option<PageRange>,
    ) -> Result<i64, OrchestratorError> {
        let job = self
            .store
            .insert_job_with_range(url.trim(), page_range)
            .await?;
        let job_id = job.id;
        match page_range {
            Some(range) => info!(job_id, url = %job.source_url, pages = %range, "job queued"),
            None => info!(job_id, url = %job.source_url, "job queued"),
        }
        self.jobs.insert(job_id, job);
        self.emit_status(job_id);
        Ok(job_id)
    }

    async fn pause(&mut self, job_id: i64) -> Result<(), OrchestratorError> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(OrchestratorError::JobNotFound(job_id))?;
        job.transition(JobStatus::Paused)?;
        self.end_run(job_id);
        info!(job_id, "job paused");
        self.persist(job_id).await;
        self.emit_status(job_id);
        Ok(())
    }

    async fn resume(&mut self, job_id: i64) -> Result<(), OrchestratorError> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(OrchestratorError::JobNotFound(job_id))?;
        let to = job.resume()?;
        info!(job_id, status = %to, "job resumed");
        self.persist(job_id).await;
        self.emit_status(job_id);
        Ok(())
    }

    async fn delete(&mut self, job_id: i64) -> Result<(), OrchestratorError> {
        if !self.jobs.contains_key(&job_id) {
            return Err(OrchestratorError::JobNotFound(job_id));
        }
        self.end_run(job_id);
        self.store.delete_job(job_id).await?;
        self.jobs.remove(&job_id);
        remove_work_dir(paths::job_work_dir(&self.config.state_dir, job_id));
        info!(job_id, "job deleted");
        let _ = self.events.send(QueueEvent::Removed { job_id });
        Ok(())
    }

    async fn retry(&mut self, job_id: Option<i64>) -> Result<Vec<i64>, OrchestratorError> {
        let targets: Vec<i64> = match job_id {
            Some(id) => {
                let job = self
                    .jobs
                    .get(&id)
                    .ok_or(OrchestratorError::JobNotFound(id))?;
                if job.status != JobStatus::Failed {
                    return Err(OrchestratorError::InvalidTransition {
                        job_id: id,
                        from: job.status,
                        to: JobStatus::ResolvingManifest,
                    });
                }
                vec![id]
            }
            None => self
                .jobs
                .values()
                .filter(|job| {
                    job.status == JobStatus::Failed
                        && job.error_kind.is_none_or(|kind| kind.is_retryable())
                })
                .map(|job| job.id)
                .collect(),
        };

        let state_dir = self.config.state_dir.clone();
        let min_page_bytes = self.pool.min_page_bytes();
        for &id in &targets {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            let mut reset = 0;
            for part in &mut job.parts {
                if part.status == PartStatus::Completed {
                    continue;
                }
                let cleared = part.reset_failed();
                reset += cleared;
                if cleared > 0 || part.status == PartStatus::Failed {
                    part.status = if part.all_terminal() {
                        PartStatus::Downloaded
                    } else {
                        PartStatus::Pending
                    };
                }
            }
            reset += revalidate_parts(job, &state_dir, min_page_bytes).await;
            job.transition(JobStatus::ResolvingManifest)?;
            info!(job_id = id, reset_pages = reset, "job requeued");
            self.persist(id).await;
            self.emit_status(id);
        }
        Ok(targets)
    }
}

/// Removes a scratch directory in the background.
fn remove_work_dir(dir: PathBuf) {
    tokio::spawn(async move {
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %dir.display(), error = %e, "could not remove scratch directory");
        }
    });
}
