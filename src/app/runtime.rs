//! Command execution.

use std::fs;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use mss_core::Database;
use mss_core::download::constants::CONNECT_TIMEOUT_SECS;
use mss_core::download::{CircuitBreaker, CircuitBreakerSource, FetcherPool, HostLimiter, HttpClient};
use mss_core::library::builtin_libraries;
use mss_core::manifest::ManifestResolver;
use mss_core::orchestrator::{
    JobStatus, JobSummary, JobStore, Orchestrator, OrchestratorHandle, RunMode,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::ProcessExit;
use crate::app::config::{self, Settings};
use crate::app::lock::StateLock;
use crate::app::{exit, progress, terminal};
use crate::cli::{Cli, Command};

const DB_FILE: &str = "queue.db";

pub(crate) async fn run() -> Result<ProcessExit> {
    let cli = Cli::parse();
    terminal::init_tracing(terminal::default_log_level(cli.verbose, cli.quiet));
    debug!(?cli, "CLI arguments parsed");

    let file = config::load(cli.config.as_deref())?;
    let settings = Settings::resolve(&cli, file);
    let show_progress = terminal::progress_enabled(cli.quiet);

    match cli.command {
        Command::Add { urls, run, pages } => {
            let urls = validate_urls(&urls)?;
            let _lock = run
                .then(|| StateLock::acquire(&settings.state_dir, "run the queue"))
                .transpose()?;
            let mode = if run { RunMode::Active } else { RunMode::Idle };
            let handle = start_orchestrator(&settings, mode).await?;
            let mut ids = Vec::with_capacity(urls.len());
            for url in &urls {
                let id = handle.enqueue_range(url.as_str(), pages).await?;
                match pages {
                    Some(range) => println!("queued job {id}: {url} (pages {range})"),
                    None => println!("queued job {id}: {url}"),
                }
                ids.push(id);
            }
            if run {
                return run_until_settled(&handle, &ids, show_progress).await;
            }
            handle.shutdown().await?;
            Ok(ProcessExit::Success)
        }
        Command::List { json } => {
            let handle = start_orchestrator(&settings, RunMode::Idle).await?;
            let jobs = handle.list().await?;
            handle.shutdown().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                print_table(&jobs)?;
            }
            Ok(ProcessExit::Success)
        }
        Command::Pause { id } => {
            let _lock = StateLock::acquire(&settings.state_dir, &format!("pause job {id}"))?;
            let handle = start_orchestrator(&settings, RunMode::Idle).await?;
            handle.pause(id).await?;
            handle.shutdown().await?;
            println!("paused job {id}");
            Ok(ProcessExit::Success)
        }
        Command::Resume { id } => {
            let _lock = StateLock::acquire(&settings.state_dir, &format!("resume job {id}"))?;
            let handle = start_orchestrator(&settings, RunMode::Idle).await?;
            handle.resume(id).await?;
            handle.shutdown().await?;
            println!("resumed job {id}; it continues on the next `run`");
            Ok(ProcessExit::Success)
        }
        Command::Delete { id } => {
            let _lock = StateLock::acquire(&settings.state_dir, &format!("delete job {id}"))?;
            let handle = start_orchestrator(&settings, RunMode::Idle).await?;
            handle.delete(id).await?;
            handle.shutdown().await?;
            println!("deleted job {id}");
            Ok(ProcessExit::Success)
        }
        Command::Retry { id, run } => {
            let _lock = StateLock::acquire(&settings.state_dir, "retry failed jobs")?;
            let mode = if run { RunMode::Active } else { RunMode::Idle };
            let handle = start_orchestrator(&settings, mode).await?;
            let ids = handle.retry(id).await?;
            if ids.is_empty() {
                println!("no failed jobs to retry");
            }
            for id in &ids {
                println!("requeued job {id}");
            }
            if run {
                return run_until_settled(&handle, &ids, show_progress).await;
            }
            handle.shutdown().await?;
            Ok(ProcessExit::Success)
        }
        Command::Run => {
            let _lock = StateLock::acquire(&settings.state_dir, "run the queue")?;
            let handle = start_orchestrator(&settings, RunMode::Active).await?;
            let ids: Vec<i64> = handle
                .list()
                .await?
                .into_iter()
                .filter(|job| !job.status.is_terminal() && job.status != JobStatus::Paused)
                .map(|job| job.id)
                .collect();
            if ids.is_empty() {
                info!("No pending jobs in the queue");
                handle.shutdown().await?;
                return Ok(ProcessExit::Success);
            }
            run_until_settled(&handle, &ids, show_progress).await
        }
    }
}

fn validate_urls(raw: &[String]) -> Result<Vec<Url>> {
    raw.iter()
        .map(|input| {
            let url = Url::parse(input.trim()).with_context(|| {
                format!("Invalid URL '{input}'\n  Suggestion: pass the manuscript viewer or IIIF manifest URL")
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                bail!("Unsupported URL scheme '{}' in '{input}'. Expected http or https", url.scheme());
            }
            Ok(url)
        })
        .collect()
}

async fn start_orchestrator(settings: &Settings, mode: RunMode) -> Result<OrchestratorHandle> {
    fs::create_dir_all(&settings.state_dir).with_context(|| {
        format!(
            "Failed to create state directory '{}'",
            settings.state_dir.display()
        )
    })?;
    let db_path = settings.state_dir.join(DB_FILE);
    let db = Database::new(&db_path)
        .await
        .with_context(|| format!("Failed to open queue database '{}'", db_path.display()))?;

    let http = HttpClient::with_timeouts(
        Duration::from_secs(CONNECT_TIMEOUT_SECS),
        settings.page_timeout,
    )
    .context("Failed to initialize HTTP client")?;
    let mut libraries = builtin_libraries(http.inner().clone());
    settings.apply_library_overrides(&mut libraries)?;
    let registry = libraries.build().context("Invalid library table")?;
    debug!(libraries = ?registry.library_ids(), "library table loaded");

    let resolver = ManifestResolver::new(Arc::new(registry), settings.manifest_timeout);
    let source = CircuitBreakerSource::new(http, Arc::new(CircuitBreaker::default()));
    let pool = FetcherPool::new(
        Arc::new(source),
        Arc::new(HostLimiter::new(settings.per_host_connections)),
        settings.min_page_bytes,
    );

    let orchestrator = Orchestrator::new(
        settings.orchestrator_config(),
        resolver,
        pool,
        JobStore::new(db),
    );
    Ok(orchestrator.start(mode).await?)
}

async fn run_until_settled(
    handle: &OrchestratorHandle,
    ids: &[i64],
    show_progress: bool,
) -> Result<ProcessExit> {
    if ids.is_empty() {
        handle.shutdown().await?;
        return Ok(ProcessExit::Success);
    }
    info!(jobs = ids.len(), "Processing queue");
    let (ui, stop) = progress::spawn_progress_ui(show_progress, handle.subscribe());

    let settled = tokio::select! {
        settled = handle.wait_until_settled(ids) => Some(settled),
        _ = tokio::signal::ctrl_c() => None,
    };

    stop.store(true, Ordering::SeqCst);
    if let Some(ui) = ui {
        let _ = ui.await;
    }
    handle.shutdown().await?;

    let Some(settled) = settled else {
        warn!("Interrupted; progress is saved and continues on the next `run`");
        return Ok(ProcessExit::Failure);
    };
    let jobs = settled?;
    report(&jobs)?;

    let completed = jobs
        .iter()
        .filter(|job| job.status == JobStatus::Completed)
        .count();
    Ok(exit::determine_exit_outcome(completed, ids.len()))
}

fn report(jobs: &[JobSummary]) -> Result<()> {
    let mut out = io::stdout().lock();
    for job in jobs {
        let title = job.display_name.as_deref().unwrap_or(&job.source_url);
        match job.status {
            JobStatus::Completed => {
                writeln!(out, "job {} completed: {title}", job.id)?;
                for path in &job.outputs {
                    writeln!(out, "  {}", path.display())?;
                }
            }
            JobStatus::Failed => {
                let kind = job.error_kind.map_or("error", |kind| kind.as_str());
                writeln!(out, "job {} failed ({kind}): {title}", job.id)?;
                if let Some(error) = &job.last_error {
                    writeln!(out, "  {error}")?;
                }
            }
            status => writeln!(out, "job {} {status}: {title}", job.id)?,
        }
    }
    Ok(())
}

fn print_table(jobs: &[JobSummary]) -> Result<()> {
    let mut out = io::stdout().lock();
    if jobs.is_empty() {
        writeln!(out, "queue is empty")?;
        return Ok(());
    }
    writeln!(out, "{:>5}  {:<18}  {:>11}  {:>5}  TITLE", "ID", "STATUS", "PAGES", "PARTS")?;
    for job in jobs {
        let pages = format!("{}/{}", job.completed_pages, job.total_pages);
        let name = job.display_name.as_deref().unwrap_or(&job.source_url);
        let title = match job.page_range {
            Some(range) => format!("{name} [pages {range}]"),
            None => name.to_string(),
        };
        writeln!(
            out,
            "{:>5}  {:<18}  {pages:>11}  {:>5}  {title}",
            job.id,
            job.status.as_str(),
            job.parts
        )?;
        if let Some(error) = &job.last_error {
            let first_line = error.lines().next().unwrap_or_default();
            writeln!(out, "{:>5}  {first_line}", "")?;
        }
    }
    Ok(())
}
