//! Progress bars driven by orchestrator events.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use mss_core::orchestrator::{JobStatus, ProgressEvent, QueueEvent};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const POLL_INTERVAL: Duration = Duration::from_millis(120);

/// Spawns the progress UI when requested.
///
/// Returns (handle, stop) so the caller can signal stop and await the handle.
/// When `enabled` is false, returns (None, stop) with stop already true.
pub(crate) fn spawn_progress_ui(
    enabled: bool,
    events: broadcast::Receiver<QueueEvent>,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !enabled {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let handle = tokio::spawn(render(events, Arc::clone(&stop)));
    (Some(handle), stop)
}

async fn render(mut events: broadcast::Receiver<QueueEvent>, stop: Arc<AtomicBool>) {
    let multi = MultiProgress::new();
    let style = ProgressStyle::with_template("{prefix:>7} [{bar:30.cyan/blue}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    let mut bars: HashMap<i64, ProgressBar> = HashMap::new();

    while !stop.load(Ordering::SeqCst) {
        let event = match tokio::time::timeout(POLL_INTERVAL, events.recv()).await {
            Err(_) | Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) => break,
            Ok(Ok(event)) => event,
        };

        match event {
            QueueEvent::Progress(progress) => {
                let bar = bars.entry(progress.job_id).or_insert_with(|| {
                    let bar = multi.add(ProgressBar::new(0));
                    bar.set_style(style.clone());
                    bar.set_prefix(format!("job {}", progress.job_id));
                    bar
                });
                bar.set_length(progress.total_pages as u64);
                bar.set_position(progress.completed_pages as u64);
                bar.set_message(progress_message(&progress));
            }
            QueueEvent::StatusChanged { job_id, status, .. } => {
                if let Some(bar) = bars.get(&job_id) {
                    if status.is_terminal() || status == JobStatus::Paused {
                        bar.abandon_with_message(status.to_string());
                    } else {
                        bar.set_message(status.to_string());
                    }
                }
            }
            QueueEvent::PartCompleted { path, .. } => {
                let _ = multi.println(format!("wrote {}", path.display()));
            }
            QueueEvent::Removed { job_id } => {
                if let Some(bar) = bars.remove(&job_id) {
                    bar.finish_and_clear();
                }
            }
        }
    }

    for bar in bars.values() {
        if !bar.is_finished() {
            bar.abandon();
        }
    }
}

/// Bar message: page counts, the active part for split jobs, and the ETA.
pub(crate) fn progress_message(progress: &ProgressEvent) -> String {
    format!("{progress}  {:.0}%  eta {}", progress.percentage, progress.eta)
}
