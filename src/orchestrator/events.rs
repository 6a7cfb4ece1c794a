//! Mailbox commands and broadcast events.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::oneshot;

use super::job::{JobErrorKind, JobStatus, JobSummary};
use super::progress::ProgressEvent;
use super::OrchestratorError;
use crate::assemble::AssemblyError;
use crate::download::PageResult;
use crate::manifest::{PageRange, ResolveError, ResolvedManifest};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, OrchestratorError>>;

/// Messages processed by the orchestrator actor.
///
/// The first group comes from [`super::OrchestratorHandle`]; the rest are
/// reports from tasks the actor spawned, tagged with the run they belong to.
#[derive(Debug)]
pub(crate) enum Command {
    Enqueue {
        url: String,
        page_range: Option<PageRange>,
        reply: Reply<i64>,
    },
    Pause {
        job_id: i64,
        reply: Reply<()>,
    },
    Resume {
        job_id: i64,
        reply: Reply<()>,
    },
    Delete {
        job_id: i64,
        reply: Reply<()>,
    },
    Retry {
        job_id: Option<i64>,
        reply: Reply<Vec<i64>>,
    },
    List {
        reply: Reply<Vec<JobSummary>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },

    ManifestResolved {
        job_id: i64,
        run: u64,
        result: Result<ResolvedManifest, ResolveError>,
    },
    PageFinished {
        job_id: i64,
        run: u64,
        part: usize,
        result: PageResult,
    },
    PoolDrained {
        job_id: i64,
        run: u64,
        part: usize,
    },
    PartAssembled {
        job_id: i64,
        run: u64,
        part: usize,
        result: Result<PathBuf, AssemblyError>,
    },
}

/// Notifications broadcast to every subscriber.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A job entered a new state.
    StatusChanged {
        /// Job id.
        job_id: i64,
        /// New state.
        status: JobStatus,
        /// Failure kind when `status` is `Failed`.
        error_kind: Option<JobErrorKind>,
        /// Failure message when `status` is `Failed`.
        error: Option<String>,
    },
    /// Page-level progress.
    Progress(ProgressEvent),
    /// A part's PDF was written.
    PartCompleted {
        /// Job id.
        job_id: i64,
        /// Zero-based part index.
        part: usize,
        /// PDF path.
        path: PathBuf,
    },
    /// A job was deleted.
    Removed {
        /// Job id.
        job_id: i64,
    },
}

impl QueueEvent {
    /// Id of the job the event concerns.
    #[must_use]
    pub fn job_id(&self) -> i64 {
        match self {
            Self::StatusChanged { job_id, .. }
            | Self::PartCompleted { job_id, .. }
            | Self::Removed { job_id } => *job_id,
            Self::Progress(progress) => progress.job_id,
        }
    }
}
