//! Job and part model plus the job state machine.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::OrchestratorError;
use crate::manifest::{Manifest, PageRange};
use crate::split::PartSpec;

/// Lifecycle of a job.
///
/// ```text
/// Queued → ResolvingManifest → Splitting → Downloading → Assembling → Completed
/// ```
///
/// `Paused` is reachable from every non-terminal state and resumes into the
/// state it interrupted. `Failed` is reachable from `ResolvingManifest`,
/// `Downloading` and `Assembling`, and a user retry re-enters `ResolvingManifest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a scheduling slot.
    Queued,
    /// Loading the manifest.
    ResolvingManifest,
    /// Computing parts.
    Splitting,
    /// Fetching page images.
    Downloading,
    /// Writing PDFs.
    Assembling,
    /// Every part has its PDF.
    Completed,
    /// Stopped by the user.
    Paused,
    /// Needs user action.
    Failed,
}

impl JobStatus {
    /// Database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::ResolvingManifest => "resolving_manifest",
            Self::Splitting => "splitting",
            Self::Downloading => "downloading",
            Self::Assembling => "assembling",
            Self::Completed => "completed",
            Self::Paused => "paused",
            Self::Failed => "failed",
        }
    }

    /// `Completed` or `Failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// States that occupy a scheduling slot.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::ResolvingManifest | Self::Splitting | Self::Downloading | Self::Assembling
        )
    }

    /// Whether `self → to` is a legal edge. Resuming from `Paused` is checked
    /// separately against the remembered state.
    #[must_use]
    pub fn can_transition_to(&self, to: Self) -> bool {
        use JobStatus::{
            Assembling, Completed, Downloading, Failed, Paused, Queued, ResolvingManifest,
            Splitting,
        };
        match (*self, to) {
            (Queued | Failed, ResolvingManifest)
            | (ResolvingManifest, Splitting)
            | (Splitting, Downloading)
            | (Downloading, Assembling)
            | (Assembling, Completed)
            | (ResolvingManifest | Downloading | Assembling, Failed) => true,
            (from, Paused) => !from.is_terminal() && from != Paused,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "resolving_manifest" => Ok(Self::ResolvingManifest),
            "splitting" => Ok(Self::Splitting),
            "downloading" => Ok(Self::Downloading),
            "assembling" => Ok(Self::Assembling),
            "completed" => Ok(Self::Completed),
            "paused" => Ok(Self::Paused),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid job status: {s}")),
        }
    }
}

/// Lifecycle of one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartStatus {
    /// Not started.
    Pending,
    /// Pages are being fetched.
    Downloading,
    /// Every page is terminal; waiting for assembly.
    Downloaded,
    /// PDF written.
    Completed,
    /// Assembly failed or too many pages failed.
    Failed,
}

impl PartStatus {
    /// Database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for PartStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloading" => Ok(Self::Downloading),
            "downloaded" => Ok(Self::Downloaded),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid part status: {s}")),
        }
    }
}

/// Per-page completion flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageState {
    /// No terminal result yet.
    Pending,
    /// A valid file is on disk.
    Done,
    /// Retries exhausted or permanent error.
    Failed,
}

impl PageState {
    /// Single-character encoding used in the `parts.page_states` column.
    #[must_use]
    pub fn as_char(self) -> char {
        match self {
            Self::Pending => '.',
            Self::Done => '+',
            Self::Failed => 'x',
        }
    }

    /// Decodes a flag; anything unrecognised is `Pending`.
    #[must_use]
    pub fn from_char(c: char) -> Self {
        match c {
            '+' => Self::Done,
            'x' => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// Done or failed.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

/// Why a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// No library handles the URL; the input must change.
    UnsupportedLibrary,
    /// The selected page range lies outside the manuscript; the input must change.
    PageRange,
    /// Manifest could not be loaded (includes timeouts).
    ManifestFetch,
    /// Pages failed permanently.
    PageFetch,
    /// Failed pages exceed the tolerance.
    PartialFailure,
    /// A part's PDF could not be written.
    Assembly,
    /// No progress within the stall window.
    StallDetected,
}

impl JobErrorKind {
    /// Database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnsupportedLibrary => "unsupported_library",
            Self::PageRange => "page_range",
            Self::ManifestFetch => "manifest_fetch",
            Self::PageFetch => "page_fetch",
            Self::PartialFailure => "partial_failure",
            Self::Assembly => "assembly",
            Self::StallDetected => "stall_detected",
        }
    }

    /// Whether `retry` can help without changing the input.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::UnsupportedLibrary | Self::PageRange)
    }
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsupported_library" => Ok(Self::UnsupportedLibrary),
            "page_range" => Ok(Self::PageRange),
            "manifest_fetch" => Ok(Self::ManifestFetch),
            "page_fetch" => Ok(Self::PageFetch),
            "partial_failure" => Ok(Self::PartialFailure),
            "assembly" => Ok(Self::Assembly),
            "stall_detected" => Ok(Self::StallDetected),
            _ => Err(format!("invalid error kind: {s}")),
        }
    }
}

/// A contiguous page range of a job and its progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// Zero-based part number.
    pub index: usize,
    /// First page (zero-based).
    pub start: usize,
    /// Last page (zero-based, inclusive).
    pub end: usize,
    /// Lifecycle.
    pub status: PartStatus,
    /// One flag per page in `start..=end`.
    pub pages: Vec<PageState>,
    /// Final PDF path once assembled.
    pub output_path: Option<PathBuf>,
}

impl Part {
    /// Creates a pending part covering `spec`.
    #[must_use]
    pub fn from_spec(spec: PartSpec) -> Self {
        Self {
            index: spec.index,
            start: spec.start,
            end: spec.end,
            status: PartStatus::Pending,
            pages: vec![PageState::Pending; spec.len()],
            output_path: None,
        }
    }

    /// Pages in this part.
    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    /// Always false; a part holds at least one page.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Pages with a valid file.
    #[must_use]
    pub fn completed_pages(&self) -> usize {
        self.pages.iter().filter(|s| **s == PageState::Done).count()
    }

    /// Pages that failed permanently.
    #[must_use]
    pub fn failed_pages(&self) -> usize {
        self.pages.iter().filter(|s| **s == PageState::Failed).count()
    }

    /// Whether every page has a terminal result.
    #[must_use]
    pub fn all_terminal(&self) -> bool {
        self.pages.iter().all(|s| s.is_terminal())
    }

    /// State of manuscript page `index`, if it belongs to this part.
    #[must_use]
    pub fn page_state(&self, index: usize) -> Option<PageState> {
        index
            .checked_sub(self.start)
            .and_then(|offset| self.pages.get(offset))
            .copied()
    }

    /// Records a terminal result for manuscript page `index`.
    ///
    /// Returns false when the page is outside the part or already has that state.
    pub fn set_page(&mut self, index: usize, state: PageState) -> bool {
        let Some(slot) = index
            .checked_sub(self.start)
            .and_then(|offset| self.pages.get_mut(offset))
        else {
            return false;
        };
        if *slot == state {
            return false;
        }
        *slot = state;
        true
    }

    /// Resets failed pages to pending. Returns how many were reset.
    pub fn reset_failed(&mut self) -> usize {
        let mut reset = 0;
        for state in &mut self.pages {
            if *state == PageState::Failed {
                *state = PageState::Pending;
                reset += 1;
            }
        }
        reset
    }

    /// Compact encoding of the page flags.
    #[must_use]
    pub fn encode_pages(&self) -> String {
        self.pages.iter().map(|s| s.as_char()).collect()
    }

    /// Decodes page flags, padding or truncating to the part length.
    #[must_use]
    pub fn decode_pages(encoded: &str, len: usize) -> Vec<PageState> {
        let mut pages: Vec<PageState> = encoded.chars().map(PageState::from_char).take(len).collect();
        pages.resize(len, PageState::Pending);
        pages
    }
}

/// A queued manuscript download.
#[derive(Debug, Clone)]
pub struct Job {
    /// Row id.
    pub id: i64,
    /// URL the user supplied.
    pub source_url: String,
    /// Library id once resolved.
    pub library_id: Option<String>,
    /// Manuscript title once resolved.
    pub display_name: Option<String>,
    /// Lifecycle.
    pub status: JobStatus,
    /// State interrupted by a pause.
    pub paused_from: Option<JobStatus>,
    /// Pages the user selected, when not the whole manuscript.
    pub page_range: Option<PageRange>,
    /// Page count once resolved; only the selected pages when a range is set.
    pub total_pages: usize,
    /// Loaded manifest, already restricted to `page_range`.
    pub manifest: Option<Arc<Manifest>>,
    /// Parts, in order.
    pub parts: Vec<Part>,
    /// Human-readable cause of the last failure.
    pub last_error: Option<String>,
    /// Kind of the last failure.
    pub error_kind: Option<JobErrorKind>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Creates a queued job.
    #[must_use]
    pub fn new(id: i64, source_url: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            source_url: source_url.into(),
            library_id: None,
            display_name: None,
            status: JobStatus::Queued,
            paused_from: None,
            page_range: None,
            total_pages: 0,
            manifest: None,
            parts: Vec::new(),
            last_error: None,
            error_kind: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves to `to` if the edge is legal.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::InvalidTransition`] otherwise.
    pub fn transition(&mut self, to: JobStatus) -> Result<(), OrchestratorError> {
        if !self.status.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to,
            });
        }
        if to == JobStatus::Paused {
            self.paused_from = Some(self.status);
        }
        if !matches!(to, JobStatus::Failed | JobStatus::Paused) {
            self.last_error = None;
            self.error_kind = None;
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Leaves `Paused` for the state it interrupted.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::InvalidTransition`] if the job is not paused.
    pub fn resume(&mut self) -> Result<JobStatus, OrchestratorError> {
        if self.status != JobStatus::Paused {
            return Err(OrchestratorError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: self.paused_from.unwrap_or(JobStatus::Queued),
            });
        }
        let to = self
            .paused_from
            .take()
            .filter(|s| *s != JobStatus::Paused && !s.is_terminal())
            .unwrap_or(JobStatus::Queued);
        self.status = to;
        self.updated_at = Utc::now();
        Ok(to)
    }

    /// Records a failure and moves to `Failed`.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::InvalidTransition`] from a state that cannot fail.
    pub fn fail(&mut self, kind: JobErrorKind, message: impl Into<String>) -> Result<(), OrchestratorError> {
        self.transition(JobStatus::Failed)?;
        self.error_kind = Some(kind);
        self.last_error = Some(message.into());
        Ok(())
    }

    /// Title for output files and display.
    #[must_use]
    pub fn title(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.source_url)
    }

    /// Manuscript pages skipped before the selection; part ranges are
    /// relative to it.
    #[must_use]
    pub fn page_offset(&self) -> usize {
        self.page_range.map_or(0, |range| range.offset())
    }

    /// Sum of completed pages over all parts.
    #[must_use]
    pub fn completed_pages(&self) -> usize {
        self.parts.iter().map(Part::completed_pages).sum()
    }

    /// Sum of failed pages over all parts.
    #[must_use]
    pub fn failed_pages(&self) -> usize {
        self.parts.iter().map(Part::failed_pages).sum()
    }

    /// First part that still needs downloading.
    #[must_use]
    pub fn next_download_part(&self) -> Option<usize> {
        self.parts.iter().position(|part| {
            matches!(part.status, PartStatus::Pending | PartStatus::Downloading)
        })
    }

    /// Whether every part has its PDF.
    #[must_use]
    pub fn all_parts_completed(&self) -> bool {
        !self.parts.is_empty() && self.parts.iter().all(|p| p.status == PartStatus::Completed)
    }

    /// Snapshot for listing.
    #[must_use]
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            source_url: self.source_url.clone(),
            library_id: self.library_id.clone(),
            display_name: self.display_name.clone(),
            status: self.status,
            page_range: self.page_range,
            total_pages: self.total_pages,
            completed_pages: self.completed_pages(),
            failed_pages: self.failed_pages(),
            parts: self.parts.len(),
            outputs: self
                .parts
                .iter()
                .filter_map(|p| p.output_path.clone())
                .collect(),
            last_error: self.last_error.clone(),
            error_kind: self.error_kind,
            updated_at: self.updated_at,
        }
    }
}

/// Serializable view of a job for `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    /// Job id.
    pub id: i64,
    /// Source URL.
    pub source_url: String,
    /// Library id.
    pub library_id: Option<String>,
    /// Title.
    pub display_name: Option<String>,
    /// Status.
    pub status: JobStatus,
    /// Selected pages, when not the whole manuscript.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_range: Option<PageRange>,
    /// Page count.
    pub total_pages: usize,
    /// Pages done.
    pub completed_pages: usize,
    /// Pages failed.
    pub failed_pages: usize,
    /// Number of parts.
    pub parts: usize,
    /// PDFs written so far.
    pub outputs: Vec<PathBuf>,
    /// Failure message.
    pub last_error: Option<String>,
    /// Failure kind.
    pub error_kind: Option<JobErrorKind>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}
