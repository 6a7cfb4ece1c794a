//! Progress aggregation and ETA estimation.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use serde::{Serialize, Serializer};

use super::job::Job;

/// Fewest completion samples before an ETA is offered.
pub const MIN_ETA_SAMPLES: usize = 3;

/// Completion instants kept in the moving window.
pub const ETA_WINDOW: usize = 30;

/// Estimated time to finish a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eta {
    /// Too few samples, or nothing left to do.
    Undetermined,
    /// Whole seconds, never below 1.
    Seconds(u64),
}

impl Serialize for Eta {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Undetermined => serializer.serialize_str("undetermined"),
            Self::Seconds(secs) => serializer.serialize_u64(*secs),
        }
    }
}

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undetermined => f.write_str("--"),
            Self::Seconds(secs) if *secs >= 3600 => {
                write!(f, "{}h{:02}m", secs / 3600, (secs % 3600) / 60)
            }
            Self::Seconds(secs) if *secs >= 60 => write!(f, "{}m{:02}s", secs / 60, secs % 60),
            Self::Seconds(secs) => write!(f, "{secs}s"),
        }
    }
}

/// Secondary progress for the active part of a multi-part job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartInfo {
    /// 1-based number of the part being worked on.
    pub current_part: usize,
    /// Number of parts.
    pub total_parts: usize,
    /// Pages done in this part.
    pub part_completed_pages: usize,
    /// Pages in this part.
    pub part_total_pages: usize,
}

/// One progress update for a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    /// Job id.
    pub job_id: i64,
    /// Pages in the whole manuscript.
    pub total_pages: usize,
    /// Pages done across all parts.
    pub completed_pages: usize,
    /// `completed_pages / total_pages` as a percentage.
    pub percentage: f64,
    /// Estimated time to finish.
    pub eta: Eta,
    /// Active part, only for jobs with more than one part.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_info: Option<PartInfo>,
}

impl ProgressEvent {
    /// Computes the aggregate for `job`, with `active_part` as the secondary figure.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn for_job(job: &Job, active_part: Option<usize>, eta: Eta) -> Self {
        let completed_pages = job.completed_pages().min(job.total_pages);
        let percentage = if job.total_pages == 0 {
            0.0
        } else {
            completed_pages as f64 * 100.0 / job.total_pages as f64
        };
        let part_info = if job.parts.len() > 1 {
            active_part
                .and_then(|index| job.parts.get(index))
                .map(|part| PartInfo {
                    current_part: part.index + 1,
                    total_parts: job.parts.len(),
                    part_completed_pages: part.completed_pages(),
                    part_total_pages: part.len(),
                })
        } else {
            None
        };
        Self {
            job_id: job.id,
            total_pages: job.total_pages,
            completed_pages,
            percentage,
            eta,
            part_info,
        }
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.part_info {
            Some(part) => write!(
                f,
                "{}/{} pages total (part {}/{}: {}/{})",
                self.completed_pages,
                self.total_pages,
                part.current_part,
                part.total_parts,
                part.part_completed_pages,
                part.part_total_pages
            ),
            None => write!(f, "{}/{} pages", self.completed_pages, self.total_pages),
        }
    }
}

/// Moving-window rate estimator over page completion instants.
#[derive(Debug, Clone)]
pub struct EtaEstimator {
    samples: VecDeque<Instant>,
    capacity: usize,
}

impl Default for EtaEstimator {
    fn default() -> Self {
        Self::new(ETA_WINDOW)
    }
}

impl EtaEstimator {
    /// Creates an estimator keeping the last `capacity` instants.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_ETA_SAMPLES);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Records a page fetched at `at`.
    pub fn record(&mut self, at: Instant) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(at);
    }

    /// Number of samples in the window.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no samples are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Estimates time for `remaining` pages.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn estimate(&self, remaining: usize) -> Eta {
        if remaining == 0 || self.samples.len() < MIN_ETA_SAMPLES {
            return Eta::Undetermined;
        }
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return Eta::Undetermined;
        };
        let span = last.saturating_duration_since(*first);
        let intervals = (self.samples.len() - 1) as f64;
        let per_page = span.as_secs_f64() / intervals;
        let secs = (per_page * remaining as f64).ceil();
        Eta::Seconds((secs as u64).max(1))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::orchestrator::job::{PageState, Part};
    use crate::split::PartSpec;

    fn job_with_parts(total: usize, per_part: usize) -> Job {
        let mut job = Job::new(9, "u", Utc::now());
        job.total_pages = total;
        job.parts = (0..total)
            .step_by(per_part)
            .enumerate()
            .map(|(index, start)| {
                Part::from_spec(PartSpec {
                    index,
                    start,
                    end: (start + per_part).min(total) - 1,
                })
            })
            .collect();
        job
    }

    #[test]
    fn test_multi_part_display_and_percentage() {
        let mut job = job_with_parts(278, 20);
        assert_eq!(job.parts.len(), 14);
        for page in 0..65 {
            for part in &mut job.parts {
                part.set_page(page, PageState::Done);
            }
        }
        let event = ProgressEvent::for_job(&job, Some(3), Eta::Undetermined);
        assert_eq!(event.to_string(), "65/278 pages total (part 4/14: 5/20)");
        assert!((event.percentage - 65.0 * 100.0 / 278.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_part_has_no_part_info() {
        let mut job = job_with_parts(10, 250);
        job.parts[0].set_page(0, PageState::Done);
        let event = ProgressEvent::for_job(&job, Some(0), Eta::Seconds(5));
        assert_eq!(event.part_info, None);
        assert_eq!(event.to_string(), "1/10 pages");
    }

    #[test]
    fn test_failed_pages_do_not_count_as_completed() {
        let mut job = job_with_parts(4, 4);
        job.parts[0].set_page(0, PageState::Done);
        job.parts[0].set_page(1, PageState::Failed);
        let event = ProgressEvent::for_job(&job, Some(0), Eta::Undetermined);
        assert_eq!(event.completed_pages, 1);
    }

    #[test]
    fn test_progress_json_shape() {
        let job = job_with_parts(40, 20);
        let json = serde_json::to_value(ProgressEvent::for_job(&job, Some(0), Eta::Undetermined)).unwrap();
        assert_eq!(json["eta"], "undetermined");
        assert_eq!(json["part_info"]["current_part"], 1);
        assert_eq!(json["part_info"]["total_parts"], 2);
        assert_eq!(json["part_info"]["part_completed_pages"], 0);
        assert_eq!(json["part_info"]["part_total_pages"], 20);

        let json = serde_json::to_value(ProgressEvent::for_job(&job, None, Eta::Seconds(12))).unwrap();
        assert_eq!(json["eta"], 12);
        assert!(json.get("part_info").is_none());
    }

    #[test]
    fn test_eta_undetermined_below_min_samples() {
        let mut eta = EtaEstimator::default();
        let t0 = Instant::now();
        eta.record(t0);
        eta.record(t0 + Duration::from_secs(1));
        assert_eq!(eta.estimate(100), Eta::Undetermined);
        eta.record(t0 + Duration::from_secs(2));
        assert_eq!(eta.estimate(100), Eta::Seconds(100));
    }

    #[test]
    fn test_eta_undetermined_when_nothing_remains() {
        let mut eta = EtaEstimator::default();
        let t0 = Instant::now();
        for i in 0..5 {
            eta.record(t0 + Duration::from_secs(i));
        }
        assert_eq!(eta.estimate(0), Eta::Undetermined);
    }

    #[test]
    fn test_eta_never_below_one_second() {
        let mut eta = EtaEstimator::default();
        let t0 = Instant::now();
        for _ in 0..5 {
            eta.record(t0);
        }
        assert_eq!(eta.estimate(1), Eta::Seconds(1));
    }

    #[test]
    fn test_eta_window_forgets_old_samples() {
        let mut eta = EtaEstimator::new(3);
        let t0 = Instant::now();
        eta.record(t0);
        eta.record(t0 + Duration::from_secs(100));
        eta.record(t0 + Duration::from_secs(101));
        eta.record(t0 + Duration::from_secs(102));
        assert_eq!(eta.len(), 3);
        assert_eq!(eta.estimate(10), Eta::Seconds(10));
    }

    #[test]
    fn test_eta_display() {
        assert_eq!(Eta::Seconds(42).to_string(), "42s");
        assert_eq!(Eta::Seconds(125).to_string(), "2m05s");
        assert_eq!(Eta::Seconds(3725).to_string(), "1h02m");
        assert_eq!(Eta::Undetermined.to_string(), "--");
    }
}
