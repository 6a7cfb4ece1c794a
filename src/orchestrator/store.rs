//! SQLite persistence for jobs and parts.
//!
//! The orchestrator is the only writer. Every state transition is saved with
//! [`JobStore::save_job`]; page results only touch their part's row through
//! [`JobStore::save_part`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, Row};
use tracing::{instrument, warn};

use super::StoreError;
use super::job::{Job, JobStatus, Part, PartStatus};
use crate::db::Database;
use crate::manifest::{Manifest, PageRange};

type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, FromRow)]
struct JobRow {
    id: i64,
    source_url: String,
    library_id: Option<String>,
    display_name: Option<String>,
    status: String,
    paused_from: Option<String>,
    page_first: Option<i64>,
    page_last: Option<i64>,
    total_pages: i64,
    manifest_json: Option<String>,
    last_error: Option<String>,
    error_kind: Option<String>,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, FromRow)]
struct PartRow {
    job_id: i64,
    part_index: i64,
    start_page: i64,
    end_page: i64,
    status: String,
    page_states: String,
    output_path: Option<String>,
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_usize(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}

fn parse_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value).map_or_else(|_| Utc::now(), |t| t.with_timezone(&Utc))
}

impl PartRow {
    fn into_part(self) -> Part {
        let start = to_usize(self.start_page);
        let end = to_usize(self.end_page).max(start);
        let len = end - start + 1;
        Part {
            index: to_usize(self.part_index),
            start,
            end,
            status: self.status.parse().unwrap_or(PartStatus::Pending),
            pages: Part::decode_pages(&self.page_states, len),
            output_path: self.output_path.map(PathBuf::from),
        }
    }
}

impl JobRow {
    fn into_job(self, parts: Vec<Part>) -> Job {
        let manifest = self.manifest_json.as_deref().and_then(|json| {
            serde_json::from_str::<Manifest>(json)
                .inspect_err(|e| warn!(job_id = self.id, error = %e, "stored manifest unreadable"))
                .ok()
                .map(Arc::new)
        });
        let page_range = self.page_first.and_then(|first| {
            PageRange::new(to_usize(first), self.page_last.map(to_usize))
                .inspect_err(|e| warn!(job_id = self.id, error = %e, "stored page range unreadable"))
                .ok()
        });
        Job {
            id: self.id,
            source_url: self.source_url,
            library_id: self.library_id,
            display_name: self.display_name,
            status: self.status.parse().unwrap_or(JobStatus::Queued),
            paused_from: self.paused_from.and_then(|s| s.parse().ok()),
            page_range,
            total_pages: to_usize(self.total_pages),
            manifest,
            parts,
            last_error: self.last_error,
            error_kind: self.error_kind.and_then(|s| s.parse().ok()),
            created_at: parse_time(&self.created_at),
            updated_at: parse_time(&self.updated_at),
        }
    }
}

/// Job persistence over the shared [`Database`].
#[derive(Debug, Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    /// Creates a store.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts a queued job for the whole manuscript and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    pub async fn insert_job(&self, source_url: &str) -> Result<Job> {
        self.insert_job_with_range(source_url, None).await
    }

    /// Inserts a queued job limited to `page_range` and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    #[instrument(skip(self))]
    pub async fn insert_job_with_range(
        &self,
        source_url: &str,
        page_range: Option<PageRange>,
    ) -> Result<Job> {
        let now = Utc::now();
        let stamp = now.to_rfc3339();
        let row = sqlx::query(
            r"INSERT INTO jobs (source_url, status, page_first, page_last, created_at, updated_at)
              VALUES (?, ?, ?, ?, ?, ?)
              RETURNING id",
        )
        .bind(source_url)
        .bind(JobStatus::Queued.as_str())
        .bind(page_range.map(|range| to_i64(range.first())))
        .bind(page_range.and_then(|range| range.last()).map(to_i64))
        .bind(&stamp)
        .bind(&stamp)
        .fetch_one(self.db.pool())
        .await?;

        let mut job = Job::new(row.get("id"), source_url, now);
        job.page_range = page_range;
        Ok(job)
    }

    /// Writes the job row and all of its parts in one transaction.
    ///
    /// Parts beyond the job's current part list are removed, so rebuilt
    /// parts never leave stale rows behind.
    ///
    /// # Errors
    ///
    /// [`StoreError::JobNotFound`] if the row is gone, [`StoreError::Database`] otherwise.
    #[instrument(skip(self, job), fields(job_id = job.id, status = %job.status))]
    pub async fn save_job(&self, job: &Job) -> Result<()> {
        let manifest_json = job
            .manifest
            .as_deref()
            .and_then(|m| serde_json::to_string(m).ok());

        let mut tx = self.db.pool().begin().await?;
        let updated = sqlx::query(
            r"UPDATE jobs
              SET library_id = ?, display_name = ?, status = ?, paused_from = ?,
                  total_pages = ?, manifest_json = ?, last_error = ?, error_kind = ?,
                  updated_at = ?
              WHERE id = ?",
        )
        .bind(job.library_id.as_deref())
        .bind(job.display_name.as_deref())
        .bind(job.status.as_str())
        .bind(job.paused_from.map(|s| s.as_str()))
        .bind(to_i64(job.total_pages))
        .bind(manifest_json)
        .bind(job.last_error.as_deref())
        .bind(job.error_kind.map(|k| k.as_str()))
        .bind(job.updated_at.to_rfc3339())
        .bind(job.id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job.id));
        }

        for part in &job.parts {
            sqlx::query(
                r"INSERT INTO parts (job_id, part_index, start_page, end_page, status, page_states, output_path)
                  VALUES (?, ?, ?, ?, ?, ?, ?)
                  ON CONFLICT (job_id, part_index) DO UPDATE SET
                      start_page = excluded.start_page,
                      end_page = excluded.end_page,
                      status = excluded.status,
                      page_states = excluded.page_states,
                      output_path = excluded.output_path",
            )
            .bind(job.id)
            .bind(to_i64(part.index))
            .bind(to_i64(part.start))
            .bind(to_i64(part.end))
            .bind(part.status.as_str())
            .bind(part.encode_pages())
            .bind(part.output_path.as_deref().and_then(|p| p.to_str()))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM parts WHERE job_id = ? AND part_index >= ?")
            .bind(job.id)
            .bind(to_i64(job.parts.len()))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Writes one part's status and page flags.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn save_part(&self, job_id: i64, part: &Part) -> Result<()> {
        sqlx::query(
            r"UPDATE parts SET status = ?, page_states = ?, output_path = ?
              WHERE job_id = ? AND part_index = ?",
        )
        .bind(part.status.as_str())
        .bind(part.encode_pages())
        .bind(part.output_path.as_deref().and_then(|p| p.to_str()))
        .bind(job_id)
        .bind(to_i64(part.index))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Loads every job with its parts, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a query fails.
    #[instrument(skip(self))]
    pub async fn load_jobs(&self) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs ORDER BY id")
            .fetch_all(self.db.pool())
            .await?;
        let part_rows = sqlx::query_as::<_, PartRow>(
            "SELECT * FROM parts ORDER BY job_id, part_index",
        )
        .fetch_all(self.db.pool())
        .await?;

        let mut parts: HashMap<i64, Vec<Part>> = HashMap::new();
        for row in part_rows {
            parts.entry(row.job_id).or_default().push(row.into_part());
        }

        Ok(jobs
            .into_iter()
            .map(|row| {
                let job_parts = parts.remove(&row.id).unwrap_or_default();
                row.into_job(job_parts)
            })
            .collect())
    }

    /// Removes a job; its parts go with it through the foreign key.
    ///
    /// # Errors
    ///
    /// [`StoreError::JobNotFound`] if no such job exists.
    #[instrument(skip(self))]
    pub async fn delete_job(&self, id: i64) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(id));
        }
        Ok(())
    }
}
