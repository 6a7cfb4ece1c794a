//! SQLite storage for the job queue.
//!
//! One database file under the state directory holds every job and part. File
//! databases run in WAL mode so `list` can read while a `run` is writing, and
//! with foreign keys on so deleting a job drops its parts.
//!
//! ```no_run
//! use mss_core::Database;
//! use mss_core::orchestrator::JobStore;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = JobStore::new(Database::new(Path::new("state/queue.db")).await?);
//! let jobs = store.load_jobs().await?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use thiserror::Error;
use tracing::{debug, instrument};

/// Pool size for file databases. The orchestrator is the only writer.
const MAX_CONNECTIONS: u32 = 4;

/// How long a connection waits on a locked database before `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// The directory for the database file could not be created.
    #[error("cannot create database directory {}: {source}", path.display())]
    Directory {
        /// Directory that was being created.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to connect to the database.
    #[error("failed to open queue database: {0}")]
    Connection(#[from] sqlx::Error),

    /// Failed to run migrations.
    #[error("queue database schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Handle to the queue database. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the queue database at `db_path`, creating the file and its parent
    /// directory when missing, and applies pending migrations.
    ///
    /// # Errors
    ///
    /// - [`DbError::Directory`] if the parent directory cannot be created
    /// - [`DbError::Connection`] if SQLite cannot open the file
    /// - [`DbError::Migration`] if the schema cannot be brought up to date
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| DbError::Directory {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("queue database ready");
        Ok(Self { pool })
    }

    /// In-memory database for tests.
    ///
    /// A single connection is used so every query sees the same memory database.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails,
    /// or `DbError::Migration` if migrations fail.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Returns the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes every pooled connection, flushing the WAL.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn insert_job(db: &Database) -> i64 {
        sqlx::query(
            "INSERT INTO jobs (source_url, created_at, updated_at) VALUES ('https://example.com/manifest.json', 'now', 'now')",
        )
        .execute(db.pool())
        .await
        .unwrap()
        .last_insert_rowid()
    }

    async fn part_count(db: &Database) -> i64 {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM parts")
            .fetch_one(db.pool())
            .await
            .unwrap();
        count
    }

    #[tokio::test]
    async fn test_parts_reference_jobs() {
        let db = Database::new_in_memory().await.unwrap();
        let job_id = insert_job(&db).await;

        sqlx::query("INSERT INTO parts (job_id, part_index, start_page, end_page) VALUES (?, 0, 0, 19)")
            .bind(job_id)
            .execute(db.pool())
            .await
            .unwrap();

        let orphan =
            sqlx::query("INSERT INTO parts (job_id, part_index, start_page, end_page) VALUES (999, 0, 0, 19)")
                .execute(db.pool())
                .await;
        assert!(orphan.is_err(), "parts must belong to an existing job");
        assert_eq!(part_count(&db).await, 1);
    }

    #[tokio::test]
    async fn test_deleting_job_cascades_to_parts() {
        let db = Database::new_in_memory().await.unwrap();
        let job_id = insert_job(&db).await;
        sqlx::query("INSERT INTO parts (job_id, part_index, start_page, end_page) VALUES (?, 0, 0, 9), (?, 1, 10, 19)")
            .bind(job_id)
            .bind(job_id)
            .execute(db.pool())
            .await
            .unwrap();

        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job_id)
            .execute(db.pool())
            .await
            .unwrap();
        assert_eq!(part_count(&db).await, 0);
    }

    #[tokio::test]
    async fn test_parts_reject_inverted_range() {
        let db = Database::new_in_memory().await.unwrap();
        let job_id = insert_job(&db).await;

        let result =
            sqlx::query("INSERT INTO parts (job_id, part_index, start_page, end_page) VALUES (?, 0, 20, 10)")
                .bind(job_id)
                .execute(db.pool())
                .await;

        assert!(result.is_err(), "end_page < start_page should be rejected");
    }

    #[tokio::test]
    async fn test_file_database_creates_state_dir_and_uses_wal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("state").join("queue.db");

        let db = Database::new(&db_path).await.unwrap();
        assert!(db_path.exists());
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        db.close().await;

        // Reopening an existing database runs no migrations twice.
        let reopened = Database::new(&db_path).await.unwrap();
        insert_job(&reopened).await;
    }
}
