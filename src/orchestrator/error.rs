//! Error types for the job store and the orchestrator.

use std::fmt;

use thiserror::Error;

use super::JobStatus;

/// Structured classification of database failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// `SQLite` returned busy/locked under concurrent access.
    BusyOrLocked,
    /// Constraint failure (unique/check/not-null).
    ConstraintViolation,
    /// Connection pool timed out waiting for a free connection.
    PoolTimeout,
    /// Connection pool is closed.
    PoolClosed,
    /// Filesystem or transport IO failure.
    Io,
    /// Unclassified database failure.
    Other,
}

impl StoreErrorKind {
    /// Classifies a driver error.
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => Self::PoolTimeout,
            sqlx::Error::PoolClosed => Self::PoolClosed,
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::Database(database_error) => {
                classify_database_error(database_error.as_ref())
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::PoolTimeout => "pool_timeout",
            Self::PoolClosed => "pool_closed",
            Self::Io => "io",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

fn classify_database_error(
    database_error: &(dyn sqlx::error::DatabaseError + 'static),
) -> StoreErrorKind {
    let code = database_error.code();
    if matches!(
        code.as_deref(),
        Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6")
    ) {
        return StoreErrorKind::BusyOrLocked;
    }

    if database_error.is_unique_violation()
        || database_error.is_check_violation()
        || code
            .as_deref()
            .is_some_and(|value| value.starts_with("SQLITE_CONSTRAINT") || value == "275")
    {
        return StoreErrorKind::ConstraintViolation;
    }

    let message = database_error.message().to_ascii_lowercase();
    if message.contains("database is locked") || message.contains("database is busy") {
        return StoreErrorKind::BusyOrLocked;
    }

    StoreErrorKind::Other
}

/// Errors from [`super::JobStore`].
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error ({kind}): {message}")]
    Database {
        /// Classification.
        kind: StoreErrorKind,
        /// Driver message.
        message: String,
    },

    /// No job with this id.
    #[error("job not found: id {0}\n  Suggestion: run `list` to see current job ids")]
    JobNotFound(i64),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: StoreErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl StoreError {
    /// Returns true for a busy/locked database.
    #[must_use]
    pub fn is_busy_or_locked(&self) -> bool {
        matches!(
            self,
            Self::Database {
                kind: StoreErrorKind::BusyOrLocked,
                ..
            }
        )
    }
}

/// Errors returned through [`super::OrchestratorHandle`].
#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    /// No job with this id.
    #[error("job not found: id {0}\n  Suggestion: run `list` to see current job ids")]
    JobNotFound(i64),

    /// The requested change is not legal from the job's current state.
    #[error("job {job_id} cannot go from {from} to {to}")]
    InvalidTransition {
        /// Job id.
        job_id: i64,
        /// Current state.
        from: JobStatus,
        /// Requested state.
        to: JobStatus,
    },

    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The orchestrator task has stopped.
    #[error("orchestrator is not running")]
    Stopped,
}
