//! Retry/backoff policy for page fetches.
//!
//! A failed fetch is classified into an [`ErrorKind`], then the library's
//! [`BackoffPolicy`] decides whether the page is requeued and after what delay.
//!
//! # Example
//!
//! ```
//! use mss_core::download::{BackoffPolicy, DownloadError, RetryDecision, classify_error};
//!
//! let policy = BackoffPolicy::default();
//! let error = DownloadError::http_status("https://iiif.example.org/p1.jpg", 503);
//!
//! match policy.next_delay(classify_error(&error), 1, None) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("retrying in {delay:?} (attempt {attempt})");
//!     }
//!     RetryDecision::GiveUp { reason } => println!("giving up: {reason}"),
//! }
//! ```

use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::DownloadError;

/// Default maximum attempts per page, including the first one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_JITTER_FRACTION: f64 = 0.3;

/// Classification of a failed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeouts, resets, 5xx and other conditions that usually clear up.
    TransientNetwork,
    /// The server asked us to slow down.
    RateLimited,
    /// Retrying cannot help (404, bad URL, local disk error).
    Permanent,
    /// Not recognized; retried like a transient error.
    Unknown,
}

impl ErrorKind {
    /// Returns the kind as a short label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient",
            Self::RateLimited => "rate-limited",
            Self::Permanent => "permanent",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision on whether to retry a failed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the page after `delay`.
    Retry {
        /// How long to wait before the next attempt.
        delay: Duration,
        /// Number of the next attempt (1-indexed, so the first retry is attempt 2).
        attempt: u32,
    },

    /// Stop retrying; the page is permanently failed.
    GiveUp {
        /// Human-readable reason.
        reason: String,
    },
}

/// Exponential backoff parameters for one library.
///
/// ```text
/// delay = min(max_delay, base_delay * 2^(attempt - 1)) * (1 ± jitter_fraction)
/// ```
///
/// A rate-limited response's `Retry-After` hint replaces the computed delay when larger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_fraction: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
        }
    }
}

impl BackoffPolicy {
    /// Creates a policy; `max_attempts` is clamped to at least 1 and
    /// `jitter_fraction` to `0.0..=1.0`.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        jitter_fraction: f64,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter_fraction: jitter_fraction.clamp(0.0, 1.0),
        }
    }

    /// Returns a copy with a different attempt budget.
    #[must_use]
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }

    /// Returns a copy with different delay bounds.
    #[must_use]
    pub fn with_delays(self, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            ..self
        }
    }

    /// Returns a copy with a different jitter fraction.
    #[must_use]
    pub fn with_jitter(self, jitter_fraction: f64) -> Self {
        Self {
            jitter_fraction: jitter_fraction.clamp(0.0, 1.0),
            ..self
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the base delay.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Returns the delay cap.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Decides what happens after attempt number `attempt` (1-indexed) failed.
    ///
    /// `retry_after` is the server's hint, already parsed. It only applies to
    /// rate-limited failures.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn next_delay(
        &self,
        kind: ErrorKind,
        attempt: u32,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        if kind == ErrorKind::Permanent {
            return RetryDecision::GiveUp {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::GiveUp {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let mut delay = self.apply_jitter(self.backoff_delay(attempt));
        if kind == ErrorKind::RateLimited
            && let Some(hint) = retry_after
            && hint > delay
        {
            debug!(hint_ms = hint.as_millis(), "honoring Retry-After");
            delay = hint;
        }

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            %kind,
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Un-jittered exponential delay for the attempt that just failed.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_fraction <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng()
            .gen_range((1.0 - self.jitter_fraction)..=(1.0 + self.jitter_fraction));
        delay.mul_f64(factor)
    }
}

/// Classifies a download error for the backoff policy.
///
/// | Error | Kind |
/// |-------|------|
/// | HTTP 429, or 503 with Retry-After | RateLimited |
/// | HTTP 408, other 5xx | TransientNetwork |
/// | Other HTTP 4xx | Permanent |
/// | Timeout, connection error, near-empty or non-image body, open circuit | TransientNetwork |
/// | TLS/certificate error | Permanent |
/// | IO, invalid URL | Permanent |
/// | Anything else (e.g. unexpected 3xx) | Unknown |
#[instrument]
pub fn classify_error(error: &DownloadError) -> ErrorKind {
    match error {
        DownloadError::HttpStatus {
            status,
            retry_after,
            ..
        } => classify_http_status(*status, retry_after.is_some()),

        DownloadError::Timeout { .. }
        | DownloadError::TooSmall { .. }
        | DownloadError::NotAnImage { .. }
        | DownloadError::CircuitOpen { .. } => ErrorKind::TransientNetwork,

        DownloadError::Network { source, .. } => {
            if is_tls_error(source) {
                ErrorKind::Permanent
            } else {
                ErrorKind::TransientNetwork
            }
        }

        DownloadError::Io { .. } | DownloadError::InvalidUrl { .. } => ErrorKind::Permanent,
    }
}

#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16, has_retry_after: bool) -> ErrorKind {
    match status {
        408 => ErrorKind::TransientNetwork, // Request Timeout
        429 => ErrorKind::RateLimited,      // Too Many Requests
        503 if has_retry_after => ErrorKind::RateLimited,
        status if (400..500).contains(&status) => ErrorKind::Permanent,
        status if (500..600).contains(&status) => ErrorKind::TransientNetwork,
        _ => ErrorKind::Unknown,
    }
}

fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}
