//! Per-library circuit breaker around a [`PageSource`].
//!
//! After `failure_threshold` consecutive transient failures for one library,
//! the breaker opens: requests for that library fail fast with
//! [`DownloadError::CircuitOpen`] until `cooldown` has passed. The next request
//! is then let through as a probe; success closes the circuit, failure reopens it.
//!
//! Open-circuit errors are classified as transient, so pages simply wait in the
//! backoff queue instead of hammering a library that is down.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{info, warn};

use super::error::DownloadError;
use super::retry::{ErrorKind, classify_error};
use super::source::{PageRequest, PageSource};

/// Consecutive failures that open the circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 8;

/// How long an open circuit rejects requests.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    /// A probe is in flight; another is admitted if it has not reported back by `retry_at`.
    HalfOpen { retry_at: Instant },
}

/// Failure-rate tracker keyed by library id.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    libraries: DashMap<String, BreakerState>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }
}

impl CircuitBreaker {
    /// Creates a breaker.
    #[must_use]
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            libraries: DashMap::new(),
        }
    }

    /// Returns true when a request for `library` may go out now.
    ///
    /// An expired open circuit moves to half-open and admits exactly one probe.
    pub fn allow(&self, library: &str) -> bool {
        let mut state = self
            .libraries
            .entry(library.to_string())
            .or_insert(BreakerState::Closed {
                consecutive_failures: 0,
            });
        let now = Instant::now();
        let current = *state;
        match current {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { until: deadline } | BreakerState::HalfOpen { retry_at: deadline }
                if now >= deadline =>
            {
                *state = BreakerState::HalfOpen {
                    retry_at: now + self.cooldown,
                };
                true
            }
            BreakerState::Open { .. } | BreakerState::HalfOpen { .. } => false,
        }
    }

    /// Records a successful request.
    pub fn record_success(&self, library: &str) {
        let previous = self.libraries.insert(
            library.to_string(),
            BreakerState::Closed {
                consecutive_failures: 0,
            },
        );
        if matches!(previous, Some(BreakerState::HalfOpen { .. })) {
            info!(library, "circuit closed after successful probe");
        }
    }

    /// Records a failed request.
    pub fn record_failure(&self, library: &str) {
        let mut state = self
            .libraries
            .entry(library.to_string())
            .or_insert(BreakerState::Closed {
                consecutive_failures: 0,
            });
        let next = match *state {
            BreakerState::Closed {
                consecutive_failures,
            } if consecutive_failures + 1 < self.failure_threshold => BreakerState::Closed {
                consecutive_failures: consecutive_failures + 1,
            },
            BreakerState::Open { until } => BreakerState::Open { until },
            BreakerState::Closed { .. } | BreakerState::HalfOpen { .. } => {
                warn!(
                    library,
                    cooldown_secs = self.cooldown.as_secs(),
                    "circuit opened after repeated failures"
                );
                BreakerState::Open {
                    until: Instant::now() + self.cooldown,
                }
            }
        };
        *state = next;
    }

    /// Returns true while the library's circuit is open or probing.
    #[must_use]
    pub fn is_open(&self, library: &str) -> bool {
        self.libraries
            .get(library)
            .is_some_and(|state| !matches!(*state, BreakerState::Closed { .. }))
    }
}

/// [`PageSource`] decorator applying a shared [`CircuitBreaker`].
pub struct CircuitBreakerSource<S> {
    inner: S,
    breaker: Arc<CircuitBreaker>,
}

impl<S> CircuitBreakerSource<S> {
    /// Wraps `inner`.
    pub fn new(inner: S, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }
}

#[async_trait]
impl<S: PageSource> PageSource for CircuitBreakerSource<S> {
    async fn fetch_page(&self, request: &PageRequest, dest: &Path) -> Result<u64, DownloadError> {
        if !self.breaker.allow(&request.library) {
            return Err(DownloadError::circuit_open(&request.library, &request.url));
        }

        let result = self.inner.fetch_page(request, dest).await;
        match &result {
            Ok(_) => self.breaker.record_success(&request.library),
            // A 404 says nothing about the library's health.
            Err(e) if classify_error(e) == ErrorKind::Permanent => {
                self.breaker.record_success(&request.library);
            }
            Err(_) => self.breaker.record_failure(&request.library),
        }
        result
    }
}
