//! Global per-host connection ceiling.
//!
//! Every page fetch, from any job, acquires a [`HostPermit`] for the page's host
//! before opening a connection. The limiter caps simultaneous connections per
//! host and holds back new requests while a host is cooling down after a
//! rate-limit response.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use mss_core::download::HostLimiter;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = HostLimiter::new(4);
//!
//! let permit = limiter.acquire("https://iiif.example.org/p1.jpg").await?;
//! assert_eq!(limiter.in_flight("https://iiif.example.org/p2.jpg"), 1);
//! drop(permit);
//!
//! // A 429 with Retry-After pauses the whole host.
//! limiter
//!     .record_rate_limit("https://iiif.example.org/p3.jpg", Duration::from_secs(30))
//!     .await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{AcquireError, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Warning threshold for cumulative server-imposed delay per host.
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(120);

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Default simultaneous connections allowed to one host across all jobs.
pub const DEFAULT_PER_HOST_CONNECTIONS: usize = 8;

/// Per-host connection limiter shared by every fetcher pool.
#[derive(Debug)]
pub struct HostLimiter {
    per_host: usize,
    /// Arc'd so the `DashMap` shard lock is released before awaiting.
    hosts: DashMap<String, Arc<HostState>>,
}

#[derive(Debug)]
struct HostState {
    permits: Arc<Semaphore>,
    cooldown_until: Mutex<Option<Instant>>,
    cumulative_delay_ms: AtomicU64,
}

impl HostState {
    fn new(per_host: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(per_host)),
            cooldown_until: Mutex::new(None),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let new_total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(new_total)
    }
}

/// A held connection slot; released on drop.
#[derive(Debug)]
pub struct HostPermit {
    _permit: OwnedSemaphorePermit,
}

impl HostLimiter {
    /// Creates a limiter allowing `per_host` simultaneous connections per host.
    #[must_use]
    pub fn new(per_host: usize) -> Self {
        Self {
            per_host: per_host.max(1),
            hosts: DashMap::new(),
        }
    }

    /// Returns the configured ceiling.
    #[must_use]
    pub fn per_host(&self) -> usize {
        self.per_host
    }

    fn state(&self, host: &str) -> Arc<HostState> {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostState::new(self.per_host)))
            .clone()
    }

    /// Waits out any active cool-down for the URL's host, then takes a connection slot.
    ///
    /// # Errors
    ///
    /// Returns `AcquireError` if the host's semaphore was closed.
    #[instrument(skip(self), fields(host))]
    pub async fn acquire(&self, url: &str) -> Result<HostPermit, AcquireError> {
        let host = extract_domain(url);
        tracing::Span::current().record("host", &host);
        let state = self.state(&host);

        loop {
            let until = *state.cooldown_until.lock().await;
            match until {
                Some(until) if until > Instant::now() => {
                    debug!(host = %host, wait_ms = (until - Instant::now()).as_millis(), "host cooling down");
                    tokio::time::sleep_until(until).await;
                }
                _ => break,
            }
        }

        let permit = Arc::clone(&state.permits).acquire_owned().await?;
        Ok(HostPermit { _permit: permit })
    }

    /// Returns the number of connections currently held for the URL's host.
    #[must_use]
    pub fn in_flight(&self, url: &str) -> usize {
        let host = extract_domain(url);
        self.hosts.get(&host).map_or(0, |state| {
            self.per_host
                .saturating_sub(state.permits.available_permits())
        })
    }

    /// Records a server-mandated delay (Retry-After) for the URL's host.
    ///
    /// New requests to that host wait until the delay has passed. A later,
    /// shorter hint never shortens an existing cool-down.
    #[instrument(skip(self), fields(host))]
    pub async fn record_rate_limit(&self, url: &str, delay: Duration) {
        let host = extract_domain(url);
        tracing::Span::current().record("host", &host);
        let state = self.state(&host);

        let until = Instant::now() + delay.min(MAX_RETRY_AFTER);
        {
            let mut guard = state.cooldown_until.lock().await;
            if guard.is_none_or(|current| current < until) {
                *guard = Some(until);
            }
        }

        let cumulative = state.add_cumulative_delay(delay);
        debug!(
            host = %host,
            delay_ms = delay.as_millis(),
            cumulative_ms = cumulative.as_millis(),
            "recorded server rate limit"
        );

        if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
            warn!(
                host = %host,
                cumulative_delay_secs = cumulative.as_secs(),
                "excessive server rate limiting - library may be under heavy load"
            );
        }
    }
}

impl Default for HostLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_PER_HOST_CONNECTIONS)
    }
}

/// Extracts the lowercase host from a URL, or `"unknown"` when it has none.
///
/// ```
/// use mss_core::download::extract_domain;
///
/// assert_eq!(extract_domain("https://IIIF.Durham.ac.uk/x"), "iiif.durham.ac.uk");
/// assert_eq!(extract_domain("https://localhost:8080/x"), "localhost");
/// assert_eq!(extract_domain("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_domain(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a Retry-After header value (integer seconds or HTTP-date).
///
/// Returns `None` if the value cannot be parsed. Caps excessive values at 1 hour.
///
/// ```
/// use std::time::Duration;
/// use mss_core::download::parse_retry_after;
///
/// assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }
        return Some(duration);
    }

    let Ok(datetime) = httpdate::parse_http_date(header_value) else {
        debug!(header_value, "unparseable Retry-After value");
        return None;
    };

    match datetime.duration_since(std::time::SystemTime::now()) {
        Ok(duration) => Some(duration.min(MAX_RETRY_AFTER)),
        Err(_) => Some(Duration::ZERO),
    }
}
