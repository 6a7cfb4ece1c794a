//! Page fetching: HTTP client, retry policy, per-host limits and the fetcher pool.
//!
//! # Layers
//!
//! - [`HttpClient`] implements [`PageSource`]: one GET streamed to disk.
//! - [`CircuitBreakerSource`] decorates any [`PageSource`] with per-library
//!   failure tracking.
//! - [`HostLimiter`] caps connections per host across all jobs.
//! - [`FetcherPool`] drives one part's pages through the above with bounded
//!   concurrency and [`BackoffPolicy`]-driven retries.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use mss_core::download::{
//!     BackoffPolicy, FetcherPool, HostLimiter, HttpClient, PageJob, PartFetch, collect_results,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = FetcherPool::new(
//!     Arc::new(HttpClient::new()?),
//!     Arc::new(HostLimiter::default()),
//!     1024,
//! );
//! let part = PartFetch {
//!     library: "iiif".to_string(),
//!     dir: "./pages".into(),
//!     pages: vec![PageJob { index: 0, url: "https://iiif.example.org/p1.jpg".to_string() }],
//!     concurrency: 4,
//!     headers: Vec::new(),
//!     timeout: Duration::from_secs(60),
//!     backoff: BackoffPolicy::default(),
//! };
//! let results = collect_results(pool.run(part, CancellationToken::new())).await;
//! println!("{} pages resolved", results.len());
//! # Ok(())
//! # }
//! ```

mod circuit_breaker;
mod client;
pub mod constants;
mod error;
mod host_limiter;
pub mod page_file;
mod pool;
mod retry;
mod source;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerSource};
pub use client::HttpClient;
pub use constants::{DEFAULT_CONCURRENCY, MIN_VALID_PAGE_BYTES};
pub use error::DownloadError;
pub use host_limiter::{
    DEFAULT_PER_HOST_CONNECTIONS, HostLimiter, HostPermit, extract_domain, parse_retry_after,
};
pub use pool::{FetcherPool, PageJob, PageOutcome, PageResult, PartFetch, collect_results};
pub use retry::{BackoffPolicy, DEFAULT_MAX_ATTEMPTS, ErrorKind, RetryDecision, classify_error};
pub use source::{PageRequest, PageSource};
