//! The per-request seam of the fetcher pool.
//!
//! [`PageSource`] fetches one page image to disk. [`super::HttpClient`] is the
//! real implementation; decorators such as [`super::CircuitBreakerSource`]
//! wrap it without the pool knowing.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use super::DownloadError;

/// Everything needed to fetch one page.
#[derive(Debug, Clone)]
pub struct PageRequest {
    /// Image URL.
    pub url: String,
    /// Library the page belongs to.
    pub library: String,
    /// Extra headers required by the library (Referer, User-Agent, ...).
    pub headers: Vec<(String, String)>,
    /// Whole-request timeout.
    pub timeout: Duration,
    /// Bodies smaller than this are rejected.
    pub min_bytes: u64,
}

/// Fetches a single page image to `dest`.
///
/// Implementations write to a temporary sibling first so `dest` only ever
/// holds a complete body, and return the number of bytes written.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Downloads `request.url` into `dest`.
    async fn fetch_page(&self, request: &PageRequest, dest: &Path) -> Result<u64, DownloadError>;
}
