//! Error types for page downloads.
//!
//! Every variant carries the URL or path it concerns so a failed page can be
//! reported without extra bookkeeping.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while fetching a single page image.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The connection failed before a response arrived.
    #[error("network error fetching page {url}: {source}")]
    Network {
        /// Page URL.
        url: String,
        /// Transport error from reqwest.
        #[source]
        source: reqwest::Error,
    },

    /// No complete response within the library's page timeout.
    #[error("timeout fetching page {url}")]
    Timeout {
        /// Page URL.
        url: String,
    },

    /// Non-success status from the image server.
    #[error("HTTP {status} for page {url}")]
    HttpStatus {
        /// Page URL.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present.
        retry_after: Option<String>,
    },

    /// The page file could not be written or renamed into place.
    #[error("cannot write page file {path}: {source}")]
    Io {
        /// Page file path.
        path: PathBuf,
        /// Filesystem error.
        #[source]
        source: std::io::Error,
    },

    /// The manifest listed a page URL reqwest cannot parse.
    #[error("malformed page URL: {url}")]
    InvalidUrl {
        /// URL as listed in the manifest.
        url: String,
    },

    /// The server answered with a body too small to be a page image.
    ///
    /// Libraries commonly return tiny HTML or placeholder images instead of
    /// an error status when they are overloaded.
    #[error("response from {url} is only {bytes} bytes (minimum {min_bytes}); likely an error page")]
    TooSmall {
        /// The URL that returned the short body.
        url: String,
        /// Bytes received.
        bytes: u64,
        /// Configured minimum page size.
        min_bytes: u64,
    },

    /// The body is large enough but is not an image, typically an HTML
    /// login or "access denied" page served with status 200.
    #[error("response from {url} is not an image ({bytes} bytes); likely an error page")]
    NotAnImage {
        /// The URL that returned the body.
        url: String,
        /// Bytes received.
        bytes: u64,
    },

    /// The circuit breaker for this library is open.
    #[error("circuit open for library {library}; skipping {url} until the cool-down ends")]
    CircuitOpen {
        /// The library whose breaker tripped.
        library: String,
        /// The URL that was not attempted.
        url: String,
    },
}

impl DownloadError {
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Status error carrying the raw `Retry-After` header.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a near-empty response error.
    pub fn too_small(url: impl Into<String>, bytes: u64, min_bytes: u64) -> Self {
        Self::TooSmall {
            url: url.into(),
            bytes,
            min_bytes,
        }
    }

    pub fn not_an_image(url: impl Into<String>, bytes: u64) -> Self {
        Self::NotAnImage {
            url: url.into(),
            bytes,
        }
    }

    /// Creates an open-circuit error.
    pub fn circuit_open(library: impl Into<String>, url: impl Into<String>) -> Self {
        Self::CircuitOpen {
            library: library.into(),
            url: url.into(),
        }
    }

    /// Returns the raw Retry-After header value when the server sent one.
    #[must_use]
    pub fn retry_after(&self) -> Option<&str> {
        match self {
            Self::HttpStatus { retry_after, .. } => retry_after.as_deref(),
            _ => None,
        }
    }
}
