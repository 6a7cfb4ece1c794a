//! Manifest loading and resolution errors.
//!
//! Messages follow the What/Why/Suggestion layout because they end up in
//! `list` output and persisted job errors.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a [`super::ManifestLoader`].
#[derive(Debug, Clone, Error)]
pub enum LoaderError {
    /// The URL is not something this loader understands.
    #[error("unsupported manuscript URL '{url}': {reason}")]
    Unsupported {
        /// Source URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The manifest could not be retrieved.
    #[error("failed to fetch manifest '{url}': {reason}")]
    Fetch {
        /// Manifest URL.
        url: String,
        /// Cause.
        reason: String,
    },

    /// The manifest was retrieved but is not usable.
    #[error("failed to parse manifest '{url}': {reason}")]
    Parse {
        /// Manifest URL.
        url: String,
        /// Cause.
        reason: String,
    },
}

impl LoaderError {
    /// Creates an `Unsupported` error.
    #[must_use]
    pub fn unsupported(url: &str, reason: &str) -> Self {
        Self::Unsupported {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Creates a `Fetch` error.
    #[must_use]
    pub fn fetch(url: &str, reason: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    /// Creates a `Parse` error.
    #[must_use]
    pub fn parse(url: &str, reason: impl Into<String>) -> Self {
        Self::Parse {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failure of [`super::ManifestResolver::resolve`].
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// No library handles this URL.
    #[error("unsupported library for '{url}': {reason}\n  Suggestion: {suggestion}")]
    UnsupportedLibrary {
        /// Source URL.
        url: String,
        /// Why.
        reason: String,
        /// How to fix it.
        suggestion: String,
    },

    /// The loader did not answer within the library's timeout.
    #[error("manifest for '{url}' from {library} timed out after {}s\n  Suggestion: retry later or raise timeout_multiplier for {library}", after.as_secs())]
    Timeout {
        /// Source URL.
        url: String,
        /// Library id.
        library: String,
        /// Timeout applied.
        after: Duration,
    },

    /// The loader failed or returned an unusable manifest.
    #[error("manifest fetch failed for '{url}' ({library}): {reason}\n  Suggestion: check the URL in a browser, then run `retry`")]
    ManifestFetch {
        /// Source URL.
        url: String,
        /// Library id.
        library: String,
        /// Cause.
        reason: String,
    },
}

impl ResolveError {
    /// No pattern in the routing table matched.
    #[must_use]
    pub fn no_library(url: &str) -> Self {
        Self::UnsupportedLibrary {
            url: url.to_string(),
            reason: "no known library matches this URL".to_string(),
            suggestion: "Use the library's IIIF manifest URL, or add a route for it".to_string(),
        }
    }

    /// The loader rejected the URL.
    #[must_use]
    pub fn rejected(url: &str, reason: &str) -> Self {
        Self::UnsupportedLibrary {
            url: url.to_string(),
            reason: reason.to_string(),
            suggestion: "Check that the URL points at a manuscript, not a search page".to_string(),
        }
    }

    /// Creates a `Timeout` error.
    #[must_use]
    pub fn timeout(url: &str, library: &str, after: Duration) -> Self {
        Self::Timeout {
            url: url.to_string(),
            library: library.to_string(),
            after,
        }
    }

    /// Creates a `ManifestFetch` error.
    #[must_use]
    pub fn manifest_fetch(url: &str, library: &str, reason: impl Into<String>) -> Self {
        Self::ManifestFetch {
            url: url.to_string(),
            library: library.to_string(),
            reason: reason.into(),
        }
    }

    /// True when retrying cannot help without user action on the input.
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::UnsupportedLibrary { .. })
    }
}
