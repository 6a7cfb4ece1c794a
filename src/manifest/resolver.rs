//! URL → library → loader dispatch with per-library timeouts.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use super::{LoaderError, Manifest, ResolveError};
use crate::library::LibraryRegistry;

/// Manifest timeout before the library multiplier is applied.
pub const DEFAULT_MANIFEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A loaded manifest and the library it came from.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    /// Library id from the routing table.
    pub library_id: String,
    /// The manifest, shared read-only from here on.
    pub manifest: Arc<Manifest>,
}

/// Resolves source URLs through a validated [`LibraryRegistry`].
#[derive(Debug, Clone)]
pub struct ManifestResolver {
    registry: Arc<LibraryRegistry>,
    base_timeout: Duration,
}

impl ManifestResolver {
    /// Creates a resolver.
    #[must_use]
    pub fn new(registry: Arc<LibraryRegistry>, base_timeout: Duration) -> Self {
        Self {
            registry,
            base_timeout,
        }
    }

    /// Returns the registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<LibraryRegistry> {
        &self.registry
    }

    /// Maps `url` to its library and loads the manifest.
    ///
    /// # Errors
    ///
    /// - [`ResolveError::UnsupportedLibrary`] when no route matches or the loader rejects the URL
    /// - [`ResolveError::Timeout`] when the loader exceeds the library's timeout
    /// - [`ResolveError::ManifestFetch`] for fetch/parse failures and manifests without pages
    #[instrument(skip(self), fields(library))]
    pub async fn resolve(&self, url: &str) -> Result<ResolvedManifest, ResolveError> {
        let library = self
            .registry
            .detect(url)
            .ok_or_else(|| ResolveError::no_library(url))?;
        tracing::Span::current().record("library", library);

        let entry = self
            .registry
            .entry(library)
            .ok_or_else(|| ResolveError::no_library(url))?;
        let timeout = entry.profile.scaled_timeout(self.base_timeout);

        let loaded = tokio::time::timeout(timeout, entry.loader.load_manifest(url))
            .await
            .map_err(|_| {
                warn!(timeout_secs = timeout.as_secs(), "manifest load timed out");
                ResolveError::timeout(url, library, timeout)
            })?;

        let manifest = match loaded {
            Ok(manifest) => manifest,
            Err(LoaderError::Unsupported { reason, .. }) => {
                return Err(ResolveError::rejected(url, &reason));
            }
            Err(e @ (LoaderError::Fetch { .. } | LoaderError::Parse { .. })) => {
                return Err(ResolveError::manifest_fetch(url, library, e.to_string()));
            }
        };

        if manifest.pages.is_empty() {
            return Err(ResolveError::manifest_fetch(
                url,
                library,
                "manifest lists no pages",
            ));
        }

        info!(
            pages = manifest.page_count(),
            title = %manifest.display_name,
            "manifest resolved"
        );

        Ok(ResolvedManifest {
            library_id: library.to_string(),
            manifest: Arc::new(manifest),
        })
    }
}
