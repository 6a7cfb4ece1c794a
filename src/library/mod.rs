//! Library registry: which loader and tuning apply to a source URL.
//!
//! Each supported library has one [`LibraryProfile`] and exactly one
//! [`ManifestLoader`]. URLs are routed to a library id through an ordered
//! table of regex patterns. The registry is assembled with
//! [`LibraryRegistryBuilder`] and validated once in [`LibraryRegistryBuilder::build`],
//! so a URL that matches a pattern always has a loader to go to.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use mss_core::library::{LibraryProfile, LibraryRegistry};
//! use mss_core::manifest::IiifManifestLoader;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let loader = Arc::new(IiifManifestLoader::new(reqwest::Client::new()));
//! let registry = LibraryRegistry::builder()
//!     .route(r"iiif\.durham\.ac\.uk", "durham")
//!     .loader("durham", loader)
//!     .profile(LibraryProfile::new("durham", "Durham University Library"))
//!     .build()?;
//!
//! let id = registry.detect("https://iiif.durham.ac.uk/manifests/trifle/32150/t1/m1/q1/manifest");
//! assert_eq!(id, Some("durham"));
//! # Ok(())
//! # }
//! ```

mod builtin;
mod error;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use crate::download::{BackoffPolicy, DEFAULT_CONCURRENCY};
use crate::manifest::ManifestLoader;

pub use builtin::builtin_libraries;
pub use error::RegistryError;

/// Average bytes per page assumed when a library has no better figure.
pub const DEFAULT_AVG_PAGE_BYTES: u64 = 400 * 1024;

/// Tuning for one library.
#[derive(Debug, Clone, PartialEq)]
pub struct LibraryProfile {
    /// Stable id used in persisted jobs and config overrides.
    pub id: String,
    /// Human-readable name.
    pub display_name: String,
    /// Upper bound on simultaneous page requests for one part.
    pub concurrency: usize,
    /// Scales manifest and page timeouts for slow servers.
    pub timeout_multiplier: f64,
    /// Retry policy for page fetches.
    pub backoff: BackoffPolicy,
    /// Size estimate used by the splitter when pages carry no size hint.
    pub avg_page_bytes: u64,
    /// Per-library override of the part byte ceiling.
    pub max_part_bytes: Option<u64>,
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
}

impl LibraryProfile {
    /// Creates a profile with default tuning.
    #[must_use]
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            concurrency: DEFAULT_CONCURRENCY,
            timeout_multiplier: 1.0,
            backoff: BackoffPolicy::default(),
            avg_page_bytes: DEFAULT_AVG_PAGE_BYTES,
            max_part_bytes: None,
            headers: Vec::new(),
        }
    }

    /// Sets the concurrency cap.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the timeout multiplier.
    #[must_use]
    pub fn with_timeout_multiplier(mut self, multiplier: f64) -> Self {
        self.timeout_multiplier = multiplier;
        self
    }

    /// Sets the average page size in KiB.
    #[must_use]
    pub fn with_avg_page_kb(mut self, kb: u64) -> Self {
        self.avg_page_bytes = kb * 1024;
        self
    }

    /// Adds a request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Applies the multiplier to a base timeout.
    #[must_use]
    pub fn scaled_timeout(&self, base: Duration) -> Duration {
        if self.timeout_multiplier.is_finite() && self.timeout_multiplier > 0.0 {
            base.mul_f64(self.timeout_multiplier)
        } else {
            base
        }
    }
}

/// A library's profile plus its loader.
#[derive(Clone)]
pub struct LibraryEntry {
    /// Tuning.
    pub profile: LibraryProfile,
    /// The one loader for this library.
    pub loader: Arc<dyn ManifestLoader>,
}

impl fmt::Debug for LibraryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryEntry")
            .field("profile", &self.profile)
            .field("loader", &self.loader.name())
            .finish()
    }
}

#[derive(Debug, Clone)]
struct Route {
    pattern: Regex,
    library: String,
}

/// Validated routing table and per-library entries.
#[derive(Debug, Clone)]
pub struct LibraryRegistry {
    routes: Vec<Route>,
    entries: HashMap<String, LibraryEntry>,
}

impl LibraryRegistry {
    /// Starts an empty builder.
    #[must_use]
    pub fn builder() -> LibraryRegistryBuilder {
        LibraryRegistryBuilder::default()
    }

    /// Returns the id of the first route matching `url`.
    #[must_use]
    pub fn detect(&self, url: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|route| route.pattern.is_match(url))
            .map(|route| route.library.as_str())
    }

    /// Returns the entry for a library id.
    #[must_use]
    pub fn entry(&self, id: &str) -> Option<&LibraryEntry> {
        self.entries.get(id)
    }

    /// Returns the profile for a library id.
    #[must_use]
    pub fn profile(&self, id: &str) -> Option<&LibraryProfile> {
        self.entries.get(id).map(|entry| &entry.profile)
    }

    /// Library ids in sorted order.
    #[must_use]
    pub fn library_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

/// Collects routes, loaders and profiles, then validates them together.
#[derive(Default)]
pub struct LibraryRegistryBuilder {
    routes: Vec<(String, String)>,
    loaders: Vec<(String, Arc<dyn ManifestLoader>)>,
    profiles: HashMap<String, LibraryProfile>,
}

impl LibraryRegistryBuilder {
    /// Adds a URL pattern for `library`. Earlier routes win.
    #[must_use]
    pub fn route(mut self, pattern: &str, library: &str) -> Self {
        self.routes.push((pattern.to_string(), library.to_string()));
        self
    }

    /// Registers the loader for `library`.
    #[must_use]
    pub fn loader(mut self, library: &str, loader: Arc<dyn ManifestLoader>) -> Self {
        self.loaders.push((library.to_string(), loader));
        self
    }

    /// Sets the profile for `profile.id`, replacing any earlier one.
    #[must_use]
    pub fn profile(mut self, profile: LibraryProfile) -> Self {
        self.profiles.insert(profile.id.clone(), profile);
        self
    }

    /// Mutable access to a profile, for applying config overrides.
    pub fn profile_mut(&mut self, library: &str) -> Option<&mut LibraryProfile> {
        self.profiles.get_mut(library)
    }

    /// Validates and builds the registry.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::InvalidPattern`] if a route does not compile
    /// - [`RegistryError::MissingLoader`] if a routed id has no loader
    /// - [`RegistryError::DuplicateLoader`] if an id has more than one loader
    /// - [`RegistryError::UnroutedLibrary`] if a loader or profile is unreachable
    pub fn build(self) -> Result<LibraryRegistry, RegistryError> {
        let mut routes = Vec::with_capacity(self.routes.len());
        for (pattern, library) in &self.routes {
            let compiled = Regex::new(pattern).map_err(|source| RegistryError::InvalidPattern {
                library: library.clone(),
                pattern: pattern.clone(),
                source,
            })?;
            routes.push(Route {
                pattern: compiled,
                library: library.clone(),
            });
        }

        let routed: BTreeSet<&str> = self.routes.iter().map(|(_, id)| id.as_str()).collect();

        let mut loaders: HashMap<&str, Vec<Arc<dyn ManifestLoader>>> = HashMap::new();
        for (library, loader) in &self.loaders {
            loaders
                .entry(library.as_str())
                .or_default()
                .push(Arc::clone(loader));
        }

        let declared = loaders
            .keys()
            .copied()
            .chain(self.profiles.keys().map(String::as_str));
        for id in declared {
            if !routed.contains(id) {
                return Err(RegistryError::UnroutedLibrary {
                    library: id.to_string(),
                });
            }
        }

        let mut entries = HashMap::with_capacity(routed.len());
        for id in routed {
            let mut found = loaders.remove(id).unwrap_or_default();
            let loader = match found.len() {
                0 => {
                    return Err(RegistryError::MissingLoader {
                        library: id.to_string(),
                    });
                }
                1 => found.remove(0),
                count => {
                    return Err(RegistryError::DuplicateLoader {
                        library: id.to_string(),
                        count,
                    });
                }
            };
            let profile = self
                .profiles
                .get(id)
                .cloned()
                .unwrap_or_else(|| LibraryProfile::new(id, id));
            debug!(library = id, loader = loader.name(), "registered library");
            entries.insert(id.to_string(), LibraryEntry { profile, loader });
        }

        Ok(LibraryRegistry { routes, entries })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::manifest::{LoaderError, Manifest};
    use async_trait::async_trait;

    struct Stub;

    #[async_trait]
    impl ManifestLoader for Stub {
        fn name(&self) -> &str {
            "stub"
        }

        async fn load_manifest(&self, _url: &str) -> Result<Manifest, LoaderError> {
            Ok(Manifest::new("stub", Vec::new()))
        }
    }

    #[test]
    fn test_detect_uses_first_matching_route() {
        let registry = LibraryRegistry::builder()
            .route(r"iiif\.bl\.uk", "bl")
            .route(r"/manifest(\.json)?$", "iiif")
            .loader("bl", Arc::new(Stub))
            .loader("iiif", Arc::new(Stub))
            .build()
            .unwrap();

        assert_eq!(registry.detect("https://iiif.bl.uk/x/manifest.json"), Some("bl"));
        assert_eq!(registry.detect("https://other.org/x/manifest"), Some("iiif"));
        assert_eq!(registry.detect("https://other.org/page.html"), None);
    }

    #[test]
    fn test_build_rejects_routed_id_without_loader() {
        let err = LibraryRegistry::builder()
            .route("gallica", "gallica")
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::MissingLoader { ref library } if library == "gallica"));
    }

    #[test]
    fn test_build_rejects_duplicate_loaders() {
        let err = LibraryRegistry::builder()
            .route("gallica", "gallica")
            .loader("gallica", Arc::new(Stub))
            .loader("gallica", Arc::new(Stub))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateLoader { count: 2, .. }));
    }

    #[test]
    fn test_build_rejects_unrouted_loader() {
        let err = LibraryRegistry::builder()
            .route("gallica", "gallica")
            .loader("gallica", Arc::new(Stub))
            .loader("orphan", Arc::new(Stub))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnroutedLibrary { ref library } if library == "orphan"));
    }

    #[test]
    fn test_build_rejects_invalid_pattern() {
        let err = LibraryRegistry::builder()
            .route("([", "broken")
            .loader("broken", Arc::new(Stub))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidPattern { .. }));
    }

    #[test]
    fn test_missing_profile_gets_defaults() {
        let registry = LibraryRegistry::builder()
            .route("ugent", "ugent")
            .loader("ugent", Arc::new(Stub))
            .build()
            .unwrap();
        let profile = registry.profile("ugent").unwrap();
        assert_eq!(profile.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(profile.avg_page_bytes, DEFAULT_AVG_PAGE_BYTES);
    }

    #[test]
    fn test_scaled_timeout_applies_multiplier() {
        let profile = LibraryProfile::new("slow", "Slow").with_timeout_multiplier(2.5);
        assert_eq!(
            profile.scaled_timeout(Duration::from_secs(10)),
            Duration::from_secs(25)
        );
        let broken = LibraryProfile::new("x", "X").with_timeout_multiplier(f64::NAN);
        assert_eq!(
            broken.scaled_timeout(Duration::from_secs(10)),
            Duration::from_secs(10)
        );
    }
}
