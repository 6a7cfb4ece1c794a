//! Startup-time registry configuration errors.

use thiserror::Error;

/// The library table is inconsistent. Raised while building the registry,
/// never at request time.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A URL pattern does not compile.
    #[error("invalid URL pattern '{pattern}' for library '{library}': {source}")]
    InvalidPattern {
        /// Library the route points to.
        library: String,
        /// The offending pattern.
        pattern: String,
        /// Regex compile error.
        #[source]
        source: regex::Error,
    },

    /// URLs route to a library that has no loader.
    #[error("library '{library}' is routed but has no manifest loader\n  Suggestion: register a loader for '{library}' or remove its URL pattern")]
    MissingLoader {
        /// The library id.
        library: String,
    },

    /// More than one loader claims the same library.
    #[error("library '{library}' has {count} manifest loaders; exactly one is allowed")]
    DuplicateLoader {
        /// The library id.
        library: String,
        /// Number of loaders registered.
        count: usize,
    },

    /// A loader or profile exists for an id no URL pattern reaches.
    #[error("library '{library}' is not reachable from any URL pattern\n  Suggestion: add a route for '{library}' or check the id for typos")]
    UnroutedLibrary {
        /// The library id.
        library: String,
    },
}
