//! Manifests and the loader contract.
//!
//! A [`Manifest`] is the immutable list of page image URLs for one manuscript.
//! Library-specific [`ManifestLoader`]s produce it; [`ManifestResolver`] picks the
//! loader for a URL and enforces the library's timeout.

mod error;
mod iiif;
mod range;
mod resolver;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use error::{LoaderError, ResolveError};
pub use iiif::IiifManifestLoader;
pub use range::{PageRange, PageRangeError};
pub use resolver::{DEFAULT_MANIFEST_TIMEOUT, ManifestResolver, ResolvedManifest};

/// One page image location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDescriptor {
    /// Image URL.
    pub url: String,
    /// Expected size in bytes, when the library publishes it.
    #[serde(default)]
    pub size_hint: Option<u64>,
}

impl PageDescriptor {
    /// Creates a descriptor without a size hint.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            size_hint: None,
        }
    }
}

/// Ordered page list plus display metadata for one manuscript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Title shown to the user and used for output file names.
    #[serde(default)]
    pub display_name: String,
    /// Pages in reading order.
    #[serde(default)]
    pub pages: Vec<PageDescriptor>,
}

impl Manifest {
    /// Creates a manifest.
    pub fn new(display_name: impl Into<String>, pages: Vec<PageDescriptor>) -> Self {
        Self {
            display_name: display_name.into(),
            pages,
        }
    }

    /// Number of pages.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Estimated total size: each page's hint, or `avg_page_bytes` when absent.
    #[must_use]
    pub fn estimated_bytes(&self, avg_page_bytes: u64) -> u64 {
        self.pages
            .iter()
            .map(|page| page.size_hint.unwrap_or(avg_page_bytes))
            .sum()
    }
}

/// Library-specific manifest producer.
///
/// Loaders turn a source URL into page descriptors and a display name. They may
/// retry internally, but never split, download pages or report progress.
#[async_trait]
pub trait ManifestLoader: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Loads the manifest behind `url`.
    async fn load_manifest(&self, url: &str) -> Result<Manifest, LoaderError>;
}
