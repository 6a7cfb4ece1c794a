//! PDF assembly errors.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while assembling one part into a PDF.
#[derive(Debug, Error)]
pub enum AssemblyError {
    /// Too many pages failed to download.
    #[error(
        "{failed} of {total} pages failed, above the {:.1}% tolerance\n  Suggestion: run `retry` to fetch the missing pages",
        tolerance * 100.0
    )]
    ToleranceExceeded {
        /// Permanently failed pages.
        failed: usize,
        /// Pages in the part.
        total: usize,
        /// Allowed failed fraction.
        tolerance: f64,
    },

    /// The request listed no pages.
    #[error("nothing to assemble for {path}")]
    NoPages {
        /// Requested output.
        path: PathBuf,
    },

    /// A page file could not be read as an image.
    #[error("page {} ({}) is not a usable image: {reason}", index + 1, path.display())]
    Image {
        /// Zero-based page index.
        index: usize,
        /// Page file.
        path: PathBuf,
        /// Decoder message.
        reason: String,
    },

    /// The PDF could not be encoded.
    #[error("failed to encode PDF {path}: {reason}")]
    Pdf {
        /// Output path.
        path: PathBuf,
        /// Encoder message.
        reason: String,
    },

    /// File system error.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl AssemblyError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn pdf(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Pdf {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
