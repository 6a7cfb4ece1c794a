//! Manuscript Downloader Core Library
//!
//! Turns a manuscript URL from a supported digital library into one or more
//! PDFs. Jobs live in a persistent queue and survive restarts; page files on
//! disk are the source of truth for what has already been fetched.
//!
//! # Architecture
//!
//! - [`library`] - URL pattern table mapping inputs to per-library download profiles
//! - [`manifest`] - Manifest loaders turning a URL into an ordered page list
//! - [`split`] - Partitioning large manuscripts into size-bounded parts
//! - [`download`] - Page fetcher pool with retries, per-host limits and circuit breaking
//! - [`assemble`] - PDF assembly from validated page images
//! - [`orchestrator`] - Job lifecycle, queue persistence, progress and ETA
//! - [`db`] - SQLite connection and schema management

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod assemble;
pub mod db;
pub mod download;
pub mod library;
pub mod manifest;
pub mod orchestrator;
pub mod split;
mod user_agent;

// Re-export commonly used types
pub use assemble::{AssemblyError, PdfAssembler};
pub use db::Database;
pub use download::{BackoffPolicy, FetcherPool, HostLimiter, HttpClient, PageSource};
pub use library::{LibraryProfile, LibraryRegistry, builtin_libraries};
pub use manifest::{Manifest, ManifestResolver};
pub use orchestrator::{
    JobStatus, JobStore, Orchestrator, OrchestratorConfig, OrchestratorHandle, QueueEvent, RunMode,
};
pub use split::SplitPolicy;
