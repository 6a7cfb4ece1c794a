//! Constants for the download module.

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default per-page request timeout before library multipliers (60 seconds).
pub const PAGE_TIMEOUT_SECS: u64 = 60;

/// Bodies smaller than this are treated as error pages, not images.
pub const MIN_VALID_PAGE_BYTES: u64 = 1024;

/// Default number of pages fetched concurrently for one part.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Upper bound for any per-library concurrency setting.
pub const MAX_CONCURRENCY: usize = 32;
