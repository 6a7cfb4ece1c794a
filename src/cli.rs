//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use mss_core::manifest::PageRange;

/// Download digitized manuscripts and assemble them into PDFs.
///
/// Jobs are kept in a persistent queue; interrupted downloads continue where
/// they stopped on the next `run`.
#[derive(Parser, Debug)]
#[command(name = "mss-downloader")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/mss-downloader/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory finished PDFs are written to
    #[arg(short, long, global = true, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Directory holding the queue database and page scratch files
    #[arg(long, global = true, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    /// Jobs processed at the same time (1-8)
    #[arg(short = 'j', long, global = true, value_parser = clap::value_parser!(u8).range(1..=8))]
    pub jobs: Option<u8>,

    #[command(subcommand)]
    pub command: Command,
}

/// Queue operations.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Queue one or more manuscript URLs
    Add {
        /// Manuscript or IIIF manifest URLs
        #[arg(required = true, value_name = "URL")]
        urls: Vec<String>,

        /// Process the new jobs right away and wait for them
        #[arg(long)]
        run: bool,

        /// Only download these pages, e.g. `12-40`, `100-` or `7`
        #[arg(long, value_name = "FIRST-LAST")]
        pages: Option<PageRange>,
    },

    /// Show every job in the queue
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Stop a job; downloaded pages are kept
    Pause {
        /// Job id
        id: i64,
    },

    /// Continue a paused job on the next run
    Resume {
        /// Job id
        id: i64,
    },

    /// Remove a job and its scratch files
    Delete {
        /// Job id
        id: i64,
    },

    /// Requeue a failed job, or every retryable failed job
    Retry {
        /// Job id (all failed jobs when omitted)
        id: Option<i64>,

        /// Process the requeued jobs right away and wait for them
        #[arg(long)]
        run: bool,
    },

    /// Process the queue until every pending job has finished or failed
    Run,
}
