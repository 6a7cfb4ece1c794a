//! CLI entry point for the manuscript downloader.

use std::process::ExitCode;

mod app;
mod cli;

/// Outcome of a command, mapped to the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessExit {
    /// Everything requested finished.
    Success,
    /// Some jobs completed, some did not.
    Partial,
    /// Nothing completed, or the command failed.
    Failure,
}

impl ProcessExit {
    pub(crate) fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::Partial => 2,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match app::runtime::run().await {
        Ok(outcome) => ExitCode::from(outcome.code()),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(ProcessExit::Failure.code())
        }
    }
}
