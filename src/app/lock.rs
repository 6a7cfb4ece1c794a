//! Single-runner lock on a state directory.
//!
//! A `run` keeps jobs in memory and writes them back as they progress, so a
//! second process editing the same rows would be overwritten. Commands that
//! change job state take this lock first; `list` and a plain `add` do not.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use tracing::debug;

const LOCK_FILE: &str = "queue.lock";

/// Exclusive advisory lock, released when dropped or when the process exits.
#[derive(Debug)]
pub(crate) struct StateLock {
    _file: File,
}

impl StateLock {
    /// Takes the lock without waiting. `action` names the refused command in
    /// the error, e.g. "pause job 3".
    pub(crate) fn acquire(state_dir: &Path, action: &str) -> Result<Self> {
        std::fs::create_dir_all(state_dir).with_context(|| {
            format!("Failed to create state directory '{}'", state_dir.display())
        })?;
        let path = state_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open lock file '{}'", path.display()))?;

        if let Err(e) = file.try_lock_exclusive() {
            if is_contended(&e) {
                bail!(
                    "Cannot {action}: another mss-downloader process is running the queue in '{}'\n  Suggestion: wait for it to finish, or stop it with Ctrl-C first",
                    state_dir.display()
                );
            }
            return Err(e).with_context(|| format!("Failed to lock '{}'", path.display()));
        }
        debug!(path = %path.display(), "state directory locked");
        Ok(Self { _file: file })
    }
}

fn is_contended(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::WouldBlock
        || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_second_lock_is_refused_until_first_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state");

        let held = StateLock::acquire(&state, "run the queue").unwrap();
        let err = StateLock::acquire(&state, "pause job 1").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Cannot pause job 1"), "{message}");
        assert!(message.contains("another mss-downloader process"), "{message}");

        drop(held);
        StateLock::acquire(&state, "pause job 1").unwrap();
    }
}
