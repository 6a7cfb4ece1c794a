//! Exit code logic for the process.

use crate::ProcessExit;

/// Maps how many requested jobs completed to the process exit outcome.
pub(crate) fn determine_exit_outcome(completed: usize, requested: usize) -> ProcessExit {
    if completed == requested {
        ProcessExit::Success
    } else if completed > 0 {
        ProcessExit::Partial
    } else {
        ProcessExit::Failure
    }
}
