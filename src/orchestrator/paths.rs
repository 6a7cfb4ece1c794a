//! File and directory naming for jobs.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

/// Longest title kept in an output file name, in characters.
const MAX_TITLE_CHARS: usize = 120;

/// Replaces characters that are invalid on common filesystems.
///
/// `/ \ : * ? " < > |` and control characters become `_`; runs of whitespace
/// collapse to one `_`. Names made only of dots are neutralised.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());
    let mut last_was_space = false;
    for c in name.trim().chars().take(MAX_TITLE_CHARS) {
        let mapped = match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        };
        if mapped.is_whitespace() {
            if !last_was_space {
                sanitized.push('_');
            }
            last_was_space = true;
        } else {
            sanitized.push(mapped);
            last_was_space = false;
        }
    }

    let trimmed = sanitized.trim_matches(|c| c == '_' || c == '.');
    if trimmed.is_empty() {
        return "manuscript".to_string();
    }
    trimmed.to_string()
}

/// Output file name for one part.
///
/// `pages` are zero-based manuscript indices. A single-part job is
/// `<name>.pdf`, or `<name>_pages_<first>-<last>.pdf` when the user picked a
/// page range; otherwise `<name>_part_<n>_of_<total>_pages_<first>-<last>.pdf`
/// with 1-based numbers.
#[must_use]
pub fn part_file_name(
    title: &str,
    part_index: usize,
    part_count: usize,
    pages: RangeInclusive<usize>,
    selected: bool,
) -> String {
    let name = sanitize_filename(title);
    let (first, last) = (pages.start() + 1, pages.end() + 1);
    match (part_count <= 1, selected) {
        (true, false) => format!("{name}.pdf"),
        (true, true) => format!("{name}_pages_{first}-{last}.pdf"),
        (false, _) => format!(
            "{name}_part_{}_of_{part_count}_pages_{first}-{last}.pdf",
            part_index + 1
        ),
    }
}

/// Scratch directory holding every part of a job.
#[must_use]
pub fn job_work_dir(state_dir: &Path, job_id: i64) -> PathBuf {
    state_dir.join("pages").join(format!("job_{job_id}"))
}

/// Scratch directory for one part's page files.
#[must_use]
pub fn part_work_dir(state_dir: &Path, job_id: i64, part_index: usize) -> PathBuf {
    job_work_dir(state_dir, job_id).join(format!("part_{}", part_index + 1))
}
