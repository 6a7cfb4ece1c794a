//! Splitting a manifest into contiguous, size-bounded parts.
//!
//! Large manuscripts become several PDFs. The target part length comes from
//! the smallest count that could satisfy both the page ceiling and the
//! estimated byte ceiling; a part is then closed early whenever its next page
//! would push it over the byte ceiling.

use serde::{Deserialize, Serialize};

use crate::manifest::Manifest;

/// Default page ceiling per part.
pub const DEFAULT_MAX_PAGES_PER_PART: usize = 250;

/// Default estimated byte ceiling per part (300 MiB).
pub const DEFAULT_MAX_PART_BYTES: u64 = 300 * 1024 * 1024;

/// Part size limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitPolicy {
    /// Maximum pages in one part. Values below 1 are treated as 1.
    pub max_pages_per_part: usize,
    /// Maximum estimated bytes in one part. Values below 1 are treated as 1.
    pub max_bytes_per_part: u64,
}

impl Default for SplitPolicy {
    fn default() -> Self {
        Self {
            max_pages_per_part: DEFAULT_MAX_PAGES_PER_PART,
            max_bytes_per_part: DEFAULT_MAX_PART_BYTES,
        }
    }
}

/// One part: the inclusive zero-based page range `start..=end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartSpec {
    /// Zero-based part number.
    pub index: usize,
    /// First page (zero-based).
    pub start: usize,
    /// Last page (zero-based, inclusive).
    pub end: usize,
}

impl PartSpec {
    /// Pages in this part.
    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    /// Always false; a part holds at least one page.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Splits `manifest` into parts.
///
/// `avg_page_bytes` is used for pages without a size hint. A manifest with no
/// pages yields no parts. The result always covers every page exactly once,
/// in order. No part exceeds `max_pages_per_part`, and no part of two or more
/// pages exceeds `max_bytes_per_part` by estimate; a single page larger than
/// the byte ceiling gets a part of its own.
#[must_use]
pub fn split(manifest: &Manifest, policy: SplitPolicy, avg_page_bytes: u64) -> Vec<PartSpec> {
    let total = manifest.page_count();
    if total == 0 {
        return Vec::new();
    }

    let max_pages = policy.max_pages_per_part.max(1);
    let max_bytes = policy.max_bytes_per_part.max(1);
    let estimated = manifest.estimated_bytes(avg_page_bytes);

    let by_pages = total.div_ceil(max_pages);
    let by_bytes = usize::try_from(estimated.div_ceil(max_bytes)).unwrap_or(total);
    let count = by_pages.max(by_bytes).clamp(1, total);
    let target = total.div_ceil(count);

    let mut parts = Vec::with_capacity(count);
    let mut start = 0;
    let mut bytes: u64 = 0;
    for (index, page) in manifest.pages.iter().enumerate() {
        let size = page.size_hint.unwrap_or(avg_page_bytes);
        let len = index - start;
        if len > 0 && (len == target || bytes.saturating_add(size) > max_bytes) {
            parts.push(PartSpec {
                index: parts.len(),
                start,
                end: index - 1,
            });
            start = index;
            bytes = 0;
        }
        bytes = bytes.saturating_add(size);
    }
    parts.push(PartSpec {
        index: parts.len(),
        start,
        end: total - 1,
    });
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PageDescriptor;

    fn manifest(pages: usize) -> Manifest {
        Manifest::new(
            "Test",
            (0..pages)
                .map(|i| PageDescriptor::new(format!("https://x/{i}.jpg")))
                .collect(),
        )
    }

    fn assert_partition(parts: &[PartSpec], total: usize, max_pages: usize) {
        let mut next = 0;
        for (i, part) in parts.iter().enumerate() {
            assert_eq!(part.index, i);
            assert_eq!(part.start, next, "gap or overlap before part {i}");
            assert!(part.end >= part.start);
            assert!(part.len() <= max_pages, "part {i} has {} pages", part.len());
            next = part.end + 1;
        }
        assert_eq!(next, total, "pages not fully covered");
    }

    #[test]
    fn test_empty_manifest_has_no_parts() {
        assert!(split(&manifest(0), SplitPolicy::default(), 1).is_empty());
    }

    #[test]
    fn test_small_manifest_is_one_part() {
        let parts = split(&manifest(12), SplitPolicy::default(), 400 * 1024);
        assert_eq!(parts, vec![PartSpec { index: 0, start: 0, end: 11 }]);
    }

    #[test]
    fn test_page_ceiling_drives_part_count() {
        let policy = SplitPolicy {
            max_pages_per_part: 20,
            max_bytes_per_part: u64::MAX,
        };
        let parts = split(&manifest(278), policy, 1);
        assert_eq!(parts.len(), 14);
        assert!(parts[..13].iter().all(|p| p.len() == 20));
        assert_eq!(parts[13].len(), 18);
        assert_partition(&parts, 278, 20);
    }

    #[test]
    fn test_byte_ceiling_drives_part_count() {
        let policy = SplitPolicy {
            max_pages_per_part: 1000,
            max_bytes_per_part: 10 * 1024 * 1024,
        };
        // 100 pages * 1 MiB = 100 MiB → at least 10 parts.
        let parts = split(&manifest(100), policy, 1024 * 1024);
        assert_eq!(parts.len(), 10);
        assert_partition(&parts, 100, 1000);
    }

    fn part_bytes(m: &Manifest, part: &PartSpec, avg: u64) -> u64 {
        m.pages[part.start..=part.end]
            .iter()
            .map(|page| page.size_hint.unwrap_or(avg))
            .sum()
    }

    #[test]
    fn test_byte_ceiling_holds_when_pages_do_not_pack_evenly() {
        let m = manifest(10);
        let policy = SplitPolicy {
            max_pages_per_part: 250,
            max_bytes_per_part: 1666,
        };
        let parts = split(&m, policy, 1000);

        assert!(parts.len() >= 7, "at least ceil(10000 / 1666) parts, got {}", parts.len());
        for part in &parts {
            let bytes = part_bytes(&m, part, 1000);
            assert!(bytes <= 1666, "part {} holds {bytes} bytes", part.index);
        }
        assert_partition(&parts, 10, 250);
    }

    #[test]
    fn test_uneven_size_hints_close_parts_early() {
        let mut m = manifest(6);
        for (page, size) in m.pages.iter_mut().zip([100, 100, 700, 100, 100, 100]) {
            page.size_hint = Some(size);
        }
        let policy = SplitPolicy {
            max_pages_per_part: 10,
            max_bytes_per_part: 800,
        };
        let parts = split(&m, policy, 1);

        for part in &parts {
            assert!(part_bytes(&m, part, 1) <= 800, "{part:?}");
        }
        assert_eq!(
            parts,
            vec![
                PartSpec { index: 0, start: 0, end: 1 },
                PartSpec { index: 1, start: 2, end: 3 },
                PartSpec { index: 2, start: 4, end: 5 },
            ]
        );
    }

    #[test]
    fn test_size_hints_override_average() {
        let mut m = manifest(4);
        for page in &mut m.pages {
            page.size_hint = Some(100);
        }
        let policy = SplitPolicy {
            max_pages_per_part: 10,
            max_bytes_per_part: 1000,
        };
        assert_eq!(split(&m, policy, 1_000_000).len(), 1);
    }

    #[test]
    fn test_oversized_pages_get_one_part_each() {
        let policy = SplitPolicy {
            max_pages_per_part: 50,
            max_bytes_per_part: 10,
        };
        let parts = split(&manifest(5), policy, 1_000);
        assert_eq!(parts.len(), 5);
        assert_partition(&parts, 5, 1);
    }

    #[test]
    fn test_partition_holds_across_sizes() {
        for total in 1..=120 {
            for max_pages in [1, 3, 7, 20, 250] {
                let policy = SplitPolicy {
                    max_pages_per_part: max_pages,
                    max_bytes_per_part: 5_000,
                };
                let parts = split(&manifest(total), policy, 333);
                assert_partition(&parts, total, max_pages);
            }
        }
    }
}
