//! User-selected page ranges.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Manifest;

/// Why a page range was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageRangeError {
    /// Not of the form `N`, `N-M` or `N-`.
    #[error("invalid page range '{0}'; expected FIRST-LAST, FIRST- or a single page number")]
    Syntax(String),

    /// Page numbers start at 1.
    #[error("page numbers start at 1")]
    Zero,

    /// The last page comes before the first.
    #[error("page range {first}-{last} ends before it starts")]
    Inverted {
        /// First page (1-based).
        first: usize,
        /// Last page (1-based).
        last: usize,
    },

    /// The range starts after the manuscript's last page.
    #[error("page range starts at page {first} but the manuscript has {page_count} pages")]
    OutOfBounds {
        /// First page (1-based).
        first: usize,
        /// Pages in the manifest.
        page_count: usize,
    },
}

/// Inclusive 1-based page selection; an open end runs to the last page.
///
/// ```
/// use mss_core::manifest::PageRange;
///
/// let range: PageRange = "12-40".parse().unwrap();
/// assert_eq!(range.indices(30).unwrap(), 11..=29);
/// assert_eq!("7".parse::<PageRange>().unwrap().to_string(), "7");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PageRange {
    first: usize,
    last: Option<usize>,
}

impl PageRange {
    /// Creates a range from 1-based page numbers.
    ///
    /// # Errors
    ///
    /// [`PageRangeError::Zero`] or [`PageRangeError::Inverted`].
    pub fn new(first: usize, last: Option<usize>) -> Result<Self, PageRangeError> {
        if first == 0 || last == Some(0) {
            return Err(PageRangeError::Zero);
        }
        if let Some(last) = last
            && last < first
        {
            return Err(PageRangeError::Inverted { first, last });
        }
        Ok(Self { first, last })
    }

    /// First selected page, 1-based.
    #[must_use]
    pub fn first(&self) -> usize {
        self.first
    }

    /// Last selected page, 1-based, or `None` for "to the end".
    #[must_use]
    pub fn last(&self) -> Option<usize> {
        self.last
    }

    /// Manuscript pages before the selection.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.first - 1
    }

    /// Zero-based manifest indices for a manuscript of `page_count` pages.
    /// A last page beyond the manuscript is clamped to its end.
    ///
    /// # Errors
    ///
    /// [`PageRangeError::OutOfBounds`] if the first page does not exist.
    pub fn indices(&self, page_count: usize) -> Result<RangeInclusive<usize>, PageRangeError> {
        if self.first > page_count {
            return Err(PageRangeError::OutOfBounds {
                first: self.first,
                page_count,
            });
        }
        let last = self.last.map_or(page_count, |last| last.min(page_count));
        Ok(self.offset()..=last - 1)
    }
}

impl FromStr for PageRange {
    type Err = PageRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let syntax = || PageRangeError::Syntax(s.to_string());
        let number = |part: &str| part.trim().parse::<usize>().map_err(|_| syntax());
        match s.trim().split_once('-') {
            None => {
                let page = number(s)?;
                Self::new(page, Some(page))
            }
            Some((first, "")) => Self::new(number(first)?, None),
            Some((first, last)) => Self::new(number(first)?, Some(number(last)?)),
        }
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last {
            Some(last) if last == self.first => write!(f, "{last}"),
            Some(last) => write!(f, "{}-{last}", self.first),
            None => write!(f, "{}-", self.first),
        }
    }
}

impl From<PageRange> for String {
    fn from(range: PageRange) -> Self {
        range.to_string()
    }
}

impl TryFrom<String> for PageRange {
    type Error = PageRangeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Manifest {
    /// The manifest restricted to `range`, keeping the display name.
    ///
    /// # Errors
    ///
    /// [`PageRangeError::OutOfBounds`] if the range starts past the last page.
    pub fn select(&self, range: PageRange) -> Result<Manifest, PageRangeError> {
        let indices = range.indices(self.page_count())?;
        Ok(Manifest {
            display_name: self.display_name.clone(),
            pages: self.pages[indices].to_vec(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::manifest::PageDescriptor;

    #[test]
    fn test_parse_forms() {
        let closed: PageRange = "12-40".parse().unwrap();
        assert_eq!((closed.first(), closed.last()), (12, Some(40)));

        let open: PageRange = " 100- ".parse().unwrap();
        assert_eq!((open.first(), open.last()), (100, None));

        let single: PageRange = "5".parse().unwrap();
        assert_eq!((single.first(), single.last()), (5, Some(5)));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!("a-b".parse::<PageRange>(), Err(PageRangeError::Syntax(_))));
        assert!(matches!("-4".parse::<PageRange>(), Err(PageRangeError::Syntax(_))));
        assert_eq!("0-3".parse::<PageRange>(), Err(PageRangeError::Zero));
        assert_eq!(
            "9-3".parse::<PageRange>(),
            Err(PageRangeError::Inverted { first: 9, last: 3 })
        );
    }

    #[test]
    fn test_display_matches_input_form() {
        for input in ["12-40", "100-", "5"] {
            assert_eq!(input.parse::<PageRange>().unwrap().to_string(), input);
        }
    }

    #[test]
    fn test_indices_clamp_to_manuscript() {
        let range = PageRange::new(270, Some(300)).unwrap();
        assert_eq!(range.indices(278).unwrap(), 269..=277);
        assert_eq!(PageRange::new(3, None).unwrap().indices(10).unwrap(), 2..=9);
        assert_eq!(
            PageRange::new(11, None).unwrap().indices(10),
            Err(PageRangeError::OutOfBounds {
                first: 11,
                page_count: 10
            })
        );
    }

    #[test]
    fn test_select_keeps_requested_pages() {
        let manifest = Manifest::new(
            "Hours",
            (1..=6).map(|n| PageDescriptor::new(format!("p{n}"))).collect(),
        );
        let selected = manifest.select("2-4".parse().unwrap()).unwrap();
        assert_eq!(selected.display_name, "Hours");
        let urls: Vec<&str> = selected.pages.iter().map(|p| p.url.as_str()).collect();
        assert_eq!(urls, ["p2", "p3", "p4"]);
    }

    #[test]
    fn test_serde_uses_display_form() {
        let range: PageRange = "3-9".parse().unwrap();
        assert_eq!(serde_json::to_value(range).unwrap(), "3-9");
        let back: PageRange = serde_json::from_str("\"3-9\"").unwrap();
        assert_eq!(back, range);
    }
}
