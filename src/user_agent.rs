//! User-Agent string shared by manifest and page requests.

/// Project URL for User-Agent identification (good citizenship; RFC 9308).
const PROJECT_UA_URL: &str = "https://github.com/nicksrandall/mss-downloader";

/// Default User-Agent for manifest and page requests.
///
/// Libraries that reject non-browser agents get a per-library `User-Agent`
/// header from their profile instead.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("mss-downloader/{version} (manuscript-archiving-tool; +{PROJECT_UA_URL})")
}
