//! On-disk layout and validation of downloaded page images.

use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;

/// Bytes read from the head of a file to sniff its image format.
pub const SNIFF_LEN: usize = 64;

/// Path of the image file for page `index` (0-based) inside a part directory.
#[must_use]
pub fn page_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("page_{:05}.img", index + 1))
}

/// Temporary sibling a page is streamed into before the final rename.
#[must_use]
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Returns true when `path` holds a complete page image.
///
/// A page is valid when it is at least `min_bytes` long and starts with a
/// known image signature. Anything else (missing, truncated, an HTML error
/// page saved by an older run) must be fetched again.
pub async fn is_valid_page(path: &Path, min_bytes: u64) -> bool {
    let Ok(metadata) = tokio::fs::metadata(path).await else {
        return false;
    };
    if !metadata.is_file() || metadata.len() < min_bytes {
        return false;
    }

    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return false;
    };
    let mut head = vec![0u8; SNIFF_LEN];
    let Ok(read) = file.read(&mut head).await else {
        return false;
    };
    head.truncate(read);
    has_image_signature(&head)
}

/// Returns true when `head` starts with a signature the PDF assembler can decode.
#[must_use]
pub fn has_image_signature(head: &[u8]) -> bool {
    image::guess_format(head).is_ok()
}
