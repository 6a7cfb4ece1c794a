//! HTTP client for page images and manifests.
//!
//! [`HttpClient`] wraps a pooled `reqwest::Client` and implements
//! [`PageSource`] by streaming each page to a `.part` file, rejecting
//! near-empty and non-image bodies, then renaming the file into place.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::RETRY_AFTER;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, PAGE_TIMEOUT_SECS};
use super::error::DownloadError;
use super::page_file::{SNIFF_LEN, has_image_signature, partial_path};
use super::source::{PageRequest, PageSource};
use crate::user_agent;

/// HTTP client shared by every fetcher pool and manifest loader.
///
/// Create once and clone; clones share the connection pool.
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use std::time::Duration;
/// use mss_core::download::{HttpClient, PageRequest, PageSource};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new()?;
/// let request = PageRequest {
///     url: "https://iiif.example.org/iiif/ms1/f1r/full/full/0/default.jpg".to_string(),
///     library: "iiif".to_string(),
///     headers: Vec::new(),
///     timeout: Duration::from_secs(60),
///     min_bytes: 1024,
/// };
/// let bytes = client.fetch_page(&request, Path::new("page_00001.img")).await?;
/// println!("{bytes} bytes");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Creates a client with default connect and read timeouts.
    ///
    /// # Errors
    ///
    /// Returns the builder error if the TLS backend cannot be initialized.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeouts(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(PAGE_TIMEOUT_SECS),
        )
    }

    /// Creates a client with explicit timeouts.
    ///
    /// `read_timeout` is the default for requests that do not set their own.
    ///
    /// # Errors
    ///
    /// Returns the builder error if the TLS backend cannot be initialized.
    pub fn with_timeouts(
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .gzip(true)
            .user_agent(user_agent::default_user_agent())
            .build()?;
        Ok(Self { client })
    }

    /// Returns the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }

    async fn send_request(&self, request: &PageRequest) -> Result<reqwest::Response, DownloadError> {
        let url = request.url.as_str();
        let mut builder = self.client.get(url).timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                DownloadError::timeout(url)
            } else {
                DownloadError::network(url, e)
            }
        })?;

        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(std::string::ToString::to_string);
            return Err(DownloadError::http_status_with_retry_after(
                url,
                response.status().as_u16(),
                retry_after,
            ));
        }

        Ok(response)
    }
}

#[async_trait]
impl PageSource for HttpClient {
    #[instrument(skip(self, request, dest), fields(url = %request.url, library = %request.library))]
    async fn fetch_page(&self, request: &PageRequest, dest: &Path) -> Result<u64, DownloadError> {
        Url::parse(&request.url).map_err(|_| DownloadError::invalid_url(&request.url))?;

        let response = self.send_request(request).await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent, e))?;
        }

        let temp_path = partial_path(dest);
        let mut file = File::create(&temp_path)
            .await
            .map_err(|e| DownloadError::io(&temp_path, e))?;

        let streamed = stream_to_file(&mut file, response, &request.url, &temp_path).await;
        drop(file);

        let (bytes, head) = match streamed {
            Ok(streamed) => streamed,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(e);
            }
        };

        if bytes < request.min_bytes {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(DownloadError::too_small(&request.url, bytes, request.min_bytes));
        }
        if !has_image_signature(&head) {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(DownloadError::not_an_image(&request.url, bytes));
        }

        tokio::fs::rename(&temp_path, dest)
            .await
            .map_err(|e| DownloadError::io(dest, e))?;

        debug!(bytes, path = %dest.display(), "page saved");
        Ok(bytes)
    }
}

/// Streams response body to file, returning bytes written and the first
/// [`SNIFF_LEN`] bytes for format detection.
async fn stream_to_file(
    file: &mut File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
) -> Result<(u64, Vec<u8>), DownloadError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;
    let mut head = Vec::with_capacity(SNIFF_LEN);

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| {
            if e.is_timeout() {
                DownloadError::timeout(url)
            } else {
                DownloadError::network(url, e)
            }
        })?;

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(file_path, e))?;

        if head.len() < SNIFF_LEN {
            let take = (SNIFF_LEN - head.len()).min(chunk.len());
            head.extend_from_slice(&chunk[..take]);
        }
        bytes_written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;

    Ok((bytes_written, head))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// JPEG signature padded to `len` bytes.
    fn jpeg_like(len: usize) -> Vec<u8> {
        let mut body = vec![0xFF, 0xD8, 0xFF, 0xE0];
        body.resize(len, 0x20);
        body
    }

    fn request(url: String) -> PageRequest {
        PageRequest {
            url,
            library: "test".to_string(),
            headers: Vec::new(),
            timeout: Duration::from_secs(5),
            min_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn test_fetch_page_writes_body_and_removes_partial() {
        let server = MockServer::start().await;
        let body = jpeg_like(4096);
        Mock::given(method("GET"))
            .and(path("/p1.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("page_00001.img");
        let client = HttpClient::new().unwrap();

        let bytes = client
            .fetch_page(&request(format!("{}/p1.jpg", server.uri())), &dest)
            .await
            .unwrap();

        assert_eq!(bytes, 4096);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_fetch_page_rejects_near_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tiny.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>busy</html>"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("page_00001.img");
        let client = HttpClient::new().unwrap();

        let err = client
            .fetch_page(&request(format!("{}/tiny.jpg", server.uri())), &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::TooSmall { .. }), "got {err:?}");
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_fetch_page_rejects_html_body_over_min_size() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/denied.jpg"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("<html>Access denied</html>".repeat(100)),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("page_00001.img");
        let client = HttpClient::new().unwrap();

        let err = client
            .fetch_page(&request(format!("{}/denied.jpg", server.uri())), &dest)
            .await
            .unwrap_err();

        assert!(
            matches!(err, DownloadError::NotAnImage { bytes: 2600, .. }),
            "got {err:?}"
        );
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_fetch_page_captures_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let client = HttpClient::new().unwrap();
        let err = client
            .fetch_page(
                &request(format!("{}/p.jpg", server.uri())),
                &dir.path().join("p.img"),
            )
            .await
            .unwrap_err();

        match err {
            DownloadError::HttpStatus {
                status,
                retry_after,
                ..
            } => {
                assert_eq!(status, 429);
                assert_eq!(retry_after.as_deref(), Some("30"));
            }
            other => panic!("expected HttpStatus, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_page_sends_library_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("Referer", "https://library.example.org/"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(jpeg_like(2048)))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let client = HttpClient::new().unwrap();
        let mut req = request(format!("{}/p.jpg", server.uri()));
        req.headers = vec![(
            "Referer".to_string(),
            "https://library.example.org/".to_string(),
        )];

        client
            .fetch_page(&req, &dir.path().join("p.img"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fetch_page_invalid_url() {
        let dir = TempDir::new().unwrap();
        let client = HttpClient::new().unwrap();
        let err = client
            .fetch_page(&request("not a url".to_string()), &dir.path().join("p.img"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::InvalidUrl { .. }));
    }
}
