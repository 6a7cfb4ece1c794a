//! IIIF Presentation manifest loader (API 2.x and 3.0).
//!
//! Page URLs are built from each canvas' first image. When the image carries
//! an Image API service, the full-resolution rendition is requested through it;
//! otherwise the resource URL is used as-is.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::{LoaderError, Manifest, ManifestLoader, PageDescriptor};
use crate::download::{
    BackoffPolicy, DownloadError, RetryDecision, classify_error, parse_retry_after,
};

const MANIFEST_ATTEMPTS: u32 = 3;
const UNTITLED: &str = "Untitled manuscript";

/// Loads IIIF Presentation manifests over HTTP.
#[derive(Debug, Clone)]
pub struct IiifManifestLoader {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl IiifManifestLoader {
    /// Creates a loader that retries transient failures up to three times.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            backoff: BackoffPolicy::default().with_max_attempts(MANIFEST_ATTEMPTS),
        }
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    async fn fetch_body(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/ld+json, application/json;q=0.9, */*;q=0.1")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DownloadError::timeout(url)
                } else {
                    DownloadError::network(url, e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            return Err(DownloadError::http_status_with_retry_after(
                url,
                status.as_u16(),
                retry_after,
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| DownloadError::network(url, e))?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl ManifestLoader for IiifManifestLoader {
    fn name(&self) -> &str {
        "iiif"
    }

    #[instrument(skip(self))]
    async fn load_manifest(&self, url: &str) -> Result<Manifest, LoaderError> {
        let mut attempt = 1;
        let body = loop {
            match self.fetch_body(url).await {
                Ok(body) => break body,
                Err(error) => {
                    let hint = error.retry_after().and_then(parse_retry_after);
                    match self.backoff.next_delay(classify_error(&error), attempt, hint) {
                        RetryDecision::Retry {
                            delay,
                            attempt: next,
                        } => {
                            warn!(%error, delay_ms = delay.as_millis(), "manifest fetch failed, retrying");
                            tokio::time::sleep(delay).await;
                            attempt = next;
                        }
                        RetryDecision::GiveUp { .. } => {
                            return Err(LoaderError::fetch(url, error.to_string()));
                        }
                    }
                }
            }
        };

        let document: Value = serde_json::from_slice(&body)
            .map_err(|e| LoaderError::parse(url, format!("invalid JSON: {e}")))?;
        let manifest = parse_manifest(url, &document)?;
        debug!(pages = manifest.page_count(), "parsed IIIF manifest");
        Ok(manifest)
    }
}

/// Parses a IIIF Presentation 2.x or 3.0 manifest document.
///
/// # Errors
///
/// [`LoaderError::Unsupported`] when the document is not a manifest (a
/// collection, for instance), [`LoaderError::Parse`] when a canvas has no
/// usable image.
pub fn parse_manifest(url: &str, document: &Value) -> Result<Manifest, LoaderError> {
    let kind = document
        .get("@type")
        .or_else(|| document.get("type"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    let pages = match kind {
        "sc:Manifest" => v2_pages(url, document)?,
        "Manifest" => v3_pages(url, document)?,
        "sc:Collection" | "Collection" => {
            return Err(LoaderError::unsupported(
                url,
                "IIIF collection, pick one manuscript from it",
            ));
        }
        _ => return Err(LoaderError::unsupported(url, "not a IIIF manifest")),
    };

    let display_name = document
        .get("label")
        .and_then(label_text)
        .unwrap_or_else(|| UNTITLED.to_string());

    Ok(Manifest::new(display_name, pages))
}

fn v2_pages(url: &str, document: &Value) -> Result<Vec<PageDescriptor>, LoaderError> {
    let canvases = document
        .pointer("/sequences/0/canvases")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    canvases
        .iter()
        .enumerate()
        .map(|(index, canvas)| {
            let resource = canvas
                .pointer("/images/0/resource")
                .ok_or_else(|| LoaderError::parse(url, format!("canvas {} has no image", index + 1)))?;
            image_url(resource)
                .map(PageDescriptor::new)
                .ok_or_else(|| LoaderError::parse(url, format!("canvas {} image has no URL", index + 1)))
        })
        .collect()
}

fn v3_pages(url: &str, document: &Value) -> Result<Vec<PageDescriptor>, LoaderError> {
    let canvases = document
        .get("items")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    canvases
        .iter()
        .enumerate()
        .map(|(index, canvas)| {
            let body = canvas
                .pointer("/items/0/items/0/body")
                .ok_or_else(|| LoaderError::parse(url, format!("canvas {} has no image", index + 1)))?;
            // Choice bodies list alternatives; the first one is the default.
            let body = body.pointer("/items/0").filter(|_| is_choice(body)).unwrap_or(body);
            image_url(body)
                .map(PageDescriptor::new)
                .ok_or_else(|| LoaderError::parse(url, format!("canvas {} image has no URL", index + 1)))
        })
        .collect()
}

fn is_choice(body: &Value) -> bool {
    matches!(
        body.get("type").and_then(Value::as_str),
        Some("Choice" | "oa:Choice")
    )
}

/// Full-size image URL for a v2 resource or v3 body.
fn image_url(resource: &Value) -> Option<String> {
    let service = match resource.get("service") {
        Some(Value::Array(services)) => services.first(),
        other => other,
    };

    if let Some(service) = service
        && let Some(base) = id_of(service)
    {
        let size = if is_image_api_3(service) { "max" } else { "full" };
        return Some(format!("{}/full/{size}/0/default.jpg", base.trim_end_matches('/')));
    }

    id_of(resource).map(str::to_string)
}

fn id_of(value: &Value) -> Option<&str> {
    value
        .get("@id")
        .or_else(|| value.get("id"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

fn is_image_api_3(service: &Value) -> bool {
    let type_is_v3 = service
        .get("type")
        .or_else(|| service.get("@type"))
        .and_then(Value::as_str)
        .is_some_and(|t| t == "ImageService3");
    let context_is_v3 = service
        .get("@context")
        .and_then(Value::as_str)
        .is_some_and(|c| c.contains("image/3"));
    type_is_v3 || context_is_v3
}

/// Text of a label: plain string, v2 `@value` object or list, or v3 language map.
fn label_text(label: &Value) -> Option<String> {
    let text = match label {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(label_text),
        Value::Object(map) => {
            if let Some(value) = map.get("@value") {
                label_text(value)
            } else {
                ["en", "none"]
                    .iter()
                    .find_map(|lang| map.get(*lang))
                    .or_else(|| map.values().next())
                    .and_then(label_text)
            }
        }
        _ => None,
    };
    text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn v2_manifest() -> Value {
        json!({
            "@context": "http://iiif.io/api/presentation/2/context.json",
            "@type": "sc:Manifest",
            "label": [{"@value": "Cosin Gospels", "@language": "en"}],
            "sequences": [{
                "canvases": [
                    {"images": [{"resource": {
                        "@id": "https://img.example.org/a/full/full/0/default.jpg",
                        "service": {
                            "@context": "http://iiif.io/api/image/2/context.json",
                            "@id": "https://img.example.org/a"
                        }
                    }}]},
                    {"images": [{"resource": {"@id": "https://img.example.org/b.jpg"}}]}
                ]
            }]
        })
    }

    fn v3_manifest() -> Value {
        json!({
            "@context": "http://iiif.io/api/presentation/3/context.json",
            "type": "Manifest",
            "label": {"en": ["Psalter"]},
            "items": [
                {"items": [{"items": [{"body": {
                    "id": "https://img.example.org/p1/full/max/0/default.jpg",
                    "service": [{"id": "https://img.example.org/p1/", "type": "ImageService3"}]
                }}]}]},
                {"items": [{"items": [{"body": {
                    "type": "Choice",
                    "items": [{"id": "https://img.example.org/p2-color.jpg"}, {"id": "https://img.example.org/p2-ir.jpg"}]
                }}]}]}
            ]
        })
    }

    #[test]
    fn test_parse_v2_prefers_image_service() {
        let manifest = parse_manifest("u", &v2_manifest()).unwrap();
        assert_eq!(manifest.display_name, "Cosin Gospels");
        assert_eq!(
            manifest.pages,
            vec![
                PageDescriptor::new("https://img.example.org/a/full/full/0/default.jpg"),
                PageDescriptor::new("https://img.example.org/b.jpg"),
            ]
        );
    }

    #[test]
    fn test_parse_v3_uses_max_size_and_first_choice() {
        let manifest = parse_manifest("u", &v3_manifest()).unwrap();
        assert_eq!(manifest.display_name, "Psalter");
        assert_eq!(
            manifest.pages[0].url,
            "https://img.example.org/p1/full/max/0/default.jpg"
        );
        assert_eq!(manifest.pages[1].url, "https://img.example.org/p2-color.jpg");
    }

    #[test]
    fn test_parse_collection_is_unsupported() {
        let err = parse_manifest("u", &json!({"@type": "sc:Collection"})).unwrap_err();
        assert!(matches!(err, LoaderError::Unsupported { .. }));
    }

    #[test]
    fn test_parse_canvas_without_image_is_parse_error() {
        let doc = json!({"type": "Manifest", "items": [{"items": []}]});
        let err = parse_manifest("u", &doc).unwrap_err();
        assert!(matches!(err, LoaderError::Parse { ref reason, .. } if reason.contains("canvas 1")));
    }

    #[test]
    fn test_missing_label_falls_back() {
        let doc = json!({"type": "Manifest", "items": []});
        let manifest = parse_manifest("u", &doc).unwrap();
        assert_eq!(manifest.display_name, UNTITLED);
        assert!(manifest.pages.is_empty());
    }

    #[test]
    fn test_label_text_variants() {
        assert_eq!(label_text(&json!("  Hours  ")), Some("Hours".to_string()));
        assert_eq!(label_text(&json!({"fr": ["Heures"]})), Some("Heures".to_string()));
        assert_eq!(label_text(&json!({"none": ["MS 1"], "de": ["x"]})), Some("MS 1".to_string()));
        assert_eq!(label_text(&json!([])), None);
    }

    fn fast_loader() -> IiifManifestLoader {
        IiifManifestLoader::new(reqwest::Client::new()).with_backoff(
            BackoffPolicy::default()
                .with_max_attempts(3)
                .with_delays(Duration::from_millis(1), Duration::from_millis(5)),
        )
    }

    #[tokio::test]
    async fn test_load_manifest_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ms/manifest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(v3_manifest()))
            .mount(&server)
            .await;

        let url = format!("{}/ms/manifest.json", server.uri());
        let manifest = fast_loader().load_manifest(&url).await.unwrap();
        assert_eq!(manifest.page_count(), 2);
    }

    #[tokio::test]
    async fn test_load_manifest_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(v2_manifest()))
            .mount(&server)
            .await;

        let manifest = fast_loader()
            .load_manifest(&format!("{}/manifest", server.uri()))
            .await
            .unwrap();
        assert_eq!(manifest.page_count(), 2);
    }

    #[tokio::test]
    async fn test_load_manifest_404_is_fetch_error_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = fast_loader()
            .load_manifest(&format!("{}/manifest", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::Fetch { ref reason, .. } if reason.contains("404")));
    }

    #[tokio::test]
    async fn test_load_manifest_invalid_json_is_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
            .mount(&server)
            .await;

        let err = fast_loader()
            .load_manifest(&format!("{}/manifest", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::Parse { .. }));
    }
}
