use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use url::Url;

use crate::images::tools::{detect_image_type, ImageProxyError};

// Headers that describe the transfer rather than the resource.
const SKIPPED_HEADERS: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "content-length",
    "content-encoding",
    "content-type",
];

/// An upstream response, kept intact so it can be forwarded verbatim.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Declared content type, sniffed from the body when missing or generic.
    pub fn effective_content_type(&self) -> Option<String> {
        match self.content_type.as_deref() {
            Some(declared) if !declared.is_empty() && declared != "application/octet-stream" => {
                Some(declared.to_string())
            }
            _ => detect_image_type(&self.body).map(str::to_string),
        }
    }

    pub fn is_image(&self) -> bool {
        self.effective_content_type()
            .map_or(false, |content_type| content_type.to_ascii_lowercase().starts_with("image/"))
    }

    pub fn is_svg(&self) -> bool {
        self.effective_content_type()
            .map_or(false, |content_type| content_type.to_ascii_lowercase().starts_with("image/svg"))
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<UpstreamResponse, ImageProxyError>;
}

/// Fetches images from their origin over HTTP.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: u64, user_agent: &str, proxy_url: Option<&str>) -> Result<Self, ImageProxyError> {
        let client_builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .user_agent(user_agent);

        // Add proxy if provided
        let client_builder = if let Some(proxy) = proxy_url {
            match reqwest::Proxy::all(proxy) {
                Ok(proxy) => client_builder.proxy(proxy),
                Err(e) => return Err(ImageProxyError::ProxyError(format!("Failed to create proxy: {}", e))),
            }
        } else {
            client_builder
        };

        let client = match client_builder.build() {
            Ok(client) => client,
            Err(e) => return Err(ImageProxyError::ProxyError(format!("Failed to build client: {}", e))),
        };

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<UpstreamResponse, ImageProxyError> {
        let response = self
            .client
            .get(url.clone())
            .header("Accept", "image/avif,image/webp,image/*,*/*;q=0.8")
            .send()
            .await
            .map_err(|e| {
                log::error!("Upstream request to {} failed: {}", url, e);
                ImageProxyError::NetworkError(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            log::warn!("Upstream {} answered with status: {}", url, status);
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);
        let headers = forwarded_headers(response.headers());
        let body = response.bytes().await?.to_vec();

        Ok(UpstreamResponse {
            status: status.as_u16(),
            content_type,
            headers,
            body,
        })
    }
}

fn forwarded_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !SKIPPED_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Serves canned responses and records every URL it was asked for.
    #[derive(Default)]
    pub(crate) struct StubFetcher {
        responses: Mutex<HashMap<String, UpstreamResponse>>,
        pub(crate) requests: Mutex<Vec<String>>,
    }

    impl StubFetcher {
        pub(crate) fn respond(&self, url: &str, status: u16, content_type: &str, body: Vec<u8>) {
            self.responses.lock().insert(
                url.to_string(),
                UpstreamResponse {
                    status,
                    content_type: Some(content_type.to_string()),
                    headers: vec![("x-origin".to_string(), "stub".to_string())],
                    body,
                },
            );
        }

        pub(crate) fn request_count(&self) -> usize {
            self.requests.lock().len()
        }
    }

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(&self, url: &Url) -> Result<UpstreamResponse, ImageProxyError> {
            self.requests.lock().push(url.to_string());
            self.responses
                .lock()
                .get(url.as_str())
                .cloned()
                .ok_or_else(|| ImageProxyError::ProxyError(format!("no stub for {}", url)))
        }
    }

    fn response(content_type: Option<&str>, body: &[u8]) -> UpstreamResponse {
        UpstreamResponse {
            status: 200,
            content_type: content_type.map(str::to_string),
            headers: Vec::new(),
            body: body.to_vec(),
        }
    }

    #[test]
    fn generic_content_type_is_sniffed() {
        let upstream = response(Some("application/octet-stream"), b"GIF89a\x01\x00\x01\x00");
        assert_eq!(upstream.effective_content_type().as_deref(), Some("image/gif"));
        assert!(upstream.is_image());
    }

    #[test]
    fn html_is_not_an_image() {
        let upstream = response(Some("text/html; charset=utf-8"), b"<html></html>");
        assert!(!upstream.is_image());
        assert!(!upstream.is_svg());
    }

    #[test]
    fn svg_is_detected_from_header() {
        let upstream = response(Some("image/svg+xml"), b"<svg/>");
        assert!(upstream.is_image());
        assert!(upstream.is_svg());
    }

    #[test]
    fn transfer_headers_are_not_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", "10".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("etag", "\"abc\"".parse().unwrap());
        headers.insert("cache-control", "max-age=60".parse().unwrap());

        let mut forwarded = forwarded_headers(&headers);
        forwarded.sort();
        assert_eq!(
            forwarded,
            vec![
                ("cache-control".to_string(), "max-age=60".to_string()),
                ("etag".to_string(), "\"abc\"".to_string()),
            ]
        );
    }
}
