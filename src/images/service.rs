use std::sync::Arc;

use url::Url;

use crate::cache::{CachedImage, ImageCache};
use crate::images::fetcher::{Fetcher, UpstreamResponse};
use crate::images::hints::{cache_key, resolve_max_size, should_intercept, upstream_url, SizeProfiles};
use crate::images::tools::{resize_image, EncodeSettings, ImageProxyError};

/// A fetch intercepted from the page.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub url: Url,
    pub accept: Option<String>,
}

impl ProxyRequest {
    pub fn new(url: Url, accept: Option<String>) -> Self {
        Self { url, accept }
    }
}

#[derive(Debug)]
pub enum ProxyResponse {
    /// Freshly resized and stored.
    Resized(CachedImage),
    /// Served from the cache without touching the network.
    Cached(CachedImage),
    /// The upstream response, forwarded as-is.
    Upstream(UpstreamResponse),
}

/// Resizing image proxy with a size-bounded cache.
pub struct ImageCacheProxy {
    fetcher: Arc<dyn Fetcher>,
    cache: ImageCache,
    profiles: SizeProfiles,
    encode: EncodeSettings,
}

impl ImageCacheProxy {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        cache: ImageCache,
        profiles: SizeProfiles,
        encode: EncodeSettings,
    ) -> Self {
        Self {
            fetcher,
            cache,
            profiles,
            encode,
        }
    }

    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    /// Serve one request. Only fails when even a plain passthrough fetch of
    /// the original URL fails.
    pub async fn handle(&self, request: &ProxyRequest) -> Result<ProxyResponse, ImageProxyError> {
        if !should_intercept(&request.url, request.accept.as_deref()) {
            log::debug!("Passing through {}", request.url);
            return self.passthrough(&request.url).await;
        }

        match self.intercept(&request.url).await {
            Ok(response) => Ok(response),
            Err(e) => {
                log::warn!("Image proxy failed for {}, retrying as passthrough: {}", request.url, e);
                self.passthrough(&request.url).await
            }
        }
    }

    async fn passthrough(&self, url: &Url) -> Result<ProxyResponse, ImageProxyError> {
        Ok(ProxyResponse::Upstream(self.fetcher.fetch(url).await?))
    }

    async fn intercept(&self, url: &Url) -> Result<ProxyResponse, ImageProxyError> {
        let max_size = resolve_max_size(url, &self.profiles);
        let key = cache_key(url, max_size);

        if let Some(cached) = self.cache.get_image(&key).await {
            log::info!("Processed image found in cache: {}", key);
            return Ok(ProxyResponse::Cached(cached));
        }
        log::info!("Processed image not found in cache: {}", key);

        let upstream = self.fetcher.fetch(&upstream_url(url)).await?;
        if !upstream.is_success() || !upstream.is_image() {
            log::debug!(
                "Not resizing {}: status {}, content type {:?}",
                url,
                upstream.status,
                upstream.content_type
            );
            return Ok(ProxyResponse::Upstream(upstream));
        }
        if upstream.is_svg() {
            return Ok(ProxyResponse::Upstream(upstream));
        }

        let settings = self.encode;
        let (upstream, processed) = tokio::task::spawn_blocking(move || {
            let processed = resize_image(&upstream.body, max_size, &settings);
            (upstream, processed)
        })
        .await?;

        let processed = match processed {
            Ok(processed) => processed,
            Err(e) => {
                log::warn!("Serving {} unresized: {}", url, e);
                return Ok(ProxyResponse::Upstream(upstream));
            }
        };
        log::debug!(
            "Resized {} to {}x{} ({}, {} bytes)",
            url,
            processed.width,
            processed.height,
            processed.content_type,
            processed.data.len()
        );

        let image = CachedImage::new(processed.data, processed.content_type);
        if self.cache.store_image(&key, image.clone()).await {
            let cache = self.cache.clone();
            tokio::spawn(async move {
                cache.enforce_budget().await;
            });
        }

        Ok(ProxyResponse::Resized(image))
    }
}
