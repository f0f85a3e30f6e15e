use rocket::http::{ContentType, Header, Status};
use rocket::request::{self, FromRequest, Request};
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;
use rocket::State;
use serde::Serialize;
use std::io::Cursor;
use url::Url;

use crate::api::ApiError;
use crate::cache::CachedImage;
use crate::images::{ImageCacheProxy, ProxyRequest, ProxyResponse, UpstreamResponse};

/// The client's `Accept` header, if any.
pub struct AcceptHeader(pub Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AcceptHeader {
    type Error = std::convert::Infallible;

    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        request::Outcome::Success(AcceptHeader(req.headers().get_one("Accept").map(str::to_string)))
    }
}

fn parse_content_type(content_type: &str) -> ContentType {
    ContentType::parse_flexible(content_type).unwrap_or(ContentType::Binary)
}

// Responder for resized or cached image data
pub struct ImageResponse {
    pub image: CachedImage,
    pub from_cache: bool,
}

impl<'r> Responder<'r, 'static> for ImageResponse {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let etag = format!("\"{:x}\"", md5::compute(&self.image.data));
        let cache_status = if self.from_cache { "HIT" } else { "MISS" };

        // Check If-None-Match header
        if let Some(if_none_match) = req.headers().get_one("If-None-Match") {
            if if_none_match == etag {
                return Response::build()
                    .status(Status::NotModified)
                    .header(Header::new("ETag", etag))
                    .header(Header::new("Cache-Control", self.image.cache_control))
                    .ok();
            }
        }

        Response::build()
            .header(parse_content_type(&self.image.content_type))
            .header(Header::new("Cache-Control", self.image.cache_control))
            .header(Header::new("ETag", etag))
            .header(Header::new("X-Image-Cache", cache_status))
            .sized_body(None, Cursor::new(self.image.data))
            .ok()
    }
}

// Responder forwarding an upstream response untouched
pub struct UpstreamPassthrough(pub UpstreamResponse);

impl<'r> Responder<'r, 'static> for UpstreamPassthrough {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        let upstream = self.0;
        let mut response = Response::build();
        response.status(Status::new(upstream.status));

        if let Some(content_type) = upstream.content_type.as_deref() {
            response.header(parse_content_type(content_type));
        }
        for (name, value) in upstream.headers {
            response.raw_header_adjoin(name, value);
        }

        response.sized_body(None, Cursor::new(upstream.body));
        response.ok()
    }
}

impl<'r> Responder<'r, 'static> for ProxyResponse {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        match self {
            ProxyResponse::Resized(image) => ImageResponse { image, from_cache: false }.respond_to(req),
            ProxyResponse::Cached(image) => ImageResponse { image, from_cache: true }.respond_to(req),
            ProxyResponse::Upstream(upstream) => UpstreamPassthrough(upstream).respond_to(req),
        }
    }
}

fn parse_image_url(raw: &str) -> Result<Url, ApiError> {
    let url = Url::parse(raw).map_err(|e| ApiError::InvalidUrl(format!("'{}': {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(ApiError::InvalidUrl(format!("unsupported scheme '{}'", scheme))),
    }
}

#[get("/image?<url>")]
pub async fn proxy_image(
    url: &str,
    accept: AcceptHeader,
    image_proxy: &State<ImageCacheProxy>,
) -> Result<ProxyResponse, ApiError> {
    let url = parse_image_url(url)?;
    log::debug!("Proxying image {}", url);

    let request = ProxyRequest::new(url, accept.0);
    match image_proxy.handle(&request).await {
        Ok(response) => Ok(response),
        Err(err) => {
            log::error!("Failed to fetch {}: {}", request.url, err);
            Err(err.into())
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub cache_version: String,
    pub entries: usize,
    pub bytes: u64,
}

#[get("/health")]
pub async fn health(image_proxy: &State<ImageCacheProxy>) -> Result<Json<HealthResponse>, ApiError> {
    let cache = image_proxy.cache();
    let (entries, bytes) = cache.stats().await?;

    Ok(Json(HealthResponse {
        status: "ok",
        cache_version: cache.version().to_string(),
        entries,
        bytes,
    }))
}
