use crate::cache::CacheError;
use crate::images::ImageProxyError;
use rocket::http::{ContentType, Status};
use serde_json::json;

#[derive(Debug)]
pub enum ApiError {
    InvalidUrl(String),
    ImageError(ImageProxyError),
    CacheError(CacheError),
}

impl From<ImageProxyError> for ApiError {
    fn from(error: ImageProxyError) -> Self {
        ApiError::ImageError(error)
    }
}

impl From<CacheError> for ApiError {
    fn from(error: CacheError) -> Self {
        ApiError::CacheError(error)
    }
}

impl ApiError {
    fn status(&self) -> Status {
        match self {
            ApiError::InvalidUrl(_) => Status::BadRequest,
            ApiError::ImageError(ImageProxyError::NetworkError(_)) => Status::BadGateway,
            ApiError::ImageError(ImageProxyError::ProxyError(_)) => Status::BadGateway,
            ApiError::ImageError(ImageProxyError::InvalidUrl(_)) => Status::BadRequest,
            ApiError::ImageError(_) => Status::InternalServerError,
            ApiError::CacheError(_) => Status::ServiceUnavailable,
        }
    }

    fn body(&self) -> serde_json::Value {
        match self {
            ApiError::InvalidUrl(message) => json!({
                "error": "Invalid image URL",
                "message": message
            }),
            ApiError::ImageError(ImageProxyError::NetworkError(error)) => json!({
                "error": "Upstream unreachable",
                "message": error.to_string()
            }),
            ApiError::ImageError(error) => json!({
                "error": "Image proxy error",
                "message": error.to_string()
            }),
            ApiError::CacheError(error) => json!({
                "error": "Image cache unavailable",
                "message": error.to_string()
            }),
        }
    }
}

impl<'r> rocket::response::Responder<'r, 'static> for ApiError {
    fn respond_to(self, _: &'r rocket::Request<'_>) -> rocket::response::Result<'static> {
        let body = self.body().to_string();

        rocket::Response::build()
            .status(self.status())
            .header(ContentType::JSON)
            .sized_body(None, std::io::Cursor::new(body))
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_errors_to_statuses() {
        assert_eq!(ApiError::InvalidUrl("nope".into()).status(), Status::BadRequest);
        assert_eq!(
            ApiError::from(ImageProxyError::ProxyError("down".into())).status(),
            Status::BadGateway
        );
        assert_eq!(
            ApiError::from(ImageProxyError::DecodeError("bad".into())).status(),
            Status::InternalServerError
        );
        assert_eq!(
            ApiError::from(CacheError::InvalidNamespace("..".into())).status(),
            Status::ServiceUnavailable
        );
    }

    #[test]
    fn body_carries_message() {
        let body = ApiError::InvalidUrl("relative URL without a base".into()).body();
        assert_eq!(body["error"], "Invalid image URL");
        assert_eq!(body["message"], "relative URL without a base");
    }
}
