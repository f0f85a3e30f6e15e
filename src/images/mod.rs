pub mod fetcher;
pub mod hints;
pub mod service;
pub mod tools;

pub use fetcher::{Fetcher, HttpFetcher, UpstreamResponse};
pub use hints::SizeProfiles;
pub use service::{ImageCacheProxy, ProxyRequest, ProxyResponse};
pub use tools::{EncodeSettings, ImageProxyError, OutputFormat};
