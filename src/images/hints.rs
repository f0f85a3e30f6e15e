use serde::{Deserialize, Serialize};
use url::Url;

/// Query parameter carrying an explicit pixel limit.
pub const MAX_SIZE_PARAM: &str = "maxSize";
/// Query parameter naming the display context of the image.
pub const CONTEXT_PARAM: &str = "context";

const RASTER_EXTENSIONS: [&str; 5] = [".jpg", ".jpeg", ".png", ".gif", ".webp"];

/// Maximum pixel dimension per display context.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SizeProfiles {
    pub map: u32,
    pub timeline: u32,
    pub modal: u32,
    pub default: u32,
}

impl Default for SizeProfiles {
    fn default() -> Self {
        Self {
            map: 80,
            timeline: 150,
            modal: 400,
            default: 300,
        }
    }
}

impl SizeProfiles {
    /// Look up a context name; unknown contexts get the default limit.
    pub fn limit_for(&self, context: &str) -> u32 {
        match context {
            "map" => self.map,
            "timeline" => self.timeline,
            "modal" => self.modal,
            _ => self.default,
        }
    }

    pub(crate) fn first_zero(&self) -> Option<&'static str> {
        [
            ("map", self.map),
            ("timeline", self.timeline),
            ("modal", self.modal),
            ("default", self.default),
        ]
        .into_iter()
        .find(|(_, limit)| *limit == 0)
        .map(|(name, _)| name)
    }
}

fn is_hint_param(name: &str) -> bool {
    name == MAX_SIZE_PARAM || name == CONTEXT_PARAM
}

fn query_value(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// Resolve the target maximum dimension for a request URL.
///
/// An explicit positive `maxSize` wins, then the `context` profile, then the
/// default profile. Malformed hints are ignored rather than rejected.
pub fn resolve_max_size(url: &Url, profiles: &SizeProfiles) -> u32 {
    if let Some(explicit) = query_value(url, MAX_SIZE_PARAM)
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .filter(|size| *size > 0)
    {
        return explicit;
    }

    match query_value(url, CONTEXT_PARAM) {
        Some(context) => profiles.limit_for(&context),
        None => profiles.default,
    }
}

// Raw query segments other than our hints, byte-for-byte as received.
fn kept_query_segments(url: &Url) -> Vec<&str> {
    url.query()
        .unwrap_or_default()
        .split('&')
        .filter(|segment| !segment.is_empty())
        .filter(|segment| {
            !url::form_urlencoded::parse(segment.as_bytes())
                .next()
                .map_or(false, |(name, _)| is_hint_param(&name))
        })
        .collect()
}

fn with_query(url: &Url, segments: &[&str]) -> Url {
    let mut clean = url.clone();
    clean.set_fragment(None);
    if segments.is_empty() {
        clean.set_query(None);
    } else {
        clean.set_query(Some(&segments.join("&")));
    }
    clean
}

/// Canonical cache key: the resource URL with exactly one `maxSize` parameter.
pub fn cache_key(url: &Url, max_size: u32) -> String {
    let size = format!("{}={}", MAX_SIZE_PARAM, max_size);
    let mut segments = kept_query_segments(url);
    segments.push(&size);
    with_query(url, &segments).to_string()
}

/// The URL the origin server should see, stripped of our own hints.
pub fn upstream_url(url: &Url) -> Url {
    with_query(url, &kept_query_segments(url))
}

/// Whether a request is a candidate for resizing at all.
///
/// `data:`/`blob:` URLs and SVG paths are never touched, not even for key
/// rewriting.
pub fn should_intercept(url: &Url, accept: Option<&str>) -> bool {
    if matches!(url.scheme(), "data" | "blob") {
        return false;
    }

    let path = url.path().to_ascii_lowercase();
    if path.ends_with(".svg") {
        return false;
    }

    RASTER_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
        || accept.map_or(false, |accept| accept.contains("image"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn explicit_max_size_wins_over_context() {
        let profiles = SizeProfiles::default();
        let u = url("https://host/a.jpg?context=map&maxSize=512");
        assert_eq!(resolve_max_size(&u, &profiles), 512);
    }

    #[test]
    fn context_lookup_and_fallbacks() {
        let profiles = SizeProfiles::default();
        assert_eq!(resolve_max_size(&url("https://host/a.jpg?context=map"), &profiles), 80);
        assert_eq!(resolve_max_size(&url("https://host/a.jpg?context=timeline"), &profiles), 150);
        assert_eq!(resolve_max_size(&url("https://host/a.jpg?context=modal"), &profiles), 400);
        assert_eq!(resolve_max_size(&url("https://host/a.jpg?context=gallery"), &profiles), 300);
        assert_eq!(resolve_max_size(&url("https://host/a.jpg"), &profiles), 300);
    }

    #[test]
    fn malformed_max_size_is_ignored() {
        let profiles = SizeProfiles::default();
        assert_eq!(resolve_max_size(&url("https://host/a.jpg?maxSize=abc&context=map"), &profiles), 80);
        assert_eq!(resolve_max_size(&url("https://host/a.jpg?maxSize=0"), &profiles), 300);
        assert_eq!(resolve_max_size(&url("https://host/a.jpg?maxSize=-20"), &profiles), 300);
    }

    #[test]
    fn equivalent_hints_share_a_key() {
        let profiles = SizeProfiles::default();
        let by_context = url("https://host/img/saint.jpg?context=map");
        let by_size = url("https://host/img/saint.jpg?maxSize=80");

        let a = cache_key(&by_context, resolve_max_size(&by_context, &profiles));
        let b = cache_key(&by_size, resolve_max_size(&by_size, &profiles));
        assert_eq!(a, b);
        assert_eq!(a, "https://host/img/saint.jpg?maxSize=80");
    }

    #[test]
    fn key_keeps_resource_params_and_drops_fragment() {
        let u = url("https://host/thumb.php?f=Peter.jpg&context=modal&w=800#top");
        assert_eq!(cache_key(&u, 400), "https://host/thumb.php?f=Peter.jpg&w=800&maxSize=400");
    }

    #[test]
    fn distinct_sizes_get_distinct_keys() {
        let u = url("https://host/a.png");
        assert_ne!(cache_key(&u, 80), cache_key(&u, 150));
    }

    #[test]
    fn upstream_url_strips_hints() {
        assert_eq!(
            upstream_url(&url("https://host/a.jpg?context=map&maxSize=80")).as_str(),
            "https://host/a.jpg"
        );
        assert_eq!(
            upstream_url(&url("https://host/a.jpg?v=2&context=map")).as_str(),
            "https://host/a.jpg?v=2"
        );
    }

    #[test]
    fn resource_params_are_forwarded_byte_for_byte() {
        let u = url("https://host/render.php?crop=10,20&f=a:b&v=1%202&context=map");
        assert_eq!(upstream_url(&u).as_str(), "https://host/render.php?crop=10,20&f=a:b&v=1%202");
        assert_eq!(cache_key(&u, 80), "https://host/render.php?crop=10,20&f=a:b&v=1%202&maxSize=80");

        let untouched = url("https://host/a.jpg?q=x+y&tag=%E2%9C%93");
        assert_eq!(upstream_url(&untouched).as_str(), "https://host/a.jpg?q=x+y&tag=%E2%9C%93");
    }

    #[test]
    fn encoded_hint_names_are_still_stripped() {
        let u = url("https://host/a.jpg?%63ontext=map&id=7");
        assert_eq!(upstream_url(&u).as_str(), "https://host/a.jpg?id=7");
    }

    #[test]
    fn interception_rules() {
        assert!(should_intercept(&url("https://host/a.JPG"), None));
        assert!(should_intercept(&url("https://host/a.webp?context=map"), None));
        assert!(should_intercept(&url("https://host/render"), Some("image/avif,image/webp,*/*")));
        assert!(!should_intercept(&url("https://host/page.html"), Some("text/html")));
        assert!(!should_intercept(&url("https://host/logo.svg"), Some("image/svg+xml")));
        assert!(!should_intercept(&url("data:image/png;base64,AAAA"), Some("image/png")));
        assert!(!should_intercept(&url("blob:https://host/1234"), Some("image/png")));
    }
}
