use std::io::Cursor;

use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::{WebPEncoder, WebPQuality};
use image::imageops::FilterType;
use image::io::Reader as ImageReader;
use image::{ColorType, DynamicImage, GenericImageView, ImageEncoder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageProxyError {
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Proxy error: {0}")]
    ProxyError(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Image decode error: {0}")]
    DecodeError(String),

    #[error("Image encode error: {0}")]
    EncodeError(String),

    #[error("Image task failed: {0}")]
    TaskError(#[from] tokio::task::JoinError),
}

/// Preferred modern output format. JPEG is always the fallback.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    WebP,
    Avif,
    Jpeg,
}

impl OutputFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::WebP => "image/webp",
            OutputFormat::Avif => "image/avif",
            OutputFormat::Jpeg => "image/jpeg",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EncodeSettings {
    pub format: OutputFormat,
    pub quality: u8,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            format: OutputFormat::WebP,
            quality: 85,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessedImage {
    pub data: Vec<u8>,
    pub content_type: String,
    pub width: u32,
    pub height: u32,
}

/// Fit `width` x `height` inside a `limit` square, keeping the aspect ratio.
///
/// Images already within the limit keep their size. Each axis is at least 1px,
/// so a zero limit yields 1x1.
pub fn target_dimensions(width: u32, height: u32, limit: u32) -> (u32, u32) {
    if width <= limit && height <= limit {
        return (width, height);
    }

    let limit = limit.max(1);
    let scale = limit as f64 / width.max(height) as f64;
    let scaled = |side: u32| ((side as f64 * scale).round() as u32).clamp(1, limit);
    (scaled(width), scaled(height))
}

/// Decode, shrink to `limit`, and re-encode an image.
pub fn resize_image(
    image_data: &[u8],
    limit: u32,
    settings: &EncodeSettings,
) -> Result<ProcessedImage, ImageProxyError> {
    let img = decode_image(image_data)?;

    let (current_width, current_height) = img.dimensions();
    if current_width == 0 || current_height == 0 {
        return Err(ImageProxyError::DecodeError(format!(
            "Image has zero dimension: {}x{}",
            current_width, current_height
        )));
    }

    let (target_width, target_height) = target_dimensions(current_width, current_height, limit);
    let resized = if (target_width, target_height) == (current_width, current_height) {
        img
    } else {
        img.resize_exact(target_width, target_height, FilterType::Lanczos3)
    };

    let (data, content_type) = encode_image(&resized, settings)?;

    Ok(ProcessedImage {
        data,
        content_type: content_type.to_string(),
        width: target_width,
        height: target_height,
    })
}

// Pixels are taken as stored; EXIF orientation is not applied.
fn decode_image(image_data: &[u8]) -> Result<DynamicImage, ImageProxyError> {
    if image_data.is_empty() {
        return Err(ImageProxyError::DecodeError("Empty image body".to_string()));
    }

    ImageReader::new(Cursor::new(image_data))
        .with_guessed_format()
        .map_err(|e| ImageProxyError::DecodeError(format!("Failed to read image: {}", e)))?
        .decode()
        .map_err(|e| ImageProxyError::DecodeError(format!("Failed to load image: {}", e)))
}

fn encode_image(
    img: &DynamicImage,
    settings: &EncodeSettings,
) -> Result<(Vec<u8>, &'static str), ImageProxyError> {
    let preferred = match settings.format {
        OutputFormat::WebP => encode_webp(img, settings.quality),
        OutputFormat::Avif => encode_avif(img, settings.quality),
        OutputFormat::Jpeg => encode_jpeg(img, settings.quality),
    };

    match preferred {
        Ok(output) => Ok((output, settings.format.content_type())),
        Err(e) if settings.format != OutputFormat::Jpeg => {
            log::warn!("{:?} encoding unavailable, falling back to JPEG: {}", settings.format, e);
            let output = encode_jpeg(img, settings.quality)?;
            Ok((output, OutputFormat::Jpeg.content_type()))
        }
        Err(e) => Err(e),
    }
}

fn encode_webp(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, ImageProxyError> {
    let mut output = Vec::new();
    let rgba = img.to_rgba8();
    WebPEncoder::new_with_quality(&mut output, WebPQuality::lossy(quality))
        .encode(rgba.as_raw(), rgba.width(), rgba.height(), ColorType::Rgba8)
        .map_err(|e| ImageProxyError::EncodeError(format!("WebP encoding failed: {}", e)))?;
    Ok(output)
}

fn encode_avif(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, ImageProxyError> {
    let mut output = Vec::new();
    let rgba = img.to_rgba8();
    // speed ranges 1-10, higher is faster
    AvifEncoder::new_with_speed_quality(&mut output, 8, quality)
        .write_image(rgba.as_raw(), rgba.width(), rgba.height(), ColorType::Rgba8)
        .map_err(|e| ImageProxyError::EncodeError(format!("AVIF encoding failed: {}", e)))?;
    Ok(output)
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, ImageProxyError> {
    let mut output = Vec::new();
    // JPEG has no alpha channel
    let rgb = img.to_rgb8();
    JpegEncoder::new_with_quality(&mut output, quality.min(100))
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
        .map_err(|e| ImageProxyError::EncodeError(format!("JPEG encoding failed: {}", e)))?;
    Ok(output)
}

/// Guess an image MIME type from its magic number.
pub fn detect_image_type(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some("image/png")
    } else if data.starts_with(b"GIF8") {
        Some("image/gif")
    } else if data.starts_with(b"RIFF") && data.get(8..12) == Some(b"WEBP".as_slice()) {
        Some("image/webp")
    } else if data.get(4..12) == Some(b"ftypavif".as_slice()) {
        Some("image/avif")
    } else if data.starts_with(b"BM") {
        Some("image/bmp")
    } else if data.starts_with(&[0x49, 0x49, 0x2A, 0x00]) || data.starts_with(&[0x4D, 0x4D, 0x00, 0x2A]) {
        Some("image/tiff")
    } else if data.starts_with(&[0x00, 0x00, 0x01, 0x00]) {
        Some("image/x-icon")
    } else if looks_like_svg(data) {
        Some("image/svg+xml")
    } else {
        None
    }
}

fn looks_like_svg(data: &[u8]) -> bool {
    let head = &data[..data.len().min(256)];
    let text = String::from_utf8_lossy(head);
    let text = text.trim_start();
    text.starts_with("<svg") || (text.starts_with("<?xml") && text.contains("<svg"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};

    pub(crate) fn sample_jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
        let mut output = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut output), ImageFormat::Jpeg)
            .unwrap();
        output
    }

    fn sample_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([10, 20, 30]));
        let mut output = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut output), ImageFormat::Png)
            .unwrap();
        output
    }

    fn jpeg_settings() -> EncodeSettings {
        EncodeSettings {
            format: OutputFormat::Jpeg,
            quality: 85,
        }
    }

    #[test]
    fn small_images_keep_their_size() {
        assert_eq!(target_dimensions(120, 90, 150), (120, 90));
        assert_eq!(target_dimensions(150, 150, 150), (150, 150));
    }

    #[test]
    fn longer_side_is_scaled_to_limit() {
        assert_eq!(target_dimensions(600, 900, 150), (100, 150));
        assert_eq!(target_dimensions(1000, 333, 300), (300, 100));
        assert_eq!(target_dimensions(4000, 3000, 400), (400, 300));
    }

    #[test]
    fn extreme_aspect_ratios_clamp_to_one_pixel() {
        assert_eq!(target_dimensions(10_000, 3, 80), (80, 1));
        assert_eq!(target_dimensions(2, 5_000, 150), (1, 150));
    }

    #[test]
    fn zero_limit_shrinks_to_a_single_pixel() {
        assert_eq!(target_dimensions(600, 900, 0), (1, 1));
        assert_eq!(target_dimensions(1, 1, 0), (1, 1));
    }

    #[test]
    fn aspect_ratio_is_preserved_within_rounding() {
        for (w, h, limit) in [(640, 480, 80), (1920, 1080, 150), (333, 777, 300), (5000, 4999, 400)] {
            let (tw, th) = target_dimensions(w, h, limit);
            assert!(tw.max(th) <= limit);
            let expected_h = tw as f64 * h as f64 / w as f64;
            assert!((th as f64 - expected_h).abs() <= 1.0, "{}x{} -> {}x{}", w, h, tw, th);
        }
    }

    #[test]
    fn resizes_jpeg_to_limit() {
        let processed = resize_image(&sample_jpeg(600, 900), 150, &jpeg_settings()).unwrap();

        assert_eq!((processed.width, processed.height), (100, 150));
        assert_eq!(processed.content_type, "image/jpeg");
        let decoded = image::load_from_memory(&processed.data).unwrap();
        assert_eq!(decoded.dimensions(), (100, 150));
    }

    #[test]
    fn webp_output_or_jpeg_fallback() {
        let processed = resize_image(&sample_png(500, 250), 80, &EncodeSettings::default()).unwrap();

        assert!(processed.content_type == "image/webp" || processed.content_type == "image/jpeg");
        assert_eq!(detect_image_type(&processed.data), Some(processed.content_type.as_str()));
        assert_eq!((processed.width, processed.height), (80, 40));
    }

    #[test]
    fn empty_and_truncated_bodies_fail_to_decode() {
        assert!(matches!(
            resize_image(&[], 150, &jpeg_settings()),
            Err(ImageProxyError::DecodeError(_))
        ));

        let mut truncated = sample_jpeg(64, 64);
        truncated.truncate(20);
        assert!(matches!(
            resize_image(&truncated, 150, &jpeg_settings()),
            Err(ImageProxyError::DecodeError(_))
        ));
    }

    #[test]
    fn detects_common_signatures() {
        assert_eq!(detect_image_type(&sample_jpeg(4, 4)), Some("image/jpeg"));
        assert_eq!(detect_image_type(&sample_png(4, 4)), Some("image/png"));
        assert_eq!(detect_image_type(b"GIF89a......"), Some("image/gif"));
        assert_eq!(detect_image_type(b"<?xml version=\"1.0\"?><svg></svg>"), Some("image/svg+xml"));
        assert_eq!(detect_image_type(b"<html></html>"), None);
    }
}
