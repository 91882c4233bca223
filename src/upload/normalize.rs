//! Client-side image normalization.
//!
//! Incoming files are decoded, shrunk to fit a bounding box and re-encoded
//! as PNG. The PNG bytes are what gets sent for processing; the data URL
//! built from them is what the library stores for display.

use base64::{engine::general_purpose, Engine as _};
use image::{imageops::FilterType, ImageFormat};
use std::io::Cursor;
use tokio::task;

use crate::error::{PreviewError, UploadError};

/// Largest width/height of a normalized image
pub const MAX_DIMENSION: u32 = 400;

/// Prefix that turns a base64 PNG payload into a displayable preview
pub const PREVIEW_HEADER: &str = "data:image/png;base64,";

/// A decoded, resized, PNG-encoded image
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub width: u32,
    pub height: u32,
    /// PNG bytes
    pub png: Vec<u8>,
}

impl NormalizedImage {
    /// Base64 of the PNG bytes, without any data URL prefix.
    pub fn payload(&self) -> String {
        general_purpose::STANDARD.encode(&self.png)
    }

    /// Displayable preview string.
    pub fn preview(&self) -> String {
        to_preview(&self.payload())
    }
}

/// Decode and normalize an image file.
///
/// Decoding is CPU-bound, so it runs on the blocking pool.
pub async fn normalize(
    name: &str,
    bytes: Vec<u8>,
    max_dimension: u32,
) -> Result<NormalizedImage, UploadError> {
    let owned_name = name.to_string();
    task::spawn_blocking(move || normalize_blocking(&bytes, max_dimension))
        .await
        .map_err(|e| UploadError::Decode {
            name: owned_name.clone(),
            message: format!("Task join error: {}", e),
        })?
        .map_err(|e| UploadError::Decode {
            name: owned_name,
            message: e.to_string(),
        })
}

/// Blocking implementation of [`normalize`]
pub fn normalize_blocking(
    bytes: &[u8],
    max_dimension: u32,
) -> Result<NormalizedImage, image::ImageError> {
    let img = image::load_from_memory(bytes)?;

    // Only ever shrink; resize() keeps the aspect ratio.
    let img = if img.width() > max_dimension || img.height() > max_dimension {
        img.resize(max_dimension, max_dimension, FilterType::Lanczos3)
    } else {
        img
    };

    let mut png = Cursor::new(Vec::new());
    img.write_to(&mut png, ImageFormat::Png)?;

    Ok(NormalizedImage {
        width: img.width(),
        height: img.height(),
        png: png.into_inner(),
    })
}

/// Prefix a base64 PNG payload with [`PREVIEW_HEADER`].
pub fn to_preview(payload: &str) -> String {
    format!("{}{}", PREVIEW_HEADER, payload)
}

/// Strip any `data:...;base64,` prefix, leaving the bare payload.
pub fn strip_preview_header(preview: &str) -> &str {
    if preview.starts_with("data:") {
        if let Some((_, payload)) = preview.split_once(',') {
            return payload;
        }
    }
    preview
}

/// Decode a preview string back to the encoded image bytes.
pub fn decode_preview(preview: &str) -> Result<Vec<u8>, PreviewError> {
    if !preview.starts_with("data:") || !preview.contains(";base64,") {
        return Err(PreviewError::NotDataUrl);
    }
    Ok(general_purpose::STANDARD.decode(strip_preview_header(preview))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbaImage};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::new(width, height));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_large_image_fits_bounding_box() {
        let normalized = normalize_blocking(&png_bytes(1600, 800), MAX_DIMENSION).unwrap();
        assert_eq!((normalized.width, normalized.height), (400, 200));

        let tall = normalize_blocking(&png_bytes(300, 900), MAX_DIMENSION).unwrap();
        assert_eq!((tall.width, tall.height), (133, 400));
    }

    #[test]
    fn test_small_image_is_not_upscaled() {
        let normalized = normalize_blocking(&png_bytes(120, 80), MAX_DIMENSION).unwrap();
        assert_eq!((normalized.width, normalized.height), (120, 80));

        let decoded = image::load_from_memory(&normalized.png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (120, 80));
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        assert!(normalize_blocking(b"definitely not an image", MAX_DIMENSION).is_err());
    }

    #[tokio::test]
    async fn test_async_decode_failure_names_the_file() {
        let err = normalize("broken.png", b"nope".to_vec(), MAX_DIMENSION)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Decode { ref name, .. } if name == "broken.png"));
    }

    #[test]
    fn test_preview_round_trip() {
        let normalized = normalize_blocking(&png_bytes(10, 10), MAX_DIMENSION).unwrap();
        let preview = normalized.preview();

        assert!(preview.starts_with(PREVIEW_HEADER));
        assert_eq!(strip_preview_header(&preview), normalized.payload());
        assert_eq!(decode_preview(&preview).unwrap(), normalized.png);
    }

    #[test]
    fn test_strip_header_handles_other_formats_and_bare_payloads() {
        assert_eq!(strip_preview_header("data:image/jpeg;base64,AAAA"), "AAAA");
        assert_eq!(strip_preview_header("AAAA"), "AAAA");
        assert!(matches!(decode_preview("AAAA"), Err(PreviewError::NotDataUrl)));
        assert!(matches!(
            decode_preview("data:image/png;base64,@@@"),
            Err(PreviewError::Base64(_))
        ));
    }
}
