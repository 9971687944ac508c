//! Input intake: wrap a captured photograph as an [`AnswerSheetImage`].
//!
//! ## Why sniff magic bytes?
//!
//! Capture endpoints forward whatever the phone uploaded, and the declared
//! content type is frequently wrong (HEIC renamed to `.jpg`, screenshots sent
//! as `image/jpeg`). Checking the signature up front gives callers a
//! meaningful error instead of a decoder failure deep inside preprocessing,
//! and gives the vision backends a media-type tag that matches the bytes.

use crate::error::SheetOcrError;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use tracing::debug;

/// Minimum width for a photo to be considered legible, in pixels.
pub const MIN_LEGIBLE_WIDTH: u32 = 800;
/// Minimum height for a photo to be considered legible, in pixels.
pub const MIN_LEGIBLE_HEIGHT: u32 = 1000;

/// Raw bytes of a photographed answer sheet plus their media type.
///
/// Immutable once captured; consumed by [`crate::pipeline::preprocess`].
#[derive(Clone, PartialEq, Eq)]
pub struct AnswerSheetImage {
    bytes: Vec<u8>,
    media_type: MediaType,
}

/// Image formats accepted from capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MediaType {
    Jpeg,
    Png,
    Webp,
}

impl MediaType {
    pub fn as_mime(self) -> &'static str {
        match self {
            MediaType::Jpeg => "image/jpeg",
            MediaType::Png => "image/png",
            MediaType::Webp => "image/webp",
        }
    }

    fn image_format(self) -> image::ImageFormat {
        match self {
            MediaType::Jpeg => image::ImageFormat::Jpeg,
            MediaType::Png => image::ImageFormat::Png,
            MediaType::Webp => image::ImageFormat::WebP,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_mime())
    }
}

/// Detect the media type from the leading signature bytes.
pub fn detect_media_type(bytes: &[u8]) -> Option<MediaType> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(MediaType::Jpeg)
    } else if bytes.starts_with(b"\x89PNG") {
        Some(MediaType::Png)
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some(MediaType::Webp)
    } else {
        None
    }
}

impl AnswerSheetImage {
    /// Wrap raw bytes, detecting the media type from their signature.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, SheetOcrError> {
        match detect_media_type(&bytes) {
            Some(media_type) => Ok(Self { bytes, media_type }),
            None => Err(SheetOcrError::UnsupportedImage {
                magic: bytes.iter().take(8).copied().collect(),
            }),
        }
    }

    /// Read an image from disk.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, SheetOcrError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => SheetOcrError::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => SheetOcrError::FileNotFound {
                path: path.to_path_buf(),
            },
        })?;
        debug!("Read {} bytes from {}", bytes.len(), path.display());
        Self::from_bytes(bytes)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    /// Decode into pixels.
    pub fn decode(&self) -> Result<image::DynamicImage, SheetOcrError> {
        image::load_from_memory_with_format(&self.bytes, self.media_type.image_format()).map_err(
            |e| SheetOcrError::ImageDecode {
                media_type: self.media_type.as_mime().to_string(),
                detail: e.to_string(),
            },
        )
    }
}

impl fmt::Debug for AnswerSheetImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnswerSheetImage")
            .field("media_type", &self.media_type)
            .field("bytes", &format_args!("<{} bytes>", self.bytes.len()))
            .finish()
    }
}

/// Quality warning for photos below the legibility minimum, if any.
pub fn legibility_warning(width: u32, height: u32) -> Option<String> {
    if width < MIN_LEGIBLE_WIDTH || height < MIN_LEGIBLE_HEIGHT {
        Some(format!(
            "low resolution {width}x{height} (recommended at least {MIN_LEGIBLE_WIDTH}x{MIN_LEGIBLE_HEIGHT})"
        ))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbImage};
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::new(4, 4));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn detects_signatures() {
        assert_eq!(detect_media_type(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(MediaType::Jpeg));
        assert_eq!(detect_media_type(b"\x89PNG\r\n\x1a\n"), Some(MediaType::Png));
        assert_eq!(detect_media_type(b"RIFF\0\0\0\0WEBPVP8 "), Some(MediaType::Webp));
        assert_eq!(detect_media_type(b"%PDF-1.7"), None);
        assert_eq!(detect_media_type(&[]), None);
    }

    #[test]
    fn rejects_unknown_bytes() {
        let err = AnswerSheetImage::from_bytes(b"GIF89a....".to_vec()).unwrap_err();
        assert!(matches!(err, SheetOcrError::UnsupportedImage { .. }));
    }

    #[test]
    fn decodes_png() {
        let sheet = AnswerSheetImage::from_bytes(png_bytes()).unwrap();
        assert_eq!(sheet.media_type(), MediaType::Png);
        let img = sheet.decode().unwrap();
        assert_eq!((img.width(), img.height()), (4, 4));
    }

    #[test]
    fn truncated_png_is_decode_error() {
        let mut bytes = png_bytes();
        bytes.truncate(20);
        let sheet = AnswerSheetImage::from_bytes(bytes).unwrap();
        assert!(matches!(sheet.decode(), Err(SheetOcrError::ImageDecode { .. })));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let err = AnswerSheetImage::from_path("/nonexistent/sheet.jpg")
            .await
            .unwrap_err();
        assert!(matches!(err, SheetOcrError::FileNotFound { .. }));
    }

    #[test]
    fn small_photo_warns() {
        assert!(legibility_warning(640, 480).is_some());
        assert!(legibility_warning(1200, 1600).is_none());
    }
}
