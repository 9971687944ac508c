//! Image encoding: `PreprocessedImage` → base64 payload for vision APIs.
//!
//! OpenAI, Anthropic and Gemini all accept images as base64 strings embedded
//! in the JSON request body, tagged with a media type. The preprocessor
//! already produced PNG bytes (lossless, so thin pencil marks survive), so
//! encoding is only a base64 wrap plus the correct tag.

use crate::pipeline::preprocess::PreprocessedImage;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use tracing::debug;

/// Base64 encoding of the image bytes.
pub fn to_base64(image: &PreprocessedImage) -> String {
    let b64 = STANDARD.encode(image.bytes());
    debug!(
        "Encoded {} image → {} bytes base64",
        image.media_type(),
        b64.len()
    );
    b64
}

/// Wrap the image for an edgequake-llm chat message.
///
/// ## Why `detail: "high"`?
/// OpenAI's tiling splits images into 512 px tiles. A 100-question grid
/// has bubbles a few pixels wide; `detail: "low"` squeezes the whole sheet
/// into one tile and the marks disappear. Other backends ignore the hint.
pub fn to_image_data(image: &PreprocessedImage, detail: Option<&str>) -> ImageData {
    let data = ImageData::new(to_base64(image), image.media_type().as_mime());
    match detail {
        Some(d) => data.with_detail(d),
        None => data,
    }
}
