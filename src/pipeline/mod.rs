//! Pipeline stages for answer-sheet extraction.
//!
//! Each submodule implements exactly one transformation step, so each is
//! independently testable and none knows which backend will read the image.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ preprocess ──▶ encode ──▶ (provider) ──▶ parse ──▶ validate
//! (bytes)   (enhance)     (base64)     (network)    (repair)   (100 cells)
//! ```
//!
//! 1. [`input`]      — sniff the media type and load the photograph
//! 2. [`preprocess`] — upscale, flatten lighting, deskew, enhance, binarise;
//!    runs in `spawn_blocking` because it is CPU-bound
//! 3. [`encode`]     — base64-wrap the PNG for the API request body
//! 4. [`parse`]      — recover JSON from the provider's reply text
//! 5. [`validate`]   — turn decoded answers into a canonical answer set

pub mod encode;
pub mod input;
pub mod parse;
pub mod preprocess;
pub mod validate;
