//! Error types for the sheet-ocr library.
//!
//! Four error types reflect four distinct failure modes:
//!
//! * [`SheetOcrError`] — **Fatal**: extraction cannot start at all (unreadable
//!   input, no provider configured, a forced provider that does not exist).
//!   Returned as `Err(SheetOcrError)` from the top-level `extract*` functions
//!   and from [`crate::orchestrator::Orchestrator`] construction.
//!
//! * [`ProviderError`] — **Non-fatal**: one provider attempt failed (timeout,
//!   auth error, unparseable reply, wrong answer count). Stored inside
//!   [`crate::output::ProviderResult`] so the orchestrator can move on to the
//!   next provider instead of losing the whole sheet to one bad backend.
//!
//! * [`ParseError`] — the reply text could not be turned into JSON even after
//!   every repair strategy.
//!
//! * [`ValidationError`] — the reply parsed, but the answers do not form a
//!   dense 1..=100 set.
//!
//! Errors below the orchestrator are data, not control flow: callers get a
//! result object describing what every provider did.

use crate::config::ProviderId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the sheet-ocr library.
///
/// Per-provider failures use [`ProviderError`] and are stored in
/// [`crate::output::ProviderResult`] rather than propagated here.
#[derive(Debug, Error)]
pub enum SheetOcrError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Image file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The bytes are neither JPEG, PNG nor WEBP.
    #[error("Unsupported image format: first bytes {magic:?}\nExpected a JPEG or PNG photograph of the answer sheet.")]
    UnsupportedImage { magic: Vec<u8> },

    /// The bytes carry a known signature but could not be decoded.
    #[error("Failed to decode {media_type} image: {detail}")]
    ImageDecode { media_type: String, detail: String },

    // ── Provider configuration errors ─────────────────────────────────────
    /// No provider is available, so no request could ever be satisfied.
    #[error("No vision provider is available.\n{hint}")]
    NoProviderConfigured { hint: String },

    /// A provider name did not match any known backend.
    #[error("Unknown vision provider '{name}'\nValid providers: google, claude, openai")]
    UnknownProvider { name: String },

    /// A forced provider is registered but cannot be used.
    #[error("Vision provider '{provider}' is not available.\n{hint}")]
    ProviderNotAvailable { provider: ProviderId, hint: String },

    // ── Grading errors ────────────────────────────────────────────────────
    /// An answer key could not be built from the given data.
    #[error("Invalid answer key: {0}")]
    InvalidAnswerKey(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single provider attempt.
///
/// Stored in [`crate::output::ProviderResult`] and in the attempt log of
/// [`crate::output::ExtractionOutcome`].
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum ProviderError {
    /// Network, auth, quota or backend error. Not retried.
    #[error("{provider} unavailable: {detail}")]
    Unavailable { provider: ProviderId, detail: String },

    /// The call did not finish within the configured timeout.
    #[error("{provider} timed out after {secs}s ({attempts} attempt(s))")]
    Timeout {
        provider: ProviderId,
        secs: u64,
        attempts: u32,
    },

    /// The reply could not be parsed as JSON.
    #[error("{provider} reply could not be parsed: {source}")]
    Parse {
        provider: ProviderId,
        source: ParseError,
    },

    /// The reply parsed but did not contain a valid answer set.
    #[error("{provider} returned an invalid answer set: {source}")]
    Validation {
        provider: ProviderId,
        source: ValidationError,
    },

    /// The provider call panicked.
    #[error("{provider} failed unexpectedly: {detail}")]
    Panicked { provider: ProviderId, detail: String },
}

impl ProviderError {
    /// The provider this error belongs to.
    pub fn provider(&self) -> ProviderId {
        match self {
            ProviderError::Unavailable { provider, .. }
            | ProviderError::Timeout { provider, .. }
            | ProviderError::Parse { provider, .. }
            | ProviderError::Validation { provider, .. }
            | ProviderError::Panicked { provider, .. } => *provider,
        }
    }

    /// `true` when the failure points at the photo rather than the backend.
    pub fn is_validation(&self) -> bool {
        matches!(self, ProviderError::Validation { .. })
    }
}

/// Raised by [`crate::pipeline::parse::parse`] after every repair strategy
/// has been exhausted.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message} at line {line}, column {column}; raw reply: {raw_excerpt:?}")]
pub struct ParseError {
    /// Last underlying parser message.
    pub message: String,
    /// 1-based line of the last parse failure (0 when no JSON was found).
    pub line: usize,
    /// 1-based column of the last parse failure.
    pub column: usize,
    /// The original reply, truncated.
    pub raw_excerpt: String,
}

/// The answer list could not be turned into a dense 1..=100 set.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("expected {expected}, got {got}")]
    WrongCount { expected: usize, got: usize },

    #[error("question {question} appears more than once")]
    DuplicateQuestion { question: u32 },

    #[error("question {question} is outside 1..={max}")]
    QuestionOutOfRange { question: u32, max: u32 },

    #[error("reply has no answer list")]
    NoAnswers,
}
