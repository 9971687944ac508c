//! # sheet-ocr
//!
//! Read the 100 answers off a photographed multiple-choice answer sheet
//! using vision language models, with automatic fallback between backends.
//!
//! ## Why this crate?
//!
//! Phone photos of handwritten answer sheets are skewed, shadowed and
//! low-contrast, and no single vision backend reads them reliably or is
//! always reachable. This crate cleans the photo up, asks one backend after
//! another until one returns a well-formed answer set, repairs the JSON the
//! models produce, and refuses anything that is not exactly 100 answers
//! from A–E/BLANK.
//!
//! ## Pipeline Overview
//!
//! ```text
//! Photo (JPEG/PNG/WEBP)
//!  │
//!  ├─ 1. Input       sniff media type, load bytes
//!  ├─ 2. Preprocess  upscale, shadow removal, deskew, CLAHE, sharpen,
//!  │                 binarise (CPU-bound, spawn_blocking)
//!  ├─ 3. Orchestrate try providers in priority order, one at a time
//!  │      ├─ Google (Gemini, structured output)
//!  │      ├─ Claude
//!  │      └─ OpenAI
//!  ├─ 4. Parse       repair malformed JSON replies
//!  ├─ 5. Validate    exactly 100 answers, A–E or BLANK
//!  └─ 6. Output      answers + confidence + attempt log
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sheet_ocr::{extract_file, ExtractionConfig, Orchestrator, SheetKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Providers auto-detected from GEMINI_API_KEY / ANTHROPIC_API_KEY / OPENAI_API_KEY
//!     let orchestrator = Orchestrator::from_env(ExtractionConfig::default())?;
//!     let outcome = extract_file(&orchestrator, "sheet.jpg", SheetKind::CandidateSheet, None).await?;
//!     match outcome.answers {
//!         Some(answers) => println!("{}", answers.to_letters()),
//!         None => eprintln!("{}", outcome.error_message.unwrap_or_default()),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `sheet-ocr` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! sheet-ocr = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod extract;
pub mod grading;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod providers;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    BinarizationMode, ExtractionConfig, ExtractionConfigBuilder, PreprocessOptions, ProviderId,
    SheetKind,
};
pub use error::{ParseError, ProviderError, SheetOcrError, ValidationError};
pub use extract::{
    extract_bytes, extract_file, extract_preprocessed, extract_sheet, extract_sync,
    write_preprocessed,
};
pub use grading::{grade, AnswerKey, GradeReport};
pub use orchestrator::{ExtractionRequest, Orchestrator, ProviderStatus};
pub use output::{
    Answer, AnswerCell, AttemptRecord, CanonicalAnswerSet, ExtractionOutcome, FailureKind,
    ProviderResult, ReviewFlag, ReviewReason, SheetHeader, QUESTION_COUNT,
};
pub use pipeline::input::{AnswerSheetImage, MediaType};
pub use pipeline::preprocess::{preprocess, PreprocessReport, PreprocessedImage};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use providers::{
    ClaudeProvider, GoogleProvider, OpenAiProvider, ProviderReply, VisionProvider,
};
pub use stream::{extract_batch, extract_stream, SheetOutcome, SheetStream};
