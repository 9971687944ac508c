//! Configuration types for answer-sheet extraction.
//!
//! All extraction behaviour is controlled through [`ExtractionConfig`], built
//! via its [`ExtractionConfigBuilder`]. The orchestrator reads it once at
//! construction time; nothing in it changes for the lifetime of the process.
//!
//! # Design choice: builder over constructor
//! Most deployments only touch the primary provider and the timeout. The
//! builder lets callers set only what they care about and rely on the
//! documented defaults for the rest.

use crate::error::SheetOcrError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Configuration for answer-sheet extraction.
///
/// # Example
/// ```rust
/// use sheet_ocr::{ExtractionConfig, ProviderId};
///
/// let config = ExtractionConfig::builder()
///     .primary(ProviderId::Claude)
///     .timeout_secs(45)
///     .build()
///     .unwrap();
/// assert_eq!(config.primary, Some(ProviderId::Claude));
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Provider tried first when available. Default: Google.
    pub primary: Option<ProviderId>,

    /// When false only the first provider of the priority list is tried. Default: true.
    pub fallback_enabled: bool,

    /// Per-provider call timeout in seconds. Default: 30.
    pub timeout_secs: u64,

    /// Extra attempts after a timeout, per provider. Default: 2.
    ///
    /// Only timeouts are retried. Auth errors and unparseable replies will
    /// not improve on a second try, so they escalate to the next provider.
    pub retry_attempts: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    pub retry_backoff_ms: u64,

    /// Cells below this confidence are flagged for manual review. Default: 0.70.
    pub review_threshold: f32,

    /// Sampling temperature for LLM backends. Default: 0.0.
    ///
    /// Reading marks is transcription, not generation.
    pub temperature: f32,

    /// Maximum tokens a backend may generate per sheet. Default: 4096.
    ///
    /// A 100-entry answer object with header codes is roughly 1 500 tokens.
    pub max_tokens: usize,

    /// OpenAI model. Default: `gpt-4o`.
    pub openai_model: String,

    /// Anthropic model. Default: `claude-3-5-sonnet-20241022`.
    pub anthropic_model: String,

    /// Gemini model. Default: `gemini-2.0-flash-exp`.
    pub gemini_model: String,

    /// Number of sheets processed concurrently by batch extraction. Default: 4.
    pub concurrency: usize,

    /// Image preprocessing options.
    pub preprocess: PreprocessOptions,

    /// Optional progress callback for batch extraction.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            primary: Some(ProviderId::Google),
            fallback_enabled: true,
            timeout_secs: 30,
            retry_attempts: 2,
            retry_backoff_ms: 500,
            review_threshold: 0.70,
            temperature: 0.0,
            max_tokens: 4096,
            openai_model: "gpt-4o".to_string(),
            anthropic_model: "claude-3-5-sonnet-20241022".to_string(),
            gemini_model: "gemini-2.0-flash-exp".to_string(),
            concurrency: 4,
            preprocess: PreprocessOptions::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("primary", &self.primary)
            .field("fallback_enabled", &self.fallback_enabled)
            .field("timeout_secs", &self.timeout_secs)
            .field("retry_attempts", &self.retry_attempts)
            .field("review_threshold", &self.review_threshold)
            .field("openai_model", &self.openai_model)
            .field("anthropic_model", &self.anthropic_model)
            .field("gemini_model", &self.gemini_model)
            .field("concurrency", &self.concurrency)
            .field("preprocess", &self.preprocess)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ProgressCallback>"),
            )
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Model configured for the given provider.
    pub fn model_for(&self, provider: ProviderId) -> &str {
        match provider {
            ProviderId::Google => &self.gemini_model,
            ProviderId::Claude => &self.anthropic_model,
            ProviderId::OpenAi => &self.openai_model,
        }
    }
}

/// Builder for [`ExtractionConfig`].
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl fmt::Debug for ExtractionConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl ExtractionConfigBuilder {
    pub fn primary(mut self, provider: ProviderId) -> Self {
        self.config.primary = Some(provider);
        self
    }

    /// Drop the primary preference; the fixed tie-break order applies alone.
    pub fn no_primary(mut self) -> Self {
        self.config.primary = None;
        self
    }

    pub fn fallback_enabled(mut self, v: bool) -> Self {
        self.config.fallback_enabled = v;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.config.timeout_secs = secs;
        self
    }

    pub fn retry_attempts(mut self, n: u32) -> Self {
        self.config.retry_attempts = n.min(5);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn review_threshold(mut self, t: f32) -> Self {
        self.config.review_threshold = t.clamp(0.0, 1.0);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn openai_model(mut self, model: impl Into<String>) -> Self {
        self.config.openai_model = model.into();
        self
    }

    pub fn anthropic_model(mut self, model: impl Into<String>) -> Self {
        self.config.anthropic_model = model.into();
        self
    }

    pub fn gemini_model(mut self, model: impl Into<String>) -> Self {
        self.config.gemini_model = model.into();
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn preprocess(mut self, options: PreprocessOptions) -> Self {
        self.config.preprocess = options;
        self
    }

    pub fn binarization(mut self, mode: BinarizationMode) -> Self {
        self.config.preprocess.binarization = mode;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, SheetOcrError> {
        let c = &self.config;
        if c.timeout_secs == 0 {
            return Err(SheetOcrError::InvalidConfig(
                "Timeout must be ≥ 1 second".into(),
            ));
        }
        if c.max_tokens < 256 {
            return Err(SheetOcrError::InvalidConfig(format!(
                "max_tokens must be ≥ 256 to fit 100 answers, got {}",
                c.max_tokens
            )));
        }
        let p = &c.preprocess;
        if !(1..=4).contains(&p.zoom_factor) {
            return Err(SheetOcrError::InvalidConfig(format!(
                "zoom factor must be 1–4, got {}",
                p.zoom_factor
            )));
        }
        if p.adaptive_block_size < 3 || p.adaptive_block_size % 2 == 0 {
            return Err(SheetOcrError::InvalidConfig(format!(
                "adaptive block size must be odd and ≥ 3, got {}",
                p.adaptive_block_size
            )));
        }
        if p.clahe_tiles == 0 {
            return Err(SheetOcrError::InvalidConfig(
                "CLAHE tile grid must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// A vision backend known to the orchestrator.
///
/// The declaration order is the fixed tie-break order used after the
/// configured primary provider: Google, then Claude, then OpenAI.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    /// Google Gemini (generateContent REST API).
    Google,
    /// Anthropic Claude.
    Claude,
    /// OpenAI GPT-4o family.
    #[serde(rename = "openai")]
    OpenAi,
}

impl ProviderId {
    /// Tie-break order applied after the primary provider.
    pub const FALLBACK_ORDER: [ProviderId; 3] =
        [ProviderId::Google, ProviderId::Claude, ProviderId::OpenAi];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderId::Google => "google",
            ProviderId::Claude => "claude",
            ProviderId::OpenAi => "openai",
        }
    }

    /// Environment variables that hold this provider's credentials, in lookup order.
    pub fn credential_vars(self) -> &'static [&'static str] {
        match self {
            ProviderId::Google => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
            ProviderId::Claude => &["ANTHROPIC_API_KEY"],
            ProviderId::OpenAi => &["OPENAI_API_KEY"],
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = SheetOcrError;

    /// Accepts provider ids and common aliases, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "google" | "gemini" => Ok(ProviderId::Google),
            "claude" | "anthropic" => Ok(ProviderId::Claude),
            "openai" | "gpt" | "gpt-4o" => Ok(ProviderId::OpenAi),
            _ => Err(SheetOcrError::UnknownProvider {
                name: s.to_string(),
            }),
        }
    }
}

/// Which kind of sheet is being read.
///
/// Both carry 100 cells; an answer key holds the correct answers for a
/// process rather than a candidate's marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetKind {
    #[default]
    CandidateSheet,
    AnswerKey,
}

impl FromStr for SheetKind {
    type Err = SheetOcrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "candidate" | "candidate_sheet" | "sheet" => Ok(SheetKind::CandidateSheet),
            "key" | "answer_key" | "gabarito" => Ok(SheetKind::AnswerKey),
            other => Err(SheetOcrError::InvalidConfig(format!(
                "unknown sheet kind '{other}' (expected 'candidate' or 'key')"
            ))),
        }
    }
}

/// Final thresholding strategy of the preprocessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinarizationMode {
    /// Global Otsu threshold. Works best after shadow reduction. (default)
    #[default]
    Otsu,
    /// Local mean threshold over `adaptive_block_size` windows.
    Adaptive,
    /// Keep the enhanced grayscale image.
    None,
}

impl FromStr for BinarizationMode {
    type Err = SheetOcrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "otsu" => Ok(BinarizationMode::Otsu),
            "adaptive" => Ok(BinarizationMode::Adaptive),
            "none" | "off" => Ok(BinarizationMode::None),
            other => Err(SheetOcrError::InvalidConfig(format!(
                "unknown binarization mode '{other}'"
            ))),
        }
    }
}

/// Tuning knobs of [`crate::pipeline::preprocess`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessOptions {
    /// Run the enhancement pipeline at all. Default: true.
    pub enabled: bool,

    /// Integer upscale factor. Default: 2.
    pub zoom_factor: u32,

    /// Upper bound on the long edge after upscaling, in pixels. Default: 6000.
    ///
    /// A 12 MP phone photo doubled is 96 MP; this keeps memory bounded.
    pub max_long_edge: u32,

    /// Gaussian sigma of the background estimate. Default: 8.0.
    pub shadow_blur_sigma: f32,

    /// Minimum area of the detected sheet quadrilateral, as a fraction of the
    /// image. Default: 0.2.
    pub min_quad_area_ratio: f64,

    /// CLAHE clip limit. Default: 4.0.
    pub clahe_clip_limit: f32,

    /// CLAHE tiles per axis. Default: 8.
    pub clahe_tiles: u32,

    /// Final thresholding. Default: Otsu.
    pub binarization: BinarizationMode,

    /// Adaptive threshold window (odd). Default: 21.
    pub adaptive_block_size: u32,

    /// Adaptive threshold offset subtracted from the local mean. Default: 10.
    pub adaptive_c: i32,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            zoom_factor: 2,
            max_long_edge: 6000,
            shadow_blur_sigma: 8.0,
            min_quad_area_ratio: 0.2,
            clahe_clip_limit: 4.0,
            clahe_tiles: 8,
            binarization: BinarizationMode::Otsu,
            adaptive_block_size: 21,
            adaptive_c: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment() {
        let c = ExtractionConfig::default();
        assert_eq!(c.primary, Some(ProviderId::Google));
        assert!(c.fallback_enabled);
        assert_eq!(c.timeout_secs, 30);
        assert_eq!(c.retry_attempts, 2);
        assert_eq!(c.model_for(ProviderId::OpenAi), "gpt-4o");
    }

    #[test]
    fn builder_clamps_and_validates() {
        let c = ExtractionConfig::builder()
            .retry_attempts(50)
            .review_threshold(3.0)
            .concurrency(0)
            .build()
            .unwrap();
        assert_eq!(c.retry_attempts, 5);
        assert_eq!(c.review_threshold, 1.0);
        assert_eq!(c.concurrency, 1);

        let err = ExtractionConfig::builder().timeout_secs(0).build();
        assert!(matches!(err, Err(SheetOcrError::InvalidConfig(_))));
    }

    #[test]
    fn even_block_size_rejected() {
        let opts = PreprocessOptions {
            adaptive_block_size: 20,
            ..Default::default()
        };
        let err = ExtractionConfig::builder().preprocess(opts).build();
        assert!(matches!(err, Err(SheetOcrError::InvalidConfig(_))));
    }

    #[test]
    fn provider_aliases_parse() {
        assert_eq!("Gemini".parse::<ProviderId>().unwrap(), ProviderId::Google);
        assert_eq!("anthropic".parse::<ProviderId>().unwrap(), ProviderId::Claude);
        assert_eq!("OPENAI".parse::<ProviderId>().unwrap(), ProviderId::OpenAi);
        assert!(matches!(
            "mistral".parse::<ProviderId>(),
            Err(SheetOcrError::UnknownProvider { .. })
        ));
    }

    #[test]
    fn provider_serializes_lowercase() {
        let json = serde_json::to_string(&ProviderId::OpenAi).unwrap();
        assert_eq!(json, "\"openai\"");
        assert_eq!(ProviderId::OpenAi.to_string(), "openai");
    }
}
