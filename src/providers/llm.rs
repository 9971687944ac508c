//! Shared chat call for backends reached through edgequake-llm.
//!
//! The request contains (in order):
//! 1. **System message**: the JSON-only persona
//! 2. **User message**: the extraction prompt plus the sheet as a base64
//!    image attachment
//!
//! Claude and OpenAI differ only in their prompt suffix, the image detail
//! hint and their default confidence, so both adapters delegate here.

use crate::config::{ExtractionConfig, ProviderId, SheetKind};
use crate::error::ProviderError;
use crate::pipeline::encode::to_image_data;
use crate::pipeline::preprocess::PreprocessedImage;
use crate::prompts::{build_prompt, SYSTEM_PROMPT};
use crate::providers::{reply_from_text, ProviderReply};
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Client state shared by the edgequake-llm adapters.
pub(crate) struct LlmBackend {
    pub(crate) id: ProviderId,
    pub(crate) model: String,
    pub(crate) client: Option<Arc<dyn LLMProvider>>,
    pub(crate) options: CompletionOptions,
    pub(crate) detail: Option<&'static str>,
    pub(crate) default_confidence: f32,
    /// Why `client` is `None`.
    pub(crate) unavailable_reason: Option<String>,
}

impl LlmBackend {
    /// Build the client from the environment; a missing key leaves the
    /// backend unavailable instead of failing.
    pub(crate) fn from_env(
        id: ProviderId,
        factory_name: &str,
        config: &ExtractionConfig,
        detail: Option<&'static str>,
        default_confidence: f32,
    ) -> Self {
        let model = config.model_for(id).to_string();
        let (client, unavailable_reason) = if !credentials_present(id) {
            (None, Some(format!("{} is not set", id.credential_vars().join(" / "))))
        } else {
            match edgequake_llm::ProviderFactory::create_llm_provider(factory_name, &model) {
                Ok(p) => (Some(p), None),
                Err(e) => (None, Some(format!("client could not be created: {e}"))),
            }
        };
        Self {
            id,
            model,
            client,
            options: build_options(config),
            detail,
            default_confidence,
            unavailable_reason,
        }
    }

    /// Wrap an already-built client.
    pub(crate) fn with_client(
        id: ProviderId,
        client: Arc<dyn LLMProvider>,
        config: &ExtractionConfig,
        detail: Option<&'static str>,
        default_confidence: f32,
    ) -> Self {
        Self {
            id,
            model: config.model_for(id).to_string(),
            client: Some(client),
            options: build_options(config),
            detail,
            default_confidence,
            unavailable_reason: None,
        }
    }

    pub(crate) fn is_available(&self) -> bool {
        self.client.is_some()
    }

    pub(crate) async fn extract(
        &self,
        image: &PreprocessedImage,
        kind: SheetKind,
    ) -> Result<ProviderReply, ProviderError> {
        let client = self.client.as_ref().ok_or_else(|| ProviderError::Unavailable {
            provider: self.id,
            detail: self
                .unavailable_reason
                .clone()
                .unwrap_or_else(|| "not configured".into()),
        })?;

        let messages = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user_with_images(
                &build_prompt(kind, self.id),
                vec![to_image_data(image, self.detail)],
            ),
        ];

        let start = Instant::now();
        let response = client
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| classify_error(self.id, &e.to_string()))?;
        debug!(
            "{}: {} input tokens, {} output tokens, {:?}",
            self.id,
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        let mut diagnostic = Map::new();
        diagnostic.insert("model".into(), json!(self.model));
        diagnostic.insert("input_tokens".into(), json!(response.prompt_tokens));
        diagnostic.insert("output_tokens".into(), json!(response.completion_tokens));
        reply_from_text(self.id, &response.content, self.default_confidence, diagnostic)
    }
}

fn credentials_present(id: ProviderId) -> bool {
    id.credential_vars()
        .iter()
        .any(|var| std::env::var(var).is_ok_and(|v| !v.trim().is_empty()))
}

/// Build `CompletionOptions` from the extraction config.
pub(crate) fn build_options(config: &ExtractionConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

/// edgequake-llm reports transport failures as text; timeouts are the only
/// kind worth a retry.
pub(crate) fn classify_error(provider: ProviderId, message: &str) -> ProviderError {
    let lower = message.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        ProviderError::Timeout {
            provider,
            secs: 0,
            attempts: 1,
        }
    } else {
        ProviderError::Unavailable {
            provider,
            detail: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_options_defaults() {
        let opts = build_options(&ExtractionConfig::default());
        assert_eq!(opts.temperature, Some(0.0));
        assert_eq!(opts.max_tokens, Some(4096));
    }

    #[test]
    fn timeout_messages_are_retryable() {
        assert!(matches!(
            classify_error(ProviderId::OpenAi, "request Timed Out after 30s"),
            ProviderError::Timeout { .. }
        ));
        assert!(matches!(
            classify_error(ProviderId::OpenAi, "401 Unauthorized"),
            ProviderError::Unavailable { .. }
        ));
    }

    #[tokio::test]
    async fn unconfigured_backend_reports_unavailable() {
        let backend = LlmBackend {
            id: ProviderId::Claude,
            model: "m".into(),
            client: None,
            options: CompletionOptions::default(),
            detail: None,
            default_confidence: 0.95,
            unavailable_reason: Some("ANTHROPIC_API_KEY is not set".into()),
        };
        assert!(!backend.is_available());
        let image = {
            use image::{DynamicImage, RgbImage};
            let mut buf = Vec::new();
            DynamicImage::ImageRgb8(RgbImage::new(2, 2))
                .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
                .unwrap();
            PreprocessedImage::unprocessed(
                &crate::pipeline::input::AnswerSheetImage::from_bytes(buf).unwrap(),
            )
            .unwrap()
        };
        let err = backend.extract(&image, SheetKind::CandidateSheet).await.unwrap_err();
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }
}
