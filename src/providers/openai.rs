//! OpenAI adapter.
//!
//! Images are sent with `detail: "high"`: at low detail the whole sheet is
//! squeezed into a single 512 px tile and pencil marks inside the
//! parentheses disappear.

use crate::config::{ExtractionConfig, ProviderId, SheetKind};
use crate::error::ProviderError;
use crate::pipeline::preprocess::PreprocessedImage;
use crate::providers::llm::LlmBackend;
use crate::providers::{ProviderReply, VisionProvider};
use async_trait::async_trait;
use edgequake_llm::LLMProvider;
use std::sync::Arc;

/// Confidence assigned when the reply carries none.
pub const DEFAULT_CONFIDENCE: f32 = 0.90;

const IMAGE_DETAIL: Option<&str> = Some("high");

pub struct OpenAiProvider {
    backend: LlmBackend,
}

impl OpenAiProvider {
    /// Reads `OPENAI_API_KEY`; without it the provider reports itself
    /// unavailable.
    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self {
            backend: LlmBackend::from_env(
                ProviderId::OpenAi,
                "openai",
                config,
                IMAGE_DETAIL,
                DEFAULT_CONFIDENCE,
            ),
        }
    }

    /// Use a pre-built edgequake-llm client.
    pub fn with_llm(client: Arc<dyn LLMProvider>, config: &ExtractionConfig) -> Self {
        Self {
            backend: LlmBackend::with_client(
                ProviderId::OpenAi,
                client,
                config,
                IMAGE_DETAIL,
                DEFAULT_CONFIDENCE,
            ),
        }
    }

    pub fn model(&self) -> &str {
        &self.backend.model
    }
}

#[async_trait]
impl VisionProvider for OpenAiProvider {
    fn id(&self) -> ProviderId {
        ProviderId::OpenAi
    }

    fn is_available(&self) -> bool {
        self.backend.is_available()
    }

    async fn extract_answers(
        &self,
        image: &PreprocessedImage,
        kind: SheetKind,
    ) -> Result<ProviderReply, ProviderError> {
        self.backend.extract(image, kind).await
    }
}
