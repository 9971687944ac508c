//! Anthropic Claude adapter.

use crate::config::{ExtractionConfig, ProviderId, SheetKind};
use crate::error::ProviderError;
use crate::pipeline::preprocess::PreprocessedImage;
use crate::providers::llm::LlmBackend;
use crate::providers::{ProviderReply, VisionProvider};
use async_trait::async_trait;
use edgequake_llm::LLMProvider;
use std::sync::Arc;

/// Confidence assigned when Claude's reply carries none.
pub const DEFAULT_CONFIDENCE: f32 = 0.95;

pub struct ClaudeProvider {
    backend: LlmBackend,
}

impl ClaudeProvider {
    /// Reads `ANTHROPIC_API_KEY`; without it the provider reports itself
    /// unavailable.
    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self {
            backend: LlmBackend::from_env(
                ProviderId::Claude,
                "anthropic",
                config,
                None,
                DEFAULT_CONFIDENCE,
            ),
        }
    }

    /// Use a pre-built edgequake-llm client (custom endpoint, proxy, mock).
    pub fn with_llm(client: Arc<dyn LLMProvider>, config: &ExtractionConfig) -> Self {
        Self {
            backend: LlmBackend::with_client(
                ProviderId::Claude,
                client,
                config,
                None,
                DEFAULT_CONFIDENCE,
            ),
        }
    }

    pub fn model(&self) -> &str {
        &self.backend.model
    }
}

#[async_trait]
impl VisionProvider for ClaudeProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Claude
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
