//! Extraction orchestrator: try providers in a fixed priority order until
//! one returns a valid answer set.
//!
//! ## Priority
//!
//! Computed once in [`Orchestrator::new`] from live availability:
//!
//! 1. the configured primary, if it is available
//! 2. the remaining available providers in [`ProviderId::FALLBACK_ORDER`]
//!
//! Unavailable providers are left out entirely. An empty list means no
//! request can ever succeed, so construction fails with
//! [`SheetOcrError::NoProviderConfigured`].
//!
//! ## Per request
//!
//! ```text
//! NOT_STARTED ──▶ TRYING(p1) ──fail──▶ TRYING(p2) ──fail──▶ … ──▶ ALL_FAILED
//!                     │                    │
//!                     └──ok──▶ SUCCEEDED ◀─┘
//! ```
//!
//! Attempts are strictly sequential and stop at the first success, so at
//! most one provider ever succeeds per request and nothing is merged across
//! providers. The orchestrator is immutable after construction and can be
//! shared across concurrent requests behind an `Arc`.

use crate::config::{ExtractionConfig, ProviderId, SheetKind};
use crate::error::{ProviderError, SheetOcrError};
use crate::output::{AttemptRecord, ExtractionOutcome, ProviderResult};
use crate::pipeline::preprocess::PreprocessedImage;
use crate::providers::{
    invoke, ClaudeProvider, GoogleProvider, OpenAiProvider, VisionProvider,
};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// One extraction call.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionRequest<'a> {
    pub image: &'a PreprocessedImage,
    pub sheet_kind: SheetKind,
    /// Use only this provider, with no fallback.
    pub forced_provider: Option<ProviderId>,
}

impl<'a> ExtractionRequest<'a> {
    pub fn new(image: &'a PreprocessedImage, sheet_kind: SheetKind) -> Self {
        Self {
            image,
            sheet_kind,
            forced_provider: None,
        }
    }

    pub fn forced(mut self, provider: ProviderId) -> Self {
        self.forced_provider = Some(provider);
        self
    }
}

/// Availability of one registered provider, for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStatus {
    pub provider: ProviderId,
    pub available: bool,
    /// 1-based position in the priority order; `None` when unavailable.
    pub priority: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

pub struct Orchestrator {
    providers: Vec<Arc<dyn VisionProvider>>,
    /// Indices into `providers`, in the order they are tried.
    priority: Vec<usize>,
    availability: Vec<bool>,
    config: ExtractionConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("priority", &self.priority())
            .field("config", &self.config)
            .finish()
    }
}

impl Orchestrator {
    /// Build from explicit providers, sampling their availability once.
    pub fn new(
        providers: Vec<Arc<dyn VisionProvider>>,
        config: ExtractionConfig,
    ) -> Result<Self, SheetOcrError> {
        let availability: Vec<bool> = providers.iter().map(|p| p.is_available()).collect();
        let available: Vec<ProviderId> = providers
            .iter()
            .zip(&availability)
            .filter(|(_, ok)| **ok)
            .map(|(p, _)| p.id())
            .collect();

        let order = priority_order(&available, config.primary);
        if order.is_empty() {
            let hint = providers
                .iter()
                .map(|p| format!("  - {}", p.availability_hint()))
                .collect::<Vec<_>>()
                .join("\n");
            let hint = if hint.is_empty() {
                "No providers are registered.".to_string()
            } else {
                hint
            };
            return Err(SheetOcrError::NoProviderConfigured { hint });
        }

        let priority = order
            .iter()
            .filter_map(|id| {
                providers
                    .iter()
                    .zip(&availability)
                    .position(|(p, ok)| *ok && p.id() == *id)
            })
            .collect();

        let orchestrator = Self {
            providers,
            priority,
            availability,
            config,
        };
        info!(
            "Vision providers in priority order: {}",
            orchestrator
                .priority()
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(orchestrator)
    }

    /// Build the Google, Claude and OpenAI adapters from environment
    /// credentials.
    pub fn from_env(config: ExtractionConfig) -> Result<Self, SheetOcrError> {
        let providers: Vec<Arc<dyn VisionProvider>> = vec![
            Arc::new(GoogleProvider::from_config(&config)),
            Arc::new(ClaudeProvider::from_config(&config)),
            Arc::new(OpenAiProvider::from_config(&config)),
        ];
        Self::new(providers, config)
    }

    /// Providers in the order they are tried.
    pub fn priority(&self) -> Vec<ProviderId> {
        self.priority.iter().map(|&i| self.providers[i].id()).collect()
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Availability of every registered provider.
    pub fn provider_status(&self) -> Vec<ProviderStatus> {
        self.providers
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let available = self.availability[i];
                ProviderStatus {
                    provider: p.id(),
                    available,
                    priority: self.priority.iter().position(|&j| j == i).map(|n| n + 1),
                    hint: (!available).then(|| p.availability_hint()),
                }
            })
            .collect()
    }

    /// Run one extraction request.
    ///
    /// Every per-provider failure comes back inside the outcome. `Err` is
    /// returned only when a forced provider is unknown or unavailable.
    pub async fn extract(
        &self,
        request: ExtractionRequest<'_>,
    ) -> Result<ExtractionOutcome, SheetOcrError> {
        let start = Instant::now();

        if let Some(forced) = request.forced_provider {
            let index = self.forced_index(forced)?;
            info!("Forced extraction with {}", forced);
            let result = self.attempt(index, &request).await;
            let attempts = vec![AttemptRecord::from(&result)];
            let elapsed = start.elapsed().as_millis() as u64;
            return Ok(if result.success {
                ExtractionOutcome::from_success(result, attempts, elapsed, true)
            } else {
                let message = result
                    .error_message()
                    .unwrap_or_else(|| format!("{forced} failed"));
                ExtractionOutcome::from_failure(Some(forced), message, attempts, elapsed, true)
            });
        }

        let candidates: &[usize] = if self.config.fallback_enabled {
            &self.priority
        } else {
            &self.priority[..1]
        };

        let mut attempts = Vec::with_capacity(candidates.len());
        let mut last_error: Option<String> = None;

        for (n, &index) in candidates.iter().enumerate() {
            let id = self.providers[index].id();
            info!("Trying {} ({}/{})", id, n + 1, candidates.len());
            let result = self.attempt(index, &request).await;
            attempts.push(AttemptRecord::from(&result));

            if result.success {
                let elapsed = start.elapsed().as_millis() as u64;
                info!("{} succeeded after {} attempt(s) in {}ms", id, attempts.len(), elapsed);
                return Ok(ExtractionOutcome::from_success(result, attempts, elapsed, false));
            }
            let message = result
                .error_message()
                .unwrap_or_else(|| format!("{id} failed"));
            warn!("{} failed: {}", id, message);
            last_error = Some(message);
        }

        let elapsed = start.elapsed().as_millis() as u64;
        let message = format!(
            "no provider succeeded; last error: {}",
            last_error.unwrap_or_else(|| "none".into())
        );
        warn!("{}", message);
        Ok(ExtractionOutcome::from_failure(None, message, attempts, elapsed, false))
    }

    fn forced_index(&self, forced: ProviderId) -> Result<usize, SheetOcrError> {
        let index = self
            .providers
            .iter()
            .position(|p| p.id() == forced)
            .ok_or_else(|| SheetOcrError::UnknownProvider {
                name: forced.to_string(),
            })?;
        if !self.availability[index] {
            return Err(SheetOcrError::ProviderNotAvailable {
                provider: forced,
                hint: self.providers[index].availability_hint(),
            });
        }
        Ok(index)
    }

    /// Invoke one provider, turning a panic into a failed result.
    async fn attempt(&self, index: usize, request: &ExtractionRequest<'_>) -> ProviderResult {
        let provider = &self.providers[index];
        let id = provider.id();
        let start = Instant::now();
        let call = invoke(
            provider.as_ref(),
            request.image,
            request.sheet_kind,
            &self.config,
        );
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                warn!("{} panicked: {}", id, detail);
                ProviderResult::failed(
                    id,
                    ProviderError::Panicked {
                        provider: id,
                        detail,
                    },
                    start.elapsed().as_millis() as u64,
                    1,
                )
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Order in which available providers are tried: the primary first when it
/// is available, then the rest in [`ProviderId::FALLBACK_ORDER`].
pub fn priority_order(available: &[ProviderId], primary: Option<ProviderId>) -> Vec<ProviderId> {
    let mut order = Vec::with_capacity(available.len());
    if let Some(p) = primary.filter(|p| available.contains(p)) {
        order.push(p);
    }
    for id in ProviderId::FALLBACK_ORDER {
        if available.contains(&id) && !order.contains(&id) {
            order.push(id);
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProviderId::*;

    #[test]
    fn unavailable_primary_is_skipped_entirely() {
        assert_eq!(priority_order(&[Claude, OpenAi], Some(Google)), vec![Claude, OpenAi]);
    }

    #[test]
    fn available_primary_goes_first() {
        assert_eq!(
            priority_order(&[Google, Claude, OpenAi], Some(OpenAi)),
            vec![OpenAi, Google, Claude]
        );
    }

    #[test]
    fn no_primary_uses_fallback_order() {
        assert_eq!(
            priority_order(&[OpenAi, Claude, Google], None),
            vec![Google, Claude, OpenAi]
        );
        assert!(priority_order(&[], Some(Google)).is_empty());
    }

    #[test]
    fn panic_payloads_are_readable() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert!(panic_message(boxed.as_ref()).contains("non-string"));
    }

    #[test]
    fn empty_registry_fails_to_construct() {
        let err = Orchestrator::new(Vec::new(), ExtractionConfig::default()).unwrap_err();
        assert!(matches!(err, SheetOcrError::NoProviderConfigured { .. }));
    }
}
