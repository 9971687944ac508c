//! Batch extraction: many sheets at once, results emitted as they complete.
//!
//! ## Why concurrency across sheets only?
//!
//! Within one sheet, providers are tried strictly one after another (the
//! fallback policy depends on it). Different sheets share nothing mutable,
//! so a batch runs up to `config.concurrency` sheets in parallel with
//! `buffer_unordered`. Results arrive in completion order; sort by
//! [`SheetOutcome::index`] if order matters.

use crate::config::{ProviderId, SheetKind};
use crate::error::SheetOcrError;
use crate::extract::extract_preprocessed;
use crate::orchestrator::Orchestrator;
use crate::output::ExtractionOutcome;
use crate::pipeline::input::AnswerSheetImage;
use crate::pipeline::preprocess::{preprocess, PreprocessedImage};
use futures::future;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tracing::info;

/// Result for one sheet of a batch.
#[derive(Debug)]
pub struct SheetOutcome {
    /// 1-based position in the input list.
    pub index: usize,
    pub path: PathBuf,
    /// `Err` for fatal per-sheet errors (unreadable file, undecodable image).
    pub result: Result<ExtractionOutcome, SheetOcrError>,
    /// The image the providers were shown, when preprocessing succeeded.
    pub image: Option<PreprocessedImage>,
}

impl SheetOutcome {
    /// `true` when a provider produced a valid answer set.
    pub fn is_success(&self) -> bool {
        matches!(&self.result, Ok(o) if o.success)
    }
}

/// A boxed stream of per-sheet results.
pub type SheetStream = Pin<Box<dyn Stream<Item = SheetOutcome> + Send>>;

/// Extract many sheets concurrently, streaming results as they complete.
pub fn extract_stream(
    orchestrator: Arc<Orchestrator>,
    paths: Vec<PathBuf>,
    kind: SheetKind,
    forced: Option<ProviderId>,
) -> SheetStream {
    let total = paths.len();
    let concurrency = orchestrator.config().concurrency.max(1);

    // Nothing happens, not even the start event, until the stream is polled.
    let start_callback = orchestrator.config().progress_callback.clone();
    let started = stream::once(async move {
        info!("Starting batch of {} sheets, {} at a time", total, concurrency);
        if let Some(cb) = start_callback {
            cb.on_batch_start(total);
        }
    })
    .filter_map(|()| future::ready(None::<SheetOutcome>));

    let sheets = stream::iter(paths.into_iter().enumerate().map(move |(i, path)| {
        let orchestrator = Arc::clone(&orchestrator);
        async move {
            let index = i + 1;
            let callback = orchestrator.config().progress_callback.clone();
            if let Some(cb) = &callback {
                cb.on_sheet_start(index, total);
            }

            let (result, image) = match load_and_preprocess(&orchestrator, &path).await {
                Ok(image) => (
                    extract_preprocessed(&orchestrator, &image, kind, forced).await,
                    Some(image),
                ),
                Err(e) => (Err(e), None),
            };

            if let Some(cb) = &callback {
                match &result {
                    Ok(o) if o.success => {
                        let provider = o.provider.map(|p| p.as_str()).unwrap_or("unknown");
                        cb.on_sheet_complete(index, total, provider);
                    }
                    Ok(o) => cb.on_sheet_error(
                        index,
                        total,
                        o.error_message.as_deref().unwrap_or("extraction failed"),
                    ),
                    Err(e) => cb.on_sheet_error(index, total, &e.to_string()),
                }
            }
            SheetOutcome {
                index,
                path,
                result,
                image,
            }
        }
    }))
    .buffer_unordered(concurrency);

    Box::pin(started.chain(sheets))
}

async fn load_and_preprocess(
    orchestrator: &Orchestrator,
    path: &Path,
) -> Result<PreprocessedImage, SheetOcrError> {
    let sheet = AnswerSheetImage::from_path(path).await?;
    preprocess(sheet, &orchestrator.config().preprocess).await
}

/// Extract many sheets and wait for all of them. Results are sorted by
/// input position; preprocessed images are not retained.
pub async fn extract_batch(
    orchestrator: Arc<Orchestrator>,
    paths: Vec<PathBuf>,
    kind: SheetKind,
    forced: Option<ProviderId>,
) -> Vec<SheetOutcome> {
    let total = paths.len();
    let callback = orchestrator.config().progress_callback.clone();
    let mut results: Vec<SheetOutcome> = extract_stream(orchestrator, paths, kind, forced)
        .map(|mut r| {
            r.image = None;
            r
        })
        .collect()
        .await;
    results.sort_by_key(|r| r.index);

    let succeeded = results.iter().filter(|r| r.is_success()).count();
    info!("Batch complete: {}/{} sheets extracted", succeeded, total);
    if let Some(cb) = callback {
        cb.on_batch_complete(total, succeeded);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtractionConfig;
    use crate::error::ProviderError;
    use crate::progress::ExtractionProgressCallback;
    use crate::providers::{ProviderReply, VisionProvider};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Idle;

    #[async_trait]
    impl VisionProvider for Idle {
        fn id(&self) -> ProviderId {
            ProviderId::Google
        }
        fn is_available(&self) -> bool {
            true
        }
        async fn extract_answers(
            &self,
            _image: &PreprocessedImage,
            _kind: SheetKind,
        ) -> Result<ProviderReply, ProviderError> {
            Err(ProviderError::Unavailable {
                provider: ProviderId::Google,
                detail: "idle".into(),
            })
        }
    }

    #[derive(Default)]
    struct Starts(AtomicUsize);

    impl ExtractionProgressCallback for Starts {
        fn on_batch_start(&self, _total: usize) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn batch_start_fires_on_first_poll() {
        let starts = Arc::new(Starts::default());
        let config = ExtractionConfig::builder()
            .progress_callback(starts.clone())
            .build()
            .unwrap();
        let orchestrator = Arc::new(Orchestrator::new(vec![Arc::new(Idle) as Arc<dyn VisionProvider>], config).unwrap());

        let missing = vec![PathBuf::from("/nonexistent/sheet.png")];
        let mut s = extract_stream(orchestrator, missing, SheetKind::CandidateSheet, None);
        assert_eq!(starts.0.load(Ordering::SeqCst), 0);

        let first = s.next().await.unwrap();
        assert_eq!(starts.0.load(Ordering::SeqCst), 1);
        assert!(matches!(first.result, Err(SheetOcrError::FileNotFound { .. })));
        assert!(s.next().await.is_none());
        assert_eq!(starts.0.load(Ordering::SeqCst), 1);
    }
}
