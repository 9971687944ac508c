//! Top-level entry points: photo in, validated answers out.
//!
//! Each call runs the whole pipeline for one sheet:
//!
//! ```text
//! AnswerSheetImage ──▶ preprocess (blocking pool) ──▶ Orchestrator::extract
//! ```
//!
//! Use [`crate::stream::extract_stream`] for many sheets at once.

use crate::config::{ProviderId, SheetKind};
use crate::error::SheetOcrError;
use crate::orchestrator::{ExtractionRequest, Orchestrator};
use crate::output::ExtractionOutcome;
use crate::pipeline::input::AnswerSheetImage;
use crate::pipeline::preprocess::{preprocess, PreprocessedImage};
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

/// Preprocess a sheet and extract its answers.
///
/// # Errors
/// Returns `Err(SheetOcrError)` only for fatal errors:
/// - the image cannot be decoded
/// - `forced` names a provider that is not registered or not available
///
/// Every provider failure is reported inside the returned outcome.
pub async fn extract_sheet(
    orchestrator: &Orchestrator,
    sheet: AnswerSheetImage,
    kind: SheetKind,
    forced: Option<ProviderId>,
) -> Result<ExtractionOutcome, SheetOcrError> {
    let image = preprocess(sheet, &orchestrator.config().preprocess).await?;
    extract_preprocessed(orchestrator, &image, kind, forced).await
}

/// Extract answers from an image that is already preprocessed.
pub async fn extract_preprocessed(
    orchestrator: &Orchestrator,
    image: &PreprocessedImage,
    kind: SheetKind,
    forced: Option<ProviderId>,
) -> Result<ExtractionOutcome, SheetOcrError> {
    let report = image.report();
    for w in &report.warnings {
        warn!("{}", w);
    }
    info!(
        "Extracting {:?} ({}x{}, steps: {})",
        kind,
        report.width,
        report.height,
        if report.applied.is_empty() {
            "none".to_string()
        } else {
            report.applied.join(", ")
        }
    );

    let mut request = ExtractionRequest::new(image, kind);
    request.forced_provider = forced;
    let outcome = orchestrator.extract(request).await?;
    Ok(outcome.with_preprocessing(report.clone()))
}

/// Load an image file and extract its answers.
pub async fn extract_file(
    orchestrator: &Orchestrator,
    path: impl AsRef<Path>,
    kind: SheetKind,
    forced: Option<ProviderId>,
) -> Result<ExtractionOutcome, SheetOcrError> {
    let path = path.as_ref();
    info!("Starting extraction: {}", path.display());
    let sheet = AnswerSheetImage::from_path(path).await?;
    extract_sheet(orchestrator, sheet, kind, forced).await
}

/// Extract answers from in-memory JPEG/PNG/WEBP bytes.
pub async fn extract_bytes(
    orchestrator: &Orchestrator,
    bytes: Vec<u8>,
    kind: SheetKind,
    forced: Option<ProviderId>,
) -> Result<ExtractionOutcome, SheetOcrError> {
    let sheet = AnswerSheetImage::from_bytes(bytes)?;
    extract_sheet(orchestrator, sheet, kind, forced).await
}

/// Synchronous wrapper around [`extract_file`].
///
/// Creates a temporary tokio runtime internally; do not call from inside
/// an async context.
pub fn extract_sync(
    orchestrator: &Orchestrator,
    path: impl AsRef<Path>,
    kind: SheetKind,
    forced: Option<ProviderId>,
) -> Result<ExtractionOutcome, SheetOcrError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| SheetOcrError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(extract_file(orchestrator, path, kind, forced))
}

/// Write a preprocessed image to disk.
///
/// Uses an atomic write (temp file in the target directory, then rename) so
/// readers never see a partial image.
pub async fn write_preprocessed(
    image: &PreprocessedImage,
    path: impl AsRef<Path>,
) -> Result<(), SheetOcrError> {
    let path = path.as_ref().to_path_buf();
    let bytes = image.bytes().to_vec();
    let target = path.clone();
    tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
        .await
        .map_err(|e| SheetOcrError::Internal(format!("Write task panicked: {}", e)))?
        .map_err(|source| SheetOcrError::OutputWriteFailed { path, source })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbImage};
    use std::io::Cursor;

    fn png() -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, image::Rgb([200, 200, 200])))
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn write_preprocessed_creates_dirs_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let image = PreprocessedImage::unprocessed(&AnswerSheetImage::from_bytes(png()).unwrap()).unwrap();
        let target = dir.path().join("nested/out.png");
        write_preprocessed(&image, &target).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), image.bytes());
        // Only the final file remains.
        assert_eq!(std::fs::read_dir(dir.path().join("nested")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn write_preprocessed_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.png");
        std::fs::write(&target, b"old").unwrap();
        let image = PreprocessedImage::unprocessed(&AnswerSheetImage::from_bytes(png()).unwrap()).unwrap();
        write_preprocessed(&image, &target).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), image.bytes());
    }

    #[test]
    fn write_preprocessed_reports_target_path() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file cannot hold a child directory.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let image = PreprocessedImage::unprocessed(&AnswerSheetImage::from_bytes(png()).unwrap()).unwrap();
        let target = blocker.join("out.png");

        let err = tokio_test::block_on(write_preprocessed(&image, &target)).unwrap_err();
        match err {
            SheetOcrError::OutputWriteFailed { path, .. } => assert_eq!(path, target),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
