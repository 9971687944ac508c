//! Progress-callback trait for batch extraction events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to receive
//! events as [`crate::stream::extract_stream`] works through a batch of sheets.
//!
//! # Why callbacks instead of channels?
//!
//! Callers can forward events to a terminal progress bar, a WebSocket or a
//! database record without the library knowing how the host application
//! communicates. The trait is `Send + Sync` because sheets of a batch are
//! processed concurrently.
//!
//! # Example
//!
//! ```rust
//! use sheet_ocr::{ExtractionProgressCallback, ExtractionConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for CountingCallback {
//!     fn on_sheet_complete(&self, index: usize, total: usize, provider: &str) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("Sheet {}/{} read by {}", index, total, provider);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { completed: AtomicUsize::new(0) });
//!
//! let config = ExtractionConfig::builder()
//!     .progress_callback(counter as Arc<dyn ExtractionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by batch extraction as it processes each sheet.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. `on_sheet_start`, `on_sheet_complete` and
/// `on_sheet_error` may be called concurrently from different tasks.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once before any sheet is processed.
    fn on_batch_start(&self, total: usize) {
        let _ = total;
    }

    /// Called when a sheet enters preprocessing.
    ///
    /// # Arguments
    /// * `index` — 1-indexed position of the sheet in the batch
    /// * `total` — number of sheets in the batch
    fn on_sheet_start(&self, index: usize, total: usize) {
        let _ = (index, total);
    }

    /// Called when a sheet yields a validated answer set.
    ///
    /// # Arguments
    /// * `provider` — id of the provider that read the sheet
    fn on_sheet_complete(&self, index: usize, total: usize, provider: &str) {
        let _ = (index, total, provider);
    }

    /// Called when a sheet could not be read by any provider, or failed
    /// before reaching one.
    fn on_sheet_error(&self, index: usize, total: usize, error: &str) {
        let _ = (index, total, error);
    }

    /// Called once after all sheets have been attempted.
    fn on_batch_complete(&self, total: usize, success_count: usize) {
        let _ = (total, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;
