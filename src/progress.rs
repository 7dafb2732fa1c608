//! Progress-callback trait for pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::process::Pipeline::with_progress`] to observe each run: stage
//! transitions, download bytes, and the final outcome.
//!
//! # Why callbacks instead of channels?
//!
//! Callers can forward events to a terminal progress bar, a log line, or a
//! WebSocket without the library knowing how the host application
//! communicates. The trait is `Send + Sync` because one [`Pipeline`] may serve
//! many concurrent runs.
//!
//! # Example
//!
//! ```rust
//! use pds2web::{PipelineProgressCallback, PipelineStage};
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! struct ByteCounter(AtomicU64);
//!
//! impl PipelineProgressCallback for ByteCounter {
//!     fn on_download_progress(&self, _url: &str, bytes: u64, _total: Option<u64>) {
//!         self.0.store(bytes, Ordering::Relaxed);
//!     }
//! }
//! ```
//!
//! [`Pipeline`]: crate::process::Pipeline

use crate::error::PipelineError;
use crate::process::{Artifact, PipelineStage};
use std::sync::Arc;

/// Called by [`crate::process::Pipeline`] as a run advances.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Events for different URLs may arrive interleaved
/// from different tasks.
pub trait PipelineProgressCallback: Send + Sync {
    /// Entered a new state.
    fn on_stage(&self, url: &str, stage: PipelineStage) {
        let _ = (url, stage);
    }

    /// Bytes of the source now on local disk; `total` once known.
    fn on_download_progress(&self, url: &str, bytes: u64, total: Option<u64>) {
        let _ = (url, bytes, total);
    }

    /// The run produced (or found) an artifact.
    fn on_complete(&self, url: &str, artifact: &Artifact) {
        let _ = (url, artifact);
    }

    /// The run ended in an error. Temporary files are already gone.
    fn on_abort(&self, url: &str, error: &PipelineError) {
        let _ = (url, error);
    }
}

/// The default when no callback is configured.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
