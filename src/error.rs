//! Error types for the pds2web library.
//!
//! Three error types reflect three layers of the pipeline:
//!
//! * [`PipelineError`]: the single structured error a caller of
//!   [`crate::process::Pipeline::process`] ever sees. Carries an [`ErrorKind`]
//!   so front ends can map it to a status code without string matching.
//!
//! * [`FetchError`]: returned by the resumable fetcher once its internal
//!   retries are spent, or immediately for non-transient failures. The
//!   orchestrator folds it into a [`PipelineError`] together with the URL.
//!
//! * [`ConversionError`]: returned by the conversion gateway; names the stage
//!   (decode, enhance, resize, encode) that failed.
//!
//! Retries never surface as errors: a transient network failure only becomes
//! visible after the retry budget is exhausted.

use crate::pipeline::source::SourceError;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Network failures that survived every retry.
    TransientNetwork,
    /// The remote rejected the request in a way retrying cannot fix.
    Remote,
    /// No PDS signature in the detection window.
    UnsupportedOrUnknownFormat,
    /// Declared or observed size exceeds the configured ceiling.
    OversizeInput,
    /// Pixel decoding failed (after the fallback decoder, if any).
    Decode,
    /// Enhancement, resize or encoding failed.
    Encode,
    /// Staging or committing the cached artifact failed.
    CacheWrite,
    /// The caller supplied something unusable.
    InvalidInput,
    /// Configuration rejected at construction time.
    Config,
    /// Anything else: scratch-file I/O, panicked worker threads.
    Internal,
}

/// All terminal errors returned by the pds2web library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The input string is not an HTTP/HTTPS URL.
    #[error("Invalid URL '{url}': only http:// and https:// sources are supported")]
    InvalidUrl { url: String },

    // ── Network errors ────────────────────────────────────────────────────
    /// Transient failures persisted through every retry.
    #[error("Download of '{url}' failed after {attempts} attempts: {reason}")]
    Network {
        url: String,
        attempts: u32,
        reason: String,
    },

    /// The remote answered with a non-retryable failure (404, 403, …).
    #[error("Failed to download '{url}': {reason}")]
    Remote { url: String, reason: String },

    /// Declared `Content-Length` (or bytes actually received) exceed the ceiling.
    #[error("'{url}' is {size} bytes, above the {limit}-byte limit")]
    OversizeInput { url: String, size: u64, limit: u64 },

    // ── Format errors ─────────────────────────────────────────────────────
    /// No PDS3 or PDS4 marker in the detection window.
    #[error("'{url}' is not a recognised PDS3/PDS4 product (no label markers in the first {window} bytes)")]
    UnsupportedFormat { url: String, window: usize },

    /// The sniffer could not classify the prefix at all.
    #[error("Format detection failed for '{url}': {detail}")]
    DetectionFailed { url: String, detail: String },

    // ── Conversion errors ─────────────────────────────────────────────────
    /// The conversion gateway failed; the stage is named inside.
    #[error("Conversion of '{url}' failed: {source}")]
    Conversion {
        url: String,
        #[source]
        source: ConversionError,
    },

    // ── Cache errors ──────────────────────────────────────────────────────
    /// Creating the staging file or committing it into the cache failed.
    #[error("Failed to write cache entry '{path}': {source}")]
    CacheWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Private scratch file (the in-flight download) could not be created or written.
    #[error("Scratch file error at '{path}': {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation or config-file parsing failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Coarse kind, stable across message wording changes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidUrl { .. } => ErrorKind::InvalidInput,
            PipelineError::Network { .. } => ErrorKind::TransientNetwork,
            PipelineError::Remote { .. } => ErrorKind::Remote,
            PipelineError::OversizeInput { .. } => ErrorKind::OversizeInput,
            PipelineError::UnsupportedFormat { .. } | PipelineError::DetectionFailed { .. } => {
                ErrorKind::UnsupportedOrUnknownFormat
            }
            PipelineError::Conversion { source, .. } => match source.stage {
                ConversionStage::Decode => ErrorKind::Decode,
                _ => ErrorKind::Encode,
            },
            PipelineError::CacheWrite { .. } => ErrorKind::CacheWrite,
            PipelineError::InvalidConfig(_) => ErrorKind::Config,
            PipelineError::Scratch { .. } | PipelineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Fold a fetcher failure into a terminal error for `url`.
    pub(crate) fn from_fetch(url: &str, err: FetchError) -> Self {
        match err {
            FetchError::RetriesExhausted {
                attempts,
                last_error,
            } => PipelineError::Network {
                url: url.to_string(),
                attempts,
                reason: last_error,
            },
            FetchError::Remote(e) => PipelineError::Remote {
                url: url.to_string(),
                reason: e.to_string(),
            },
            FetchError::TooLarge { limit, received } => PipelineError::OversizeInput {
                url: url.to_string(),
                size: received,
                limit,
            },
            FetchError::Io { path, source } => PipelineError::Scratch { path, source },
        }
    }
}

/// Failure of one logical download, after retries.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Every attempt hit a transient error.
    #[error("gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// The remote returned something retrying will not fix.
    #[error("remote error: {0}")]
    Remote(#[source] SourceError),

    /// The stream grew past the configured ceiling.
    #[error("received {received} bytes, above the {limit}-byte limit")]
    TooLarge { limit: u64, received: u64 },

    /// Local destination file could not be opened, written or measured.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Stage of the conversion gateway that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConversionStage {
    Decode,
    Enhance,
    Resize,
    Encode,
}

impl fmt::Display for ConversionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConversionStage::Decode => "decode",
            ConversionStage::Enhance => "enhance",
            ConversionStage::Resize => "resize",
            ConversionStage::Encode => "encode",
        };
        f.write_str(s)
    }
}

/// A conversion failure with the stage that produced it.
#[derive(Debug, Clone, Error)]
#[error("{stage} stage failed: {detail}")]
pub struct ConversionError {
    pub stage: ConversionStage,
    pub detail: String,
}

impl ConversionError {
    pub fn new(stage: ConversionStage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            detail: detail.into(),
        }
    }
}
