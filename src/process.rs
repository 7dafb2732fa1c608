//! The download-and-convert orchestrator.
//!
//! One call to [`Pipeline::process`] walks this state machine:
//!
//! ```text
//! CacheCheck ──hit──▶ ServedFromCache
//!     │ miss
//!     ▼
//! Probing ──▶ Classifying ──▶ Downloading ──▶ Converting ──▶ CachePopulated
//!     └──────────────┴──────────────┴──────────────┴──▶ Aborted(error)
//! ```
//!
//! ## Why read a prefix first?
//!
//! A product that is not PDS3/PDS4 should cost one detection window of
//! bandwidth, not 500 MB. The prefix read streams just enough bytes to
//! classify, then drops the connection. If the product is worth converting,
//! those bytes seed the scratch file and the resumable fetcher picks up at
//! that offset, so nothing is fetched twice when the server honours ranges.
//!
//! ## Cleanup
//!
//! The scratch download and the staged output are [`tempfile::TempPath`]
//! guards. Every return path, error or not, drops them, which deletes the
//! files; the only file that outlives a run is the committed cache entry.
//!
//! ## Concurrency
//!
//! Runs share nothing but the cache directory. Two concurrent runs for the
//! same URL may both miss and both convert; the atomic commit makes the
//! last one win with equivalent content.

use crate::config::{OutputFormat, PipelineConfig};
use crate::error::PipelineError;
use crate::pipeline::cache::{CacheKey, CacheStore, CachedArtifact};
use crate::pipeline::fetch::ResumableFetcher;
use crate::pipeline::gateway::{ConversionGateway, ConversionJob};
use crate::pipeline::retry::{RetryPolicy, Sleeper};
use crate::pipeline::sniff::{self, FormatClassification};
use crate::pipeline::source::{RemoteSource, ReqwestSource, SourceError};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use futures::StreamExt;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// States of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PipelineStage {
    CacheCheck,
    ServedFromCache,
    Probing,
    Classifying,
    Downloading,
    Converting,
    CachePopulated,
}

/// Handle to a finished artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub media_type: &'static str,
    pub format: OutputFormat,
    /// Served from the cache without any network work.
    pub cache_hit: bool,
    /// Detected source format; `None` on a cache hit.
    pub source_format: Option<FormatClassification>,
    pub key: CacheKey,
}

impl Artifact {
    fn from_cache(cached: CachedArtifact, key: CacheKey, source_format: Option<FormatClassification>) -> Self {
        Self {
            cache_hit: source_format.is_none(),
            path: cached.path,
            media_type: cached.media_type,
            format: cached.format,
            source_format,
            key,
        }
    }
}

/// Leading bytes of a source, buffered for classification.
#[derive(Debug)]
struct Prefix {
    bytes: Vec<u8>,
    /// The whole source fit in the prefix.
    complete: bool,
    declared_len: Option<u64>,
}

enum PrefixError {
    Transient(String),
    Fatal(PipelineError),
}

/// Download-and-convert pipeline bound to one configuration.
pub struct Pipeline<S = ReqwestSource> {
    config: PipelineConfig,
    source: Arc<S>,
    cache: CacheStore,
    gateway: Arc<ConversionGateway>,
    retry: RetryPolicy,
    progress: ProgressCallback,
}

impl Pipeline<ReqwestSource> {
    /// Build a pipeline that fetches over HTTP(S) with `reqwest`.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        let source = ReqwestSource::new(&config)?;
        Self::with_source(config, source)
    }
}

impl<S: RemoteSource + 'static> Pipeline<S> {
    /// Build a pipeline around a custom [`RemoteSource`].
    ///
    /// Creates the cache and scratch directories and probes encoder support;
    /// an unusable output format fails here, not on the first request.
    pub fn with_source(config: PipelineConfig, source: S) -> Result<Self, PipelineError> {
        let cache = CacheStore::open(&config.cache_dir, config.output_format)?;
        let gateway = Arc::new(ConversionGateway::new(&config)?);
        let scratch = config.scratch_dir();
        std::fs::create_dir_all(&scratch).map_err(|source| PipelineError::Scratch {
            path: scratch.clone(),
            source,
        })?;
        let retry = RetryPolicy::new(config.max_retries, config.backoff_factor);
        info!(
            "Pipeline ready: cache {}, output {}, retries {}",
            config.cache_dir.display(),
            config.output_format,
            config.max_retries
        );
        Ok(Self {
            config,
            source: Arc::new(source),
            cache,
            gateway,
            retry,
            progress: Arc::new(NoopProgressCallback),
        })
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = callback;
        self
    }

    /// Replace how retry backoff sleeps (tests record instead of waiting).
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.retry = self.retry.with_sleeper(sleeper);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Fetch, convert and cache `url`, or return the cached artifact.
    ///
    /// `max_dimension` bounds the longer output edge; `None` uses the
    /// configured default. The cache is keyed by URL alone, so a hit is
    /// returned whatever size it was produced at.
    pub async fn process(&self, url: &str, max_dimension: Option<u32>) -> Result<Artifact, PipelineError> {
        let start = Instant::now();
        let result = self.run(url, max_dimension).await;
        match &result {
            Ok(artifact) => {
                info!(
                    "{} → {} ({}, {} ms)",
                    url,
                    artifact.path.display(),
                    if artifact.cache_hit { "cache hit" } else { "converted" },
                    start.elapsed().as_millis()
                );
                self.progress.on_complete(url, artifact);
            }
            Err(e) => {
                warn!("{} aborted: {}", url, e);
                self.progress.on_abort(url, e);
            }
        }
        result
    }

    fn enter(&self, url: &str, stage: PipelineStage) {
        debug!("{}: {:?}", url, stage);
        self.progress.on_stage(url, stage);
    }

    async fn run(&self, url: &str, max_dimension: Option<u32>) -> Result<Artifact, PipelineError> {
        validate_url(url)?;

        // ── CacheCheck ───────────────────────────────────────────────────
        self.enter(url, PipelineStage::CacheCheck);
        let key = CacheKey::from_url(url);
        if let Some(hit) = self.cache.lookup(&key).await {
            self.enter(url, PipelineStage::ServedFromCache);
            return Ok(Artifact::from_cache(hit, key, None));
        }

        // ── Probing ──────────────────────────────────────────────────────
        self.enter(url, PipelineStage::Probing);
        let prefix = self.read_prefix(url).await?;
        debug!(
            "Prefix of {}: {} bytes, declared {:?}, complete {}",
            url,
            prefix.bytes.len(),
            prefix.declared_len,
            prefix.complete
        );

        // ── Classifying ──────────────────────────────────────────────────
        self.enter(url, PipelineStage::Classifying);
        let window = self.config.detection_window_bytes;
        let classification = sniff::classify_window(&prefix.bytes, window);
        match &classification {
            FormatClassification::Pds3 | FormatClassification::Pds4 => {
                info!("{} classified as {}", url, classification)
            }
            FormatClassification::Unknown => {
                return Err(PipelineError::UnsupportedFormat {
                    url: url.to_string(),
                    window,
                })
            }
            FormatClassification::Error(detail) => {
                return Err(PipelineError::DetectionFailed {
                    url: url.to_string(),
                    detail: detail.clone(),
                })
            }
        }

        // ── Downloading ──────────────────────────────────────────────────
        self.enter(url, PipelineStage::Downloading);
        let download = self.seed_scratch(&prefix.bytes)?;
        if prefix.complete {
            let len = prefix.bytes.len() as u64;
            self.progress.on_download_progress(url, len, Some(len));
        } else {
            let progress = &self.progress;
            let on_bytes = |bytes: u64, total: Option<u64>| progress.on_download_progress(url, bytes, total);
            ResumableFetcher::new(Arc::clone(&self.source), self.retry.clone())
                .max_bytes(self.config.max_input_bytes)
                .fetch(url, &download, Some(&on_bytes))
                .await
                .map_err(|e| PipelineError::from_fetch(url, e))?;
        }

        // ── Converting ───────────────────────────────────────────────────
        self.enter(url, PipelineStage::Converting);
        let staged = self.cache.stage(&key)?;
        let job = ConversionJob {
            input_path: download.to_path_buf(),
            output_path: staged.to_path_buf(),
            source_format: classification.clone(),
            target_format: self.config.output_format,
            enhance: self.config.enhance,
            max_dimension: max_dimension.or(self.config.default_max_dimension),
        };
        let converted = self.gateway.convert_async(job).await;

        // The downloaded source is not needed past this point, whatever happened.
        let download_path = download.to_path_buf();
        if let Err(e) = download.close() {
            warn!("Could not remove {}: {}", download_path.display(), e);
        }

        let report = converted.map_err(|source| PipelineError::Conversion {
            url: url.to_string(),
            source,
        })?;
        debug!("Conversion report for {}: {:?}", url, report);

        // ── CachePopulated ───────────────────────────────────────────────
        let committed = self.cache.commit(&key, staged)?;
        self.enter(url, PipelineStage::CachePopulated);
        Ok(Artifact::from_cache(committed, key, Some(classification)))
    }

    /// Create the private scratch file holding `prefix`.
    fn seed_scratch(&self, prefix: &[u8]) -> Result<tempfile::TempPath, PipelineError> {
        let dir = self.config.scratch_dir();
        let scratch_err = |source| PipelineError::Scratch {
            path: dir.clone(),
            source,
        };
        let mut file = tempfile::Builder::new()
            .prefix("pds2web-")
            .suffix(".img")
            .tempfile_in(&dir)
            .map_err(scratch_err)?;
        file.write_all(prefix).map_err(scratch_err)?;
        file.flush().map_err(scratch_err)?;
        Ok(file.into_temp_path())
    }

    /// Buffer the detection window, retrying transient failures.
    async fn read_prefix(&self, url: &str) -> Result<Prefix, PipelineError> {
        let mut failures = 0u32;
        loop {
            match self.try_read_prefix(url).await {
                Ok(prefix) => return Ok(prefix),
                Err(PrefixError::Fatal(e)) => return Err(e),
                Err(PrefixError::Transient(reason)) => {
                    failures += 1;
                    if failures > self.retry.max_retries {
                        return Err(PipelineError::Network {
                            url: url.to_string(),
                            attempts: failures,
                            reason,
                        });
                    }
                    warn!(
                        "Prefix read of {} failed ({}), retry {}/{}",
                        url, reason, failures, self.retry.max_retries
                    );
                    self.retry.backoff(failures).await;
                }
            }
        }
    }

    async fn try_read_prefix(&self, url: &str) -> Result<Prefix, PrefixError> {
        let classify_err = |e: SourceError| {
            if e.is_transient() {
                PrefixError::Transient(e.to_string())
            } else {
                PrefixError::Fatal(PipelineError::Remote {
                    url: url.to_string(),
                    reason: e.to_string(),
                })
            }
        };

        let mut body = self.source.open(url, 0).await.map_err(classify_err)?;
        let limit = self.config.max_input_bytes;
        if let Some(len) = body.content_length {
            if len > limit {
                return Err(PrefixError::Fatal(PipelineError::OversizeInput {
                    url: url.to_string(),
                    size: len,
                    limit,
                }));
            }
        }

        let window = self.config.detection_window_bytes;
        let mut bytes = Vec::with_capacity(window);
        let mut complete = true;
        while let Some(chunk) = body.chunks.next().await {
            bytes.extend_from_slice(&chunk.map_err(classify_err)?);
            if bytes.len() >= window {
                complete = false;
                break;
            }
        }

        if complete {
            if let Some(len) = body.content_length {
                if (bytes.len() as u64) < len {
                    return Err(PrefixError::Transient(format!(
                        "stream ended after {} of {} bytes",
                        bytes.len(),
                        len
                    )));
                }
            }
            if bytes.len() as u64 > limit {
                return Err(PrefixError::Fatal(PipelineError::OversizeInput {
                    url: url.to_string(),
                    size: bytes.len() as u64,
                    limit,
                }));
            }
        } else if body.content_length == Some(bytes.len() as u64) {
            // The window boundary happened to coincide with the end of the source.
            complete = true;
        }

        Ok(Prefix {
            bytes,
            complete,
            declared_len: body.content_length,
        })
    }
}

/// Accept only absolute `http://` and `https://` URLs.
fn validate_url(url: &str) -> Result<(), PipelineError> {
    let invalid = || PipelineError::InvalidUrl {
        url: url.to_string(),
    };
    let parsed = reqwest::Url::parse(url).map_err(|_| invalid())?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(()),
        _ => Err(invalid()),
    }
}

/// Blocking wrapper around [`Pipeline::process`].
///
/// Creates a temporary tokio runtime internally; do not call from async code.
pub fn process_sync(
    config: PipelineConfig,
    url: &str,
    max_dimension: Option<u32>,
) -> Result<Artifact, PipelineError> {
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| PipelineError::Internal(format!("Failed to create tokio runtime: {e}")))?;
    runtime.block_on(async {
        let pipeline = Pipeline::new(config)?;
        pipeline.process(url, max_dimension).await
    })
}
