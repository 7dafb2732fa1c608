//! Resumable download of a remote file onto a local path.
//!
//! ## Algorithm
//!
//! 1. Probe the remote once (HEAD). A failed probe is not fatal: the size is
//!    treated as unknown and range support as available, and the first real
//!    transfer settles both.
//! 2. The destination may already hold bytes (the orchestrator seeds it with
//!    the detection prefix). Those bytes are the resume offset.
//! 3. Each attempt asks for `bytes=<offset>-` when resuming. A `206` body is
//!    appended; a `200` body means the server ignored the range, so the file
//!    is truncated and rewritten from byte 0. Appending a full body onto a
//!    prefix would silently corrupt the product.
//! 4. Transient failures (timeouts, resets, short reads, 5xx) re-measure the
//!    file, back off per [`RetryPolicy`] and try again. After
//!    `max_retries + 1` failed attempts the fetch gives up.
//!
//! The fetcher never retries non-transient responses (404, 403, …): those
//! return [`FetchError::Remote`] immediately.

use crate::error::FetchError;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::source::{BodyStatus, RemoteSource, SourceErrorKind};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Byte progress callback: `(bytes_on_disk, total_if_known)`.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// Where a download stands. Returned on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferState {
    pub destination: PathBuf,
    pub bytes_written: u64,
    pub total_bytes: Option<u64>,
    pub supports_resume: bool,
}

impl TransferState {
    pub fn is_complete(&self) -> bool {
        match self.total_bytes {
            Some(total) => self.bytes_written >= total,
            None => true,
        }
    }
}

enum AttemptError {
    Transient(String),
    Fatal(FetchError),
}

pub struct ResumableFetcher<S> {
    source: S,
    policy: RetryPolicy,
    max_bytes: Option<u64>,
}

impl<S: RemoteSource> ResumableFetcher<S> {
    pub fn new(source: S, policy: RetryPolicy) -> Self {
        Self {
            source,
            policy,
            max_bytes: None,
        }
    }

    /// Abort with [`FetchError::TooLarge`] once the file would exceed `limit`.
    pub fn max_bytes(mut self, limit: u64) -> Self {
        self.max_bytes = Some(limit);
        self
    }

    /// Download `url` into `destination`, resuming from whatever is already there.
    pub async fn fetch(
        &self,
        url: &str,
        destination: &Path,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<TransferState, FetchError> {
        let (total_bytes, supports_resume) = match self.source.probe(url).await {
            // A zero length is reported by servers that do not know it.
            Ok(probe) => (probe.total_bytes.filter(|&n| n > 0), probe.accepts_ranges),
            Err(e) => {
                debug!("Probe of {} failed ({}), assuming resumable", url, e);
                (None, true)
            }
        };

        if let (Some(total), Some(limit)) = (total_bytes, self.max_bytes) {
            if total > limit {
                return Err(FetchError::TooLarge {
                    limit,
                    received: total,
                });
            }
        }

        let mut state = TransferState {
            destination: destination.to_path_buf(),
            bytes_written: file_len(destination).await?,
            total_bytes,
            supports_resume,
        };

        let mut failures: u32 = 0;
        loop {
            match self.attempt(url, &mut state, progress).await {
                Ok(()) => {
                    info!(
                        "Downloaded {} ({} bytes, {} retries)",
                        url, state.bytes_written, failures
                    );
                    return Ok(state);
                }
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Transient(reason)) => {
                    failures += 1;
                    if failures > self.policy.max_retries {
                        return Err(FetchError::RetriesExhausted {
                            attempts: failures,
                            last_error: reason,
                        });
                    }
                    warn!(
                        "Transfer of {} interrupted ({}), retry {}/{} in {:?}",
                        url,
                        reason,
                        failures,
                        self.policy.max_retries,
                        self.policy.delay(failures)
                    );
                    self.policy.backoff(failures).await;
                    state.bytes_written = file_len(destination).await?;
                }
            }
        }
    }

    async fn attempt(
        &self,
        url: &str,
        state: &mut TransferState,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<(), AttemptError> {
        let path = state.destination.clone();

        if let Some(total) = state.total_bytes {
            if state.bytes_written == total {
                report(progress, state);
                return Ok(());
            }
            if state.bytes_written > total {
                debug!(
                    "{} holds {} bytes but remote has {}, starting over",
                    path.display(),
                    state.bytes_written,
                    total
                );
                truncate(&path).await.map_err(AttemptError::Fatal)?;
                state.bytes_written = 0;
            }
        }

        let offset = if state.supports_resume {
            state.bytes_written
        } else {
            0
        };

        let mut body = match self.source.open(url, offset).await {
            Ok(body) => body,
            Err(e)
                if e.kind == SourceErrorKind::Status(416)
                    && state.bytes_written > 0
                    && state.total_bytes.is_none() =>
            {
                // Nothing past our offset: what we hold is the whole file.
                debug!("416 at offset {} for {}, treating as complete", offset, url);
                report(progress, state);
                return Ok(());
            }
            Err(e) if e.is_transient() => return Err(AttemptError::Transient(e.to_string())),
            Err(e) => return Err(AttemptError::Fatal(FetchError::Remote(e))),
        };

        let restart = body.status == BodyStatus::Full || offset == 0;
        if restart && state.bytes_written > 0 {
            debug!(
                "Server sent the full body for {}, discarding {} bytes on disk",
                url, state.bytes_written
            );
        }
        let start = if restart { 0 } else { offset };

        if state.total_bytes.is_none() {
            state.total_bytes = body.content_length.map(|len| start + len);
        }
        if let (Some(total), Some(limit)) = (state.total_bytes, self.max_bytes) {
            if total > limit {
                return Err(AttemptError::Fatal(FetchError::TooLarge {
                    limit,
                    received: total,
                }));
            }
        }

        let mut options = OpenOptions::new();
        if restart {
            options.create(true).write(true).truncate(true);
        } else {
            options.create(true).append(true);
        }
        let mut file = options
            .open(&path)
            .await
            .map_err(|source| AttemptError::Fatal(io_error(&path, source)))?;
        state.bytes_written = start;

        let streamed: Result<(), AttemptError> = async {
            while let Some(chunk) = body.chunks.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) if e.is_transient() => {
                        return Err(AttemptError::Transient(e.to_string()))
                    }
                    Err(e) => return Err(AttemptError::Fatal(FetchError::Remote(e))),
                };
                let next = state.bytes_written + chunk.len() as u64;
                if let Some(limit) = self.max_bytes {
                    if next > limit {
                        return Err(AttemptError::Fatal(FetchError::TooLarge {
                            limit,
                            received: next,
                        }));
                    }
                }
                file.write_all(&chunk)
                    .await
                    .map_err(|source| AttemptError::Fatal(io_error(&path, source)))?;
                state.bytes_written = next;
                report(progress, state);
            }
            Ok(())
        }
        .await;

        // Whatever reached the OS must be on disk before the next re-measure.
        file.flush()
            .await
            .map_err(|source| AttemptError::Fatal(io_error(&path, source)))?;
        streamed?;

        match state.total_bytes {
            Some(total) if state.bytes_written < total => Err(AttemptError::Transient(format!(
                "incomplete transfer: {} of {} bytes",
                state.bytes_written, total
            ))),
            _ => Ok(()),
        }
    }
}

fn report(progress: Option<ProgressFn<'_>>, state: &TransferState) {
    if let Some(cb) = progress {
        cb(state.bytes_written, state.total_bytes);
    }
}

fn io_error(path: &Path, source: std::io::Error) -> FetchError {
    FetchError::Io {
        path: path.to_path_buf(),
        source,
    }
}

async fn file_len(path: &Path) -> Result<u64, FetchError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(source) => Err(io_error(path, source)),
    }
}

async fn truncate(path: &Path) -> Result<(), FetchError> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await
        .map(drop)
        .map_err(|source| io_error(path, source))
}
