//! Remote byte sources: the only place the pipeline touches the network.
//!
//! ## Why a trait?
//!
//! The fetcher's interesting behaviour is what it does when the network
//! misbehaves: resets mid-body, servers that ignore `Range`, short reads.
//! None of that is reproducible against a real server on demand, so the
//! fetcher and orchestrator are generic over [`RemoteSource`] and the tests
//! drive them with scripted in-memory sources. [`ReqwestSource`] is the
//! production implementation.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use reqwest::StatusCode;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Result of a metadata-only request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    /// Declared size, if the server sent `Content-Length`.
    pub total_bytes: Option<u64>,
    /// Server advertised `Accept-Ranges: bytes`.
    pub accepts_ranges: bool,
}

/// Whether a transfer response carries the whole resource or a suffix of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyStatus {
    /// `200 OK`: body starts at byte 0 regardless of what was asked for.
    Full,
    /// `206 Partial Content`: body starts at the requested offset.
    Partial,
}

/// An open streaming transfer.
pub struct RemoteBody {
    pub status: BodyStatus,
    /// Length of *this* body (not of the resource), if declared.
    pub content_length: Option<u64>,
    pub chunks: BoxStream<'static, Result<Bytes, SourceError>>,
}

impl fmt::Debug for RemoteBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteBody")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("chunks", &"<stream>")
            .finish()
    }
}

/// What went wrong talking to the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    Timeout,
    Connect,
    /// Body stream broke: reset, chunked decode error, short read.
    Body,
    /// Non-success HTTP status.
    Status(u16),
    Other,
}

impl fmt::Display for SourceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceErrorKind::Timeout => f.write_str("timeout"),
            SourceErrorKind::Connect => f.write_str("connection error"),
            SourceErrorKind::Body => f.write_str("body stream error"),
            SourceErrorKind::Status(code) => write!(f, "HTTP {code}"),
            SourceErrorKind::Other => f.write_str("request error"),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct SourceError {
    pub kind: SourceErrorKind,
    pub message: String,
}

impl SourceError {
    pub fn new(kind: SourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn status(code: u16) -> Self {
        Self::new(SourceErrorKind::Status(code), "unexpected response status")
    }

    /// True for failures a later attempt may not hit.
    pub fn is_transient(&self) -> bool {
        match self.kind {
            SourceErrorKind::Timeout | SourceErrorKind::Connect | SourceErrorKind::Body => true,
            SourceErrorKind::Status(code) => code == 408 || code == 429 || (500..600).contains(&code),
            SourceErrorKind::Other => false,
        }
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            SourceErrorKind::Timeout
        } else if e.is_connect() || e.is_request() {
            SourceErrorKind::Connect
        } else if e.is_body() || e.is_decode() {
            SourceErrorKind::Body
        } else if let Some(status) = e.status() {
            SourceErrorKind::Status(status.as_u16())
        } else {
            SourceErrorKind::Other
        };
        Self::new(kind, e.to_string())
    }
}

/// A remote that can be probed and streamed from an offset.
pub trait RemoteSource: Send + Sync {
    /// Metadata-only request for size and range support.
    fn probe(&self, url: &str) -> impl Future<Output = Result<Probe, SourceError>> + Send;

    /// Start a streaming transfer; `offset > 0` asks for `bytes=offset-`.
    fn open(
        &self,
        url: &str,
        offset: u64,
    ) -> impl Future<Output = Result<RemoteBody, SourceError>> + Send;
}

impl<S: RemoteSource> RemoteSource for Arc<S> {
    fn probe(&self, url: &str) -> impl Future<Output = Result<Probe, SourceError>> + Send {
        (**self).probe(url)
    }

    fn open(
        &self,
        url: &str,
        offset: u64,
    ) -> impl Future<Output = Result<RemoteBody, SourceError>> + Send {
        (**self).open(url, offset)
    }
}

/// Production source backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestSource {
    client: reqwest::Client,
    probe_timeout: Duration,
}

impl ReqwestSource {
    /// Build a client with the configured connect/read timeouts.
    ///
    /// On GET the read timeout bounds each wait for bytes rather than the
    /// whole transfer, so a slow-but-alive 500 MB download is not cut off
    /// while a stalled one still surfaces as a transient timeout. The HEAD
    /// probe carries no body, so the same value bounds the whole request.
    pub fn new(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("pds2web/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| PipelineError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            probe_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self {
            client,
            probe_timeout: Duration::from_secs(PipelineConfig::default().request_timeout_secs),
        }
    }
}

fn header_u64(headers: &reqwest::header::HeaderMap, name: reqwest::header::HeaderName) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

impl RemoteSource for ReqwestSource {
    async fn probe(&self, url: &str) -> Result<Probe, SourceError> {
        let response = self
            .client
            .head(url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(SourceError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(SourceError::status(response.status().as_u16()));
        }

        // `Response::content_length` reflects the (empty) HEAD body, so read
        // the header directly. A zero length means the server does not know.
        let headers = response.headers();
        let probe = Probe {
            total_bytes: header_u64(headers, CONTENT_LENGTH).filter(|&n| n > 0),
            accepts_ranges: headers
                .get(ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("bytes")),
        };
        debug!("Probe {}: {:?}", url, probe);
        Ok(probe)
    }

    async fn open(&self, url: &str, offset: u64) -> Result<RemoteBody, SourceError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        let response = request.send().await.map_err(SourceError::from_reqwest)?;
        let status = match response.status() {
            StatusCode::OK => BodyStatus::Full,
            StatusCode::PARTIAL_CONTENT => BodyStatus::Partial,
            other => return Err(SourceError::status(other.as_u16())),
        };

        let content_length = header_u64(response.headers(), CONTENT_LENGTH);
        debug!(
            "GET {} (offset {}) → {:?}, length {:?}",
            url, offset, status, content_length
        );

        Ok(RemoteBody {
            status,
            content_length,
            chunks: response
                .bytes_stream()
                .map_err(SourceError::from_reqwest)
                .boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(SourceError::new(SourceErrorKind::Timeout, "t").is_transient());
        assert!(SourceError::new(SourceErrorKind::Body, "reset").is_transient());
        assert!(SourceError::status(503).is_transient());
        assert!(SourceError::status(429).is_transient());
        assert!(!SourceError::status(404).is_transient());
        assert!(!SourceError::status(416).is_transient());
        assert!(!SourceError::new(SourceErrorKind::Other, "bad url").is_transient());
    }

    #[test]
    fn error_display_includes_kind() {
        let e = SourceError::status(404);
        assert!(e.to_string().starts_with("HTTP 404"));
    }
}
