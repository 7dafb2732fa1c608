//! Shared helpers for integration tests: an in-memory [`RemoteSource`] whose
//! failures are scripted per request, and synthetic PDS products.

#![allow(dead_code)]

use bytes::Bytes;
use futures::StreamExt;
use pds2web::pipeline::source::{
    BodyStatus, Probe, RemoteBody, RemoteSource, SourceError, SourceErrorKind,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const URL: &str = "https://pds.example.org/data/frame.IMG";

/// Route library logs to the test harness; `RUST_LOG=pds2web=debug` shows them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Serves one body from memory and records every request.
pub struct ScriptedSource {
    body: Bytes,
    chunk_size: usize,
    accepts_ranges: bool,
    /// Advertise ranges but answer every request with 200 and the full body.
    ignore_range: bool,
    /// Report this length instead of the real one.
    declared_len: Option<u64>,
    /// Report no length at all.
    hide_length: bool,
    /// HEAD answers `Content-Length: 0`; GETs still report real lengths.
    zero_length_probe: bool,
    /// Every `open` fails with this error.
    fail_opens: Option<SourceErrorKind>,
    /// The n-th `open` cuts its stream after this many bytes.
    cut_after: Mutex<VecDeque<Option<usize>>>,
    opens: Mutex<Vec<u64>>,
    probes: AtomicUsize,
    served: Arc<AtomicU64>,
}

impl ScriptedSource {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            chunk_size: 4096,
            accepts_ranges: true,
            ignore_range: false,
            declared_len: None,
            hide_length: false,
            zero_length_probe: false,
            fail_opens: None,
            cut_after: Mutex::new(VecDeque::new()),
            opens: Mutex::new(Vec::new()),
            probes: AtomicUsize::new(0),
            served: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn without_ranges(mut self) -> Self {
        self.accepts_ranges = false;
        self
    }

    pub fn ignoring_ranges(mut self) -> Self {
        self.ignore_range = true;
        self
    }

    pub fn declared_len(mut self, len: u64) -> Self {
        self.declared_len = Some(len);
        self
    }

    pub fn without_length(mut self) -> Self {
        self.hide_length = true;
        self
    }

    pub fn zero_length_probe(mut self) -> Self {
        self.zero_length_probe = true;
        self
    }

    pub fn failing_opens(mut self, kind: SourceErrorKind) -> Self {
        self.fail_opens = Some(kind);
        self
    }

    /// Script the stream of each successive `open`: `Some(n)` drops the
    /// connection after `n` bytes, `None` serves normally.
    pub fn cuts(self, script: impl IntoIterator<Item = Option<usize>>) -> Self {
        self.cut_after.lock().unwrap().extend(script);
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Offsets requested by each `open`, in order.
    pub fn opens(&self) -> Vec<u64> {
        self.opens.lock().unwrap().clone()
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Body bytes actually pulled by consumers.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }

    fn total(&self) -> Option<u64> {
        if self.hide_length {
            None
        } else {
            Some(self.declared_len.unwrap_or(self.body.len() as u64))
        }
    }
}

impl RemoteSource for ScriptedSource {
    async fn probe(&self, _url: &str) -> Result<Probe, SourceError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(Probe {
            total_bytes: if self.zero_length_probe {
                Some(0)
            } else {
                self.total()
            },
            accepts_ranges: self.accepts_ranges,
        })
    }

    async fn open(&self, _url: &str, offset: u64) -> Result<RemoteBody, SourceError> {
        self.opens.lock().unwrap().push(offset);
        let cut = self.cut_after.lock().unwrap().pop_front().flatten();

        if let Some(kind) = self.fail_opens {
            return Err(SourceError::new(kind, "scripted failure"));
        }
        // Nothing left past the offset.
        if offset > 0 && offset >= self.body.len() as u64 {
            return Err(SourceError::status(416));
        }

        let ranged = offset > 0 && self.accepts_ranges && !self.ignore_range;
        let start = if ranged { offset as usize } else { 0 };
        let remaining = self.body.slice(start..);
        let content_length = self.total().map(|t| t.saturating_sub(start as u64));

        let mut items: Vec<Result<Bytes, SourceError>> = Vec::new();
        let limit = cut.unwrap_or(remaining.len()).min(remaining.len());
        let mut pos = 0;
        while pos < limit {
            let end = (pos + self.chunk_size).min(limit);
            items.push(Ok(remaining.slice(pos..end)));
            pos = end;
        }
        if cut.is_some() {
            items.push(Err(SourceError::new(
                SourceErrorKind::Body,
                "connection reset by peer",
            )));
        }

        let served = Arc::clone(&self.served);
        let chunks = futures::stream::iter(items)
            .inspect(move |item| {
                if let Ok(bytes) = item {
                    served.fetch_add(bytes.len() as u64, Ordering::SeqCst);
                }
            })
            .boxed();

        Ok(RemoteBody {
            status: if ranged {
                BodyStatus::Partial
            } else {
                BodyStatus::Full
            },
            content_length,
            chunks,
        })
    }
}

/// Deterministic non-repeating filler.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

/// A PDS3 product with an attached 16-bit MSB image holding a gradient.
pub fn pds3_product(width: usize, height: usize) -> Vec<u8> {
    let record_bytes = width * 2;
    let mut label_records = 1;
    let label = loop {
        let text = format!(
            "PDS_VERSION_ID = PDS3\r\n\
             RECORD_TYPE = FIXED_LENGTH\r\n\
             RECORD_BYTES = {record_bytes}\r\n\
             FILE_RECORDS = {}\r\n\
             LABEL_RECORDS = {label_records}\r\n\
             ^IMAGE = {}\r\n\
             INSTRUMENT_NAME = \"SYNTHETIC CAMERA\"\r\n\
             OBJECT = IMAGE\r\n\
             \x20 LINES = {height}\r\n\
             \x20 LINE_SAMPLES = {width}\r\n\
             \x20 SAMPLE_BITS = 16\r\n\
             \x20 SAMPLE_TYPE = MSB_UNSIGNED_INTEGER\r\n\
             END_OBJECT = IMAGE\r\n\
             END\r\n",
            label_records + height,
            label_records + 1,
        );
        let needed = text.len().div_ceil(record_bytes);
        if needed == label_records {
            break text;
        }
        label_records = needed;
    };

    let mut out = label.into_bytes();
    out.resize(label_records * record_bytes, b' ');
    for y in 0..height {
        for x in 0..width {
            let v = ((x * 31 + y * 17) % 4096) as u16;
            out.extend_from_slice(&v.to_be_bytes());
        }
    }
    out
}

/// Classifies as PDS3 but carries no decodable image.
pub fn broken_pds3_product(len: usize) -> Vec<u8> {
    let mut out = b"PDS_VERSION_ID = PDS3\r\nRECORD_BYTES = 512\r\nEND\r\n".to_vec();
    out.extend(pattern(len));
    out
}
