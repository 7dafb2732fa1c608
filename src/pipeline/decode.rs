//! Pixel decoders for PDS products with attached labels.
//!
//! ## Why one decoder per format?
//!
//! The format is already known from the sniffer, so decoder selection is a
//! plain `match` on [`FormatClassification`]; nothing here inspects a file to
//! guess what it might contain. Each format has a primary decoder and, for
//! PDS3, a more permissive fallback that is tried once when the primary
//! rejects the label.
//!
//! All decoders produce a [`RasterBuffer`] in band-sequential order
//! (band, line, sample), whatever the on-disk interleave.

use crate::pipeline::sniff::FormatClassification;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// Labels longer than this are not searched for their end marker.
const LABEL_SCAN_LIMIT: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("label error: {0}")]
    Label(String),

    #[error("unsupported product: {0}")]
    Unsupported(String),

    #[error("decoded image needs {needed} bytes, above the {limit}-byte memory limit")]
    TooLarge { needed: u64, limit: u64 },

    #[error("file holds {available} bytes but the image ends at byte {expected}")]
    Truncated { expected: u64, available: u64 },
}

/// Decoded sample values, one variant per storage type.
#[derive(Debug, Clone, PartialEq)]
pub enum Samples {
    U8(Vec<u8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    U32(Vec<u32>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Samples {
    pub fn len(&self) -> usize {
        match self {
            Samples::U8(v) => v.len(),
            Samples::U16(v) => v.len(),
            Samples::I16(v) => v.len(),
            Samples::U32(v) => v.len(),
            Samples::I32(v) => v.len(),
            Samples::F32(v) => v.len(),
            Samples::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every value widened to `f64`, in storage order.
    pub fn iter_f64(&self) -> Box<dyn Iterator<Item = f64> + '_> {
        match self {
            Samples::U8(v) => Box::new(v.iter().map(|&x| f64::from(x))),
            Samples::U16(v) => Box::new(v.iter().map(|&x| f64::from(x))),
            Samples::I16(v) => Box::new(v.iter().map(|&x| f64::from(x))),
            Samples::U32(v) => Box::new(v.iter().map(|&x| f64::from(x))),
            Samples::I32(v) => Box::new(v.iter().map(|&x| f64::from(x))),
            Samples::F32(v) => Box::new(v.iter().map(|&x| f64::from(x))),
            Samples::F64(v) => Box::new(v.iter().copied()),
        }
    }
}

/// A decoded image in band-sequential order.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterBuffer {
    pub width: u32,
    pub height: u32,
    pub bands: u32,
    pub samples: Samples,
}

impl RasterBuffer {
    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Turns a local product file into pixels.
pub trait Decoder: Send + Sync {
    fn name(&self) -> &'static str;
    fn decode(&self, path: &Path) -> Result<RasterBuffer, DecodeError>;
}

/// Primary decoder plus an optional single fallback.
pub struct DecoderChain {
    primary: Box<dyn Decoder>,
    fallback: Option<Box<dyn Decoder>>,
}

impl std::fmt::Debug for DecoderChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderChain")
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback.as_ref().map(|d| d.name()))
            .finish()
    }
}

impl DecoderChain {
    pub fn new(primary: Box<dyn Decoder>, fallback: Option<Box<dyn Decoder>>) -> Self {
        Self { primary, fallback }
    }

    /// Decoders for an already-classified product; `None` for unsupported formats.
    pub fn for_format(
        format: &FormatClassification,
        memory_limit: u64,
        use_fallback: bool,
    ) -> Option<Self> {
        match format {
            FormatClassification::Pds3 => Some(Self::new(
                Box::new(Pds3LabelDecoder { memory_limit }),
                use_fallback
                    .then(|| Box::new(Pds3HeuristicDecoder { memory_limit }) as Box<dyn Decoder>),
            )),
            FormatClassification::Pds4 => Some(Self::new(Box::new(Pds4Decoder { memory_limit }), None)),
            FormatClassification::Unknown | FormatClassification::Error(_) => None,
        }
    }

    /// Run the primary decoder, then the fallback once if the primary failed.
    ///
    /// Returns the raster and the name of the decoder that produced it.
    pub fn decode(&self, path: &Path) -> Result<(RasterBuffer, &'static str), DecodeError> {
        let primary_err = match self.primary.decode(path) {
            Ok(raster) => return Ok((raster, self.primary.name())),
            Err(e) => e,
        };
        let Some(fallback) = &self.fallback else {
            return Err(primary_err);
        };
        warn!(
            "{} failed ({}), trying {}",
            self.primary.name(),
            primary_err,
            fallback.name()
        );
        match fallback.decode(path) {
            Ok(raster) => Ok((raster, fallback.name())),
            Err(fallback_err) => Err(DecodeError::Label(format!(
                "{}: {}; {}: {}",
                self.primary.name(),
                primary_err,
                fallback.name(),
                fallback_err
            ))),
        }
    }
}

// ── Sample layout ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl SampleType {
    fn stored_size(self) -> u64 {
        match self {
            SampleType::U8 | SampleType::I8 => 1,
            SampleType::U16 | SampleType::I16 => 2,
            SampleType::U32 | SampleType::I32 | SampleType::F32 => 4,
            SampleType::F64 => 8,
        }
    }

    fn decoded_size(self) -> u64 {
        match self {
            // i8 is widened to i16
            SampleType::I8 => 2,
            other => other.stored_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interleave {
    /// band, line, sample
    BandSequential,
    /// line, band, sample
    LineInterleaved,
    /// line, sample, band
    SampleInterleaved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ImageSpec {
    width: u32,
    height: u32,
    bands: u32,
    sample: SampleType,
    order: ByteOrder,
    interleave: Interleave,
    offset: u64,
    line_prefix: u64,
    line_suffix: u64,
}

macro_rules! decode_words {
    ($raw:expr, $order:expr, $t:ty, $n:literal) => {
        $raw.chunks_exact($n)
            .map(|c| {
                let mut b = [0u8; $n];
                b.copy_from_slice(c);
                match $order {
                    ByteOrder::Big => <$t>::from_be_bytes(b),
                    ByteOrder::Little => <$t>::from_le_bytes(b),
                }
            })
            .collect::<Vec<$t>>()
    };
}

fn read_image(path: &Path, spec: &ImageSpec, memory_limit: u64) -> Result<RasterBuffer, DecodeError> {
    if spec.width == 0 || spec.height == 0 || spec.bands == 0 {
        return Err(DecodeError::Label(format!(
            "degenerate image {}x{}x{}",
            spec.width, spec.height, spec.bands
        )));
    }
    let w = u64::from(spec.width);
    let h = u64::from(spec.height);
    let bands = u64::from(spec.bands);
    let size = spec.sample.stored_size();

    let count = w
        .checked_mul(h)
        .and_then(|n| n.checked_mul(bands))
        .ok_or_else(|| DecodeError::Label("image dimensions overflow".into()))?;
    let needed = count.saturating_mul(spec.sample.decoded_size());
    if needed > memory_limit {
        return Err(DecodeError::TooLarge {
            needed,
            limit: memory_limit,
        });
    }

    let (line_samples, line_count) = match spec.interleave {
        Interleave::SampleInterleaved => (w * bands, h),
        _ => (w, h * bands),
    };
    let line_bytes = line_samples * size;
    let stride = spec.line_prefix + line_bytes + spec.line_suffix;
    let region = stride.saturating_mul(line_count);

    let mut file = File::open(path)?;
    let available = file.metadata()?.len();
    let end = spec.offset.saturating_add(region);
    if end > available {
        return Err(DecodeError::Truncated {
            expected: end,
            available,
        });
    }
    file.seek(SeekFrom::Start(spec.offset))?;

    let mut raw = vec![0u8; to_usize(region)?];
    file.read_exact(&mut raw)?;

    if spec.line_prefix > 0 || spec.line_suffix > 0 {
        let (prefix, line_bytes, stride) = (to_usize(spec.line_prefix)?, to_usize(line_bytes)?, to_usize(stride)?);
        raw = raw
            .chunks_exact(stride)
            .flat_map(|line| &line[prefix..prefix + line_bytes])
            .copied()
            .collect();
    }

    let raw = to_band_sequential(raw, spec, to_usize(size)?);
    let samples = match spec.sample {
        SampleType::U8 => Samples::U8(raw),
        SampleType::I8 => Samples::I16(raw.iter().map(|&b| i16::from(b as i8)).collect()),
        SampleType::U16 => Samples::U16(decode_words!(raw, spec.order, u16, 2)),
        SampleType::I16 => Samples::I16(decode_words!(raw, spec.order, i16, 2)),
        SampleType::U32 => Samples::U32(decode_words!(raw, spec.order, u32, 4)),
        SampleType::I32 => Samples::I32(decode_words!(raw, spec.order, i32, 4)),
        SampleType::F32 => Samples::F32(decode_words!(raw, spec.order, f32, 4)),
        SampleType::F64 => Samples::F64(decode_words!(raw, spec.order, f64, 8)),
    };

    debug!(
        "Decoded {}x{}x{} {:?} samples at offset {}",
        spec.width, spec.height, spec.bands, spec.sample, spec.offset
    );
    Ok(RasterBuffer {
        width: spec.width,
        height: spec.height,
        bands: spec.bands,
        samples,
    })
}

/// Reorder raw sample words into band-sequential layout.
fn to_band_sequential(raw: Vec<u8>, spec: &ImageSpec, size: usize) -> Vec<u8> {
    if spec.bands == 1 || spec.interleave == Interleave::BandSequential {
        return raw;
    }
    let (w, h, b) = (spec.width as usize, spec.height as usize, spec.bands as usize);
    let mut out = vec![0u8; raw.len()];
    for line in 0..h {
        for band in 0..b {
            for sample in 0..w {
                let src = match spec.interleave {
                    Interleave::LineInterleaved => (line * b + band) * w + sample,
                    Interleave::SampleInterleaved => (line * w + sample) * b + band,
                    Interleave::BandSequential => unreachable!(),
                };
                let dst = (band * h + line) * w + sample;
                out[dst * size..(dst + 1) * size].copy_from_slice(&raw[src * size..(src + 1) * size]);
            }
        }
    }
    out
}

fn to_usize(n: u64) -> Result<usize, DecodeError> {
    usize::try_from(n).map_err(|_| DecodeError::Unsupported(format!("{n} bytes exceeds address space")))
}

/// Read up to [`LABEL_SCAN_LIMIT`] leading bytes.
fn read_label_bytes(path: &Path) -> Result<Vec<u8>, DecodeError> {
    let file = File::open(path)?;
    let mut buf = Vec::new();
    file.take(LABEL_SCAN_LIMIT).read_to_end(&mut buf)?;
    Ok(buf)
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

// ── PDS3 ──────────────────────────────────────────────────────────────────

static ODL_STATEMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\^?[A-Za-z][A-Za-z0-9_:]*)\s*=\s*(.*?)\s*$").expect("valid regex"));

/// The parts of an attached ODL label the decoders need.
#[derive(Debug, Default, Clone)]
struct Pds3Label {
    /// Keywords outside any OBJECT block.
    top: HashMap<String, String>,
    /// Keywords directly inside the first `OBJECT = IMAGE`.
    image: HashMap<String, String>,
    /// Byte offset just past the `END` statement.
    end_offset: Option<u64>,
}

impl Pds3Label {
    fn parse(bytes: &[u8]) -> Self {
        let mut label = Pds3Label::default();
        let mut depth = 0usize;
        let mut image_depth: Option<usize> = None;
        let mut image_done = false;
        let mut offset = 0u64;

        for raw_line in bytes.split_inclusive(|&b| b == b'\n') {
            offset += raw_line.len() as u64;
            let line = latin1(raw_line);
            let statement = line.split("/*").next().unwrap_or("").trim();
            if statement == "END" {
                label.end_offset = Some(offset);
                break;
            }
            let Some(caps) = ODL_STATEMENT.captures(statement) else {
                continue;
            };
            let key = caps[1].to_ascii_uppercase();
            let value = clean_value(&caps[2]);

            match key.as_str() {
                "OBJECT" => {
                    depth += 1;
                    if value.eq_ignore_ascii_case("IMAGE") && image_depth.is_none() && !image_done {
                        image_depth = Some(depth);
                    }
                }
                "END_OBJECT" => {
                    if image_depth == Some(depth) {
                        image_depth = None;
                        image_done = true;
                    }
                    depth = depth.saturating_sub(1);
                }
                _ if image_depth == Some(depth) => {
                    label.image.insert(key.clone(), value);
                }
                _ if depth == 0 => {
                    label.top.insert(key.clone(), value);
                }
                _ => {}
            }
        }
        label
    }

    fn image_u64(&self, key: &str) -> Option<u64> {
        self.image.get(key).and_then(|v| parse_number(v))
    }

    fn top_u64(&self, key: &str) -> Option<u64> {
        self.top.get(key).and_then(|v| parse_number(v))
    }

    fn any_u64(&self, key: &str) -> Option<u64> {
        self.image_u64(key).or_else(|| self.top_u64(key))
    }

    fn require_u32(&self, key: &str) -> Result<u32, DecodeError> {
        self.any_u64(key)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| DecodeError::Label(format!("missing or invalid {key}")))
    }
}

/// Strip quotes and `<UNIT>` suffixes from an ODL value.
fn clean_value(raw: &str) -> String {
    raw.trim().trim_matches('"').trim().to_string()
}

/// Leading integer of an ODL value, ignoring any `<UNIT>`.
fn parse_number(value: &str) -> Option<u64> {
    value
        .split(|c: char| c.is_whitespace() || c == '<')
        .next()
        .and_then(|n| n.trim().parse::<u64>().ok())
}

fn pds3_sample_type(sample_type: &str, bits: u64) -> Result<(SampleType, ByteOrder), DecodeError> {
    let t = sample_type.to_ascii_uppercase().replace(' ', "_");
    let unsupported = || DecodeError::Unsupported(format!("{bits}-bit {t} samples"));

    if matches!(t.as_str(), "VAX_REAL" | "VAXG_REAL" | "VAX_DOUBLE") {
        return Err(unsupported());
    }
    let real = t.contains("REAL") || t == "FLOAT";
    let unsigned = t.contains("UNSIGNED");
    let order = if t.starts_with("LSB") || t.starts_with("PC_") || t.starts_with("VAX") {
        ByteOrder::Little
    } else {
        ByteOrder::Big
    };

    let sample = match (bits, real, unsigned) {
        // PDS3 8-bit data is conventionally read as unsigned.
        (8, false, _) => SampleType::U8,
        (16, false, true) => SampleType::U16,
        (16, false, false) => SampleType::I16,
        (32, false, true) => SampleType::U32,
        (32, false, false) => SampleType::I32,
        (32, true, _) => SampleType::F32,
        (64, true, _) => SampleType::F64,
        _ => return Err(unsupported()),
    };
    Ok((sample, order))
}

fn pds3_interleave(value: Option<&String>) -> Result<Interleave, DecodeError> {
    match value.map(|v| v.to_ascii_uppercase()) {
        None => Ok(Interleave::BandSequential),
        Some(v) if v == "BAND_SEQUENTIAL" => Ok(Interleave::BandSequential),
        Some(v) if v == "LINE_INTERLEAVED" => Ok(Interleave::LineInterleaved),
        Some(v) if v == "SAMPLE_INTERLEAVED" => Ok(Interleave::SampleInterleaved),
        Some(v) => Err(DecodeError::Unsupported(format!("BAND_STORAGE_TYPE {v}"))),
    }
}

/// Resolve an attached `^IMAGE` pointer to a 0-based byte offset.
fn pds3_image_offset(pointer: &str, record_bytes: Option<u64>) -> Result<u64, DecodeError> {
    let p = pointer.trim();
    if p.starts_with('(') || p.starts_with('"') || p.chars().next().is_some_and(char::is_alphabetic) {
        return Err(DecodeError::Unsupported(format!(
            "detached image pointer {p}"
        )));
    }
    let n = parse_number(p).ok_or_else(|| DecodeError::Label(format!("bad ^IMAGE value {p}")))?;
    if n == 0 {
        return Err(DecodeError::Label("^IMAGE is 1-based, got 0".into()));
    }
    if p.to_ascii_uppercase().contains("<BYTES>") {
        Ok(n - 1)
    } else {
        let rb = record_bytes.ok_or_else(|| DecodeError::Label("^IMAGE in records but no RECORD_BYTES".into()))?;
        Ok((n - 1).saturating_mul(rb))
    }
}

/// Full attached-label PDS3 decoder.
#[derive(Debug, Clone, Copy)]
pub struct Pds3LabelDecoder {
    pub memory_limit: u64,
}

impl Pds3LabelDecoder {
    fn spec(label: &Pds3Label) -> Result<ImageSpec, DecodeError> {
        if label.image.is_empty() {
            return Err(DecodeError::Label("no OBJECT = IMAGE in label".into()));
        }
        let pointer = label
            .top
            .get("^IMAGE")
            .ok_or_else(|| DecodeError::Label("no ^IMAGE pointer".into()))?;
        let offset = pds3_image_offset(pointer, label.top_u64("RECORD_BYTES"))?;
        let bits = label
            .image_u64("SAMPLE_BITS")
            .ok_or_else(|| DecodeError::Label("missing SAMPLE_BITS".into()))?;
        let sample_type = label
            .image
            .get("SAMPLE_TYPE")
            .ok_or_else(|| DecodeError::Label("missing SAMPLE_TYPE".into()))?;
        let (sample, order) = pds3_sample_type(sample_type, bits)?;

        Ok(ImageSpec {
            width: label.require_u32("LINE_SAMPLES")?,
            height: label.require_u32("LINES")?,
            bands: label
                .image_u64("BANDS")
                .map_or(Ok(1), |b| u32::try_from(b).map_err(|_| DecodeError::Label("BANDS out of range".into())))?,
            sample,
            order,
            interleave: pds3_interleave(label.image.get("BAND_STORAGE_TYPE"))?,
            offset,
            line_prefix: label.image_u64("LINE_PREFIX_BYTES").unwrap_or(0),
            line_suffix: label.image_u64("LINE_SUFFIX_BYTES").unwrap_or(0),
        })
    }
}

impl Decoder for Pds3LabelDecoder {
    fn name(&self) -> &'static str {
        "pds3-label"
    }

    fn decode(&self, path: &Path) -> Result<RasterBuffer, DecodeError> {
        let label = Pds3Label::parse(&read_label_bytes(path)?);
        let spec = Self::spec(&label)?;
        read_image(path, &spec, self.memory_limit)
    }
}

/// Permissive PDS3 decoder: trusts only the label size and the image
/// dimensions, and reads single-band 8-bit samples right after the label.
#[derive(Debug, Clone, Copy)]
pub struct Pds3HeuristicDecoder {
    pub memory_limit: u64,
}

impl Decoder for Pds3HeuristicDecoder {
    fn name(&self) -> &'static str {
        "pds3-heuristic"
    }

    fn decode(&self, path: &Path) -> Result<RasterBuffer, DecodeError> {
        let label = Pds3Label::parse(&read_label_bytes(path)?);
        let offset = match (label.top_u64("LABEL_RECORDS"), label.top_u64("RECORD_BYTES")) {
            (Some(records), Some(bytes)) => records.saturating_mul(bytes),
            _ => label
                .end_offset
                .ok_or_else(|| DecodeError::Label("no END statement and no LABEL_RECORDS".into()))?,
        };
        let spec = ImageSpec {
            width: label.require_u32("LINE_SAMPLES")?,
            height: label.require_u32("LINES")?,
            bands: 1,
            sample: SampleType::U8,
            order: ByteOrder::Big,
            interleave: Interleave::BandSequential,
            offset,
            line_prefix: 0,
            line_suffix: 0,
        };
        read_image(path, &spec, self.memory_limit)
    }
}

// ── PDS4 ──────────────────────────────────────────────────────────────────

// Elements may carry a namespace prefix (`<pds:offset>`).
static PDS4_ARRAY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?s)<(?:\w+:)?(Array_[23]D(?:_Image)?)\b[^>]*>(.*?)</(?:\w+:)?Array_[23]D(?:_Image)?>",
    )
    .expect("valid regex")
});
static PDS4_OFFSET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(?:\w+:)?offset\b[^>]*>\s*(\d+)\s*</(?:\w+:)?offset>").expect("valid regex")
});
static PDS4_DATA_TYPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(?:\w+:)?data_type>\s*(\w+)\s*</(?:\w+:)?data_type>").expect("valid regex")
});
static PDS4_AXIS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<(?:\w+:)?Axis_Array>(.*?)</(?:\w+:)?Axis_Array>").expect("valid regex")
});
static PDS4_AXIS_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(?:\w+:)?axis_name>\s*(\w+)\s*</(?:\w+:)?axis_name>").expect("valid regex")
});
static PDS4_ELEMENTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(?:\w+:)?elements>\s*(\d+)\s*</(?:\w+:)?elements>").expect("valid regex")
});
static PDS4_SEQUENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(?:\w+:)?sequence_number>\s*(\d+)\s*</(?:\w+:)?sequence_number>")
        .expect("valid regex")
});

fn pds4_data_type(name: &str) -> Result<(SampleType, ByteOrder), DecodeError> {
    use ByteOrder::{Big, Little};
    Ok(match name {
        "UnsignedByte" => (SampleType::U8, Big),
        "SignedByte" => (SampleType::I8, Big),
        "UnsignedMSB2" => (SampleType::U16, Big),
        "UnsignedLSB2" => (SampleType::U16, Little),
        "SignedMSB2" => (SampleType::I16, Big),
        "SignedLSB2" => (SampleType::I16, Little),
        "UnsignedMSB4" => (SampleType::U32, Big),
        "UnsignedLSB4" => (SampleType::U32, Little),
        "SignedMSB4" => (SampleType::I32, Big),
        "SignedLSB4" => (SampleType::I32, Little),
        "IEEE754MSBSingle" => (SampleType::F32, Big),
        "IEEE754LSBSingle" => (SampleType::F32, Little),
        "IEEE754MSBDouble" => (SampleType::F64, Big),
        "IEEE754LSBDouble" => (SampleType::F64, Little),
        other => return Err(DecodeError::Unsupported(format!("PDS4 data_type {other}"))),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Line,
    Sample,
    Band,
}

fn pds4_spec(label: &str) -> Result<ImageSpec, DecodeError> {
    let array = PDS4_ARRAY
        .captures(label)
        .ok_or_else(|| DecodeError::Label("no Array_2D/Array_3D image in PDS4 label".into()))?;
    let body = &array[2];

    let offset = PDS4_OFFSET
        .captures(body)
        .and_then(|c| c[1].parse::<u64>().ok())
        .ok_or_else(|| DecodeError::Label("array has no offset".into()))?;
    let data_type = PDS4_DATA_TYPE
        .captures(body)
        .map(|c| c[1].to_string())
        .ok_or_else(|| DecodeError::Label("array has no data_type".into()))?;
    let (sample, order) = pds4_data_type(&data_type)?;

    let mut axes: Vec<(u64, Axis, u32)> = Vec::new();
    for (i, axis) in PDS4_AXIS.captures_iter(body).enumerate() {
        let block = &axis[1];
        let name = PDS4_AXIS_NAME
            .captures(block)
            .map(|c| c[1].to_ascii_lowercase())
            .ok_or_else(|| DecodeError::Label("Axis_Array without axis_name".into()))?;
        let kind = match name.as_str() {
            "line" => Axis::Line,
            "sample" => Axis::Sample,
            "band" => Axis::Band,
            other => return Err(DecodeError::Unsupported(format!("axis {other}"))),
        };
        let elements = PDS4_ELEMENTS
            .captures(block)
            .and_then(|c| c[1].parse::<u32>().ok())
            .ok_or_else(|| DecodeError::Label(format!("axis {name} has no elements")))?;
        let sequence = PDS4_SEQUENCE
            .captures(block)
            .and_then(|c| c[1].parse::<u64>().ok())
            .unwrap_or(i as u64 + 1);
        axes.push((sequence, kind, elements));
    }
    axes.sort_by_key(|(seq, _, _)| *seq);

    let order_of: Vec<Axis> = axes.iter().map(|(_, kind, _)| *kind).collect();
    let size_of = |want: Axis| axes.iter().find(|(_, k, _)| *k == want).map(|(_, _, n)| *n);

    let interleave = match order_of.as_slice() {
        [Axis::Line, Axis::Sample] | [Axis::Band, Axis::Line, Axis::Sample] => Interleave::BandSequential,
        [Axis::Line, Axis::Band, Axis::Sample] => Interleave::LineInterleaved,
        [Axis::Line, Axis::Sample, Axis::Band] => Interleave::SampleInterleaved,
        other => {
            return Err(DecodeError::Unsupported(format!("axis order {other:?}")));
        }
    };

    Ok(ImageSpec {
        width: size_of(Axis::Sample).ok_or_else(|| DecodeError::Label("no Sample axis".into()))?,
        height: size_of(Axis::Line).ok_or_else(|| DecodeError::Label("no Line axis".into()))?,
        bands: size_of(Axis::Band).unwrap_or(1),
        sample,
        order,
        interleave,
        offset,
        line_prefix: 0,
        line_suffix: 0,
    })
}

/// PDS4 decoder for products whose XML label is attached to the data.
#[derive(Debug, Clone, Copy)]
pub struct Pds4Decoder {
    pub memory_limit: u64,
}

impl Decoder for Pds4Decoder {
    fn name(&self) -> &'static str {
        "pds4-xml"
    }

    fn decode(&self, path: &Path) -> Result<RasterBuffer, DecodeError> {
        let label = latin1(&read_label_bytes(path)?);
        let spec = pds4_spec(&label)?;
        read_image(path, &spec, self.memory_limit)
    }
}
