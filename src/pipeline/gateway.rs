//! Conversion gateway: local PDS product → encoded web raster.
//!
//! ## Stages
//!
//! ```text
//! decode ──▶ normalize ──▶ (pre-shrink) ──▶ enhance ──▶ resize ──▶ encode
//! ```
//!
//! Every failure is a [`ConversionError`] naming its stage; nothing panics
//! across this boundary. The work is CPU-bound, so [`ConversionGateway::convert_async`]
//! runs it on the blocking thread pool.
//!
//! ## Why shrink twice?
//!
//! Local equalization is quadratic-ish in tile size and the enhancement
//! passes allocate a full copy of the image. When the source is more than
//! twice the requested size, it is first brought down to `2 × max_dimension`
//! so enhancement never runs on pixels that the final resize throws away,
//! while the last Lanczos pass still has headroom to keep edges clean.

use crate::config::{EnhanceOptions, OutputFormat, PipelineConfig};
use crate::error::{ConversionError, ConversionStage, PipelineError};
use crate::pipeline::decode::DecoderChain;
use crate::pipeline::encode::{self, EncodeBackend, EncodeSettings, EncoderCapabilities};
use crate::pipeline::enhance::{self, Stretch};
use crate::pipeline::sniff::FormatClassification;
use image::imageops::FilterType;
use image::DynamicImage;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// One conversion, consumed exactly once by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionJob {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub source_format: FormatClassification,
    pub target_format: OutputFormat,
    pub enhance: bool,
    pub max_dimension: Option<u32>,
}

/// What a successful conversion produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionReport {
    pub source_width: u32,
    pub source_height: u32,
    pub width: u32,
    pub height: u32,
    pub decoder: &'static str,
    pub backend: EncodeBackend,
    pub bytes_written: u64,
}

#[derive(Debug)]
pub struct ConversionGateway {
    capabilities: EncoderCapabilities,
    png_compression: u8,
    jpeg_quality: u8,
    stretch: Stretch,
    enhance_options: EnhanceOptions,
    memory_limit: u64,
    use_fallback: bool,
}

impl ConversionGateway {
    /// Probe encoder capabilities and fail early if the configured output
    /// format cannot be written.
    pub fn new(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let capabilities = EncoderCapabilities::probe(config);
        if !capabilities.supports(config.output_format) {
            return Err(PipelineError::InvalidConfig(format!(
                "output format {} is not supported by this build (available: {:?})",
                config.output_format,
                capabilities.formats()
            )));
        }
        Ok(Self {
            capabilities,
            png_compression: config.png_compression,
            jpeg_quality: config.jpeg_quality,
            stretch: Stretch {
                percentiles: config.normalize_percentiles,
                low: config.percentile_low,
                high: config.percentile_high,
            },
            enhance_options: config.enhance_options.clone(),
            memory_limit: config.memory_limit_bytes(),
            use_fallback: config.use_fallback_decoders,
        })
    }

    pub fn capabilities(&self) -> &EncoderCapabilities {
        &self.capabilities
    }

    /// Run `job` on the blocking pool.
    pub async fn convert_async(
        self: &Arc<Self>,
        job: ConversionJob,
    ) -> Result<ConversionReport, ConversionError> {
        let gateway = Arc::clone(self);
        tokio::task::spawn_blocking(move || gateway.convert(&job))
            .await
            .map_err(|e| ConversionError::new(ConversionStage::Encode, format!("conversion task panicked: {e}")))?
    }

    /// Convert synchronously. Writes only to `job.output_path`.
    pub fn convert(&self, job: &ConversionJob) -> Result<ConversionReport, ConversionError> {
        let start = Instant::now();

        if job.max_dimension == Some(0) {
            return Err(ConversionError::new(ConversionStage::Resize, "max_dimension must be at least 1"));
        }
        if !self.capabilities.supports(job.target_format) {
            return Err(ConversionError::new(
                ConversionStage::Encode,
                format!("{} output is not available", job.target_format),
            ));
        }

        // ── Decode ───────────────────────────────────────────────────────
        let chain = DecoderChain::for_format(&job.source_format, self.memory_limit, self.use_fallback)
            .ok_or_else(|| {
                ConversionError::new(
                    ConversionStage::Decode,
                    format!("no decoder for {}", job.source_format),
                )
            })?;
        let (raster, decoder) = chain
            .decode(&job.input_path)
            .map_err(|e| ConversionError::new(ConversionStage::Decode, e.to_string()))?;
        let (source_width, source_height) = (raster.width, raster.height);
        info!(
            "Decoded {}x{}x{} with {}",
            raster.width, raster.height, raster.bands, decoder
        );

        // ── Normalize ────────────────────────────────────────────────────
        let mut img = enhance::normalize(&raster, self.stretch).ok_or_else(|| {
            ConversionError::new(
                ConversionStage::Enhance,
                format!(
                    "cannot build an 8-bit image from {}x{}x{} samples",
                    raster.width, raster.height, raster.bands
                ),
            )
        })?;
        drop(raster);

        // ── Resize / enhance ─────────────────────────────────────────────
        if let Some(max) = job.max_dimension {
            let headroom = max.saturating_mul(2);
            if img.width().max(img.height()) > headroom {
                debug!("Pre-shrinking to {} px before enhancement", headroom);
                img = fit(&img, headroom);
            }
        }

        if job.enhance {
            enhance::enhance(&mut img, &self.enhance_options);
        }

        if let Some(max) = job.max_dimension {
            if img.width().max(img.height()) > max {
                img = fit(&img, max);
                debug!("Resized to {}x{}", img.width(), img.height());
            }
        }
        if img.width() == 0 || img.height() == 0 {
            return Err(ConversionError::new(ConversionStage::Resize, "resize produced an empty image"));
        }

        // ── Encode ───────────────────────────────────────────────────────
        let backend = self
            .capabilities
            .backend_for(u64::from(img.width()) * u64::from(img.height()));
        let settings = EncodeSettings {
            format: job.target_format,
            png_compression: self.png_compression,
            jpeg_quality: self.jpeg_quality,
        };
        let bytes_written = encode::encode_to_path(&img, &job.output_path, &settings, backend)
            .map_err(|e| ConversionError::new(ConversionStage::Encode, e.to_string()))?;

        info!(
            "Converted {}x{} → {}x{} {} via {:?} backend in {} ms",
            source_width,
            source_height,
            img.width(),
            img.height(),
            job.target_format,
            backend,
            start.elapsed().as_millis()
        );

        Ok(ConversionReport {
            source_width,
            source_height,
            width: img.width(),
            height: img.height(),
            decoder,
            backend,
            bytes_written,
        })
    }
}

/// Shrink so the longer side is `max`, keeping the aspect ratio.
fn fit(img: &DynamicImage, max: u32) -> DynamicImage {
    img.resize(max, max, FilterType::Lanczos3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pds3_product(lines: u32, samples: u32) -> tempfile::NamedTempFile {
        let mut label = format!(
            "PDS_VERSION_ID = PDS3\r\nRECORD_BYTES = 512\r\nLABEL_RECORDS = 1\r\n^IMAGE = 2\r\n\
             OBJECT = IMAGE\r\n  LINES = {lines}\r\n  LINE_SAMPLES = {samples}\r\n  SAMPLE_BITS = 8\r\n\
             SAMPLE_TYPE = MSB_UNSIGNED_INTEGER\r\nEND_OBJECT = IMAGE\r\nEND\r\n"
        );
        label.extend(std::iter::repeat_n(' ', 512 - label.len()));
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(label.as_bytes()).unwrap();
        let pixels: Vec<u8> = (0..lines * samples).map(|i| (i % 251) as u8).collect();
        f.write_all(&pixels).unwrap();
        f.flush().unwrap();
        f
    }

    fn job(input: &tempfile::NamedTempFile, out: PathBuf, max_dimension: Option<u32>) -> ConversionJob {
        ConversionJob {
            input_path: input.path().to_path_buf(),
            output_path: out,
            source_format: FormatClassification::Pds3,
            target_format: OutputFormat::Png,
            enhance: true,
            max_dimension,
        }
    }

    #[test]
    fn converts_and_downscales_preserving_aspect() {
        let dir = tempfile::tempdir().unwrap();
        let input = pds3_product(60, 120);
        let gateway = ConversionGateway::new(&PipelineConfig::default()).unwrap();

        let report = gateway
            .convert(&job(&input, dir.path().join("out.png"), Some(40)))
            .unwrap();
        assert_eq!((report.source_width, report.source_height), (120, 60));
        assert_eq!((report.width, report.height), (40, 20));
        assert_eq!(report.decoder, "pds3-label");
        assert_eq!(report.backend, EncodeBackend::Reference);

        let written = image::open(dir.path().join("out.png")).unwrap();
        assert_eq!((written.width(), written.height()), (40, 20));
    }

    #[test]
    fn small_images_are_not_upscaled() {
        let dir = tempfile::tempdir().unwrap();
        let input = pds3_product(10, 10);
        let gateway = ConversionGateway::new(&PipelineConfig::default()).unwrap();
        let report = gateway
            .convert(&job(&input, dir.path().join("out.png"), Some(8192)))
            .unwrap();
        assert_eq!((report.width, report.height), (10, 10));
    }

    #[test]
    fn unknown_format_fails_in_decode_stage() {
        let dir = tempfile::tempdir().unwrap();
        let input = pds3_product(4, 4);
        let gateway = ConversionGateway::new(&PipelineConfig::default()).unwrap();
        let mut j = job(&input, dir.path().join("out.png"), None);
        j.source_format = FormatClassification::Unknown;
        let err = gateway.convert(&j).unwrap_err();
        assert_eq!(err.stage, ConversionStage::Decode);
        assert!(!dir.path().join("out.png").exists());
    }

    #[test]
    fn garbage_pds3_fails_in_decode_stage() {
        let dir = tempfile::tempdir().unwrap();
        let mut input = tempfile::NamedTempFile::new().unwrap();
        input.write_all(b"PDS_VERSION_ID = PDS3\r\nnothing useful here\r\n").unwrap();
        let gateway = ConversionGateway::new(&PipelineConfig::default()).unwrap();
        let err = gateway
            .convert(&job(&input, dir.path().join("out.png"), None))
            .unwrap_err();
        assert_eq!(err.stage, ConversionStage::Decode);
    }

    #[test]
    fn zero_max_dimension_fails_in_resize_stage() {
        let dir = tempfile::tempdir().unwrap();
        let input = pds3_product(4, 4);
        let gateway = ConversionGateway::new(&PipelineConfig::default()).unwrap();
        let err = gateway
            .convert(&job(&input, dir.path().join("out.png"), Some(0)))
            .unwrap_err();
        assert_eq!(err.stage, ConversionStage::Resize);
    }

    #[test]
    fn streaming_backend_above_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let input = pds3_product(50, 50);
        let config = PipelineConfig::builder()
            .streaming_threshold_pixels(100)
            .build()
            .unwrap();
        let gateway = ConversionGateway::new(&config).unwrap();
        let mut j = job(&input, dir.path().join("out.tif"), None);
        j.target_format = OutputFormat::Tiff;
        let report = gateway.convert(&j).unwrap();
        assert_eq!(report.backend, EncodeBackend::Streaming);
        assert_eq!(report.bytes_written, std::fs::metadata(dir.path().join("out.tif")).unwrap().len());
    }

    #[tokio::test]
    async fn async_wrapper_runs_on_blocking_pool() {
        let dir = tempfile::tempdir().unwrap();
        let input = pds3_product(16, 16);
        let gateway = Arc::new(ConversionGateway::new(&PipelineConfig::default()).unwrap());
        let report = gateway
            .convert_async(job(&input, dir.path().join("out.png"), None))
            .await
            .unwrap();
        assert_eq!((report.width, report.height), (16, 16));
    }
}
