//! Image encoding: 8-bit `DynamicImage` → TIFF / PNG / JPEG / WebP file.
//!
//! Two backends share one encoder routine, so their output is the same bytes:
//!
//! * [`EncodeBackend::Reference`] encodes into memory and writes the file in
//!   one call. Simple, and the buffer is small for typical frames.
//! * [`EncodeBackend::Streaming`] encodes straight into a buffered file and
//!   never holds the encoded image in memory, which matters for
//!   mosaics of tens of megapixels.
//!
//! Which backend runs is decided by [`EncoderCapabilities`], computed once
//! when the gateway is built.

use crate::config::{OutputFormat, PipelineConfig};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::tiff::TiffEncoder;
use image::codecs::webp::WebPEncoder;
use image::DynamicImage;
use std::fs::File;
use std::io::{BufWriter, Cursor, Seek, Write};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("{0}")]
    Image(#[from] image::ImageError),

    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeBackend {
    Reference,
    Streaming,
}

/// Encoder settings for one conversion: the requested format plus the
/// configured quality knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeSettings {
    pub format: OutputFormat,
    pub png_compression: u8,
    pub jpeg_quality: u8,
}

/// What the linked encoder can do, probed once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCapabilities {
    formats: Vec<OutputFormat>,
    streaming: bool,
    streaming_threshold_pixels: u64,
}

impl EncoderCapabilities {
    pub fn probe(config: &PipelineConfig) -> Self {
        let formats: Vec<OutputFormat> = OutputFormat::all()
            .into_iter()
            .filter(|f| f.image_format().writing_enabled())
            .collect();
        debug!(
            "Encoder formats: {:?}, streaming backend: {}",
            formats, config.streaming_backend
        );
        Self {
            formats,
            streaming: config.streaming_backend,
            streaming_threshold_pixels: config.streaming_threshold_pixels,
        }
    }

    pub fn supports(&self, format: OutputFormat) -> bool {
        self.formats.contains(&format)
    }

    pub fn formats(&self) -> &[OutputFormat] {
        &self.formats
    }

    /// Backend for an image of `pixels` pixels.
    pub fn backend_for(&self, pixels: u64) -> EncodeBackend {
        if self.streaming && pixels > self.streaming_threshold_pixels {
            EncodeBackend::Streaming
        } else {
            EncodeBackend::Reference
        }
    }
}

fn png_compression(level: u8) -> CompressionType {
    match level {
        0..=3 => CompressionType::Fast,
        4..=6 => CompressionType::Default,
        _ => CompressionType::Best,
    }
}

/// Encode `img` into any seekable writer.
pub fn encode_into<W: Write + Seek>(
    img: &DynamicImage,
    settings: &EncodeSettings,
    writer: &mut W,
) -> Result<(), EncodeError> {
    match settings.format {
        OutputFormat::Tiff => img.write_with_encoder(TiffEncoder::new(writer))?,
        OutputFormat::Png => img.write_with_encoder(PngEncoder::new_with_quality(
            writer,
            png_compression(settings.png_compression),
            FilterType::Adaptive,
        ))?,
        OutputFormat::Jpeg => {
            img.write_with_encoder(JpegEncoder::new_with_quality(writer, settings.jpeg_quality))?
        }
        OutputFormat::Webp => img.write_with_encoder(WebPEncoder::new_lossless(writer))?,
    }
    Ok(())
}

/// Encode `img` to `path` through `backend`. Returns the file size.
pub fn encode_to_path(
    img: &DynamicImage,
    path: &Path,
    settings: &EncodeSettings,
    backend: EncodeBackend,
) -> Result<u64, EncodeError> {
    match backend {
        EncodeBackend::Reference => {
            let mut buf = Cursor::new(Vec::new());
            encode_into(img, settings, &mut buf)?;
            let bytes = buf.into_inner();
            std::fs::write(path, &bytes)?;
            debug!("Encoded {} → {} bytes (in memory)", settings.format, bytes.len());
            Ok(bytes.len() as u64)
        }
        EncodeBackend::Streaming => {
            let mut writer = BufWriter::new(File::create(path)?);
            encode_into(img, settings, &mut writer)?;
            writer.flush()?;
            let len = writer.get_ref().metadata()?.len();
            debug!("Encoded {} → {} bytes (streamed)", settings.format, len);
            Ok(len)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, GrayImage, Luma};

    fn gradient() -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(40, 24, |x, y| Luma([(x * 6 + y) as u8])))
    }

    fn settings(format: OutputFormat) -> EncodeSettings {
        EncodeSettings {
            format,
            png_compression: 6,
            jpeg_quality: 95,
        }
    }

    #[test]
    fn every_format_round_trips_dimensions() {
        let img = gradient();
        for format in OutputFormat::all() {
            let mut buf = Cursor::new(Vec::new());
            encode_into(&img, &settings(format), &mut buf).expect("encode should succeed");
            let decoded = image::load_from_memory_with_format(buf.get_ref(), format.image_format())
                .expect("decodable output");
            assert_eq!(decoded.dimensions(), (40, 24), "{format}");
        }
    }

    #[test]
    fn lossless_formats_preserve_pixels() {
        let img = gradient();
        for format in [OutputFormat::Tiff, OutputFormat::Png, OutputFormat::Webp] {
            let mut buf = Cursor::new(Vec::new());
            encode_into(&img, &settings(format), &mut buf).unwrap();
            let decoded = image::load_from_memory_with_format(buf.get_ref(), format.image_format()).unwrap();
            assert_eq!(decoded.to_luma8().as_raw(), img.to_luma8().as_raw(), "{format}");
        }
    }

    #[test]
    fn backends_write_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let img = gradient();
        for format in [OutputFormat::Tiff, OutputFormat::Png] {
            let a = dir.path().join(format!("ref.{}", format.extension()));
            let b = dir.path().join(format!("stream.{}", format.extension()));
            let la = encode_to_path(&img, &a, &settings(format), EncodeBackend::Reference).unwrap();
            let lb = encode_to_path(&img, &b, &settings(format), EncodeBackend::Streaming).unwrap();
            assert_eq!(la, lb);
            assert_eq!(std::fs::read(a).unwrap(), std::fs::read(b).unwrap());
        }
    }

    #[test]
    fn capabilities_pick_backend_by_pixel_count() {
        let config = PipelineConfig::builder()
            .streaming_threshold_pixels(1000)
            .build()
            .unwrap();
        let caps = EncoderCapabilities::probe(&config);
        assert!(OutputFormat::all().iter().all(|f| caps.supports(*f)));
        assert_eq!(caps.backend_for(1000), EncodeBackend::Reference);
        assert_eq!(caps.backend_for(1001), EncodeBackend::Streaming);

        let no_streaming = PipelineConfig::builder()
            .streaming_threshold_pixels(1000)
            .streaming_backend(false)
            .build()
            .unwrap();
        assert_eq!(
            EncoderCapabilities::probe(&no_streaming).backend_for(1_000_000),
            EncodeBackend::Reference
        );
    }
}
