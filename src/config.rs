//! Configuration types for the download-and-convert pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`] or loaded from a JSON document. The struct is
//! constructed once at process start and handed to [`crate::process::Pipeline::new`];
//! nothing reads settings from global state, so two pipelines with different
//! configs can live side by side (tests rely on this).
//!
//! Every field has a default and the serde representation uses
//! `#[serde(default)]`, so a config file only needs the keys it overrides.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Configuration for a [`crate::process::Pipeline`].
///
/// # Example
/// ```rust
/// use pds2web::{OutputFormat, PipelineConfig};
///
/// let config = PipelineConfig::builder()
///     .cache_dir("/var/cache/pds2web")
///     .output_format(OutputFormat::Png)
///     .max_retries(3)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_retries, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root directory of the artifact cache. Default: `./cache`.
    pub cache_dir: PathBuf,

    /// Directory for in-flight downloads. Default: the system temp dir.
    pub temp_dir: Option<PathBuf>,

    /// Output raster format. Default: [`OutputFormat::Tiff`].
    pub output_format: OutputFormat,

    /// PNG compression level, 0–9. Default: 6.
    pub png_compression: u8,

    /// JPEG quality, 1–100. Default: 95.
    pub jpeg_quality: u8,

    /// Apply the enhancement chain after normalization. Default: true.
    pub enhance: bool,

    /// Individual enhancement toggles and factors.
    pub enhance_options: EnhanceOptions,

    /// Stretch between percentiles rather than min/max. Default: true.
    ///
    /// Planetary frames routinely carry a handful of saturated or dead pixels;
    /// a min/max stretch lets those few values flatten everything else to mid-grey.
    pub normalize_percentiles: bool,

    /// Lower stretch percentile. Default: 2.0.
    pub percentile_low: f64,

    /// Upper stretch percentile. Default: 98.0.
    pub percentile_high: f64,

    /// Allow the streaming encoder backend. Default: true.
    pub streaming_backend: bool,

    /// Pixel count above which encoding goes through the streaming backend.
    /// Default: 10 000 000.
    pub streaming_threshold_pixels: u64,

    /// Upper bound on the decoded sample buffer, in MiB. Default: 2000.
    pub memory_limit_mb: u64,

    /// Longest output edge when the caller does not specify one. Default: 8192.
    pub default_max_dimension: Option<u32>,

    /// Largest accepted source, in bytes. Default: 500 MiB.
    pub max_input_bytes: u64,

    /// Bytes read before classifying the source. Default: 10 000.
    pub detection_window_bytes: usize,

    /// Retries per logical download after the first attempt. Default: 5.
    pub max_retries: u32,

    /// Backoff base: the n-th retry waits `backoff_factor^n` seconds. Default: 2.0.
    pub backoff_factor: f64,

    /// TCP connect timeout in seconds. Default: 30.
    pub connect_timeout_secs: u64,

    /// Per-read idle timeout for transfers, and whole-request timeout for the
    /// HEAD probe, in seconds. Default: 300.
    ///
    /// A transfer that keeps receiving bytes is never cut off by it. Exceeding
    /// it counts as a transient failure and feeds the retry loop.
    pub request_timeout_secs: u64,

    /// Try the secondary decoder when the primary one fails. Default: true.
    pub use_fallback_decoders: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("cache"),
            temp_dir: None,
            output_format: OutputFormat::default(),
            png_compression: 6,
            jpeg_quality: 95,
            enhance: true,
            enhance_options: EnhanceOptions::default(),
            normalize_percentiles: true,
            percentile_low: 2.0,
            percentile_high: 98.0,
            streaming_backend: true,
            streaming_threshold_pixels: 10_000_000,
            memory_limit_mb: 2000,
            default_max_dimension: Some(8192),
            max_input_bytes: 500 * 1024 * 1024,
            detection_window_bytes: 10_000,
            max_retries: 5,
            backoff_factor: 2.0,
            connect_timeout_secs: 30,
            request_timeout_secs: 300,
            use_fallback_decoders: true,
        }
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Parse a (possibly partial) JSON document; missing keys keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, PipelineError> {
        let config: PipelineConfig = serde_json::from_str(json)
            .map_err(|e| PipelineError::InvalidConfig(format!("config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::InvalidConfig(format!("cannot read '{}': {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    /// Directory for in-flight downloads.
    pub fn scratch_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Upper bound on decoded samples in bytes.
    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb.saturating_mul(1024 * 1024)
    }

    /// Check value ranges; called by `build` and the JSON loaders.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.png_compression > 9 {
            return Err(PipelineError::InvalidConfig(format!(
                "PNG compression must be 0–9, got {}",
                self.png_compression
            )));
        }
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(PipelineError::InvalidConfig(format!(
                "JPEG quality must be 1–100, got {}",
                self.jpeg_quality
            )));
        }
        if !(0.0..100.0).contains(&self.percentile_low)
            || !(0.0..=100.0).contains(&self.percentile_high)
            || self.percentile_low >= self.percentile_high
        {
            return Err(PipelineError::InvalidConfig(format!(
                "percentiles must satisfy 0 ≤ low < high ≤ 100, got {}/{}",
                self.percentile_low, self.percentile_high
            )));
        }
        if self.detection_window_bytes == 0 {
            return Err(PipelineError::InvalidConfig(
                "detection window must be ≥ 1 byte".into(),
            ));
        }
        if !(self.backoff_factor.is_finite() && self.backoff_factor >= 0.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "backoff factor must be a non-negative number, got {}",
                self.backoff_factor
            )));
        }
        if self.default_max_dimension == Some(0) {
            return Err(PipelineError::InvalidConfig(
                "default max dimension must be ≥ 1".into(),
            ));
        }
        if self.enhance_options.tile_grid == 0 {
            return Err(PipelineError::InvalidConfig(
                "equalization tile grid must be ≥ 1".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = dir.into();
        self
    }

    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.temp_dir = Some(dir.into());
        self
    }

    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.config.output_format = format;
        self
    }

    pub fn png_compression(mut self, level: u8) -> Self {
        self.config.png_compression = level.min(9);
        self
    }

    pub fn jpeg_quality(mut self, quality: u8) -> Self {
        self.config.jpeg_quality = quality.clamp(1, 100);
        self
    }

    pub fn enhance(mut self, v: bool) -> Self {
        self.config.enhance = v;
        self
    }

    pub fn enhance_options(mut self, options: EnhanceOptions) -> Self {
        self.config.enhance_options = options;
        self
    }

    pub fn normalize_percentiles(mut self, v: bool) -> Self {
        self.config.normalize_percentiles = v;
        self
    }

    pub fn percentiles(mut self, low: f64, high: f64) -> Self {
        self.config.percentile_low = low;
        self.config.percentile_high = high;
        self
    }

    pub fn streaming_backend(mut self, v: bool) -> Self {
        self.config.streaming_backend = v;
        self
    }

    pub fn streaming_threshold_pixels(mut self, px: u64) -> Self {
        self.config.streaming_threshold_pixels = px;
        self
    }

    pub fn memory_limit_mb(mut self, mb: u64) -> Self {
        self.config.memory_limit_mb = mb.max(1);
        self
    }

    pub fn default_max_dimension(mut self, px: Option<u32>) -> Self {
        self.config.default_max_dimension = px;
        self
    }

    pub fn max_input_bytes(mut self, bytes: u64) -> Self {
        self.config.max_input_bytes = bytes;
        self
    }

    pub fn detection_window_bytes(mut self, bytes: usize) -> Self {
        self.config.detection_window_bytes = bytes.max(1);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.config.backoff_factor = factor;
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.connect_timeout_secs = secs;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    pub fn use_fallback_decoders(mut self, v: bool) -> Self {
        self.config.use_fallback_decoders = v;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ── Enums and option groups ──────────────────────────────────────────────

/// Output raster format written into the cache.
///
/// TIFF is the default because it keeps the 8-bit stretch lossless and is what
/// downstream viewers for planetary products expect; PNG/JPEG/WebP trade that
/// for browser friendliness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Tiff,
    Png,
    Jpeg,
    Webp,
}

impl OutputFormat {
    /// File extension used for cache entries.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Tiff => "tif",
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Webp => "webp",
        }
    }

    /// IANA media type.
    pub fn media_type(self) -> &'static str {
        match self {
            OutputFormat::Tiff => "image/tiff",
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Webp => "image/webp",
        }
    }

    /// The matching `image` crate format.
    pub fn image_format(self) -> image::ImageFormat {
        match self {
            OutputFormat::Tiff => image::ImageFormat::Tiff,
            OutputFormat::Png => image::ImageFormat::Png,
            OutputFormat::Jpeg => image::ImageFormat::Jpeg,
            OutputFormat::Webp => image::ImageFormat::WebP,
        }
    }

    pub fn all() -> [OutputFormat; 4] {
        [
            OutputFormat::Tiff,
            OutputFormat::Png,
            OutputFormat::Jpeg,
            OutputFormat::Webp,
        ]
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutputFormat::Tiff => "tiff",
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Webp => "webp",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tif" | "tiff" => Ok(OutputFormat::Tiff),
            "png" => Ok(OutputFormat::Png),
            "jpg" | "jpeg" => Ok(OutputFormat::Jpeg),
            "webp" => Ok(OutputFormat::Webp),
            other => Err(PipelineError::InvalidConfig(format!(
                "unknown output format '{other}' (expected tiff, png, jpeg or webp)"
            ))),
        }
    }
}

/// Enhancement toggles; each step can be switched off on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhanceOptions {
    /// Contrast-limited local histogram equalization. Default: true.
    pub local_equalization: bool,
    /// Histogram clip limit, as a multiple of the mean bin height. Default: 2.0.
    pub clip_limit: f32,
    /// Tiles per side for local equalization. Default: 8.
    pub tile_grid: u32,
    /// Default: true.
    pub contrast: bool,
    /// 1.0 = unchanged, >1.0 = more contrast. Default: 1.15.
    pub contrast_factor: f32,
    /// Default: true.
    pub sharpness: bool,
    /// 1.0 = unchanged, >1.0 = sharper. Default: 1.1.
    pub sharpness_factor: f32,
}

impl Default for EnhanceOptions {
    fn default() -> Self {
        Self {
            local_equalization: true,
            clip_limit: 2.0,
            tile_grid: 8,
            contrast: true,
            contrast_factor: 1.15,
            sharpness: true,
            sharpness_factor: 1.1,
        }
    }
}

impl EnhanceOptions {
    /// All steps off; normalization still runs.
    pub fn none() -> Self {
        Self {
            local_equalization: false,
            contrast: false,
            sharpness: false,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = PipelineConfig::default();
        assert_eq!(c.output_format, OutputFormat::Tiff);
        assert_eq!(c.max_retries, 5);
        assert_eq!(c.backoff_factor, 2.0);
        assert_eq!(c.max_input_bytes, 500 * 1024 * 1024);
        assert_eq!(c.detection_window_bytes, 10_000);
        assert_eq!(c.streaming_threshold_pixels, 10_000_000);
        assert_eq!(c.default_max_dimension, Some(8192));
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let c = PipelineConfig::from_json_str(
            r#"{ "output_format": "png", "enhance_options": { "contrast_factor": 1.3 } }"#,
        )
        .unwrap();
        assert_eq!(c.output_format, OutputFormat::Png);
        assert_eq!(c.enhance_options.contrast_factor, 1.3);
        assert!(c.enhance_options.local_equalization);
        assert_eq!(c.jpeg_quality, 95);
        assert_eq!(c.max_retries, 5);
    }

    #[test]
    fn invalid_json_values_rejected() {
        let err = PipelineConfig::from_json_str(r#"{ "png_compression": 12 }"#).unwrap_err();
        assert!(err.to_string().contains("PNG compression"));

        let err =
            PipelineConfig::from_json_str(r#"{ "percentile_low": 90, "percentile_high": 10 }"#)
                .unwrap_err();
        assert!(err.to_string().contains("percentiles"));
    }

    #[test]
    fn builder_clamps() {
        let c = PipelineConfig::builder()
            .png_compression(42)
            .jpeg_quality(0)
            .detection_window_bytes(0)
            .build()
            .unwrap();
        assert_eq!(c.png_compression, 9);
        assert_eq!(c.jpeg_quality, 1);
        assert_eq!(c.detection_window_bytes, 1);
    }

    #[test]
    fn builder_rejects_negative_backoff() {
        assert!(PipelineConfig::builder().backoff_factor(-1.0).build().is_err());
    }

    #[test]
    fn output_format_parsing() {
        assert_eq!("TIF".parse::<OutputFormat>().unwrap(), OutputFormat::Tiff);
        assert_eq!("jpg".parse::<OutputFormat>().unwrap(), OutputFormat::Jpeg);
        assert!("bmp".parse::<OutputFormat>().is_err());
        assert_eq!(OutputFormat::Webp.media_type(), "image/webp");
        assert_eq!(OutputFormat::Tiff.extension(), "tif");
    }

    #[test]
    fn config_round_trips_through_json() {
        let c = PipelineConfig::builder()
            .output_format(OutputFormat::Jpeg)
            .build()
            .unwrap();
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(PipelineConfig::from_json_str(&json).unwrap(), c);
    }
}
