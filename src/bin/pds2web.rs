//! CLI binary for pds2web.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `PipelineConfig` and prints the resulting artifact.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use pds2web::{
    Artifact, OutputFormat, Pipeline, PipelineConfig, PipelineError, PipelineProgressCallback,
    PipelineStage, ProgressCallback,
};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner while probing, byte bar while downloading, spinner again while
/// converting.
struct CliProgressCallback {
    bar: ProgressBar,
    /// The byte-bar style is installed on the first progress event.
    downloading: AtomicBool,
    started: Instant,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(Self::spinner_style());
        bar.set_prefix("Starting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            downloading: AtomicBool::new(false),
            started: Instant::now(),
        })
    }

    fn spinner_style() -> ProgressStyle {
        ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS)
    }

    fn activate_bar(&self) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {bytes}/{total_bytes}  {bytes_per_sec}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        self.bar.set_style(style);
        self.bar.reset_eta();
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_stage(&self, _url: &str, stage: PipelineStage) {
        let (prefix, msg) = match stage {
            PipelineStage::CacheCheck => ("Cache", "looking up…"),
            PipelineStage::ServedFromCache => ("Cache", "hit"),
            PipelineStage::Probing => ("Probing", "reading label…"),
            PipelineStage::Classifying => ("Probing", "classifying…"),
            PipelineStage::Downloading => ("Download", "connecting…"),
            PipelineStage::Converting => ("Converting", "decode → stretch → encode…"),
            PipelineStage::CachePopulated => ("Cache", "committed"),
        };
        if stage == PipelineStage::Converting && self.downloading.swap(false, Ordering::SeqCst) {
            self.bar.set_style(Self::spinner_style());
        }
        self.bar.set_prefix(prefix);
        self.bar.set_message(msg);
    }

    fn on_download_progress(&self, _url: &str, bytes: u64, total: Option<u64>) {
        if !self.downloading.swap(true, Ordering::SeqCst) {
            self.activate_bar();
        }
        if let Some(t) = total {
            if self.bar.length() != Some(t) {
                self.bar.set_length(t);
            }
        }
        self.bar.set_position(bytes);
    }

    fn on_complete(&self, _url: &str, artifact: &Artifact) {
        self.bar.finish_and_clear();
        let how = match &artifact.source_format {
            None => "cache hit".to_string(),
            Some(src) => format!("{src} → {}", artifact.format),
        };
        eprintln!(
            "{} {}  {}",
            green("✔"),
            bold(&how),
            dim(&format!("{:.1}s", self.started.elapsed().as_secs_f64())),
        );
    }

    fn on_abort(&self, _url: &str, error: &PipelineError) {
        self.bar.finish_and_clear();
        eprintln!("{} {}", red("✘"), red(&format!("{:?}", error.kind())));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Fetch, convert to TIFF and print the cached path
  pds2web https://pds-imaging.jpl.nasa.gov/data/mer/opportunity/1P128287278.IMG

  # Browser-friendly PNG, at most 2048 px on the long edge
  pds2web --format png --max-dimension 2048 <URL>

  # Raw stretch only, no equalization/contrast/sharpening
  pds2web --no-enhance <URL>

  # Machine-readable result
  pds2web --json <URL> | jq .path

  # Settings from a JSON file, overridden by flags
  pds2web --config pds2web.json --retries 2 <URL>

CONFIG FILE (all keys optional):
  {
    "cache_dir": "cache",
    "output_format": "tiff",
    "png_compression": 6,
    "jpeg_quality": 95,
    "enhance": true,
    "enhance_options": { "clip_limit": 2.0, "tile_grid": 8,
                         "contrast_factor": 1.15, "sharpness_factor": 1.1 },
    "max_input_bytes": 524288000,
    "max_retries": 5,
    "backoff_factor": 2.0
  }

ENVIRONMENT VARIABLES:
  PDS2WEB_CONFIG          Path to a JSON config file
  PDS2WEB_CACHE_DIR       Artifact cache directory
  PDS2WEB_TEMP_DIR        Directory for in-flight downloads
  PDS2WEB_FORMAT          tiff, png, jpeg or webp
  RUST_LOG                Overrides the log filter (e.g. pds2web=debug)

Exit status is non-zero on any failure; the cache is never left with a
partial file.
"#;

/// Fetch PDS3/PDS4 planetary images and convert them to web rasters.
#[derive(Parser, Debug)]
#[command(
    name = "pds2web",
    version,
    about = "Fetch PDS3/PDS4 planetary images and convert them to web rasters",
    long_about = "Download a Planetary Data System image product over HTTP(S) with resumable, \
retrying transfers, detect whether it is PDS3 or PDS4, stretch and enhance it, and store \
the result as TIFF, PNG, JPEG or WebP in a content-addressed cache.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// HTTP/HTTPS URL of the PDS product.
    url: String,

    /// JSON config file; flags override its values.
    #[arg(long, env = "PDS2WEB_CONFIG")]
    config: Option<PathBuf>,

    /// Artifact cache directory.
    #[arg(long, env = "PDS2WEB_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Directory for in-flight downloads.
    #[arg(long, env = "PDS2WEB_TEMP_DIR")]
    temp_dir: Option<PathBuf>,

    /// Output format: tiff, png, jpeg, webp.
    #[arg(short, long, env = "PDS2WEB_FORMAT")]
    format: Option<OutputFormat>,

    /// Longest output edge in pixels.
    #[arg(short = 'd', long, env = "PDS2WEB_MAX_DIMENSION",
          value_parser = clap::value_parser!(u32).range(1..))]
    max_dimension: Option<u32>,

    /// Skip equalization, contrast and sharpening.
    #[arg(long, env = "PDS2WEB_NO_ENHANCE")]
    no_enhance: bool,

    /// Retries per download after the first attempt.
    #[arg(long, env = "PDS2WEB_MAX_RETRIES")]
    retries: Option<u32>,

    /// Backoff base: retry n waits backoff^n seconds.
    #[arg(long, env = "PDS2WEB_BACKOFF")]
    backoff: Option<f64>,

    /// Print the artifact as JSON.
    #[arg(long, env = "PDS2WEB_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDS2WEB_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDS2WEB_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDS2WEB_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs; --verbose brings everything back.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli)?;

    let mut pipeline = Pipeline::new(config).context("Failed to initialise pipeline")?;
    if show_progress {
        let cb: ProgressCallback = CliProgressCallback::new();
        pipeline = pipeline.with_progress(cb);
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let artifact = pipeline
        .process(&cli.url, cli.max_dimension)
        .await
        .with_context(|| format!("Failed to process {}", cli.url))?;

    if cli.json {
        let json = serde_json::to_string_pretty(&artifact).context("Failed to serialise artifact")?;
        println!("{json}");
    } else {
        println!("{}", artifact.path.display());
        if !cli.quiet {
            eprintln!(
                "   {}  {}  {}",
                cyan(artifact.media_type),
                dim(&artifact.key.to_string()),
                if artifact.cache_hit {
                    dim("(cached)")
                } else {
                    dim("(new)")
                },
            );
        }
    }

    Ok(())
}

/// Map CLI args (and the optional config file) to `PipelineConfig`.
fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => PipelineConfig::default(),
    };

    if let Some(ref dir) = cli.cache_dir {
        config.cache_dir = dir.clone();
    }
    if let Some(ref dir) = cli.temp_dir {
        config.temp_dir = Some(dir.clone());
    }
    if let Some(format) = cli.format {
        config.output_format = format;
    }
    if cli.no_enhance {
        config.enhance = false;
    }
    if let Some(n) = cli.retries {
        config.max_retries = n;
    }
    if let Some(b) = cli.backoff {
        config.backoff_factor = b;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}
