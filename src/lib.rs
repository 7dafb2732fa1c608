//! # pds2web
//!
//! Fetch Planetary Data System (PDS3/PDS4) images over HTTP, convert them to
//! web rasters, and cache the result.
//!
//! ## Why this crate?
//!
//! Mission archives publish raw `.IMG` products that browsers cannot display
//! and that are often hundreds of megabytes. Serving them to a viewer means
//! downloading reliably over flaky links, recognising what was downloaded,
//! stretching 16-bit or floating-point samples into something visible, and
//! doing that work once per product rather than once per request.
//!
//! ## Pipeline Overview
//!
//! ```text
//! URL
//!  │
//!  ├─ 1. Cache     SHA-256(url) → committed artifact? return it
//!  ├─ 2. Probe     stream the first 10 KB only
//!  ├─ 3. Classify  PDS3 / PDS4 / unknown from label markers
//!  ├─ 4. Download  resume from the prefix, retry with backoff
//!  ├─ 5. Convert   decode → stretch → enhance → resize → encode (spawn_blocking)
//!  └─ 6. Commit    atomic rename into the cache
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pds2web::{Pipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder().cache_dir("cache").build()?;
//!     let pipeline = Pipeline::new(config)?;
//!     let artifact = pipeline
//!         .process("https://pds-imaging.jpl.nasa.gov/data/example.IMG", Some(2048))
//!         .await?;
//!     println!("{} ({})", artifact.path.display(), artifact.media_type);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pds2web` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pds2web = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod pipeline;
pub mod process;
pub mod progress;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{EnhanceOptions, OutputFormat, PipelineConfig, PipelineConfigBuilder};
pub use error::{ConversionError, ConversionStage, ErrorKind, FetchError, PipelineError};
pub use pipeline::cache::{CacheKey, CacheStore};
pub use pipeline::sniff::{classify, FormatClassification};
pub use pipeline::source::{RemoteSource, ReqwestSource};
pub use process::{process_sync, Artifact, Pipeline, PipelineStage};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
