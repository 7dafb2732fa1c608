//! Content-addressed artifact cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/
//!   <sha256-hex>.<ext>        committed artifacts, one per source URL
//!   .staging/<hex>.XXXX.<ext> outputs being written by in-flight conversions
//! ```
//!
//! An artifact becomes visible only through a single `rename` from
//! `.staging/` into the root. Both live on the same filesystem, so a reader
//! sees either no file or a complete one. Two runs committing the same key
//! simply replace each other's equivalent output (last writer wins).

use crate::config::OutputFormat;
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tracing::debug;

const STAGING_DIR: &str = ".staging";

/// Lowercase hex SHA-256 of the source URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn from_url(url: &str) -> Self {
        Self(hex::encode(Sha256::digest(url.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle to a committed cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedArtifact {
    pub path: PathBuf,
    pub format: OutputFormat,
    pub media_type: &'static str,
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    staging: PathBuf,
    format: OutputFormat,
}

impl CacheStore {
    /// Open (creating if needed) a cache rooted at `root` holding `format` artifacts.
    pub fn open(root: impl Into<PathBuf>, format: OutputFormat) -> Result<Self, PipelineError> {
        let root = root.into();
        let staging = root.join(STAGING_DIR);
        std::fs::create_dir_all(&staging).map_err(|source| PipelineError::CacheWrite {
            path: staging.clone(),
            source,
        })?;
        Ok(Self {
            root,
            staging,
            format,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Canonical artifact path for `key`. Pure.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(format!("{}.{}", key.as_str(), self.format.extension()))
    }

    /// The committed artifact for `key`, if any.
    pub async fn lookup(&self, key: &CacheKey) -> Option<CachedArtifact> {
        let path = self.path_for(key);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Some(self.artifact(path)),
            _ => None,
        }
    }

    /// A fresh private output path in the staging area, removed on drop.
    pub fn stage(&self, key: &CacheKey) -> Result<TempPath, PipelineError> {
        let staged = tempfile::Builder::new()
            .prefix(&format!("{}.", key.as_str()))
            .suffix(&format!(".{}", self.format.extension()))
            .tempfile_in(&self.staging)
            .map_err(|source| PipelineError::CacheWrite {
                path: self.staging.clone(),
                source,
            })?;
        Ok(staged.into_temp_path())
    }

    /// Atomically publish `staged` as the artifact for `key`.
    ///
    /// On failure the staged file is removed before the error is returned.
    pub fn commit(&self, key: &CacheKey, staged: TempPath) -> Result<CachedArtifact, PipelineError> {
        let dest = self.path_for(key);
        staged.persist(&dest).map_err(|e| {
            // `e.path` still guards the staged file; dropping it deletes it.
            drop(e.path);
            PipelineError::CacheWrite {
                path: dest.clone(),
                source: e.error,
            }
        })?;
        debug!("Committed cache entry {}", dest.display());
        Ok(self.artifact(dest))
    }

    fn artifact(&self, path: PathBuf) -> CachedArtifact {
        CachedArtifact {
            path,
            format: self.format,
            media_type: self.format.media_type(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_staged(store: &CacheStore, key: &CacheKey, body: &[u8]) -> TempPath {
        let staged = store.stage(key).unwrap();
        let mut f = std::fs::File::create(&staged).unwrap();
        f.write_all(body).unwrap();
        staged
    }

    #[test]
    fn key_is_fixed_width_hex() {
        let k = CacheKey::from_url("https://pds.example/a.img");
        assert_eq!(k.as_str().len(), 64);
        assert!(k.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(k, CacheKey::from_url("https://pds.example/a.img"));
        assert_ne!(k, CacheKey::from_url("https://pds.example/b.img"));
    }

    #[test]
    fn path_is_pure_and_uses_extension() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path(), OutputFormat::Png).unwrap();
        let k = CacheKey::from_url("u");
        assert_eq!(store.path_for(&k), store.path_for(&k));
        assert_eq!(
            store.path_for(&k).file_name().unwrap().to_string_lossy(),
            format!("{k}.png")
        );
    }

    #[tokio::test]
    async fn staged_output_invisible_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path(), OutputFormat::Tiff).unwrap();
        let k = CacheKey::from_url("https://pds.example/a.img");

        let staged = write_staged(&store, &k, b"artifact");
        assert!(store.lookup(&k).await.is_none());

        let artifact = store.commit(&k, staged).unwrap();
        assert_eq!(artifact.media_type, "image/tiff");
        assert_eq!(store.lookup(&k).await.unwrap().path, artifact.path);
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"artifact");
        assert_eq!(std::fs::read_dir(dir.path().join(STAGING_DIR)).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn dropped_stage_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path(), OutputFormat::Tiff).unwrap();
        let k = CacheKey::from_url("u");
        let staged = write_staged(&store, &k, b"partial");
        let staged_path = staged.to_path_buf();
        drop(staged);
        assert!(!staged_path.exists());
        assert!(store.lookup(&k).await.is_none());
    }

    #[tokio::test]
    async fn second_commit_replaces_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path(), OutputFormat::Jpeg).unwrap();
        let k = CacheKey::from_url("u");

        let a = write_staged(&store, &k, b"first");
        let b = write_staged(&store, &k, b"second");
        store.commit(&k, a).unwrap();
        let artifact = store.commit(&k, b).unwrap();
        assert_eq!(std::fs::read(artifact.path).unwrap(), b"second");
    }
}
