//! vidpipe - Core Library
//!
//! Ingests uploaded videos: stores the original, writes a filtered copy and a
//! thumbnail, extracts technical metadata and records everything in a
//! metadata store, keeping artifacts and records consistent on failure.

use anyhow::{Context, Result};
use log::info;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub mod error;
pub mod filters;
pub mod ingest;
pub mod metadata;
pub mod pool;
pub mod progress;
pub mod record;
pub mod storage;
pub mod store;
pub mod thumbnail;
pub mod transcoder;
pub mod video_processor;

pub use error::{DeleteError, IngestError, Stage};
pub use filters::FilterRegistry;
pub use ingest::{IngestJob, Ingestor, PipelineOptions, Upload};
pub use pool::{IngestHandle, IngestPool};
pub use record::VideoRecord;
pub use storage::StorageLayout;
pub use store::{MetadataStore, SqliteStore};

/// Application configuration structure.
#[derive(Debug, Clone)]
pub struct Config {
    pub storage_root: PathBuf,
    pub database: PathBuf,
    pub workers: usize,
    pub open_timeout: Duration,
    pub concurrent_probe: bool,
    pub pixelate_block: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("media"),
            database: PathBuf::from("videos.db"),
            workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            open_timeout: video_processor::DEFAULT_OPEN_TIMEOUT,
            concurrent_probe: false,
            pixelate_block: filters::DEFAULT_PIXELATE_BLOCK,
        }
    }
}

impl Config {
    /// Opens the storage root and the database and wires up an `Ingestor`.
    pub fn build_ingestor(&self) -> Result<Ingestor> {
        info!("Initializing with config: {:?}", self);

        let layout = StorageLayout::open(&self.storage_root)
            .with_context(|| format!("Failed to open storage root {:?}", self.storage_root))?;
        let store = SqliteStore::open(&self.database)
            .with_context(|| format!("Failed to open database {:?}", self.database))?;
        let filters = FilterRegistry::with_pixelate_block(self.pixelate_block);

        Ok(Ingestor::new(
            layout,
            Arc::new(filters),
            Arc::new(store),
            PipelineOptions {
                open_timeout: self.open_timeout,
                concurrent_probe: self.concurrent_probe,
            },
        ))
    }

    /// Builds the ingestor and a worker pool around it.
    pub fn build_pool(&self) -> Result<(Arc<Ingestor>, IngestPool)> {
        let ingestor = Arc::new(self.build_ingestor()?);
        let pool = IngestPool::new(Arc::clone(&ingestor), self.workers)
            .context("Failed to start worker pool")?;
        Ok((ingestor, pool))
    }
}

/// Opens every input as an upload. Fails on the first file that cannot be
/// opened, before anything is handed to a pool.
pub fn open_uploads(
    inputs: &[PathBuf],
    filter: &str,
    content_type: Option<&str>,
) -> Result<Vec<(PathBuf, Upload<File>)>> {
    let mut uploads = Vec::with_capacity(inputs.len());
    for input in inputs {
        let file = File::open(input).with_context(|| format!("Failed to open {:?}", input))?;
        let file_name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut upload = Upload::new(file, file_name, filter);
        if let Some(ct) = content_type {
            upload = upload.with_content_type(ct);
        }
        uploads.push((input.clone(), upload));
    }
    Ok(uploads)
}

/// Formats a byte count with binary prefixes, e.g. `1.5 MB`.
pub fn format_bytes(size: u64) -> String {
    const LABELS: [&str; 5] = ["", "K", "M", "G", "T"];
    let mut value = size as f64;
    let mut n = 0;
    while value >= 1024.0 && n < LABELS.len() - 1 {
        value /= 1024.0;
        n += 1;
    }
    format!("{:.1} {}B", value, LABELS[n])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_bytes() {
        assert_eq!(format_bytes(0), "0.0 B");
        assert_eq!(format_bytes(1023), "1023.0 B");
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1536 * 1024), "1.5 MB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0 GB");
    }

    #[test]
    fn open_uploads_fails_before_returning_any_upload() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("a.mp4");
        std::fs::write(&present, b"bytes").unwrap();
        let missing = dir.path().join("b.mp4");

        let err = open_uploads(&[present.clone(), missing], "invert", None).unwrap_err();
        assert!(format!("{err:#}").contains("b.mp4"));

        let uploads = open_uploads(&[present], "invert", Some("video/webm")).unwrap();
        assert_eq!(uploads.len(), 1);
        let (_, upload) = &uploads[0];
        assert_eq!(upload.file_name, "a.mp4");
        assert_eq!(upload.filter, "invert");
        assert_eq!(upload.content_type.as_deref(), Some("video/webm"));
    }

    #[test]
    fn default_config_matches_cli_defaults() {
        let config = Config::default();
        assert_eq!(config.storage_root, PathBuf::from("media"));
        assert_eq!(config.pixelate_block, 12);
        assert!(config.workers >= 1);
    }
}
