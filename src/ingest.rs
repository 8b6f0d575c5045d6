//! Ingestion Orchestrator
//!
//! Runs one upload through the whole pipeline:
//!
//! `Received → Allocated → OriginalStored → Transcoded → MetadataExtracted →
//! ThumbnailAttempted → Committed`
//!
//! A committed record always points at complete artifacts. Any fatal failure
//! (or a cancellation) removes everything the ingestion created, so the
//! storage root is left as it was before the request.

use crate::error::{DeleteError, IngestError, Stage};
use crate::filters::{FilterRegistry, FrameFilter};
use crate::metadata::{self, VideoMetadata};
use crate::progress::{CancelToken, IngestProgress};
use crate::record::{PendingIngest, VideoRecord, guess_mime_type, sanitize_filename, split_name};
use crate::storage::{RelPath, StorageError, StorageLayout, video_dir_for};
use crate::store::{MetadataStore, StoreError};
use crate::thumbnail;
use crate::transcoder::{self, TranscodeReport};
use crate::video_processor::{DEFAULT_OPEN_TIMEOUT, MediaError, OpenOptions};
use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use log::{debug, error, info, warn};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// One upload as handed over by the request layer.
#[derive(Debug)]
pub struct Upload<R> {
    pub reader: R,
    /// File name as declared by the client; sanitized before use.
    pub file_name: String,
    pub content_type: Option<String>,
    pub filter: String,
}

impl<R: Read> Upload<R> {
    pub fn new(reader: R, file_name: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            reader,
            file_name: file_name.into(),
            content_type: None,
            filter: filter.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Upper bound on opening a media file for decoding.
    pub open_timeout: Duration,
    /// Extract metadata from the original while the transcode runs.
    pub concurrent_probe: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            concurrent_probe: false,
        }
    }
}

/// Identity, progress and cancellation handle of one ingestion.
#[derive(Debug, Clone)]
pub struct IngestJob {
    pub id: Uuid,
    pub progress: Arc<IngestProgress>,
    pub cancel: CancelToken,
}

impl IngestJob {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            progress: IngestProgress::new(),
            cancel: CancelToken::new(),
        }
    }

    fn enter(&self, stage: Stage) {
        self.progress.set_stage(stage);
        info!("[{}] {}", self.id, stage);
    }

    fn check_canceled(&self, next: Stage) -> Result<(), IngestError> {
        if self.cancel.is_canceled() {
            Err(IngestError::Canceled(next))
        } else {
            Ok(())
        }
    }
}

impl Default for IngestJob {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of `Ingestor::sweep_pending`.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub swept: Vec<Uuid>,
    pub failed: Vec<(Uuid, StorageError)>,
}

pub struct Ingestor {
    layout: StorageLayout,
    filters: Arc<FilterRegistry>,
    store: Arc<dyn MetadataStore>,
    options: PipelineOptions,
}

impl Ingestor {
    pub fn new(
        layout: StorageLayout,
        filters: Arc<FilterRegistry>,
        store: Arc<dyn MetadataStore>,
        options: PipelineOptions,
    ) -> Self {
        Self { layout, filters, store, options }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn filters(&self) -> &FilterRegistry {
        &self.filters
    }

    /// Ingests an upload with a fresh job id.
    pub fn ingest<R: Read>(&self, upload: Upload<R>) -> Result<VideoRecord, IngestError> {
        self.ingest_with(upload, &IngestJob::new())
    }

    /// Ingests an upload, reporting progress through `job` and honouring its
    /// cancellation token.
    pub fn ingest_with<R: Read>(
        &self,
        upload: Upload<R>,
        job: &IngestJob,
    ) -> Result<VideoRecord, IngestError> {
        job.enter(Stage::Received);

        let filter = self
            .filters
            .resolve(&upload.filter)
            .map_err(|_| IngestError::InvalidFilter(upload.filter.clone()))?;

        let (original_name, original_ext) = split_name(&sanitize_filename(&upload.file_name));
        let mime_type = upload
            .content_type
            .clone()
            .filter(|ct| !ct.trim().is_empty())
            .unwrap_or_else(|| guess_mime_type(&original_ext).to_string());

        let now = Utc::now().trunc_subsecs(6);
        let pending = PendingIngest {
            id: job.id,
            filter: upload.filter.clone(),
            started_at: now,
            video_dir: video_dir_for(now, &job.id),
            upload_path: self.layout.upload_path(&job.id, &original_ext),
        };

        job.check_canceled(Stage::Allocated)?;
        self.store
            .begin(&pending)
            .map_err(|source| IngestError::RecordPersistFailed { stage: Stage::Allocated, source })?;

        let ctx = IngestContext {
            job,
            pending: &pending,
            filter: filter.as_ref(),
            original_name,
            original_ext,
            mime_type,
            now,
        };

        match self.run_stages(upload.reader, ctx) {
            Ok(record) => {
                info!(
                    "[{}] committed {} ({}x{}, {:.2}s @ {:.2} fps, filter {})",
                    record.id,
                    record.display_name(),
                    record.width,
                    record.height,
                    record.duration_sec,
                    record.fps,
                    record.filter
                );
                Ok(record)
            }
            Err(err) => Err(self.roll_back(err, &pending)),
        }
    }

    fn run_stages<R: Read>(&self, reader: R, ctx: IngestContext<'_>) -> Result<VideoRecord, IngestError> {
        let IngestContext { job, pending, filter, original_name, original_ext, mime_type, now } = ctx;
        let open = OpenOptions {
            timeout: self.options.open_timeout,
            cancel: job.cancel.clone(),
        };

        let received = spool(reader, &pending.upload_path).map_err(IngestError::UploadFailed)?;
        debug!("[{}] spooled {} bytes to {:?}", job.id, received, pending.upload_path);

        job.check_canceled(Stage::Allocated)?;
        let video_dir = self
            .layout
            .allocate(now, &job.id, &pending.filter)
            .map_err(IngestError::StorageAllocationFailed)?;
        job.enter(Stage::Allocated);

        let path_original = self
            .layout
            .relocate_original(&pending.upload_path, &video_dir, &original_ext)
            .map_err(IngestError::StorageAllocationFailed)?;
        let original_abs = self.layout.absolute(&path_original);
        let size_bytes = fs::metadata(&original_abs)
            .map_err(|source| {
                IngestError::StorageAllocationFailed(StorageError::Io {
                    path: original_abs.clone(),
                    source,
                })
            })?
            .len();
        job.enter(Stage::OriginalStored);

        job.check_canceled(Stage::Transcoded)?;
        let path_processed = self
            .layout
            .processed_path(&video_dir, &pending.filter)
            .map_err(IngestError::StorageAllocationFailed)?;
        let processed_abs = self.layout.absolute(&path_processed);

        let (report, probed) = if self.options.concurrent_probe {
            let (report, probed) = rayon::join(
                || self.transcode(&original_abs, &processed_abs, filter, &open, job),
                || metadata::extract(&original_abs, &open),
            );
            (report?, Some(probed))
        } else {
            (self.transcode(&original_abs, &processed_abs, filter, &open, job)?, None)
        };
        job.enter(Stage::Transcoded);
        debug!("[{}] wrote {} frames", job.id, report.frames_written);

        job.check_canceled(Stage::MetadataExtracted)?;
        let meta = probed
            .unwrap_or_else(|| metadata::extract(&original_abs, &open))
            .map_err(|err| match err {
                MediaError::Canceled => IngestError::Canceled(Stage::MetadataExtracted),
                err => IngestError::MetadataExtractionFailed(err),
            })?;
        job.enter(Stage::MetadataExtracted);

        let path_thumbnail = self.make_thumbnail(&original_abs, &video_dir, &open, job);
        job.check_canceled(Stage::ThumbnailAttempted)?;
        job.enter(Stage::ThumbnailAttempted);

        let record = build_record(BuiltArtifacts {
            id: job.id,
            original_name,
            original_ext,
            mime_type,
            size_bytes,
            meta,
            filter: pending.filter.clone(),
            created_at: now,
            video_dir,
            path_original,
            path_processed,
            path_thumbnail,
        });

        job.check_canceled(Stage::Committed)?;
        self.store
            .insert(&record)
            .map_err(|source| IngestError::RecordPersistFailed { stage: Stage::Committed, source })?;
        job.enter(Stage::Committed);
        Ok(record)
    }

    fn transcode(
        &self,
        source: &Path,
        dest: &Path,
        filter: &dyn FrameFilter,
        open: &OpenOptions,
        job: &IngestJob,
    ) -> Result<TranscodeReport, IngestError> {
        transcoder::transcode(source, dest, filter, open, Some(&job.progress)).map_err(|err| match err {
            MediaError::Canceled => IngestError::Canceled(Stage::Transcoded),
            err if err.is_open_failure() => IngestError::SourceUnreadable(err),
            err => IngestError::TranscodeFailed(err),
        })
    }

    /// Thumbnail failures only clear the optional path.
    fn make_thumbnail(
        &self,
        original: &Path,
        video_dir: &RelPath,
        open: &OpenOptions,
        job: &IngestJob,
    ) -> Option<RelPath> {
        let thumb = match self.layout.thumbnail_path(video_dir) {
            Ok(thumb) => thumb,
            Err(e) => {
                warn!("[{}] thumbnail skipped: {}", job.id, e);
                return None;
            }
        };
        let thumb_abs = self.layout.absolute(&thumb);
        match thumbnail::extract_thumbnail(original, &thumb_abs, open) {
            Ok(()) => Some(thumb),
            Err(e) => {
                warn!("[{}] thumbnail failed: {}", job.id, e);
                remove_file_if_present(&thumb_abs);
                None
            }
        }
    }

    fn roll_back(&self, err: IngestError, pending: &PendingIngest) -> IngestError {
        warn!("[{}] failed at {}: {}; rolling back", pending.id, err.stage(), err);
        remove_file_if_present(&pending.upload_path);

        match self.layout.destroy(&pending.video_dir) {
            Ok(()) => {
                if let Err(e) = self.store.abandon(&pending.id) {
                    // the marker stays behind for sweep_pending
                    warn!("[{}] could not clear pending marker: {}", pending.id, e);
                }
                err
            }
            // the marker is kept so sweep_pending retries the cleanup
            Err(cleanup) => {
                error!(
                    "[{}] rollback could not remove {}: {}; manual cleanup needed",
                    pending.id, pending.video_dir, cleanup
                );
                IngestError::RollbackFailed { cause: Box::new(err), cleanup }
            }
        }
    }

    /// All committed records, newest first.
    pub fn list(&self) -> Result<Vec<VideoRecord>, StoreError> {
        self.store.list()
    }

    pub fn get(&self, id: &Uuid) -> Result<Option<VideoRecord>, StoreError> {
        self.store.get(id)
    }

    /// Removes a record's artifact subtree, then the record itself.
    pub fn delete(&self, id: &Uuid) -> Result<(), DeleteError> {
        let record = self
            .store
            .get(id)
            .map_err(|source| DeleteError::Lookup { id: *id, source })?
            .ok_or(DeleteError::NotFound(*id))?;

        self.layout
            .destroy(&record.video_dir)
            .map_err(|source| DeleteError::StorageDestroyFailed { id: *id, source })?;

        match self.store.delete(id) {
            Ok(true) => {
                info!("[{}] deleted", id);
                Ok(())
            }
            Ok(false) => Err(DeleteError::NotFound(*id)),
            Err(source) => {
                error!("[{}] artifacts removed but record remains: {}", id, source);
                Err(DeleteError::RecordDeleteFailed { id: *id, source })
            }
        }
    }

    /// Cleans up ingestions that started more than `older_than` ago and never
    /// committed or rolled back (e.g. the process died mid-pipeline).
    pub fn sweep_pending(&self, older_than: Duration) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();
        let Some(cutoff) = TimeDelta::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(report);
        };

        for pending in self.store.list_pending()? {
            if pending.started_at > cutoff {
                continue;
            }
            remove_file_if_present(&pending.upload_path);
            match self.layout.destroy(&pending.video_dir) {
                Ok(()) => {
                    self.store.abandon(&pending.id)?;
                    info!("[{}] swept stale ingestion from {}", pending.id, pending.started_at);
                    report.swept.push(pending.id);
                }
                Err(e) => {
                    warn!("[{}] could not sweep {}: {}", pending.id, pending.video_dir, e);
                    report.failed.push((pending.id, e));
                }
            }
        }
        Ok(report)
    }

    /// Resolves a root-relative artifact path from a record to a file on disk.
    pub fn artifact_path(&self, path: &str) -> Result<PathBuf, StorageError> {
        self.layout.resolve(path)
    }
}

struct IngestContext<'a> {
    job: &'a IngestJob,
    pending: &'a PendingIngest,
    filter: &'a dyn FrameFilter,
    original_name: String,
    original_ext: String,
    mime_type: String,
    now: DateTime<Utc>,
}

struct BuiltArtifacts {
    id: Uuid,
    original_name: String,
    original_ext: String,
    mime_type: String,
    size_bytes: u64,
    meta: VideoMetadata,
    filter: String,
    created_at: DateTime<Utc>,
    video_dir: RelPath,
    path_original: RelPath,
    path_processed: RelPath,
    path_thumbnail: Option<RelPath>,
}

fn build_record(parts: BuiltArtifacts) -> VideoRecord {
    VideoRecord {
        id: parts.id,
        original_name: parts.original_name,
        original_ext: parts.original_ext,
        mime_type: parts.mime_type,
        size_bytes: parts.size_bytes,
        duration_sec: parts.meta.duration_sec,
        fps: parts.meta.fps,
        width: parts.meta.width,
        height: parts.meta.height,
        filter: parts.filter,
        created_at: parts.created_at,
        video_dir: parts.video_dir,
        path_original: parts.path_original,
        path_processed: Some(parts.path_processed),
        path_thumbnail: parts.path_thumbnail,
    }
}

/// Writes the upload stream to its spool file. A partial spool is removed by
/// the caller's rollback.
fn spool<R: Read>(mut reader: R, path: &Path) -> io::Result<u64> {
    let mut file = File::create_new(path)?;
    let written = io::copy(&mut reader, &mut file)?;
    file.sync_all()?;
    Ok(written)
}

fn remove_file_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed {:?}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {:?}: {}", path, e),
    }
}
