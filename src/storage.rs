//! Storage Layout Manager
//!
//! Every ingested video owns one directory under the storage root:
//!
//! ```text
//! <root>/<year>/<month>/<day>/<id>/original/video.<ext>
//!                                 /processed/<filter>/video.mp4
//!                                 /thumbs/frame_0001.jpg
//! ```
//!
//! Paths handed out by this module are `RelPath`s: root-relative, segment
//! based, and rendered with `/` regardless of the host's separator.

use chrono::{DateTime, Datelike, Utc};
use log::{debug, warn};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

pub const INCOMING_DIR: &str = "incoming";
pub const ORIGINAL_DIR: &str = "original";
pub const PROCESSED_DIR: &str = "processed";
pub const THUMBS_DIR: &str = "thumbs";
pub const PROCESSED_FILE: &str = "video.mp4";
pub const THUMBNAIL_FILE: &str = "frame_0001.jpg";

/// Segments in `<year>/<month>/<day>/<id>`.
const VIDEO_DIR_DEPTH: usize = 4;
const ALLOCATE_ATTEMPTS: usize = 3;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("uploaded file {0} no longer exists")]
    MissingUpload(PathBuf),

    #[error("{0} already exists")]
    AlreadyExists(PathBuf),

    #[error("invalid storage path '{0}'")]
    InvalidPath(String),

    #[error("artifact '{0}' not found")]
    NotFound(String),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |source| StorageError::Io { path: path.to_path_buf(), source }
}

/// A storage-root-relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RelPath {
    segments: Vec<String>,
}

impl RelPath {
    /// Parses a `/`-separated relative path, rejecting anything that could
    /// escape the storage root.
    pub fn parse(value: &str) -> Result<Self, StorageError> {
        if value.is_empty() || value.starts_with('/') {
            return Err(StorageError::InvalidPath(value.to_string()));
        }
        let mut path = RelPath::default();
        for segment in value.split('/') {
            path = path.child(segment)?;
        }
        Ok(path)
    }

    /// Appends one path segment.
    pub fn child(&self, segment: &str) -> Result<Self, StorageError> {
        let invalid = segment.is_empty()
            || segment == "."
            || segment == ".."
            || segment.contains(['/', '\\', '\0'])
            || segment.contains(':');
        if invalid {
            return Err(StorageError::InvalidPath(segment.to_string()));
        }
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn parent(&self) -> Option<RelPath> {
        let (_, rest) = self.segments.split_last()?;
        Some(Self { segments: rest.to_vec() })
    }

    /// Host path of this location under `root`.
    pub fn to_path(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        path.extend(&self.segments);
        path
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl Serialize for RelPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RelPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        RelPath::parse(&value).map_err(serde::de::Error::custom)
    }
}

/// Computes `<year>/<month:02>/<day:02>/<id>` for an ingestion started at `now`.
pub fn video_dir_for(now: DateTime<Utc>, id: &Uuid) -> RelPath {
    RelPath {
        segments: vec![
            format!("{:04}", now.year()),
            format!("{:02}", now.month()),
            format!("{:02}", now.day()),
            id.to_string(),
        ],
    }
}

/// Owns the on-disk layout under one storage root.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    /// Opens (creating if needed) a storage root and its `incoming/` spool.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        let incoming = root.join(INCOMING_DIR);
        fs::create_dir_all(&incoming).map_err(io_err(&incoming))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn incoming_dir(&self) -> PathBuf {
        self.root.join(INCOMING_DIR)
    }

    /// Spool location for an upload that has not been relocated yet.
    pub fn upload_path(&self, id: &Uuid, ext: &str) -> PathBuf {
        let name = if ext.is_empty() {
            format!("{id}.upload")
        } else {
            format!("{id}.{ext}.upload")
        };
        self.incoming_dir().join(name)
    }

    pub fn absolute(&self, path: &RelPath) -> PathBuf {
        path.to_path(&self.root)
    }

    pub fn processed_path(&self, video_dir: &RelPath, filter: &str) -> Result<RelPath, StorageError> {
        video_dir
            .child(PROCESSED_DIR)?
            .child(filter)?
            .child(PROCESSED_FILE)
    }

    pub fn thumbnail_path(&self, video_dir: &RelPath) -> Result<RelPath, StorageError> {
        video_dir.child(THUMBS_DIR)?.child(THUMBNAIL_FILE)
    }

    /// Creates the per-video directory with its `original/`,
    /// `processed/<filter>/` and `thumbs/` subdirectories. Existing
    /// directories are fine. On failure whatever was created is removed.
    pub fn allocate(
        &self,
        now: DateTime<Utc>,
        id: &Uuid,
        filter: &str,
    ) -> Result<RelPath, StorageError> {
        let video_dir = video_dir_for(now, id);
        let subdirs = [
            video_dir.child(ORIGINAL_DIR)?,
            video_dir.child(PROCESSED_DIR)?.child(filter)?,
            video_dir.child(THUMBS_DIR)?,
        ];

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.create_all(&subdirs) {
                Ok(()) => break,
                // a concurrent destroy may prune a shared date directory
                // between our checks; try again
                Err(StorageError::Io { source, .. })
                    if source.kind() == io::ErrorKind::NotFound && attempt < ALLOCATE_ATTEMPTS => {}
                Err(err) => {
                    if let Err(cleanup) = self.destroy(&video_dir) {
                        warn!("Could not clean up {} after failed allocation: {}", video_dir, cleanup);
                    }
                    return Err(err);
                }
            }
        }

        debug!("Allocated {}", video_dir);
        Ok(video_dir)
    }

    fn create_all(&self, dirs: &[RelPath]) -> Result<(), StorageError> {
        for dir in dirs {
            let path = self.absolute(dir);
            fs::create_dir_all(&path).map_err(io_err(&path))?;
        }
        Ok(())
    }

    /// Moves the spooled upload to `original/video.<ext>`.
    ///
    /// This is a rename within the storage root, so the upload is visible at
    /// exactly one of the two locations at any time.
    pub fn relocate_original(
        &self,
        temp: &Path,
        video_dir: &RelPath,
        ext: &str,
    ) -> Result<RelPath, StorageError> {
        let file_name = if ext.is_empty() {
            "video".to_string()
        } else {
            format!("video.{ext}")
        };
        let target = video_dir.child(ORIGINAL_DIR)?.child(&file_name)?;
        let target_abs = self.absolute(&target);

        if !temp.is_file() {
            return Err(StorageError::MissingUpload(temp.to_path_buf()));
        }
        if target_abs.exists() {
            return Err(StorageError::AlreadyExists(target_abs));
        }

        match fs::rename(temp, &target_abs) {
            Ok(()) => {
                debug!("Moved {:?} to {}", temp, target);
                Ok(target)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && !temp.exists() => {
                Err(StorageError::MissingUpload(temp.to_path_buf()))
            }
            Err(source) => Err(StorageError::Io { path: target_abs, source }),
        }
    }

    /// Removes a per-video directory and everything in it. A directory that
    /// is already gone counts as removed. Date directories left empty are
    /// pruned as well, including ones that were empty before this video.
    pub fn destroy(&self, video_dir: &RelPath) -> Result<(), StorageError> {
        if video_dir.segments().len() != VIDEO_DIR_DEPTH {
            return Err(StorageError::InvalidPath(video_dir.to_string()));
        }

        let path = self.absolute(video_dir);
        match fs::remove_dir_all(&path) {
            Ok(()) => debug!("Removed {}", video_dir),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} was already absent", video_dir);
            }
            Err(source) => return Err(StorageError::Io { path, source }),
        }

        self.prune_empty_parents(video_dir);
        Ok(())
    }

    fn prune_empty_parents(&self, video_dir: &RelPath) {
        let mut current = video_dir.parent();
        while let Some(dir) = current {
            if dir.segments().is_empty() {
                break;
            }
            // fails harmlessly when another video still lives there
            if fs::remove_dir(self.absolute(&dir)).is_err() {
                break;
            }
            current = dir.parent();
        }
    }

    /// Resolves a root-relative artifact path to an existing file.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let rel = RelPath::parse(path)?;
        if rel.segments().first().map(String::as_str) == Some(INCOMING_DIR) {
            return Err(StorageError::NotFound(path.to_string()));
        }
        let absolute = self.absolute(&rel);
        if absolute.is_file() {
            Ok(absolute)
        } else {
            Err(StorageError::NotFound(path.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 7, 12, 30, 0).unwrap()
    }

    #[test]
    fn video_dir_uses_zero_padded_date() {
        let id = Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        let dir = video_dir_for(fixed_now(), &id);
        assert_eq!(dir.to_string(), "2024/03/07/67e55044-10b1-426f-9247-bb680e5fe0c8");
        assert_eq!(
            dir.to_path(Path::new("/srv/media")),
            Path::new("/srv/media")
                .join("2024")
                .join("03")
                .join("07")
                .join("67e55044-10b1-426f-9247-bb680e5fe0c8")
        );
    }

    #[test]
    fn rel_path_rejects_escapes() {
        for bad in ["", "/etc/passwd", "a/../b", "a//b", "a/./b", "a\\b", "c:/x"] {
            assert!(RelPath::parse(bad).is_err(), "{bad:?} should be rejected");
        }
        let ok = RelPath::parse("2024/03/07/id/thumbs/frame_0001.jpg").unwrap();
        assert_eq!(ok.segments().len(), 6);
        assert_eq!(ok.to_string(), "2024/03/07/id/thumbs/frame_0001.jpg");
    }

    #[test]
    fn rel_path_serializes_as_string() {
        let path = RelPath::parse("2024/03/07/id/original/video.mp4").unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"2024/03/07/id/original/video.mp4\"");
        let back: RelPath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
        assert!(serde_json::from_str::<RelPath>("\"../x\"").is_err());
    }

    #[test]
    fn allocate_creates_subdirectories_and_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let layout = StorageLayout::open(root.path()).unwrap();
        let id = Uuid::new_v4();

        let dir = layout.allocate(fixed_now(), &id, "sepia").unwrap();
        let again = layout.allocate(fixed_now(), &id, "sepia").unwrap();
        assert_eq!(dir, again);

        let abs = layout.absolute(&dir);
        assert!(abs.join("original").is_dir());
        assert!(abs.join("processed").join("sepia").is_dir());
        assert!(abs.join("thumbs").is_dir());
    }

    #[test]
    fn allocate_rejects_unsafe_filter_names() {
        let root = tempfile::tempdir().unwrap();
        let layout = StorageLayout::open(root.path()).unwrap();
        let err = layout.allocate(fixed_now(), &Uuid::new_v4(), "../evil").unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));
        assert!(!root.path().join("2024").exists());
    }

    #[test]
    fn relocate_moves_the_upload() {
        let root = tempfile::tempdir().unwrap();
        let layout = StorageLayout::open(root.path()).unwrap();
        let id = Uuid::new_v4();
        let temp = layout.upload_path(&id, "mp4");
        fs::write(&temp, b"bytes").unwrap();

        let dir = layout.allocate(fixed_now(), &id, "invert").unwrap();
        let original = layout.relocate_original(&temp, &dir, "mp4").unwrap();

        assert_eq!(original, dir.child("original").unwrap().child("video.mp4").unwrap());
        assert!(!temp.exists());
        assert_eq!(fs::read(layout.absolute(&original)).unwrap(), b"bytes");
    }

    #[test]
    fn relocate_fails_loudly_when_upload_is_gone() {
        let root = tempfile::tempdir().unwrap();
        let layout = StorageLayout::open(root.path()).unwrap();
        let id = Uuid::new_v4();
        let dir = layout.allocate(fixed_now(), &id, "invert").unwrap();

        let err = layout
            .relocate_original(&layout.upload_path(&id, "mp4"), &dir, "mp4")
            .unwrap_err();
        assert!(matches!(err, StorageError::MissingUpload(_)));
    }

    #[test]
    fn destroy_removes_subtree_and_prunes_empty_dates() {
        let root = tempfile::tempdir().unwrap();
        let layout = StorageLayout::open(root.path()).unwrap();
        let keep = layout.allocate(fixed_now(), &Uuid::new_v4(), "canny").unwrap();
        let gone = layout.allocate(fixed_now(), &Uuid::new_v4(), "canny").unwrap();

        layout.destroy(&gone).unwrap();
        assert!(!layout.absolute(&gone).exists());
        assert!(layout.absolute(&keep).exists());

        layout.destroy(&keep).unwrap();
        assert!(!root.path().join("2024").exists());
        assert!(root.path().join(INCOMING_DIR).is_dir());
    }

    #[test]
    fn destroy_prunes_date_directories_that_were_already_empty() {
        let root = tempfile::tempdir().unwrap();
        let layout = StorageLayout::open(root.path()).unwrap();
        fs::create_dir_all(root.path().join("2024/03/07")).unwrap();

        let dir = video_dir_for(fixed_now(), &Uuid::new_v4());
        layout.destroy(&dir).unwrap();

        assert!(!root.path().join("2024").exists());
        assert!(root.path().join(INCOMING_DIR).is_dir());
    }

    #[test]
    fn destroy_tolerates_missing_directories() {
        let root = tempfile::tempdir().unwrap();
        let layout = StorageLayout::open(root.path()).unwrap();
        let dir = video_dir_for(fixed_now(), &Uuid::new_v4());
        layout.destroy(&dir).unwrap();
        layout.destroy(&dir).unwrap();
    }

    #[test]
    fn destroy_refuses_paths_that_are_not_video_dirs() {
        let root = tempfile::tempdir().unwrap();
        let layout = StorageLayout::open(root.path()).unwrap();
        let err = layout.destroy(&RelPath::parse("2024").unwrap()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));
    }

    #[test]
    fn resolve_only_serves_existing_artifacts() {
        let root = tempfile::tempdir().unwrap();
        let layout = StorageLayout::open(root.path()).unwrap();
        let id = Uuid::new_v4();
        let dir = layout.allocate(fixed_now(), &id, "invert").unwrap();
        let thumb = layout.thumbnail_path(&dir).unwrap();
        fs::write(layout.absolute(&thumb), b"jpeg").unwrap();

        assert_eq!(layout.resolve(&thumb.to_string()).unwrap(), layout.absolute(&thumb));
        assert!(matches!(
            layout.resolve("2024/03/07/nope/thumbs/frame_0001.jpg"),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(layout.resolve("../secret"), Err(StorageError::InvalidPath(_))));

        let spooled = layout.upload_path(&id, "mp4");
        fs::write(&spooled, b"x").unwrap();
        let spooled_rel = format!("incoming/{}", spooled.file_name().unwrap().to_string_lossy());
        assert!(layout.resolve(&spooled_rel).is_err());
    }
}
