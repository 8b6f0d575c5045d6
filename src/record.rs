//! Persisted descriptions of ingested videos.

use crate::storage::RelPath;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// One committed, fully ingested video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub id: Uuid,
    pub original_name: String,
    /// Lower-cased, without the leading dot. May be empty.
    pub original_ext: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub duration_sec: f64,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub filter: String,
    pub created_at: DateTime<Utc>,
    /// The per-video directory every artifact lives under.
    pub video_dir: RelPath,
    pub path_original: RelPath,
    pub path_processed: Option<RelPath>,
    pub path_thumbnail: Option<RelPath>,
}

impl VideoRecord {
    /// `original_name` and `original_ext` joined back into a file name.
    pub fn display_name(&self) -> String {
        if self.original_ext.is_empty() {
            self.original_name.clone()
        } else {
            format!("{}.{}", self.original_name, self.original_ext)
        }
    }
}

/// Marker for an ingestion that has started but not yet committed. Left
/// behind only if the process dies mid-ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingIngest {
    pub id: Uuid,
    pub filter: String,
    pub started_at: DateTime<Utc>,
    pub video_dir: RelPath,
    pub upload_path: PathBuf,
}

/// Reduces an uploaded file name to a safe base name.
///
/// Directory components are dropped, whitespace becomes `_`, and anything
/// other than ASCII alphanumerics, `-`, `_` and `.` is removed.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter_map(|c| match c {
            c if c.is_whitespace() => Some('_'),
            c if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') => Some(c),
            _ => None,
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Splits a sanitized file name into `(stem, extension)`; the extension is
/// lower-cased and has no dot.
pub fn split_name(sanitized: &str) -> (String, String) {
    match sanitized.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            (stem.to_string(), ext.to_ascii_lowercase())
        }
        _ => (sanitized.to_string(), String::new()),
    }
}

/// Best-effort content type for an extension, used when the uploader did not
/// declare one.
pub fn guess_mime_type(ext: &str) -> &'static str {
    match ext {
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_like_a_web_upload_layer() {
        assert_eq!(sanitize_filename("My Holiday Clip.MP4"), "My_Holiday_Clip.MP4");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\me\\vídeo final.avi"), "vdeo_final.avi");
        assert_eq!(sanitize_filename(".hidden.mov"), "hidden.mov");
        assert_eq!(sanitize_filename("???"), "upload");
        assert_eq!(sanitize_filename(""), "upload");
    }

    #[test]
    fn splits_stem_and_extension() {
        assert_eq!(split_name("clip.MP4"), ("clip".into(), "mp4".into()));
        assert_eq!(split_name("archive.tar.gz"), ("archive.tar".into(), "gz".into()));
        assert_eq!(split_name("noext"), ("noext".into(), String::new()));
    }

    #[test]
    fn guesses_common_video_types() {
        assert_eq!(guess_mime_type("mp4"), "video/mp4");
        assert_eq!(guess_mime_type("mov"), "video/quicktime");
        assert_eq!(guess_mime_type("bin"), "application/octet-stream");
    }
}
