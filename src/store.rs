//! Metadata Store
//!
//! The ingestion pipeline only needs a handful of operations from its record
//! store; `MetadataStore` captures them so alternative backends (or failing
//! doubles in tests) can be plugged in. `SqliteStore` is the stock backend.

use crate::record::{PendingIngest, VideoRecord};
use crate::storage::RelPath;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store connection lock poisoned")]
    Poisoned,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub trait MetadataStore: Send + Sync {
    /// Records that an ingestion has started.
    fn begin(&self, pending: &PendingIngest) -> Result<(), StoreError>;

    /// Drops the pending marker of an ingestion that was rolled back.
    fn abandon(&self, id: &Uuid) -> Result<(), StoreError>;

    fn list_pending(&self) -> Result<Vec<PendingIngest>, StoreError>;

    /// Inserts a committed record and clears its pending marker atomically.
    /// A failed insert leaves no record behind.
    fn insert(&self, record: &VideoRecord) -> Result<(), StoreError>;

    fn get(&self, id: &Uuid) -> Result<Option<VideoRecord>, StoreError>;

    /// All committed records, newest first.
    fn list(&self) -> Result<Vec<VideoRecord>, StoreError>;

    /// Returns `false` when no record had that id.
    fn delete(&self, id: &Uuid) -> Result<bool, StoreError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS videos (
    id TEXT PRIMARY KEY,
    original_name TEXT NOT NULL,
    original_ext TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    duration_sec REAL NOT NULL,
    fps REAL NOT NULL,
    width INTEGER NOT NULL,
    height INTEGER NOT NULL,
    filter TEXT NOT NULL,
    created_at TEXT NOT NULL,
    video_dir TEXT NOT NULL,
    path_original TEXT NOT NULL,
    path_processed TEXT,
    path_thumbnail TEXT
);
CREATE INDEX IF NOT EXISTS videos_created_at ON videos (created_at);
CREATE TABLE IF NOT EXISTS pending_ingests (
    id TEXT PRIMARY KEY,
    filter TEXT NOT NULL,
    started_at TEXT NOT NULL,
    video_dir TEXT NOT NULL,
    upload_path TEXT NOT NULL
);
";

const RECORD_COLUMNS: &str = "id, original_name, original_ext, mime_type, size_bytes, \
    duration_sec, fps, width, height, filter, created_at, video_dir, path_original, \
    path_processed, path_thumbnail";

/// SQLite-backed store. Timestamps are stored as fixed-width RFC 3339 UTC
/// strings so they sort chronologically as text.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn get_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let value: String = row.get(idx)?;
    Uuid::parse_str(&value).map_err(|e| conversion_error(idx, e))
}

fn get_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn get_rel_path(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<RelPath>> {
    let value: Option<String> = row.get(idx)?;
    value
        .map(|v| RelPath::parse(&v).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn required_rel_path(row: &Row<'_>, idx: usize) -> rusqlite::Result<RelPath> {
    get_rel_path(row, idx)?.ok_or(rusqlite::Error::InvalidColumnType(
        idx,
        "path".to_string(),
        Type::Null,
    ))
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<VideoRecord> {
    let size_bytes: i64 = row.get(4)?;
    Ok(VideoRecord {
        id: get_uuid(row, 0)?,
        original_name: row.get(1)?,
        original_ext: row.get(2)?,
        mime_type: row.get(3)?,
        size_bytes: size_bytes.max(0) as u64,
        duration_sec: row.get(5)?,
        fps: row.get(6)?,
        width: row.get(7)?,
        height: row.get(8)?,
        filter: row.get(9)?,
        created_at: get_time(row, 10)?,
        video_dir: required_rel_path(row, 11)?,
        path_original: required_rel_path(row, 12)?,
        path_processed: get_rel_path(row, 13)?,
        path_thumbnail: get_rel_path(row, 14)?,
    })
}

fn row_to_pending(row: &Row<'_>) -> rusqlite::Result<PendingIngest> {
    let upload_path: String = row.get(4)?;
    Ok(PendingIngest {
        id: get_uuid(row, 0)?,
        filter: row.get(1)?,
        started_at: get_time(row, 2)?,
        video_dir: required_rel_path(row, 3)?,
        upload_path: PathBuf::from(upload_path),
    })
}

impl MetadataStore for SqliteStore {
    fn begin(&self, pending: &PendingIngest) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO pending_ingests (id, filter, started_at, video_dir, upload_path)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                pending.id.to_string(),
                pending.filter,
                timestamp(&pending.started_at),
                pending.video_dir.to_string(),
                pending.upload_path.to_string_lossy(),
            ],
        )?;
        Ok(())
    }

    fn abandon(&self, id: &Uuid) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM pending_ingests WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }

    fn list_pending(&self) -> Result<Vec<PendingIngest>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, filter, started_at, video_dir, upload_path
             FROM pending_ingests ORDER BY started_at",
        )?;
        let pending = stmt
            .query_map([], row_to_pending)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pending)
    }

    fn insert(&self, record: &VideoRecord) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO videos ({RECORD_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                record.id.to_string(),
                record.original_name,
                record.original_ext,
                record.mime_type,
                record.size_bytes as i64,
                record.duration_sec,
                record.fps,
                record.width,
                record.height,
                record.filter,
                timestamp(&record.created_at),
                record.video_dir.to_string(),
                record.path_original.to_string(),
                record.path_processed.as_ref().map(RelPath::to_string),
                record.path_thumbnail.as_ref().map(RelPath::to_string),
            ],
        )?;
        tx.execute(
            "DELETE FROM pending_ingests WHERE id = ?1",
            params![record.id.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get(&self, id: &Uuid) -> Result<Option<VideoRecord>, StoreError> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM videos WHERE id = ?1"),
                params![id.to_string()],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn list(&self) -> Result<Vec<VideoRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM videos ORDER BY created_at DESC"
        ))?;
        let records = stmt
            .query_map([], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn delete(&self, id: &Uuid) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM videos WHERE id = ?1", params![id.to_string()])?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn record(id: Uuid, created_at: DateTime<Utc>) -> VideoRecord {
        let video_dir = crate::storage::video_dir_for(created_at, &id);
        VideoRecord {
            id,
            original_name: "clip".into(),
            original_ext: "mp4".into(),
            mime_type: "video/mp4".into(),
            size_bytes: 1234,
            duration_sec: 2.0,
            fps: 10.0,
            width: 64,
            height: 48,
            filter: "grayscale".into(),
            created_at,
            path_original: video_dir.child("original").unwrap().child("video.mp4").unwrap(),
            path_processed: None,
            path_thumbnail: Some(video_dir.child("thumbs").unwrap().child("frame_0001.jpg").unwrap()),
            video_dir,
        }
    }

    #[test]
    fn insert_get_and_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        let created = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let rec = record(Uuid::new_v4(), created);

        store.insert(&rec).unwrap();
        assert_eq!(store.get(&rec.id).unwrap(), Some(rec.clone()));

        assert!(store.delete(&rec.id).unwrap());
        assert!(!store.delete(&rec.id).unwrap());
        assert_eq!(store.get(&rec.id).unwrap(), None);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rec = record(Uuid::new_v4(), Utc::now());
        store.insert(&rec).unwrap();
        assert!(store.insert(&rec).is_err());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn list_is_newest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let older = record(Uuid::new_v4(), base);
        let newer = record(Uuid::new_v4(), base + Duration::milliseconds(1500));
        let newest = record(Uuid::new_v4(), base + Duration::days(40));
        store.insert(&newer).unwrap();
        store.insert(&older).unwrap();
        store.insert(&newest).unwrap();

        let ids: Vec<Uuid> = store.list().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![newest.id, newer.id, older.id]);
    }

    #[test]
    fn commit_clears_pending_marker() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rec = record(Uuid::new_v4(), Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap());
        let pending = PendingIngest {
            id: rec.id,
            filter: rec.filter.clone(),
            started_at: rec.created_at,
            video_dir: rec.video_dir.clone(),
            upload_path: PathBuf::from("/tmp/media/incoming/x.mp4.upload"),
        };

        store.begin(&pending).unwrap();
        assert_eq!(store.list_pending().unwrap(), vec![pending.clone()]);

        store.insert(&rec).unwrap();
        assert!(store.list_pending().unwrap().is_empty());

        store.begin(&PendingIngest { id: Uuid::new_v4(), ..pending }).unwrap();
        let left = store.list_pending().unwrap();
        assert_eq!(left.len(), 1);
        store.abandon(&left[0].id).unwrap();
        assert!(store.list_pending().unwrap().is_empty());
    }
}
