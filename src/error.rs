use crate::storage::StorageError;
use crate::store::StoreError;
use crate::video_processor::MediaError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Ingestion states, in the order a successful ingestion walks through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Stage {
    Received = 0,
    Allocated = 1,
    OriginalStored = 2,
    Transcoded = 3,
    MetadataExtracted = 4,
    ThumbnailAttempted = 5,
    Committed = 6,
}

impl Stage {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Stage::Allocated,
            2 => Stage::OriginalStored,
            3 => Stage::Transcoded,
            4 => Stage::MetadataExtracted,
            5 => Stage::ThumbnailAttempted,
            6 => Stage::Committed,
            _ => Stage::Received,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Allocated => "allocated",
            Stage::OriginalStored => "original_stored",
            Stage::Transcoded => "transcoded",
            Stage::MetadataExtracted => "metadata_extracted",
            Stage::ThumbnailAttempted => "thumbnail_attempted",
            Stage::Committed => "committed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fatal ingestion failures. `stage()` names the state the ingestion was
/// trying to reach when it failed.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("invalid filter '{0}'")]
    InvalidFilter(String),

    #[error("failed to receive upload: {0}")]
    UploadFailed(#[source] std::io::Error),

    #[error("storage allocation failed: {0}")]
    StorageAllocationFailed(#[source] StorageError),

    #[error("source unreadable: {0}")]
    SourceUnreadable(#[source] MediaError),

    #[error("transcode failed: {0}")]
    TranscodeFailed(#[source] MediaError),

    #[error("metadata extraction failed: {0}")]
    MetadataExtractionFailed(#[source] MediaError),

    #[error("failed to persist record ({stage}): {source}")]
    RecordPersistFailed {
        stage: Stage,
        #[source]
        source: StoreError,
    },

    #[error("ingestion canceled before {0}")]
    Canceled(Stage),

    #[error("ingestion worker exited without a result (last stage: {0})")]
    WorkerLost(Stage),

    /// The ingestion failed and removing its artifacts failed too; the
    /// directory needs manual cleanup.
    #[error("{cause} (rollback failed: {cleanup})")]
    RollbackFailed {
        cause: Box<IngestError>,
        cleanup: StorageError,
    },
}

impl IngestError {
    pub fn stage(&self) -> Stage {
        match self {
            IngestError::InvalidFilter(_) | IngestError::UploadFailed(_) => Stage::Allocated,
            IngestError::StorageAllocationFailed(_) => Stage::OriginalStored,
            IngestError::SourceUnreadable(_) | IngestError::TranscodeFailed(_) => {
                Stage::Transcoded
            }
            IngestError::MetadataExtractionFailed(_) => Stage::MetadataExtracted,
            IngestError::RecordPersistFailed { stage, .. } => *stage,
            IngestError::Canceled(stage) | IngestError::WorkerLost(stage) => *stage,
            IngestError::RollbackFailed { cause, .. } => cause.stage(),
        }
    }

    /// True for failures caused by the caller's input rather than the system.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            IngestError::InvalidFilter(_) | IngestError::SourceUnreadable(_)
        )
    }
}

/// Failures of `Ingestor::delete`. A partial deletion is never reported as
/// `NotFound`.
#[derive(Error, Debug)]
pub enum DeleteError {
    #[error("video {0} not found")]
    NotFound(Uuid),

    #[error("failed to look up video {id}: {source}")]
    Lookup {
        id: Uuid,
        #[source]
        source: StoreError,
    },

    #[error("failed to remove artifacts of video {id}: {source}")]
    StorageDestroyFailed {
        id: Uuid,
        #[source]
        source: StorageError,
    },

    #[error("artifacts of video {id} were removed but its record could not be deleted: {source}")]
    RecordDeleteFailed {
        id: Uuid,
        #[source]
        source: StoreError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_ordered_and_round_trip() {
        assert!(Stage::Received < Stage::Committed);
        for stage in [
            Stage::Received,
            Stage::Allocated,
            Stage::OriginalStored,
            Stage::Transcoded,
            Stage::MetadataExtracted,
            Stage::ThumbnailAttempted,
            Stage::Committed,
        ] {
            assert_eq!(Stage::from_u8(stage as u8), stage);
        }
    }

    #[test]
    fn rollback_failure_keeps_the_original_stage() {
        let err = IngestError::RollbackFailed {
            cause: Box::new(IngestError::Canceled(Stage::Transcoded)),
            cleanup: StorageError::InvalidPath("x".into()),
        };
        assert_eq!(err.stage(), Stage::Transcoded);
        assert!(!err.is_user_error());
        assert!(IngestError::InvalidFilter("blur".into()).is_user_error());
    }
}
