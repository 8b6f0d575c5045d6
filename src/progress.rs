//! Progress reporting and cancellation shared between an ingestion worker and
//! whoever is watching it.

use crate::error::Stage;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

/// Cooperative cancellation flag. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Live counters for one ingestion. Updated by the worker, polled by callers.
#[derive(Debug, Default)]
pub struct IngestProgress {
    stage: AtomicU8,
    frames_written: AtomicU64,
    frames_total: AtomicU64,
}

/// Point-in-time copy of an `IngestProgress`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub stage: Stage,
    pub frames_written: u64,
    /// Estimated from container metadata; zero when unknown.
    pub frames_total: u64,
}

impl ProgressSnapshot {
    /// Fraction of frames written, in `0.0..=1.0`. `None` while the total is unknown.
    pub fn fraction(&self) -> Option<f64> {
        if self.stage >= Stage::Transcoded {
            return Some(1.0);
        }
        if self.frames_total == 0 {
            return None;
        }
        Some((self.frames_written as f64 / self.frames_total as f64).min(1.0))
    }
}

impl IngestProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_stage(&self, stage: Stage) {
        self.stage.store(stage as u8, Ordering::SeqCst);
    }

    pub fn set_total(&self, frames: u64) {
        self.frames_total.store(frames, Ordering::Relaxed);
    }

    pub fn frame_written(&self) {
        self.frames_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            stage: Stage::from_u8(self.stage.load(Ordering::SeqCst)),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            frames_total: self.frames_total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_canceled());
        token.cancel();
        assert!(other.is_canceled());
    }

    #[test]
    fn fraction_tracks_frames() {
        let progress = IngestProgress::new();
        assert_eq!(progress.snapshot().stage, Stage::Received);
        assert_eq!(progress.snapshot().fraction(), None);

        progress.set_stage(Stage::OriginalStored);
        progress.set_total(4);
        progress.frame_written();
        assert_eq!(progress.snapshot().fraction(), Some(0.25));

        progress.set_stage(Stage::Transcoded);
        assert_eq!(progress.snapshot().fraction(), Some(1.0));
    }
}
