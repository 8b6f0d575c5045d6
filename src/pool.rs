//! Bounded worker pool for concurrent ingestions.
//!
//! Each upload is an independent unit of work; the pool size caps how many
//! decode/encode pipelines run at once.

use crate::error::IngestError;
use crate::ingest::{IngestJob, Ingestor, Upload};
use crate::progress::ProgressSnapshot;
use crate::record::VideoRecord;
use log::debug;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::io::Read;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use uuid::Uuid;

pub struct IngestPool {
    pool: ThreadPool,
    ingestor: Arc<Ingestor>,
}

impl IngestPool {
    pub fn new(ingestor: Arc<Ingestor>, workers: usize) -> Result<Self, ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("ingest-{i}"))
            .build()?;
        Ok(Self { pool, ingestor })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Queues an upload. The returned handle can be polled for progress,
    /// used to cancel, or waited on for the result.
    pub fn submit<R>(&self, upload: Upload<R>) -> IngestHandle
    where
        R: Read + Send + 'static,
    {
        let job = IngestJob::new();
        let (tx, rx) = mpsc::channel();
        let ingestor = Arc::clone(&self.ingestor);
        let worker_job = job.clone();

        debug!("[{}] queued {}", job.id, upload.file_name);
        self.pool.spawn(move || {
            let result = ingestor.ingest_with(upload, &worker_job);
            // the handle may have been dropped; nobody is waiting then
            let _ = tx.send(result);
        });

        IngestHandle { job, result: rx }
    }
}

pub struct IngestHandle {
    job: IngestJob,
    result: Receiver<Result<VideoRecord, IngestError>>,
}

impl IngestHandle {
    pub fn id(&self) -> Uuid {
        self.job.id
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.job.progress.snapshot()
    }

    /// Requests cancellation; the ingestion rolls back at its next check.
    pub fn cancel(&self) {
        self.job.cancel.cancel();
    }

    /// Returns the result if the ingestion has finished. The result is handed
    /// out once.
    pub fn try_result(&self) -> Option<Result<VideoRecord, IngestError>> {
        match self.result.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(self.lost())),
        }
    }

    /// Blocks until the ingestion finishes.
    pub fn wait(self) -> Result<VideoRecord, IngestError> {
        self.result.recv().unwrap_or_else(|_| Err(self.lost()))
    }

    fn lost(&self) -> IngestError {
        IngestError::WorkerLost(self.job.progress.snapshot().stage)
    }
}
