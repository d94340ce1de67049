pub mod date_util;
pub mod error;
pub mod sink;
pub mod source;
pub mod storage;
pub mod sync;

use std::future::Future;
use std::sync::Arc;

pub use error::{Error, Result};
pub use sink::{RecordFailure, RecordSink, SinkError, WriteReport};
pub use source::{AttendanceRecord, JsonFileSource, Page, SourceClient, SourceError};
pub use storage::Database;
pub use sync::checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore, SyncCounters};
pub use sync::chunker::{Chunk, DateWindow};
pub use sync::progress::ProgressUpdate;
pub use sync::{
    BatchReport, CancelHandle, RunInfo, SyncConfiguration, SyncOrchestrator,
    SyncProgress, SyncResult, SyncState, SyncStatus,
};

// Re-export repository row types needed by the binary crate, but not the module itself
pub use storage::repository::{CheckpointSummary, SyncJob};

use storage::repository;

/// Main entry point: syncs attendance from an SIS source into the local
/// database, which doubles as the checkpoint store.
pub struct AttendanceSync {
    db: Database,
    source: Arc<dyn SourceClient>,
}

impl AttendanceSync {
    pub fn new(db: Database, source: Arc<dyn SourceClient>) -> Self {
        Self { db, source }
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Build an orchestrator writing to this database. Callers can subscribe
    /// observers and take a cancel handle before running it.
    pub fn orchestrator(&self, config: SyncConfiguration) -> Result<SyncOrchestrator> {
        let db = Arc::new(self.db.clone());
        SyncOrchestrator::new(config, self.source.clone(), db.clone(), db)
    }

    // ── Sync commands ──────────────────────────────────────────────

    pub async fn sync(&self, orchestrator: &SyncOrchestrator) -> Result<SyncResult> {
        self.tracked(orchestrator.configuration(), orchestrator.execute_sync())
            .await
    }

    pub async fn resume(
        &self,
        orchestrator: &SyncOrchestrator,
        checkpoint_id: &str,
    ) -> Result<SyncResult> {
        self.tracked(
            orchestrator.configuration(),
            orchestrator.resume_from_checkpoint(checkpoint_id),
        )
        .await
    }

    /// Load a stored checkpoint, e.g. to rebuild its configuration for a resume.
    pub async fn checkpoint(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        self.db
            .load(checkpoint_id)
            .await?
            .ok_or_else(|| Error::CheckpointNotFound(checkpoint_id.to_string()))
    }

    /// Run `run` inside a `sync_jobs` row. Bookkeeping failures after the run
    /// are logged, never allowed to mask the run's result.
    async fn tracked(
        &self,
        config: &SyncConfiguration,
        run: impl Future<Output = Result<SyncResult>>,
    ) -> Result<SyncResult> {
        let range_start = config.start_date.to_string();
        let range_end = config.end_date.to_string();
        let job_id = self
            .db
            .writer()
            .call(move |conn| repository::insert_sync_job(conn, &range_start, &range_end))
            .await?;

        let outcome = run.await;

        let closed = match &outcome {
            Ok(result) => {
                let result = result.clone();
                self.db
                    .writer()
                    .call(move |conn| repository::finish_sync_job(conn, job_id, &result))
                    .await
            }
            Err(e) => {
                let message = e.to_string();
                self.db
                    .writer()
                    .call(move |conn| repository::fail_sync_job(conn, job_id, &message))
                    .await
            }
        };
        if let Err(e) = closed {
            log::warn!("Failed to record outcome of sync job {job_id}: {e}");
        }
        outcome
    }
}
