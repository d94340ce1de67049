use std::collections::HashMap;
use std::ops::AddAssign;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::sync::SyncConfiguration;

/// Tag identifying a serialized checkpoint.
pub const CHECKPOINT_FORMAT: &str = "attendsync.checkpoint";

/// Bumped whenever the serialized layout changes. Blobs with any other
/// version are rejected.
pub const CHECKPOINT_VERSION: u64 = 1;

/// Cumulative record counters for a run (or a delta for one batch).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounters {
    pub records_processed: u64,
    pub records_successful: u64,
    pub records_failed: u64,
    pub records_skipped: u64,
    pub retry_attempts: u64,
    pub batches_processed: u64,
}

impl AddAssign for SyncCounters {
    fn add_assign(&mut self, rhs: Self) {
        self.records_processed += rhs.records_processed;
        self.records_successful += rhs.records_successful;
        self.records_failed += rhs.records_failed;
        self.records_skipped += rhs.records_skipped;
        self.retry_attempts += rhs.retry_attempts;
        self.batches_processed += rhs.batches_processed;
    }
}

/// Snapshot of orchestrator progress.
///
/// A chunk index is in `completed_chunks` only once every batch of that
/// chunk reached a terminal outcome. `counters` cover exactly those chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub operation_id: String,
    pub configuration: SyncConfiguration,
    /// Sorted, unique.
    pub completed_chunks: Vec<u64>,
    pub counters: SyncCounters,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    format: &'a str,
    version: u64,
    checkpoint: &'a Checkpoint,
}

impl Checkpoint {
    pub fn new(
        operation_id: impl Into<String>,
        configuration: SyncConfiguration,
        completed_chunks: impl IntoIterator<Item = u64>,
        counters: SyncCounters,
    ) -> Self {
        let mut completed: Vec<u64> = completed_chunks.into_iter().collect();
        completed.sort_unstable();
        completed.dedup();
        Self {
            checkpoint_id: uuid::Uuid::new_v4().to_string(),
            operation_id: operation_id.into(),
            configuration,
            completed_chunks: completed,
            counters,
            created_at: Utc::now(),
        }
    }

    /// Serialize with the format/version envelope.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(&EnvelopeRef {
            format: CHECKPOINT_FORMAT,
            version: CHECKPOINT_VERSION,
            checkpoint: self,
        })?)
    }

    /// Parse an encoded checkpoint, rejecting foreign or unsupported blobs.
    pub fn decode(raw: &str) -> Result<Self> {
        let mut value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| Error::CheckpointFormat(format!("not valid JSON: {e}")))?;

        let format = value.get("format").and_then(|v| v.as_str());
        if format != Some(CHECKPOINT_FORMAT) {
            return Err(Error::CheckpointFormat(format!(
                "unexpected format tag {format:?}"
            )));
        }
        let version = value
            .get("version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| Error::CheckpointFormat("missing version tag".into()))?;
        if version != CHECKPOINT_VERSION {
            return Err(Error::CheckpointVersion {
                found: version,
                supported: CHECKPOINT_VERSION,
            });
        }

        let body = value
            .get_mut("checkpoint")
            .map(serde_json::Value::take)
            .ok_or_else(|| Error::CheckpointFormat("missing checkpoint body".into()))?;
        let checkpoint: Checkpoint = serde_json::from_value(body)
            .map_err(|e| Error::CheckpointFormat(e.to_string()))?;

        if checkpoint.completed_chunks.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::CheckpointFormat(
                "completed chunk list is not sorted and unique".into(),
            ));
        }
        Ok(checkpoint)
    }
}

/// Durable home for checkpoints. `save` either fully succeeds or errors.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint, returning the id to load it by.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<String>;

    /// `Ok(None)` when no checkpoint has that id.
    async fn load(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>>;
}

/// In-process store holding encoded blobs. Used for tests and one-shot runs
/// that do not need checkpoints to outlive the process.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    blobs: Mutex<HashMap<String, String>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a pre-encoded blob under an id.
    pub async fn insert_raw(&self, checkpoint_id: &str, blob: String) {
        self.blobs.lock().await.insert(checkpoint_id.to_string(), blob);
    }

    pub async fn len(&self) -> usize {
        self.blobs.lock().await.len()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<String> {
        let blob = checkpoint.encode()?;
        self.blobs
            .lock()
            .await
            .insert(checkpoint.checkpoint_id.clone(), blob);
        Ok(checkpoint.checkpoint_id.clone())
    }

    async fn load(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>> {
        let blob = self.blobs.lock().await.get(checkpoint_id).cloned();
        blob.map(|b| Checkpoint::decode(&b)).transpose()
    }
}
