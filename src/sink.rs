use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::source::AttendanceRecord;
use crate::sync::retry::{Classify, ErrorClass};

/// A record the sink refused or could not write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub record_id: String,
    pub reason: String,
    /// Transient failures (e.g. a row lock) may succeed when re-written.
    pub transient: bool,
}

impl RecordFailure {
    pub fn rejected(record_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            reason: reason.into(),
            transient: false,
        }
    }

    pub fn retryable(record_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            reason: reason.into(),
            transient: true,
        }
    }
}

/// Outcome of one [`RecordSink::write_batch`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<RecordFailure>,
}

/// Whole-batch write failures. Per-record problems are reported through
/// [`WriteReport::failed`] instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("write timed out")]
    Timeout,

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("batch rejected: {0}")]
    Rejected(String),
}

impl Classify for SinkError {
    fn class(&self) -> ErrorClass {
        match self {
            SinkError::Timeout | SinkError::Conflict(_) | SinkError::Unavailable(_) => {
                ErrorClass::Transient
            }
            SinkError::Rejected(_) => ErrorClass::Permanent,
        }
    }
}

/// Durably upserts attendance records. Writes must be safe to repeat: a
/// retried batch can overlap records that were already written.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn write_batch(
        &self,
        records: &[AttendanceRecord],
    ) -> std::result::Result<WriteReport, SinkError>;
}
