use std::fmt;

use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid date range {start}..{end} with chunk size {chunk_days} days")]
    InvalidRange {
        start: NaiveDate,
        end: NaiveDate,
        chunk_days: i64,
    },

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Checkpoint format version {found} is not supported (expected {supported})")]
    CheckpointVersion { found: u64, supported: u64 },

    #[error("Invalid checkpoint: {0}")]
    CheckpointFormat(String),

    #[error("Configuration mismatch: {0}")]
    ConfigurationMismatch(String),

    #[error("Sync has already been started on this orchestrator")]
    AlreadyStarted,

    #[error("No sync run has been started yet")]
    NotStarted,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for Error {
    fn from(e: rusqlite_migration::Error) -> Self {
        Error::Migration(e.to_string())
    }
}

impl<E: fmt::Display> From<tokio_rusqlite::Error<E>> for Error {
    fn from(e: tokio_rusqlite::Error<E>) -> Self {
        Error::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
