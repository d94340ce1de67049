//! The local SQLite database as a sync target: attendance sink and durable
//! checkpoint store.

use async_trait::async_trait;
use rusqlite::{Connection, ErrorCode};

use crate::error::{Error, Result};
use crate::sink::{RecordFailure, RecordSink, SinkError, WriteReport};
use crate::source::AttendanceRecord;
use crate::storage::repository::{self, CheckpointSummary, SyncJob};
use crate::storage::Database;
use crate::sync::checkpoint::{Checkpoint, CheckpointStore, CHECKPOINT_VERSION};

/// Why a record cannot be stored, if it cannot.
fn invalid_reason(record: &AttendanceRecord) -> Option<&'static str> {
    if record.record_id.trim().is_empty() {
        Some("missing record id")
    } else if record.student_id.trim().is_empty() {
        Some("missing student id")
    } else if record.school_code.trim().is_empty() {
        Some("missing school code")
    } else if record.code.trim().is_empty() {
        Some("missing attendance code")
    } else {
        None
    }
}

/// Upsert a batch in one transaction. Invalid records are reported, not written.
fn write_records(
    conn: &mut Connection,
    records: &[AttendanceRecord],
) -> std::result::Result<WriteReport, rusqlite::Error> {
    let tx = conn.transaction()?;
    let mut report = WriteReport::default();
    for record in records {
        if let Some(reason) = invalid_reason(record) {
            report
                .failed
                .push(RecordFailure::rejected(&record.record_id, reason));
            continue;
        }
        repository::upsert_attendance(&tx, record)?;
        report.succeeded.push(record.record_id.clone());
    }
    tx.commit()?;
    Ok(report)
}

fn classify_sqlite_error(e: rusqlite::Error) -> SinkError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            SinkError::Conflict(e.to_string())
        }
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
            SinkError::Rejected(e.to_string())
        }
        _ => SinkError::Unavailable(e.to_string()),
    }
}

impl Database {
    /// Most recent checkpoints first.
    pub async fn list_checkpoints(&self, limit: u32) -> Result<Vec<CheckpointSummary>> {
        self.reader()
            .call(move |conn| repository::list_checkpoints(conn, limit))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    /// Most recent sync jobs first.
    pub async fn list_sync_jobs(&self, limit: u32) -> Result<Vec<SyncJob>> {
        self.reader()
            .call(move |conn| repository::list_sync_jobs(conn, limit))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn attendance_count(&self, school_code: Option<&str>) -> Result<i64> {
        self.reader()
            .call({
                let school_code = school_code.map(str::to_string);
                move |conn| repository::count_attendance(conn, school_code.as_deref())
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}

#[async_trait]
impl RecordSink for Database {
    async fn write_batch(
        &self,
        records: &[AttendanceRecord],
    ) -> std::result::Result<WriteReport, SinkError> {
        let records = records.to_vec();
        let written = self
            .writer()
            .call(move |conn| {
                Ok::<_, rusqlite::Error>(
                    write_records(conn, &records).map_err(classify_sqlite_error),
                )
            })
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;

        let report = written?;
        if !report.failed.is_empty() {
            log::debug!("Rejected {} invalid attendance records", report.failed.len());
        }
        Ok(report)
    }
}

#[async_trait]
impl CheckpointStore for Database {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<String> {
        let payload = checkpoint.encode()?;
        let summary = CheckpointSummary {
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            operation_id: checkpoint.operation_id.clone(),
            format_version: CHECKPOINT_VERSION as i64,
            completed_chunks: checkpoint.completed_chunks.len() as i64,
            records_processed: checkpoint.counters.records_processed as i64,
            created_at: checkpoint.created_at.to_rfc3339(),
        };
        self.writer()
            .call(move |conn| {
                repository::insert_checkpoint(conn, &summary, &payload)?;
                Ok::<(), rusqlite::Error>(())
            })
            .await?;
        Ok(checkpoint.checkpoint_id.clone())
    }

    async fn load(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>> {
        let payload = self
            .reader()
            .call({
                let checkpoint_id = checkpoint_id.to_string();
                move |conn| repository::get_checkpoint_payload(conn, &checkpoint_id)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        payload.map(|p| Checkpoint::decode(&p)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::sync::checkpoint::SyncCounters;
    use crate::sync::SyncConfiguration;

    fn record(id: &str, student: &str) -> AttendanceRecord {
        AttendanceRecord {
            record_id: id.to_string(),
            school_code: "RMS".to_string(),
            student_id: student.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 8, 15).unwrap(),
            period: None,
            code: "A".to_string(),
        }
    }

    async fn stored(db: &Database) -> i64 {
        db.attendance_count(None).await.unwrap()
    }

    #[tokio::test]
    async fn test_write_batch_rejects_invalid_records() {
        let db = Database::open_memory().await.unwrap();
        let batch = vec![record("r1", "S1"), record("r2", " "), record("r3", "S3")];

        let report = db.write_batch(&batch).await.unwrap();
        assert_eq!(report.succeeded, vec!["r1".to_string(), "r3".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].record_id, "r2");
        assert!(!report.failed[0].transient);
        assert_eq!(stored(&db).await, 2);
    }

    #[tokio::test]
    async fn test_write_batch_is_idempotent() {
        let db = Database::open_memory().await.unwrap();
        let batch = vec![record("r1", "S1"), record("r2", "S2")];

        db.write_batch(&batch).await.unwrap();
        let again = db.write_batch(&batch).await.unwrap();
        assert_eq!(again.succeeded.len(), 2);
        assert_eq!(stored(&db).await, 2);
    }

    #[test]
    fn test_busy_database_is_a_conflict() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(classify_sqlite_error(busy), SinkError::Conflict(_)));
        assert!(matches!(
            classify_sqlite_error(rusqlite::Error::InvalidQuery),
            SinkError::Unavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_store_round_trip() {
        let db = Database::open_memory().await.unwrap();
        let config = SyncConfiguration::new(
            NaiveDate::from_ymd_opt(2024, 8, 15).unwrap(),
            NaiveDate::from_ymd_opt(2024, 8, 19).unwrap(),
        );
        let counters = SyncCounters {
            records_processed: 20,
            records_successful: 20,
            ..Default::default()
        };
        let checkpoint = Checkpoint::new("op-1", config, vec![0, 2], counters);

        let id = db.save(&checkpoint).await.unwrap();
        assert_eq!(db.load(&id).await.unwrap(), Some(checkpoint));
        assert_eq!(db.load("missing").await.unwrap(), None);

        let listed = db.list_checkpoints(10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].completed_chunks, 2);
        assert_eq!(listed[0].records_processed, 20);
    }

    #[tokio::test]
    async fn test_load_rejects_corrupt_payload() {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| {
                let summary = CheckpointSummary {
                    checkpoint_id: "bad".to_string(),
                    operation_id: "op-1".to_string(),
                    format_version: 1,
                    completed_chunks: 0,
                    records_processed: 0,
                    created_at: "2024-08-20T10:00:00Z".to_string(),
                };
                repository::insert_checkpoint(conn, &summary, "{\"format\":\"other\"}")?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();

        assert!(matches!(db.load("bad").await, Err(Error::CheckpointFormat(_))));
    }
}
