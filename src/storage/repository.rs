use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::source::AttendanceRecord;
use crate::sync::SyncResult;

// ── Attendance ─────────────────────────────────────────────────────

pub fn upsert_attendance(
    conn: &Connection,
    record: &AttendanceRecord,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO fact_attendance
            (record_id, school_code, student_id, attendance_date, period, attendance_code, synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
         ON CONFLICT(record_id) DO UPDATE SET
            school_code = excluded.school_code,
            student_id = excluded.student_id,
            attendance_date = excluded.attendance_date,
            period = excluded.period,
            attendance_code = excluded.attendance_code,
            synced_at = excluded.synced_at",
        params![
            record.record_id,
            record.school_code,
            record.student_id,
            record.date.format("%Y-%m-%d").to_string(),
            record.period,
            record.code,
        ],
    )?;
    Ok(())
}

/// Count stored attendance rows, optionally for one school.
pub fn count_attendance(
    conn: &Connection,
    school_code: Option<&str>,
) -> Result<i64, rusqlite::Error> {
    match school_code {
        Some(code) => conn.query_row(
            "SELECT COUNT(*) FROM fact_attendance WHERE school_code = ?1",
            params![code],
            |row| row.get(0),
        ),
        None => conn.query_row("SELECT COUNT(*) FROM fact_attendance", [], |row| row.get(0)),
    }
}

// ── Checkpoints ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointSummary {
    pub checkpoint_id: String,
    pub operation_id: String,
    pub format_version: i64,
    pub completed_chunks: i64,
    pub records_processed: i64,
    pub created_at: String,
}

pub fn insert_checkpoint(
    conn: &Connection,
    summary: &CheckpointSummary,
    payload: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_checkpoints
            (checkpoint_id, operation_id, format_version, completed_chunks,
             records_processed, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            summary.checkpoint_id,
            summary.operation_id,
            summary.format_version,
            summary.completed_chunks,
            summary.records_processed,
            payload,
            summary.created_at,
        ],
    )?;
    Ok(())
}

pub fn get_checkpoint_payload(
    conn: &Connection,
    checkpoint_id: &str,
) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT payload FROM sync_checkpoints WHERE checkpoint_id = ?1",
        params![checkpoint_id],
        |row| row.get(0),
    )
    .optional()
}

/// Most recent checkpoints first.
pub fn list_checkpoints(
    conn: &Connection,
    limit: u32,
) -> Result<Vec<CheckpointSummary>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT checkpoint_id, operation_id, format_version, completed_chunks,
                records_processed, created_at
         FROM sync_checkpoints
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| {
        Ok(CheckpointSummary {
            checkpoint_id: row.get(0)?,
            operation_id: row.get(1)?,
            format_version: row.get(2)?,
            completed_chunks: row.get(3)?,
            records_processed: row.get(4)?,
            created_at: row.get(5)?,
        })
    })?;
    rows.collect()
}

// ── Sync Jobs ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SyncJob {
    pub id: i64,
    pub operation_id: Option<String>,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub range_start: String,
    pub range_end: String,
    pub records_processed: i64,
    pub records_successful: i64,
    pub records_failed: i64,
    pub records_skipped: i64,
    pub retry_attempts: i64,
    pub checkpoint_id: Option<String>,
    pub error_message: Option<String>,
}

pub fn insert_sync_job(
    conn: &Connection,
    range_start: &str,
    range_end: &str,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_jobs (status, started_at, range_start, range_end)
         VALUES ('running', datetime('now'), ?1, ?2)",
        params![range_start, range_end],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Close a job row with the outcome of its run.
pub fn finish_sync_job(
    conn: &Connection,
    job_id: i64,
    result: &SyncResult,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE sync_jobs SET
            operation_id = ?2, status = ?3, completed_at = datetime('now'),
            records_processed = ?4, records_successful = ?5,
            records_failed = ?6, records_skipped = ?7, retry_attempts = ?8,
            checkpoint_id = ?9, error_message = ?10
         WHERE id = ?1",
        params![
            job_id,
            result.operation_id,
            result.status.as_str(),
            result.records_processed as i64,
            result.records_successful as i64,
            result.records_failed as i64,
            result.records_skipped as i64,
            result.retry_attempts as i64,
            result.checkpoint_id,
            result.failure_reason,
        ],
    )?;
    Ok(())
}

/// Mark a job failed when its run errored before producing a result.
pub fn fail_sync_job(conn: &Connection, job_id: i64, error: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE sync_jobs SET status = 'failed', completed_at = datetime('now'), error_message = ?2
         WHERE id = ?1",
        params![job_id, error],
    )?;
    Ok(())
}

/// Most recent jobs first.
pub fn list_sync_jobs(conn: &Connection, limit: u32) -> Result<Vec<SyncJob>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, operation_id, status, started_at, completed_at, range_start, range_end,
                records_processed, records_successful, records_failed, records_skipped,
                retry_attempts, checkpoint_id, error_message
         FROM sync_jobs
         ORDER BY id DESC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| {
        Ok(SyncJob {
            id: row.get(0)?,
            operation_id: row.get(1)?,
            status: row.get(2)?,
            started_at: row.get(3)?,
            completed_at: row.get(4)?,
            range_start: row.get(5)?,
            range_end: row.get(6)?,
            records_processed: row.get(7)?,
            records_successful: row.get(8)?,
            records_failed: row.get(9)?,
            records_skipped: row.get(10)?,
            retry_attempts: row.get(11)?,
            checkpoint_id: row.get(12)?,
            error_message: row.get(13)?,
        })
    })?;
    rows.collect()
}
