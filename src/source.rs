//! The Student Information System side of a sync: the records it serves and
//! the paging contract the orchestrator consumes.

use std::path::Path;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Result;
use crate::sync::chunker::DateWindow;
use crate::sync::retry::{Classify, ErrorClass};

/// One attendance mark for one student, one day and (optionally) one period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub record_id: String,
    pub school_code: String,
    pub student_id: String,
    pub date: NaiveDate,
    /// Class period; `None` for all-day marks.
    #[serde(default)]
    pub period: Option<u32>,
    /// SIS attendance code (e.g. "P", "A", "T").
    pub code: String,
}

/// One page of records returned by [`SourceClient::fetch_page`].
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<AttendanceRecord>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited by SIS")]
    RateLimited,

    #[error("SIS unavailable: {0}")]
    Unavailable(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("SIS rejected credentials: {0}")]
    Unauthorized(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl Classify for SourceError {
    fn class(&self) -> ErrorClass {
        match self {
            SourceError::Timeout
            | SourceError::RateLimited
            | SourceError::Unavailable(_)
            | SourceError::Network(_) => ErrorClass::Transient,
            SourceError::Unauthorized(_) | SourceError::Malformed(_) => ErrorClass::Permanent,
        }
    }
}

/// Fetches attendance pages from the SIS.
///
/// Implementations must return the same page for identical
/// `(school_code, window, page_token)` so that retries are safe.
/// `school_code = None` means "all schools".
#[async_trait]
pub trait SourceClient: Send + Sync {
    async fn fetch_page(
        &self,
        school_code: Option<&str>,
        window: &DateWindow,
        page_token: Option<&str>,
        page_size: u32,
    ) -> std::result::Result<Page, SourceError>;
}

/// Serves an SIS attendance export (a JSON array of [`AttendanceRecord`]s)
/// through the paging contract. Page tokens are record offsets into the
/// filtered, ordered result.
pub struct JsonFileSource {
    records: Vec<AttendanceRecord>,
}

impl JsonFileSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let records: Vec<AttendanceRecord> = serde_json::from_str(&raw)?;
        log::info!(
            "Loaded {} attendance records from {}",
            records.len(),
            path.as_ref().display()
        );
        Ok(Self::from_records(records))
    }

    pub fn from_records(mut records: Vec<AttendanceRecord>) -> Self {
        records.sort_by(|a, b| {
            (&a.school_code, a.date, a.period, &a.record_id)
                .cmp(&(&b.school_code, b.date, b.period, &b.record_id))
        });
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl SourceClient for JsonFileSource {
    async fn fetch_page(
        &self,
        school_code: Option<&str>,
        window: &DateWindow,
        page_token: Option<&str>,
        page_size: u32,
    ) -> std::result::Result<Page, SourceError> {
        let offset = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| SourceError::Malformed(format!("bad page token '{token}'")))?,
            None => 0,
        };

        let mut matching = self.records.iter().filter(|r| {
            window.contains(r.date) && school_code.map_or(true, |code| r.school_code == code)
        });

        let records: Vec<AttendanceRecord> = matching
            .by_ref()
            .skip(offset)
            .take(page_size as usize)
            .cloned()
            .collect();
        let more = matching.next().is_some();

        let next_page_token = if more {
            Some((offset + records.len()).to_string())
        } else {
            None
        };
        Ok(Page {
            records,
            next_page_token,
        })
    }
}
