use std::fmt;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::date_util::{days_inclusive, first_school_day, last_school_day};
use crate::error::{Error, Result};
use crate::sync::SyncConfiguration;

/// A date window [start, end] inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn contains(&self, d: NaiveDate) -> bool {
        self.start <= d && d <= self.end
    }

    pub fn days(&self) -> i64 {
        days_inclusive(self.start, self.end)
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// One unit of sync work: a date window, optionally scoped to one school.
///
/// `index` is the chunk's position in the full plan for a configuration and
/// is what checkpoints record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub index: u64,
    pub window: DateWindow,
    pub school_code: Option<String>,
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.school_code {
            Some(code) => write!(f, "chunk #{} [{code} {}]", self.index, self.window),
            None => write!(f, "chunk #{} [all schools {}]", self.index, self.window),
        }
    }
}

/// Split [start, end] into consecutive windows of at most `chunk_days` days.
/// The final window may be shorter.
pub fn chunk_dates(start: NaiveDate, end: NaiveDate, chunk_days: i64) -> Result<Vec<DateWindow>> {
    if start > end || chunk_days <= 0 {
        return Err(Error::InvalidRange {
            start,
            end,
            chunk_days,
        });
    }

    let mut windows = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        let window_end = (cursor + Duration::days(chunk_days - 1)).min(end);
        windows.push(DateWindow {
            start: cursor,
            end: window_end,
        });
        cursor = window_end + Duration::days(1);
    }
    Ok(windows)
}

/// Trim each window to its first and last school day, dropping windows that
/// contain none.
pub fn trim_to_school_days(windows: Vec<DateWindow>, holidays: &[NaiveDate]) -> Vec<DateWindow> {
    windows
        .into_iter()
        .filter_map(|w| {
            let start = first_school_day(w.start, w.end, holidays)?;
            let end = last_school_day(w.start, w.end, holidays)?;
            Some(DateWindow { start, end })
        })
        .collect()
}

/// Build the full, deterministic chunk plan for a configuration: date windows
/// crossed with the school filter, in window-major order.
pub fn plan_chunks(config: &SyncConfiguration) -> Result<Vec<Chunk>> {
    let mut windows = chunk_dates(config.start_date, config.end_date, config.chunk_days as i64)?;
    if config.skip_non_school_days {
        windows = trim_to_school_days(windows, &config.holidays);
    }

    let schools: Vec<Option<String>> = {
        let filter = config.school_filter();
        if filter.is_empty() {
            vec![None]
        } else {
            filter.into_iter().map(Some).collect()
        }
    };

    let mut chunks = Vec::with_capacity(windows.len() * schools.len());
    for window in &windows {
        for school in &schools {
            chunks.push(Chunk {
                index: chunks.len() as u64,
                window: *window,
                school_code: school.clone(),
            });
        }
    }
    Ok(chunks)
}
