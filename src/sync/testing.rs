//! In-process source and sink doubles for orchestrator tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::sink::{RecordFailure, RecordSink, SinkError, WriteReport};
use crate::source::{AttendanceRecord, Page, SourceClient, SourceError};
use crate::sync::chunker::DateWindow;
use crate::sync::CancelHandle;

#[derive(Debug, Clone, PartialEq)]
pub struct FetchCall {
    pub school: Option<String>,
    pub window: DateWindow,
    pub page_token: Option<String>,
}

/// Which calls a failing [`StubSource`] fails.
enum FailWhen {
    Always,
    FirstCalls(usize),
    WindowContains(NaiveDate),
}

/// Generates `records_per_day` records for every day of the requested
/// window, paged by offset. Record ids are `{school}-{date}-{n}`, with
/// school `ALL` for unscoped requests.
pub struct StubSource {
    records_per_day: usize,
    foreign_records: bool,
    fail_with: Option<(FailWhen, SourceError)>,
    delay: Option<Duration>,
    cancel_on: Mutex<Option<(usize, CancelHandle)>>,
    calls: Mutex<Vec<FetchCall>>,
}

impl StubSource {
    pub fn new(records_per_day: usize) -> Self {
        Self {
            records_per_day,
            foreign_records: false,
            fail_with: None,
            delay: None,
            cancel_on: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every call fails with `error`.
    pub fn failing_with(mut self, error: SourceError) -> Self {
        self.fail_with = Some((FailWhen::Always, error));
        self
    }

    /// The first `n` calls fail with `error`, later calls succeed.
    pub fn failing_first(mut self, n: usize, error: SourceError) -> Self {
        self.fail_with = Some((FailWhen::FirstCalls(n), error));
        self
    }

    /// Calls for any window covering `day` fail with `error`.
    pub fn failing_on(mut self, day: NaiveDate, error: SourceError) -> Self {
        self.fail_with = Some((FailWhen::WindowContains(day), error));
        self
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Add one record from school `XYZ` to every non-empty page.
    pub fn leaking_foreign_records(mut self) -> Self {
        self.foreign_records = true;
        self
    }

    /// Trigger `handle` while serving call number `call` (1-based).
    pub fn cancel_on_call(&self, call: usize, handle: CancelHandle) {
        *self.cancel_on.lock().unwrap() = Some((call, handle));
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Windows of first-page requests, i.e. one entry per chunk attempt.
    pub fn first_page_windows(&self) -> Vec<DateWindow> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.page_token.is_none())
            .map(|c| c.window)
            .collect()
    }

    fn records_for(&self, school: &str, window: &DateWindow) -> Vec<AttendanceRecord> {
        let mut records = Vec::new();
        let mut date = window.start;
        while date <= window.end {
            for n in 0..self.records_per_day {
                records.push(record(school, date, n));
            }
            date = date.succ_opt().unwrap();
        }
        records
    }
}

fn record(school: &str, date: NaiveDate, n: usize) -> AttendanceRecord {
    AttendanceRecord {
        record_id: format!("{school}-{date}-{n}"),
        school_code: school.to_string(),
        student_id: format!("S{n:04}"),
        date,
        period: None,
        code: if n % 5 == 0 { "A" } else { "P" }.to_string(),
    }
}

#[async_trait]
impl SourceClient for StubSource {
    async fn fetch_page(
        &self,
        school_code: Option<&str>,
        window: &DateWindow,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<Page, SourceError> {
        let call_number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(FetchCall {
                school: school_code.map(str::to_string),
                window: *window,
                page_token: page_token.map(str::to_string),
            });
            calls.len()
        };
        if let Some((at, handle)) = self.cancel_on.lock().unwrap().as_ref() {
            if *at == call_number {
                handle.cancel();
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some((when, error)) = &self.fail_with {
            let fails = match when {
                FailWhen::Always => true,
                FailWhen::FirstCalls(n) => call_number <= *n,
                FailWhen::WindowContains(day) => window.contains(*day),
            };
            if fails {
                return Err(error.clone());
            }
        }

        let offset: usize = page_token.map_or(0, |t| t.parse().unwrap());
        let all = self.records_for(school_code.unwrap_or("ALL"), window);
        let end = (offset + page_size as usize).min(all.len());
        let mut records = all[offset.min(end)..end].to_vec();
        if self.foreign_records && !records.is_empty() {
            records.push(record("XYZ", window.start, offset));
        }
        let next_page_token = (end < all.len()).then(|| end.to_string());
        Ok(Page {
            records,
            next_page_token,
        })
    }
}

pub enum SinkMode {
    AlwaysOk,
    AlwaysFail(SinkError),
    /// The first `n` calls fail with the error, later calls succeed.
    FailFirst(usize, SinkError),
    /// These record ids are permanently rejected.
    Reject(HashSet<String>),
    /// These record ids fail transiently the first time they are seen.
    FlakyOnce(HashSet<String>),
}

/// Records every batch it receives and answers according to its mode.
pub struct RecordingSink {
    mode: SinkMode,
    delay: Option<Duration>,
    calls: AtomicUsize,
    batches: Mutex<Vec<Vec<String>>>,
    written: Mutex<Vec<String>>,
    flaked: Mutex<HashSet<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingSink {
    pub fn new(mode: SinkMode) -> Self {
        Self {
            mode,
            delay: None,
            calls: AtomicUsize::new(0),
            batches: Mutex::new(Vec::new()),
            written: Mutex::new(Vec::new()),
            flaked: Mutex::new(HashSet::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn write_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }

    /// Ids acknowledged as written, in write order.
    pub fn written_ids(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }

    /// Highest number of concurrent `write_batch` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSink for RecordingSink {
    async fn write_batch(&self, records: &[AttendanceRecord]) -> Result<WriteReport, SinkError> {
        let call_number = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.batches
            .lock()
            .unwrap()
            .push(records.iter().map(|r| r.record_id.clone()).collect());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut report = WriteReport::default();
        match &self.mode {
            SinkMode::AlwaysFail(error) => return Err(error.clone()),
            SinkMode::FailFirst(n, error) if call_number <= *n => return Err(error.clone()),
            SinkMode::AlwaysOk | SinkMode::FailFirst(..) => {
                report.succeeded = records.iter().map(|r| r.record_id.clone()).collect();
            }
            SinkMode::Reject(ids) => {
                for r in records {
                    if ids.contains(&r.record_id) {
                        report
                            .failed
                            .push(RecordFailure::rejected(&r.record_id, "invalid attendance code"));
                    } else {
                        report.succeeded.push(r.record_id.clone());
                    }
                }
            }
            SinkMode::FlakyOnce(ids) => {
                let mut flaked = self.flaked.lock().unwrap();
                for r in records {
                    if ids.contains(&r.record_id) && flaked.insert(r.record_id.clone()) {
                        report
                            .failed
                            .push(RecordFailure::retryable(&r.record_id, "row locked"));
                    } else {
                        report.succeeded.push(r.record_id.clone());
                    }
                }
            }
        }

        self.written
            .lock()
            .unwrap()
            .extend(report.succeeded.iter().cloned());
        Ok(report)
    }
}
