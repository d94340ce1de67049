pub mod checkpoint;
pub mod chunker;
pub mod orchestrator;
pub mod progress;
pub mod retry;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{Error, Result};
use checkpoint::SyncCounters;
use chunker::Chunk;
use progress::ProgressUpdate;

pub use orchestrator::{CancelHandle, SyncOrchestrator};

const MAX_PARALLELISM: u32 = 64;
const MAX_CHUNK_DAYS: u32 = 366;

/// Immutable description of one sync invocation.
///
/// Embedded verbatim in every checkpoint, so it is also the unit of
/// compatibility when resuming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfiguration {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Empty means all schools.
    #[serde(default)]
    pub school_codes: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_chunk_days")]
    pub chunk_days: u32,
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
    /// Trim chunk windows to school days and drop windows without any.
    #[serde(default)]
    pub skip_non_school_days: bool,
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub monitoring: MonitoringSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    pub progress_interval_ms: u64,
    pub metrics_enabled: bool,
    /// Seed for the total-records estimate before real counts arrive.
    pub expected_records_per_day: u64,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            progress_interval_ms: 1_000,
            metrics_enabled: true,
            expected_records_per_day: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub source_timeout_ms: u64,
    pub sink_timeout_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            source_timeout_ms: 30_000,
            sink_timeout_ms: 30_000,
        }
    }
}

fn default_batch_size() -> u32 {
    500
}

fn default_chunk_days() -> u32 {
    7
}

fn default_parallelism() -> u32 {
    4
}

impl SyncConfiguration {
    /// A configuration over [start, end] with default tuning.
    pub fn new(start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            start_date,
            end_date,
            school_codes: Vec::new(),
            batch_size: default_batch_size(),
            chunk_days: default_chunk_days(),
            parallelism: default_parallelism(),
            skip_non_school_days: false,
            holidays: Vec::new(),
            retry: RetrySettings::default(),
            monitoring: MonitoringSettings::default(),
            timeouts: TimeoutSettings::default(),
        }
    }

    /// Load a configuration from a JSON file. Omitted tuning fields take
    /// their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Check every constraint. Runs before any I/O.
    pub fn validate(&self) -> Result<()> {
        if self.start_date > self.end_date {
            return Err(Error::Config(format!(
                "start date {} is after end date {}",
                self.start_date, self.end_date
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch size must be greater than 0".into()));
        }
        if self.chunk_days == 0 || self.chunk_days > MAX_CHUNK_DAYS {
            return Err(Error::Config(format!(
                "chunk size must be between 1 and {MAX_CHUNK_DAYS} days, got {}",
                self.chunk_days
            )));
        }
        if self.parallelism == 0 || self.parallelism > MAX_PARALLELISM {
            return Err(Error::Config(format!(
                "parallelism must be between 1 and {MAX_PARALLELISM}, got {}",
                self.parallelism
            )));
        }
        if self.school_codes.iter().any(|c| c.trim().is_empty()) {
            return Err(Error::Config("school codes must not be blank".into()));
        }

        let retry = &self.retry;
        if retry.initial_delay_ms == 0 {
            return Err(Error::Config("initial retry delay must be greater than 0".into()));
        }
        if retry.max_delay_ms < retry.initial_delay_ms {
            return Err(Error::Config(format!(
                "max retry delay ({}ms) is less than initial delay ({}ms)",
                retry.max_delay_ms, retry.initial_delay_ms
            )));
        }
        if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
            return Err(Error::Config(format!(
                "backoff multiplier must be >= 1, got {}",
                retry.backoff_multiplier
            )));
        }

        if self.monitoring.progress_interval_ms == 0 {
            return Err(Error::Config("progress interval must be greater than 0".into()));
        }
        if self.timeouts.source_timeout_ms == 0 || self.timeouts.sink_timeout_ms == 0 {
            return Err(Error::Config("timeouts must be greater than 0".into()));
        }
        Ok(())
    }

    /// School filter, trimmed, sorted and de-duplicated. Empty means all schools.
    pub fn school_filter(&self) -> Vec<String> {
        self.school_codes
            .iter()
            .map(|c| c.trim().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Two configurations are compatible when they produce the same chunk
    /// list. Tuning (batch size, parallelism, retry, monitoring) may differ.
    pub fn ensure_compatible(&self, other: &SyncConfiguration) -> Result<()> {
        if self.start_date != other.start_date || self.end_date != other.end_date {
            return Err(Error::ConfigurationMismatch(format!(
                "date range {}..{} differs from checkpoint range {}..{}",
                other.start_date, other.end_date, self.start_date, self.end_date
            )));
        }
        if self.school_filter() != other.school_filter() {
            return Err(Error::ConfigurationMismatch(format!(
                "school filter {:?} differs from checkpoint filter {:?}",
                other.school_filter(),
                self.school_filter()
            )));
        }
        if self.chunk_days != other.chunk_days {
            return Err(Error::ConfigurationMismatch(format!(
                "chunk size {} days differs from checkpoint chunk size {} days",
                other.chunk_days, self.chunk_days
            )));
        }
        let mut mine = self.holidays.clone();
        let mut theirs = other.holidays.clone();
        mine.sort();
        theirs.sort();
        if self.skip_non_school_days != other.skip_non_school_days || mine != theirs {
            return Err(Error::ConfigurationMismatch(
                "school-day calendar differs from checkpoint calendar".into(),
            ));
        }
        Ok(())
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.retry.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.retry.max_delay_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring.progress_interval_ms)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.source_timeout_ms)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.sink_timeout_ms)
    }
}

/// Lifecycle of a [`SyncOrchestrator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncState {
    Idle,
    Initializing,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::Idle => "idle",
            SyncState::Initializing => "initializing",
            SyncState::Running => "running",
            SyncState::Completed => "completed",
            SyncState::Failed => "failed",
            SyncState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Operation-level outcome. Partial record failures do not make a run `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Completed,
    Cancelled,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Completed => "completed",
            SyncStatus::Cancelled => "cancelled",
            SyncStatus::Failed => "failed",
        }
    }
}

/// Report returned after a sync run finishes.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub operation_id: String,
    pub status: SyncStatus,
    #[serde(rename = "execution_time_ms", serialize_with = "serialize_millis")]
    pub execution_time: Duration,
    pub records_processed: u64,
    pub records_successful: u64,
    pub records_failed: u64,
    pub records_skipped: u64,
    pub retry_attempts: u64,
    pub failure_reason: Option<String>,
    /// Checkpoint saved when the run stopped, if the save succeeded.
    pub checkpoint_id: Option<String>,
    /// Set when the closing checkpoint could not be saved. Independent of
    /// the record counters.
    pub checkpoint_error: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl SyncResult {
    /// True for `Completed` and `Cancelled`.
    pub fn is_success(&self) -> bool {
        self.status != SyncStatus::Failed
    }
}

fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Emitted once the chunk list is known.
#[derive(Debug, Clone, Serialize)]
pub struct RunInfo {
    pub operation_id: String,
    pub chunks_total: usize,
    pub chunks_pending: usize,
    pub resumed_from: Option<String>,
}

/// Emitted when a batch reaches a terminal outcome.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub chunk_index: u64,
    pub batch_number: u32,
    /// Counter deltas contributed by this batch alone.
    pub counters: SyncCounters,
}

/// Observer for sync lifecycle notifications. All methods default to no-ops.
///
/// Notifications are delivered from the orchestrator's reporting task, never
/// from a worker, so a slow observer does not stall I/O.
pub trait SyncProgress: Send + Sync {
    fn on_initialized(&self, _run: &RunInfo) {}
    fn on_chunk_started(&self, _chunk: &Chunk) {}
    fn on_batch_processed(&self, _batch: &BatchReport) {}
    fn on_chunk_completed(&self, _chunk: &Chunk, _counters: &SyncCounters) {}
    fn on_progress(&self, _update: &ProgressUpdate) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_default_configuration_is_valid() {
        let config = SyncConfiguration::new(d(2024, 8, 15), d(2025, 6, 5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_reversed_range() {
        let config = SyncConfiguration::new(d(2024, 8, 20), d(2024, 8, 15));
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let base = SyncConfiguration::new(d(2024, 8, 15), d(2024, 8, 20));

        let mut c = base.clone();
        c.batch_size = 0;
        assert!(matches!(c.validate(), Err(Error::Config(_))));

        let mut c = base.clone();
        c.chunk_days = 0;
        assert!(matches!(c.validate(), Err(Error::Config(_))));

        let mut c = base.clone();
        c.parallelism = 0;
        assert!(matches!(c.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_retry_settings() {
        let base = SyncConfiguration::new(d(2024, 8, 15), d(2024, 8, 20));

        let mut c = base.clone();
        c.retry.max_delay_ms = 10;
        assert!(matches!(c.validate(), Err(Error::Config(_))));

        let mut c = base.clone();
        c.retry.backoff_multiplier = 0.5;
        assert!(matches!(c.validate(), Err(Error::Config(_))));

        let mut c = base;
        c.retry.initial_delay_ms = 0;
        assert!(matches!(c.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_school_filter_normalized() {
        let mut config = SyncConfiguration::new(d(2024, 8, 15), d(2024, 8, 20));
        config.school_codes = vec!["RMS".into(), " LHS".into(), "RMS".into()];
        assert_eq!(config.school_filter(), vec!["LHS".to_string(), "RMS".to_string()]);
    }

    #[test]
    fn test_compatibility_ignores_tuning() {
        let a = SyncConfiguration::new(d(2024, 8, 15), d(2024, 8, 20));
        let mut b = a.clone();
        b.parallelism = 8;
        b.batch_size = 50;
        b.retry.max_retries = 0;
        assert!(a.ensure_compatible(&b).is_ok());
    }

    #[test]
    fn test_compatibility_rejects_different_range() {
        let a = SyncConfiguration::new(d(2024, 8, 15), d(2024, 8, 20));
        let b = SyncConfiguration::new(d(2024, 8, 15), d(2024, 8, 21));
        assert!(matches!(
            a.ensure_compatible(&b),
            Err(Error::ConfigurationMismatch(_))
        ));
    }

    #[test]
    fn test_configuration_from_json_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(
            &path,
            r#"{"start_date": "2024-08-15", "end_date": "2024-09-15", "school_codes": ["RMS"], "retry": {"max_retries": 5}}"#,
        )
        .unwrap();

        let config = SyncConfiguration::from_json_file(&path).unwrap();
        assert_eq!(config.school_codes, vec!["RMS".to_string()]);
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.initial_delay_ms, 1_000);
        assert!(config.validate().is_ok());
    }
}
