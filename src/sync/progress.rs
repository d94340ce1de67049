use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};
use tokio::time::Instant;

use crate::sync::SyncProgress;

/// Throughput is measured over this trailing window.
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(30);

/// Point-in-time view of a running sync. Observational only.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub operation_id: String,
    pub percent_complete: f64,
    pub records_processed: u64,
    pub estimated_total_records: u64,
    pub chunks_completed: usize,
    pub chunks_total: usize,
    /// Records per second over the trailing window.
    pub throughput_rps: f64,
    #[serde(rename = "elapsed_ms", serialize_with = "millis")]
    pub elapsed: Duration,
    #[serde(rename = "eta_ms", serialize_with = "optional_millis")]
    pub eta: Option<Duration>,
    pub is_final: bool,
}

fn millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

fn optional_millis<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&(d.as_millis() as u64)),
        None => s.serialize_none(),
    }
}

/// Counter view handed to the emitter by the aggregator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressSnapshot {
    pub records_processed: u64,
    pub chunks_completed: usize,
    /// Records belonging to fully completed chunks, used to refine the
    /// per-chunk estimate.
    pub records_in_completed_chunks: u64,
}

/// Turns counter updates into rate-limited [`ProgressUpdate`]s for observers.
///
/// Bursts of updates inside one interval coalesce into a single emission.
/// [`ProgressEmitter::finish`] always emits.
pub struct ProgressEmitter {
    operation_id: String,
    interval: Duration,
    chunks_total: usize,
    expected_records_per_chunk: f64,
    started: Instant,
    last_emit: Option<Instant>,
    latest: ProgressSnapshot,
    dirty: bool,
    /// Records already counted when the run began (resume), excluded from
    /// this run's throughput.
    baseline_records: u64,
    samples: VecDeque<(Instant, u64)>,
    observers: Vec<Arc<dyn SyncProgress>>,
    emitted: u64,
}

impl ProgressEmitter {
    pub fn new(
        operation_id: impl Into<String>,
        interval: Duration,
        chunks_total: usize,
        expected_records_per_chunk: f64,
        baseline: ProgressSnapshot,
        observers: Vec<Arc<dyn SyncProgress>>,
    ) -> Self {
        let started = Instant::now();
        let mut samples = VecDeque::new();
        samples.push_back((started, baseline.records_processed));
        Self {
            operation_id: operation_id.into(),
            interval,
            chunks_total,
            expected_records_per_chunk,
            started,
            last_emit: None,
            latest: baseline,
            dirty: false,
            baseline_records: baseline.records_processed,
            samples,
            observers,
            emitted: 0,
        }
    }

    /// Record fresh counters; emits if the interval has elapsed.
    pub fn record(&mut self, snapshot: ProgressSnapshot) {
        let now = Instant::now();
        self.latest = snapshot;
        self.dirty = true;
        self.samples.push_back((now, snapshot.records_processed));
        while self.samples.len() > 2 {
            match self.samples.front() {
                Some((t, _)) if now.duration_since(*t) > THROUGHPUT_WINDOW => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
        self.tick();
    }

    /// Emit pending counters if the interval has elapsed since the last emission.
    pub fn tick(&mut self) {
        if !self.dirty {
            return;
        }
        let now = Instant::now();
        let due = self
            .last_emit
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if due {
            let update = self.compute(now, false, false);
            self.emit(now, &update);
        }
    }

    /// Emit the terminal update unconditionally.
    pub fn finish(&mut self, snapshot: ProgressSnapshot, completed: bool) -> ProgressUpdate {
        let now = Instant::now();
        self.latest = snapshot;
        self.samples.push_back((now, snapshot.records_processed));
        let update = self.compute(now, true, completed);
        self.emit(now, &update);
        update
    }

    /// Number of updates delivered so far.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Records per second over the whole run so far.
    pub fn overall_throughput(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.latest.records_processed.saturating_sub(self.baseline_records) as f64 / secs
    }

    fn emit(&mut self, now: Instant, update: &ProgressUpdate) {
        for observer in &self.observers {
            observer.on_progress(update);
        }
        self.last_emit = Some(now);
        self.dirty = false;
        self.emitted += 1;
    }

    fn estimated_total(&self) -> u64 {
        let snap = &self.latest;
        let per_chunk = if snap.chunks_completed > 0 {
            snap.records_in_completed_chunks as f64 / snap.chunks_completed as f64
        } else {
            self.expected_records_per_chunk
        };
        let remaining_chunks = self.chunks_total.saturating_sub(snap.chunks_completed);
        let estimate = snap.records_in_completed_chunks as f64 + remaining_chunks as f64 * per_chunk;
        (estimate.round() as u64).max(snap.records_processed)
    }

    fn throughput(&self, now: Instant) -> f64 {
        if let (Some((first_t, first_n)), Some((last_t, last_n))) =
            (self.samples.front(), self.samples.back())
        {
            let secs = last_t.duration_since(*first_t).as_secs_f64();
            if secs > 0.0 {
                return last_n.saturating_sub(*first_n) as f64 / secs;
            }
        }
        let secs = now.duration_since(self.started).as_secs_f64();
        if secs > 0.0 {
            self.latest.records_processed.saturating_sub(self.baseline_records) as f64 / secs
        } else {
            0.0
        }
    }

    fn compute(&self, now: Instant, is_final: bool, completed: bool) -> ProgressUpdate {
        let processed = self.latest.records_processed;
        let estimated_total = self.estimated_total();
        let percent_complete = if is_final && completed {
            100.0
        } else if estimated_total == 0 {
            0.0
        } else {
            (processed as f64 / estimated_total as f64 * 100.0).min(100.0)
        };

        let throughput_rps = self.throughput(now);
        let eta = if is_final {
            Some(Duration::ZERO)
        } else if throughput_rps > 0.0 {
            let remaining = estimated_total.saturating_sub(processed) as f64;
            Some(Duration::from_secs_f64(remaining / throughput_rps))
        } else {
            None
        };

        ProgressUpdate {
            operation_id: self.operation_id.clone(),
            percent_complete,
            records_processed: processed,
            estimated_total_records: estimated_total,
            chunks_completed: self.latest.chunks_completed,
            chunks_total: self.chunks_total,
            throughput_rps,
            elapsed: now.duration_since(self.started),
            eta,
            is_final,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Collector(Mutex<Vec<ProgressUpdate>>);

    impl SyncProgress for Collector {
        fn on_progress(&self, update: &ProgressUpdate) {
            self.0.lock().unwrap().push(update.clone());
        }
    }

    fn snapshot(processed: u64, chunks: usize, in_chunks: u64) -> ProgressSnapshot {
        ProgressSnapshot {
            records_processed: processed,
            chunks_completed: chunks,
            records_in_completed_chunks: in_chunks,
        }
    }

    fn emitter(collector: &Arc<Collector>) -> ProgressEmitter {
        ProgressEmitter::new(
            "op",
            Duration::from_secs(1),
            10,
            100.0,
            ProgressSnapshot::default(),
            vec![collector.clone() as Arc<dyn SyncProgress>],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_bursts_coalesce_within_interval() {
        let collector = Arc::new(Collector::default());
        let mut e = emitter(&collector);

        for i in 1..=50 {
            e.record(snapshot(i, 0, 0));
        }
        // First update goes out immediately, the rest of the burst is held
        assert_eq!(collector.0.lock().unwrap().len(), 1);

        tokio::time::advance(Duration::from_millis(1_100)).await;
        e.tick();
        let updates = collector.0.lock().unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].records_processed, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_always_emits() {
        let collector = Arc::new(Collector::default());
        let mut e = emitter(&collector);

        e.record(snapshot(10, 1, 10));
        let update = e.finish(snapshot(100, 10, 100), true);

        assert!(update.is_final);
        assert_eq!(update.percent_complete, 100.0);
        assert_eq!(update.eta, Some(Duration::ZERO));
        let updates = collector.0.lock().unwrap();
        assert_eq!(updates.len(), 2);
        assert!(updates.last().unwrap().is_final);
    }

    #[tokio::test(start_paused = true)]
    async fn test_estimate_refined_by_completed_chunks() {
        let collector = Arc::new(Collector::default());
        let mut e = emitter(&collector);

        // Seed estimate: 10 chunks x 100
        e.record(snapshot(0, 0, 0));
        assert_eq!(collector.0.lock().unwrap()[0].estimated_total_records, 1_000);

        // Two chunks completed with 20 records each -> 10 x 20
        tokio::time::advance(Duration::from_secs(2)).await;
        e.record(snapshot(40, 2, 40));
        let updates = collector.0.lock().unwrap();
        let last = updates.last().unwrap();
        assert_eq!(last.estimated_total_records, 200);
        assert!((last.percent_complete - 20.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_and_eta() {
        let collector = Arc::new(Collector::default());
        let mut e = emitter(&collector);

        tokio::time::advance(Duration::from_secs(10)).await;
        e.record(snapshot(500, 5, 500));

        let updates = collector.0.lock().unwrap();
        let update = updates.last().unwrap();
        assert!((update.throughput_rps - 50.0).abs() < 1e-6);
        // 500 remaining at 50/s
        assert_eq!(update.eta, Some(Duration::from_secs(10)));
    }
}
