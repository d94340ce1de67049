use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use crate::date_util::{days_inclusive, school_days_between};
use crate::error::{Error, Result};
use crate::sink::{RecordFailure, RecordSink, SinkError};
use crate::source::{AttendanceRecord, Page, SourceClient, SourceError};
use crate::sync::checkpoint::{Checkpoint, CheckpointStore, SyncCounters};
use crate::sync::chunker::{plan_chunks, Chunk};
use crate::sync::progress::{ProgressEmitter, ProgressSnapshot};
use crate::sync::retry::{RetryOutcome, RetryPolicy};
use crate::sync::{
    BatchReport, RunInfo, SyncConfiguration, SyncProgress, SyncResult, SyncState, SyncStatus,
};

/// Cooperative cancellation for a running sync. Workers observe it between
/// batches; a batch already in flight always finishes.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            log::info!("Cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Chunks that may fail their fetch, with nothing completed, before the run
/// is aborted as a total source outage.
const FAILED_CHUNKS_BEFORE_ABORT: usize = 3;

/// Shared view of whether the source is reachable at all. Workers update it
/// directly so that they stop claiming chunks as soon as it trips.
#[derive(Default)]
struct SourceHealth {
    completed: AtomicUsize,
    failed: AtomicUsize,
    abort_reason: OnceLock<String>,
}

impl SourceHealth {
    fn chunk_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    /// Trips on rejected credentials or a run of failed chunks, but only
    /// while no chunk in this run has completed.
    fn fetch_failed(&self, error: &SourceError) {
        let failed = self.failed.fetch_add(1, Ordering::SeqCst) + 1;
        if self.completed.load(Ordering::SeqCst) > 0 {
            return;
        }
        let reason = match error {
            SourceError::Unauthorized(_) => error.to_string(),
            _ if failed >= FAILED_CHUNKS_BEFORE_ABORT => {
                format!("source unreachable, {failed} chunks failed without progress: {error}")
            }
            _ => return,
        };
        // Only the first tripping failure is kept
        if self.abort_reason.set(reason.clone()).is_ok() {
            log::error!("Aborting sync: {reason}");
        }
    }

    fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.get().map(String::as_str)
    }

    fn is_tripped(&self) -> bool {
        self.abort_reason.get().is_some()
    }
}

/// Messages from workers to the aggregator, the only writer of run counters.
enum WorkerEvent {
    ChunkStarted(Chunk),
    BatchProcessed {
        chunk_index: u64,
        batch_number: u32,
        counters: SyncCounters,
    },
    /// `residual` holds skips and fetch retries not yet reported in a batch.
    ChunkCompleted {
        chunk: Chunk,
        residual: SyncCounters,
        elapsed: Duration,
    },
    ChunkAbandoned {
        chunk: Chunk,
        residual: SyncCounters,
        reason: AbandonReason,
    },
}

enum AbandonReason {
    /// Cancellation or an aborted run, observed between pages.
    Stopped,
    FetchFailed(SourceError),
}

/// Run bookkeeping shared between the aggregator (writer) and
/// `save_checkpoint` (reader).
#[derive(Default)]
struct Ledger {
    completed: BTreeSet<u64>,
    /// Counters of completed chunks only; what checkpoints persist.
    committed: SyncCounters,
    /// Everything observed so far, including chunks still in flight.
    live: SyncCounters,
    in_flight: HashMap<u64, SyncCounters>,
}

impl Ledger {
    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            records_processed: self.live.records_processed,
            chunks_completed: self.completed.len(),
            records_in_completed_chunks: self.committed.records_processed,
        }
    }
}

struct ActiveRun {
    operation_id: String,
    configuration: SyncConfiguration,
    ledger: Mutex<Ledger>,
}

/// Where a run starts from: nothing, or a loaded checkpoint.
struct RunSeed {
    operation_id: String,
    completed: BTreeSet<u64>,
    counters: SyncCounters,
    resumed_from: Option<String>,
}

#[derive(Default)]
struct AggregateSummary {
    chunks_attempted: usize,
    chunks_completed: usize,
    chunks_stopped: usize,
    fetch_failures: usize,
    last_fetch_error: Option<String>,
    chunk_durations: Vec<Duration>,
}

/// Coordinates one attendance sync: plans chunks, runs a bounded worker pool
/// against the source and sink, applies the retry policy, tracks progress
/// and writes checkpoints.
///
/// An orchestrator runs at most once, via either [`SyncOrchestrator::execute_sync`]
/// or [`SyncOrchestrator::resume_from_checkpoint`].
pub struct SyncOrchestrator {
    config: SyncConfiguration,
    policy: RetryPolicy,
    source: Arc<dyn SourceClient>,
    sink: Arc<dyn RecordSink>,
    checkpoints: Arc<dyn CheckpointStore>,
    observers: Vec<Arc<dyn SyncProgress>>,
    cancel: CancelHandle,
    started: AtomicBool,
    state: watch::Sender<SyncState>,
    run: Mutex<Option<Arc<ActiveRun>>>,
}

impl SyncOrchestrator {
    /// Validates `config`; nothing touches the source, sink or store here.
    pub fn new(
        config: SyncConfiguration,
        source: Arc<dyn SourceClient>,
        sink: Arc<dyn RecordSink>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(SyncState::Idle);
        Ok(Self {
            policy: RetryPolicy::from_config(&config),
            config,
            source,
            sink,
            checkpoints,
            observers: Vec::new(),
            cancel: CancelHandle::default(),
            started: AtomicBool::new(false),
            state,
            run: Mutex::new(None),
        })
    }

    /// Register an observer for lifecycle and progress notifications.
    pub fn subscribe(&mut self, observer: Arc<dyn SyncProgress>) {
        self.observers.push(observer);
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncProgress>) -> Self {
        self.subscribe(observer);
        self
    }

    pub fn configuration(&self) -> &SyncConfiguration {
        &self.config
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Run the configured sync to completion or cancellation.
    pub async fn execute_sync(&self) -> Result<SyncResult> {
        let plan = plan_chunks(&self.config)?;
        let seed = RunSeed {
            operation_id: uuid::Uuid::new_v4().to_string(),
            completed: BTreeSet::new(),
            counters: SyncCounters::default(),
            resumed_from: None,
        };
        self.run(plan, seed).await
    }

    /// Continue the run captured by a checkpoint, skipping its completed
    /// chunks and starting counters from its totals. The operation id is
    /// carried over.
    pub async fn resume_from_checkpoint(&self, checkpoint_id: &str) -> Result<SyncResult> {
        let checkpoint = self
            .checkpoints
            .load(checkpoint_id)
            .await?
            .ok_or_else(|| Error::CheckpointNotFound(checkpoint_id.to_string()))?;
        checkpoint.configuration.ensure_compatible(&self.config)?;

        let plan = plan_chunks(&self.config)?;
        if let Some(&last) = checkpoint.completed_chunks.last() {
            if last as usize >= plan.len() {
                return Err(Error::CheckpointFormat(format!(
                    "checkpoint marks chunk {last} complete but the plan has {} chunks",
                    plan.len()
                )));
            }
        }

        log::info!(
            "Resuming operation {} from checkpoint {} ({}/{} chunks complete)",
            checkpoint.operation_id,
            checkpoint.checkpoint_id,
            checkpoint.completed_chunks.len(),
            plan.len()
        );
        let seed = RunSeed {
            operation_id: checkpoint.operation_id,
            completed: checkpoint.completed_chunks.into_iter().collect(),
            counters: checkpoint.counters,
            resumed_from: Some(checkpoint.checkpoint_id),
        };
        self.run(plan, seed).await
    }

    /// Snapshot the completed-chunk set and committed counters of the
    /// current (or finished) run.
    pub async fn save_checkpoint(&self) -> Result<String> {
        let run = self.run.lock().await.clone().ok_or(Error::NotStarted)?;
        let checkpoint = {
            let ledger = run.ledger.lock().await;
            Checkpoint::new(
                run.operation_id.clone(),
                run.configuration.clone(),
                ledger.completed.iter().copied(),
                ledger.committed,
            )
        };
        let id = self.checkpoints.save(&checkpoint).await?;
        log::info!(
            "Saved checkpoint {id} for operation {} ({} chunks complete)",
            run.operation_id,
            checkpoint.completed_chunks.len()
        );
        Ok(id)
    }

    /// Spread the expected volume for the range evenly over its date windows.
    fn expected_records_per_chunk(&self, chunks_total: usize) -> f64 {
        let config = &self.config;
        let days = if config.skip_non_school_days {
            school_days_between(config.start_date, config.end_date, &config.holidays)
        } else {
            days_inclusive(config.start_date, config.end_date)
        };
        let windows = (chunks_total / config.school_codes.len().max(1)).max(1);
        config.monitoring.expected_records_per_day as f64 * days as f64 / windows as f64
    }

    async fn run(&self, plan: Vec<Chunk>, seed: RunSeed) -> Result<SyncResult> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }
        let started_at = Instant::now();
        self.state.send_replace(SyncState::Initializing);

        let chunks_total = plan.len();
        let chunks_resumed = seed.completed.len();
        let pending: VecDeque<Chunk> = plan
            .into_iter()
            .filter(|c| !seed.completed.contains(&c.index))
            .collect();

        let active = Arc::new(ActiveRun {
            operation_id: seed.operation_id.clone(),
            configuration: self.config.clone(),
            ledger: Mutex::new(Ledger {
                completed: seed.completed,
                committed: seed.counters,
                live: seed.counters,
                in_flight: HashMap::new(),
            }),
        });
        *self.run.lock().await = Some(active.clone());

        let info = RunInfo {
            operation_id: seed.operation_id.clone(),
            chunks_total,
            chunks_pending: pending.len(),
            resumed_from: seed.resumed_from.clone(),
        };
        for observer in &self.observers {
            observer.on_initialized(&info);
        }
        log::info!(
            "Sync {} initialized: {} chunks ({} pending) over {}..{}",
            info.operation_id,
            chunks_total,
            info.chunks_pending,
            self.config.start_date,
            self.config.end_date
        );

        self.state.send_replace(SyncState::Running);

        let baseline = active.ledger.lock().await.snapshot();
        let expected_per_chunk = self.expected_records_per_chunk(chunks_total);
        let emitter = ProgressEmitter::new(
            seed.operation_id.clone(),
            self.config.progress_interval(),
            chunks_total,
            expected_per_chunk,
            baseline,
            self.observers.clone(),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let health = Arc::new(SourceHealth::default());
        let worker_count = (self.config.parallelism as usize).min(pending.len());
        let ctx = WorkerContext {
            source: self.source.clone(),
            sink: self.sink.clone(),
            policy: self.policy.clone(),
            batch_size: self.config.batch_size,
            source_timeout: self.config.source_timeout(),
            sink_timeout: self.config.sink_timeout(),
            queue: Arc::new(Mutex::new(pending)),
            cancel: self.cancel.clone(),
            health: health.clone(),
            events: tx,
        };

        let mut workers = JoinSet::new();
        for _ in 0..worker_count {
            let ctx = ctx.clone();
            workers.spawn(async move { ctx.run().await });
        }
        // Workers hold the only remaining senders; the aggregator ends when they do.
        drop(ctx);

        let (aggregated, worker_panics) = tokio::join!(
            aggregate(rx, active.clone(), self.observers.clone(), emitter),
            join_workers(&mut workers)
        );
        let (summary, mut emitter) = aggregated;

        let (final_snapshot, live, completed_total) = {
            let ledger = active.ledger.lock().await;
            (ledger.snapshot(), ledger.live, ledger.completed.len())
        };

        let (status, failure_reason) = if worker_panics > 0 {
            (
                SyncStatus::Failed,
                Some(format!("{worker_panics} sync workers panicked")),
            )
        } else if let Some(reason) = health.abort_reason() {
            (SyncStatus::Failed, Some(reason.to_string()))
        } else if summary.chunks_attempted > 0
            && summary.chunks_completed == 0
            && summary.fetch_failures == summary.chunks_attempted
        {
            (
                SyncStatus::Failed,
                Some(format!(
                    "source unreachable for all {} attempted chunks: {}",
                    summary.chunks_attempted,
                    summary.last_fetch_error.as_deref().unwrap_or("unknown error")
                )),
            )
        } else if self.cancel.is_cancelled() && completed_total < chunks_total {
            (SyncStatus::Cancelled, None)
        } else {
            (SyncStatus::Completed, None)
        };

        emitter.finish(final_snapshot, completed_total == chunks_total);

        let (checkpoint_id, checkpoint_error) = match self.save_checkpoint().await {
            Ok(id) => (Some(id), None),
            Err(e) => {
                log::warn!("Failed to save checkpoint for {}: {e}", seed.operation_id);
                (None, Some(e.to_string()))
            }
        };

        let mut metadata = serde_json::Map::new();
        metadata.insert("chunks_total".into(), json!(chunks_total));
        metadata.insert("chunks_completed".into(), json!(completed_total));
        metadata.insert("chunks_completed_this_run".into(), json!(summary.chunks_completed));
        metadata.insert("chunks_resumed".into(), json!(chunks_resumed));
        metadata.insert(
            "chunks_incomplete".into(),
            json!(chunks_total - completed_total),
        );
        metadata.insert("chunks_failed".into(), json!(summary.fetch_failures));
        metadata.insert("chunks_stopped".into(), json!(summary.chunks_stopped));
        metadata.insert("batches_processed".into(), json!(live.batches_processed));
        metadata.insert(
            "date_range".into(),
            json!(format!("{}..{}", self.config.start_date, self.config.end_date)),
        );
        let schools = self.config.school_filter();
        metadata.insert(
            "schools".into(),
            if schools.is_empty() {
                json!("all")
            } else {
                json!(schools)
            },
        );
        metadata.insert("workers".into(), json!(worker_count));
        metadata.insert("progress_updates".into(), json!(emitter.emitted()));
        if let Some(from) = &seed.resumed_from {
            metadata.insert("resumed_from".into(), json!(from));
        }
        if self.config.monitoring.metrics_enabled {
            let durations = &summary.chunk_durations;
            let avg_ms = if durations.is_empty() {
                0
            } else {
                durations.iter().map(|d| d.as_millis()).sum::<u128>() / durations.len() as u128
            };
            let max_ms = durations.iter().map(|d| d.as_millis()).max().unwrap_or(0);
            let throughput = emitter.overall_throughput();
            metadata.insert("throughput_rps".into(), json!(throughput));
            metadata.insert("avg_chunk_ms".into(), json!(avg_ms as u64));
            metadata.insert("max_chunk_ms".into(), json!(max_ms as u64));
            log::info!(
                "Sync {} metrics: {:.1} records/s, avg chunk {}ms, max chunk {}ms",
                seed.operation_id,
                throughput,
                avg_ms,
                max_ms
            );
        }

        let final_state = match status {
            SyncStatus::Completed => SyncState::Completed,
            SyncStatus::Cancelled => SyncState::Cancelled,
            SyncStatus::Failed => SyncState::Failed,
        };
        self.state.send_replace(final_state);
        match &failure_reason {
            Some(reason) => log::error!("Sync {} failed: {reason}", seed.operation_id),
            None => log::info!(
                "Sync {} {}: {} processed, {} successful, {} failed, {} skipped",
                seed.operation_id,
                status.as_str(),
                live.records_processed,
                live.records_successful,
                live.records_failed,
                live.records_skipped
            ),
        }

        Ok(SyncResult {
            operation_id: seed.operation_id,
            status,
            execution_time: started_at.elapsed(),
            records_processed: live.records_processed,
            records_successful: live.records_successful,
            records_failed: live.records_failed,
            records_skipped: live.records_skipped,
            retry_attempts: live.retry_attempts,
            failure_reason,
            checkpoint_id,
            checkpoint_error,
            metadata,
        })
    }
}

async fn join_workers(workers: &mut JoinSet<()>) -> usize {
    let mut panics = 0;
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            log::error!("Sync worker terminated abnormally: {e}");
            panics += 1;
        }
    }
    panics
}

/// Single-writer aggregation point: applies worker deltas to the ledger,
/// notifies observers and drives the progress emitter.
async fn aggregate(
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    run: Arc<ActiveRun>,
    observers: Vec<Arc<dyn SyncProgress>>,
    mut emitter: ProgressEmitter,
) -> (AggregateSummary, ProgressEmitter) {
    let mut summary = AggregateSummary::default();
    let mut ticker = tokio::time::interval(run.configuration.progress_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = ticker.tick() => {
                emitter.tick();
                continue;
            }
        };

        match event {
            WorkerEvent::ChunkStarted(chunk) => {
                summary.chunks_attempted += 1;
                log::debug!("Started {chunk}");
                for observer in &observers {
                    observer.on_chunk_started(&chunk);
                }
            }
            WorkerEvent::BatchProcessed {
                chunk_index,
                batch_number,
                counters,
            } => {
                let snapshot = {
                    let mut ledger = run.ledger.lock().await;
                    ledger.live += counters;
                    *ledger.in_flight.entry(chunk_index).or_default() += counters;
                    ledger.snapshot()
                };
                let report = BatchReport {
                    chunk_index,
                    batch_number,
                    counters,
                };
                for observer in &observers {
                    observer.on_batch_processed(&report);
                }
                emitter.record(snapshot);
            }
            WorkerEvent::ChunkCompleted {
                chunk,
                residual,
                elapsed,
            } => {
                let (delta, snapshot) = {
                    let mut ledger = run.ledger.lock().await;
                    let mut delta = ledger.in_flight.remove(&chunk.index).unwrap_or_default();
                    delta += residual;
                    ledger.live += residual;
                    ledger.committed += delta;
                    ledger.completed.insert(chunk.index);
                    (delta, ledger.snapshot())
                };
                summary.chunks_completed += 1;
                summary.chunk_durations.push(elapsed);
                log::debug!(
                    "Completed {chunk}: {} records in {:?}",
                    delta.records_processed,
                    elapsed
                );
                for observer in &observers {
                    observer.on_chunk_completed(&chunk, &delta);
                }
                emitter.record(snapshot);
            }
            WorkerEvent::ChunkAbandoned {
                chunk,
                residual,
                reason,
            } => {
                {
                    let mut ledger = run.ledger.lock().await;
                    ledger.in_flight.remove(&chunk.index);
                    ledger.live += residual;
                }
                match reason {
                    AbandonReason::Stopped => {
                        summary.chunks_stopped += 1;
                        log::info!("Stopped {chunk} mid-way");
                    }
                    AbandonReason::FetchFailed(e) => {
                        summary.fetch_failures += 1;
                        log::warn!("Abandoned {chunk}: {e}");
                        summary.last_fetch_error = Some(e.to_string());
                    }
                }
            }
        }
    }

    (summary, emitter)
}

#[derive(Clone)]
struct WorkerContext {
    source: Arc<dyn SourceClient>,
    sink: Arc<dyn RecordSink>,
    policy: RetryPolicy,
    batch_size: u32,
    source_timeout: Duration,
    sink_timeout: Duration,
    queue: Arc<Mutex<VecDeque<Chunk>>>,
    cancel: CancelHandle,
    health: Arc<SourceHealth>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl WorkerContext {
    /// Claim chunks until the queue is empty, or the run is cancelled or aborted.
    async fn run(&self) {
        loop {
            if self.should_stop() {
                break;
            }
            let next = self.queue.lock().await.pop_front();
            let Some(chunk) = next else {
                break;
            };
            self.process_chunk(chunk).await;
        }
    }

    fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || self.health.is_tripped()
    }

    fn send(&self, event: WorkerEvent) {
        // The aggregator outlives every worker, so a closed channel means the
        // run is being torn down and the event has no one to inform.
        let _ = self.events.send(event);
    }

    async fn process_chunk(&self, chunk: Chunk) {
        let started = Instant::now();
        self.send(WorkerEvent::ChunkStarted(chunk.clone()));

        let mut page_token: Option<String> = None;
        let mut batch_number: u32 = 0;
        let mut first_page = true;
        // Skips and fetch retries ride along with the next written batch
        let mut carry = SyncCounters::default();

        loop {
            if !first_page && self.should_stop() {
                self.send(WorkerEvent::ChunkAbandoned {
                    chunk,
                    residual: carry,
                    reason: AbandonReason::Stopped,
                });
                return;
            }
            first_page = false;

            let fetched = self.fetch(&chunk, page_token.as_deref()).await;
            carry.retry_attempts += fetched.retries as u64;
            let page = match fetched.result {
                Ok(page) => page,
                Err(e) => {
                    self.health.fetch_failed(&e);
                    self.send(WorkerEvent::ChunkAbandoned {
                        chunk,
                        residual: carry,
                        reason: AbandonReason::FetchFailed(e),
                    });
                    return;
                }
            };

            let Page {
                records,
                next_page_token,
            } = page;
            let (in_scope, out_of_scope): (Vec<_>, Vec<_>) =
                records.into_iter().partition(|r| in_chunk_scope(&chunk, r));
            if !out_of_scope.is_empty() {
                log::debug!(
                    "Skipping {} records outside {chunk}",
                    out_of_scope.len()
                );
                carry.records_processed += out_of_scope.len() as u64;
                carry.records_skipped += out_of_scope.len() as u64;
            }

            for batch in in_scope.chunks(self.batch_size as usize) {
                let mut counters = self.write(&chunk, batch).await;
                counters += std::mem::take(&mut carry);
                counters.batches_processed = 1;
                batch_number += 1;
                log::debug!(
                    "{chunk} batch {batch_number}: {} written, {} failed",
                    counters.records_successful,
                    counters.records_failed
                );
                self.send(WorkerEvent::BatchProcessed {
                    chunk_index: chunk.index,
                    batch_number,
                    counters,
                });
            }

            match next_page_token {
                Some(next) if page_token.as_deref() == Some(next.as_str()) => {
                    let error =
                        SourceError::Malformed(format!("page token '{next}' repeated"));
                    self.health.fetch_failed(&error);
                    self.send(WorkerEvent::ChunkAbandoned {
                        chunk,
                        residual: carry,
                        reason: AbandonReason::FetchFailed(error),
                    });
                    return;
                }
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        // Zero-record chunks arrive here too and count as complete.
        self.health.chunk_completed();
        self.send(WorkerEvent::ChunkCompleted {
            chunk,
            residual: carry,
            elapsed: started.elapsed(),
        });
    }

    async fn fetch(&self, chunk: &Chunk, page_token: Option<&str>) -> RetryOutcome<Page, SourceError> {
        let label = format!("Fetch of {chunk}");
        let school = chunk.school_code.as_deref();
        let window = chunk.window;
        let page_size = self.batch_size;
        let timeout = self.source_timeout;

        self.policy
            .run(&label, || {
                let source = self.source.clone();
                async move {
                    match tokio::time::timeout(
                        timeout,
                        source.fetch_page(school, &window, page_token, page_size),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(SourceError::Timeout),
                    }
                }
            })
            .await
    }

    /// Write one batch under the retry policy. Returns the batch's terminal
    /// counters; records that exhaust their retries count as failed.
    async fn write(&self, chunk: &Chunk, records: &[AttendanceRecord]) -> SyncCounters {
        let mut counters = SyncCounters {
            records_processed: records.len() as u64,
            ..Default::default()
        };
        let mut pending: Vec<AttendanceRecord> = records.to_vec();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let outcome =
                tokio::time::timeout(self.sink_timeout, self.sink.write_batch(&pending)).await;
            let error = match outcome {
                Err(_) => SinkError::Timeout,
                Ok(Err(e)) => e,
                Ok(Ok(report)) => {
                    let succeeded: HashSet<&str> =
                        report.succeeded.iter().map(String::as_str).collect();
                    let failures: HashMap<&str, &RecordFailure> = report
                        .failed
                        .iter()
                        .map(|f| (f.record_id.as_str(), f))
                        .collect();

                    let mut retryable = Vec::new();
                    for record in pending.drain(..) {
                        if succeeded.contains(record.record_id.as_str()) {
                            counters.records_successful += 1;
                        } else {
                            match failures.get(record.record_id.as_str()) {
                                Some(failure) if !failure.transient => {
                                    log::debug!(
                                        "Record {} rejected: {}",
                                        record.record_id,
                                        failure.reason
                                    );
                                    counters.records_failed += 1;
                                }
                                // Transient or unacknowledged: write again
                                _ => retryable.push(record),
                            }
                        }
                    }
                    if retryable.is_empty() {
                        return counters;
                    }
                    pending = retryable;
                    SinkError::Conflict(format!("{} records not written", pending.len()))
                }
            };

            let decision = self.policy.should_retry(attempt, &error);
            if !decision.retry {
                log::warn!(
                    "Giving up on {} records in {chunk} after {attempt} attempts: {error}",
                    pending.len()
                );
                counters.records_failed += pending.len() as u64;
                return counters;
            }
            counters.retry_attempts += 1;
            log::warn!(
                "Write for {chunk} failed: {error}. Waiting {:?} before retry {attempt}/{}",
                decision.delay,
                self.policy.max_retries
            );
            tokio::time::sleep(decision.delay).await;
        }
    }
}

fn in_chunk_scope(chunk: &Chunk, record: &AttendanceRecord) -> bool {
    chunk.window.contains(record.date)
        && chunk
            .school_code
            .as_deref()
            .map_or(true, |code| record.school_code == code)
}
