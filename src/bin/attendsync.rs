use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "attendsync", about = "SIS attendance sync CLI")]
struct Cli {
    /// Database path (default: ~/.attendsync/attendsync.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl attendsync::SyncProgress for StderrProgress {
    fn on_initialized(&self, run: &attendsync::RunInfo) {
        match &run.resumed_from {
            Some(checkpoint) => eprintln!(
                "Resuming {} from checkpoint {}: {} of {} chunks left",
                run.operation_id, checkpoint, run.chunks_pending, run.chunks_total
            ),
            None => eprintln!(
                "Syncing {}: {} chunks",
                run.operation_id, run.chunks_total
            ),
        }
    }

    fn on_progress(&self, update: &attendsync::ProgressUpdate) {
        let eta = update
            .eta
            .map(|d| format!("{}s", d.as_secs()))
            .unwrap_or_else(|| "?".to_string());
        eprint!(
            "\r  [{:5.1}%] {} records, {}/{} chunks, {:.0} rec/s, eta {}   ",
            update.percent_complete,
            update.records_processed,
            update.chunks_completed,
            update.chunks_total,
            update.throughput_rps,
            eta
        );
        if update.is_final {
            eprintln!();
        }
    }
}

#[derive(clap::Args)]
struct Tuning {
    /// Records per page and per write batch
    #[arg(long)]
    batch_size: Option<u32>,
    /// Concurrent chunk workers
    #[arg(long)]
    parallelism: Option<u32>,
    /// Retries per failed fetch or write
    #[arg(long)]
    max_retries: Option<u32>,
}

impl Tuning {
    fn apply(&self, config: &mut attendsync::SyncConfiguration) {
        if let Some(n) = self.batch_size {
            config.batch_size = n;
        }
        if let Some(n) = self.parallelism {
            config.parallelism = n;
        }
        if let Some(n) = self.max_retries {
            config.retry.max_retries = n;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Sync attendance for a date range
    Sync {
        /// SIS attendance export (JSON array of records)
        #[arg(long)]
        source: PathBuf,
        /// JSON sync configuration; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,
        /// First date to sync (YYYY-MM-DD)
        #[arg(long)]
        start: Option<NaiveDate>,
        /// Last date to sync, inclusive (YYYY-MM-DD)
        #[arg(long)]
        end: Option<NaiveDate>,
        /// Restrict to a school code (repeatable)
        #[arg(long = "school")]
        schools: Vec<String>,
        /// Days per chunk
        #[arg(long)]
        chunk_days: Option<u32>,
        /// Skip weekends when planning chunks
        #[arg(long)]
        skip_non_school_days: bool,
        #[command(flatten)]
        tuning: Tuning,
        /// Output the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resume a sync from a saved checkpoint
    Resume {
        checkpoint_id: String,
        /// SIS attendance export (JSON array of records)
        #[arg(long)]
        source: PathBuf,
        #[command(flatten)]
        tuning: Tuning,
        /// Output the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// List saved checkpoints
    Checkpoints {
        #[arg(long, default_value = "20")]
        limit: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show stored attendance and recent sync jobs
    Status {
        #[arg(long, default_value = "10")]
        limit: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => attendsync::Database::open_at(path).await?,
        None => attendsync::Database::open().await?,
    };

    match cli.command {
        Commands::Sync {
            source,
            config,
            start,
            end,
            schools,
            chunk_days,
            skip_non_school_days,
            tuning,
            json,
        } => {
            let mut config = match config {
                Some(path) => attendsync::SyncConfiguration::from_json_file(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => {
                    let (Some(start), Some(end)) = (start, end) else {
                        anyhow::bail!("--start and --end are required without --config");
                    };
                    attendsync::SyncConfiguration::new(start, end)
                }
            };
            if let Some(start) = start {
                config.start_date = start;
            }
            if let Some(end) = end {
                config.end_date = end;
            }
            if !schools.is_empty() {
                config.school_codes = schools;
            }
            if let Some(days) = chunk_days {
                config.chunk_days = days;
            }
            if skip_non_school_days {
                config.skip_non_school_days = true;
            }
            tuning.apply(&mut config);

            let app = open_app(db, &source).await?;
            let orchestrator = prepare(&app, config)?;
            let result = app.sync(&orchestrator).await?;
            finish(&result, json)?;
        }
        Commands::Resume {
            checkpoint_id,
            source,
            tuning,
            json,
        } => {
            let app = open_app(db, &source).await?;
            let mut config = app.checkpoint(&checkpoint_id).await?.configuration;
            tuning.apply(&mut config);

            let orchestrator = prepare(&app, config)?;
            let result = app.resume(&orchestrator, &checkpoint_id).await?;
            finish(&result, json)?;
        }
        Commands::Checkpoints { limit, json } => {
            let checkpoints = db.list_checkpoints(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&checkpoints)?);
            } else if checkpoints.is_empty() {
                println!("No checkpoints saved.");
            } else {
                for cp in checkpoints {
                    println!(
                        "{}  op {}  {} chunks  {} records  {}",
                        cp.checkpoint_id,
                        cp.operation_id,
                        cp.completed_chunks,
                        cp.records_processed,
                        cp.created_at
                    );
                }
            }
        }
        Commands::Status { limit, json } => {
            print_status(&db, limit, json).await?;
        }
    }
    Ok(())
}

async fn open_app(
    db: attendsync::Database,
    source: &Path,
) -> anyhow::Result<attendsync::AttendanceSync> {
    let source = attendsync::JsonFileSource::open(source)
        .await
        .with_context(|| format!("loading {}", source.display()))?;
    Ok(attendsync::AttendanceSync::new(db, Arc::new(source)))
}

/// Build the orchestrator with stderr progress and Ctrl-C wired to cancellation.
fn prepare(
    app: &attendsync::AttendanceSync,
    config: attendsync::SyncConfiguration,
) -> anyhow::Result<attendsync::SyncOrchestrator> {
    let orchestrator = app.orchestrator(config)?.with_observer(Arc::new(StderrProgress));
    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling: finishing in-flight batches and saving a checkpoint...");
            cancel.cancel();
        }
    });
    Ok(orchestrator)
}

fn finish(result: &attendsync::SyncResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        print_sync_result(result);
    }
    if result.status == attendsync::SyncStatus::Failed {
        std::process::exit(2);
    }
    Ok(())
}

fn print_sync_result(result: &attendsync::SyncResult) {
    println!("Operation: {}", result.operation_id);
    println!("Status:    {}", result.status.as_str());
    println!(
        "Records:   {} processed, {} successful, {} failed, {} skipped",
        result.records_processed,
        result.records_successful,
        result.records_failed,
        result.records_skipped
    );
    println!("Retries:   {}", result.retry_attempts);
    println!("Duration:  {:.1}s", result.execution_time.as_secs_f64());
    if let Some(reason) = &result.failure_reason {
        println!("Error:     {reason}");
    }
    match (&result.checkpoint_id, &result.checkpoint_error) {
        (Some(id), _) => println!("Checkpoint: {id}"),
        (None, Some(err)) => println!("Checkpoint not saved: {err}"),
        (None, None) => {}
    }
    if result.status == attendsync::SyncStatus::Cancelled {
        if let Some(id) = &result.checkpoint_id {
            println!("Resume with: attendsync resume {id} --source <export.json>");
        }
    }
}

async fn print_status(db: &attendsync::Database, limit: u32, json: bool) -> anyhow::Result<()> {
    let stored = db.attendance_count(None).await?;
    let jobs = db.list_sync_jobs(limit).await?;

    if json {
        let status = serde_json::json!({
            "attendance_records": stored,
            "recent_jobs": jobs,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Attendance records stored: {stored}");
    if jobs.is_empty() {
        println!("No sync jobs yet.");
        return Ok(());
    }
    println!("Recent sync jobs:");
    for job in jobs {
        println!(
            "  #{} {} {}..{}  {} processed, {} failed  (started {})",
            job.id,
            job.status,
            job.range_start,
            job.range_end,
            job.records_processed,
            job.records_failed,
            job.started_at
        );
        if let Some(err) = &job.error_message {
            println!("      error: {err}");
        }
    }
    Ok(())
}
