//! Command-line interface for capsync.
//!
//! Provides commands for queueing and processing captures, uploading and
//! resuming files, running sync passes, and settling conflicts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::{self, paths};
use crate::domain::{QueueStatus, ResolutionStrategy, SyncOutcome, SyncReport, SyncRequest};
use crate::ingest::{QueueWorker, WorkOutcome};

pub mod engine;

pub use engine::Engine;

/// capsync - Offline-first capture processing and sync engine
#[derive(Parser, Debug)]
#[command(name = "capsync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Bearer token for the sync server
    #[arg(long, global = true, env = "CAPSYNC_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show queue, upload and sync status
    Status,

    /// Queue a capture for processing
    Enqueue {
        /// Capture ID
        capture_id: String,

        /// Audio or text file to process
        path: PathBuf,

        /// Recording length in seconds
        #[arg(long)]
        duration: Option<f64>,
    },

    /// List queue items
    Queue {
        /// Only show items with this status (pending, processing, completed, failed)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Process pending captures
    Process {
        /// Drain the queue once and exit instead of polling
        #[arg(long)]
        once: bool,

        /// Seconds between polls when the queue is empty
        #[arg(long, default_value = "5")]
        poll: u64,
    },

    /// Reclassify items left in processing by a crash
    Recover,

    /// Queue a failed item again as a new attempt
    Retry {
        /// Queue item ID
        item_id: String,
    },

    /// Delete a completed or failed queue item
    Purge {
        /// Queue item ID
        item_id: String,
    },

    /// Upload a file in chunks
    Upload {
        /// Capture ID the file belongs to
        capture_id: String,

        /// File to upload
        path: PathBuf,

        /// Upload ID (generated if not specified)
        #[arg(long)]
        upload_id: Option<String>,
    },

    /// Resume an interrupted upload
    Resume {
        /// Upload ID
        upload_id: String,
    },

    /// List tracked uploads
    Uploads,

    /// Run one sync pass now
    Sync,

    /// List sync conflicts
    Conflicts {
        /// Include resolved conflicts
        #[arg(short, long)]
        all: bool,
    },

    /// Settle a conflict
    Resolve {
        /// Conflict ID
        conflict_id: String,

        /// local-wins, remote-wins or merged
        strategy: String,

        /// Merged payload as JSON (required for merged)
        #[arg(long)]
        payload: Option<String>,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        if let Commands::Config = self.command {
            return show_config();
        }

        let engine = Engine::open(config::load_config()?, self.token).await?;

        match self.command {
            Commands::Status => show_status(&engine).await,
            Commands::Enqueue {
                capture_id,
                path,
                duration,
            } => enqueue(&engine, &capture_id, path, duration).await,
            Commands::Queue { status } => list_queue(&engine, status.as_deref()).await,
            Commands::Process { once, poll } => process(&engine, once, poll).await,
            Commands::Recover => recover(&engine).await,
            Commands::Retry { item_id } => retry_item(&engine, &item_id).await,
            Commands::Purge { item_id } => purge_item(&engine, &item_id).await,
            Commands::Upload {
                capture_id,
                path,
                upload_id,
            } => upload(&engine, &capture_id, &path, upload_id).await,
            Commands::Resume { upload_id } => resume_upload(&engine, &upload_id).await,
            Commands::Uploads => list_uploads(&engine).await,
            Commands::Sync => sync_now(&engine).await,
            Commands::Conflicts { all } => list_conflicts(&engine, all).await,
            Commands::Resolve {
                conflict_id,
                strategy,
                payload,
            } => resolve(&engine, &conflict_id, &strategy, payload.as_deref()).await,
            Commands::Config => show_config(),
        }
    }
}

fn require_token(engine: &Engine) -> Result<()> {
    if !engine.auth.is_set() {
        bail!("No auth token. Pass --token or set CAPSYNC_TOKEN.");
    }
    Ok(())
}

async fn show_status(engine: &Engine) -> Result<()> {
    let counts = engine.queue.status().await?;
    let uploads = engine.uploader.pending().await?;
    let dirty = engine.entities.dirty_count().await?;
    let conflicts = engine.resolver.unresolved().await?;

    println!();
    println!("Capture Sync Status");
    println!("══════════════════════════════════════════════════════════════");
    println!();
    println!("Store:  {}", paths::configured_store_file(&engine.config).display());
    println!("Server: {}", engine.config.server_url());
    println!();
    println!("Queue:");
    println!("  Pending:    {}", counts.pending);
    println!("  Processing: {}", counts.processing);
    println!("  Completed:  {}", counts.completed);
    println!("  Failed:     {}", counts.failed);
    println!("  Total:      {}", counts.total());
    println!();
    println!("Sync:");
    println!("  Uploads in progress: {}", uploads.len());
    println!("  Unsynced changes:    {}", dirty);
    println!("  Open conflicts:      {}", conflicts.len());
    println!();

    if counts.processing > 0 && !engine.queue.is_recovered() {
        println!("⚠️  Items are marked processing. Run `capsync recover` if no worker is running.");
    }

    Ok(())
}

async fn enqueue(
    engine: &Engine,
    capture_id: &str,
    path: PathBuf,
    duration: Option<f64>,
) -> Result<()> {
    let path = path
        .canonicalize()
        .with_context(|| format!("File not found: {}", path.display()))?;

    let item = engine.queue.enqueue(capture_id, path, duration).await?;
    println!("✅ Queued {} ({})", item.capture_id, item.id);
    Ok(())
}

async fn list_queue(engine: &Engine, status: Option<&str>) -> Result<()> {
    let filter = match status {
        Some(s) => Some(
            QueueStatus::parse(s).with_context(|| format!("Unknown queue status: {}", s))?,
        ),
        None => None,
    };

    let items = engine.queue.list(filter).await?;
    if items.is_empty() {
        println!("No queue items.");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<12} {:<8}", "ITEM ID", "CAPTURE", "STATUS", "RETRIES");
    println!("{}", "-".repeat(80));
    for item in items {
        println!(
            "{:<38} {:<20} {:<12} {:<8}",
            item.id,
            truncate(&item.capture_id, 20),
            item.status.as_str(),
            item.retry_count
        );
        if let Some(error) = &item.last_error {
            println!("  └─ {}", truncate(error, 74));
        }
    }

    Ok(())
}

async fn process(engine: &Engine, once: bool, poll: u64) -> Result<()> {
    let report = engine.queue.recover().await?;
    if !report.is_empty() {
        println!(
            "♻️  Recovered {} item(s), failed {} with missing sources",
            report.recovered.len(),
            report.failed.len()
        );
    }

    let mut worker = QueueWorker::new(engine.queue.clone(), Arc::new(engine.processor()))
        .with_entities(engine.entities.clone())
        .with_uploader(engine.uploader.clone());

    let orchestrator = if engine.auth.is_set() {
        let orchestrator = engine.orchestrator()?;
        worker = worker.with_sync_trigger(orchestrator.clone());
        Some(orchestrator)
    } else {
        println!("ℹ️  No auth token; processed captures will sync later");
        None
    };

    if once {
        let mut completed = 0usize;
        let mut failed = 0usize;
        loop {
            match worker.process_next().await? {
                WorkOutcome::Idle => break,
                WorkOutcome::Completed(item) => {
                    completed += 1;
                    println!("✓ {} ({})", item.capture_id, item.id);
                }
                WorkOutcome::Failed { item, error } => {
                    failed += 1;
                    println!("✗ {} ({}) [{}]: {}", item.capture_id, item.id, item.status.as_str(), error);
                }
            }
        }
        println!();
        println!("Processed: {} completed, {} failed", completed, failed);

        // Sync what was just produced before exiting
        if let Some(orchestrator) = orchestrator {
            if completed > 0 {
                print_outcome(orchestrator.sync(SyncRequest::manual()).await?);
            }
        }
        return Ok(());
    }

    if let Some(orchestrator) = &orchestrator {
        orchestrator.start()?;
    }

    println!("👷 Processing queue (poll every {}s)", poll);
    println!("    Press Ctrl+C to stop");
    println!();

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        let _ = stop_tx.send(true);
    });

    let total = worker.run(Duration::from_secs(poll.max(1)), stop_rx).await?;

    if let Some(orchestrator) = orchestrator {
        orchestrator.stop();
    }

    println!();
    println!("🛑 Stopped: {} completed, {} failed", total.completed, total.failed);
    Ok(())
}

async fn recover(engine: &Engine) -> Result<()> {
    let report = engine.queue.recover().await?;

    if report.is_empty() {
        println!("✓ Nothing to recover");
        return Ok(());
    }

    for item in &report.recovered {
        println!("♻️  {} ({}) → pending", item.capture_id, item.id);
    }
    for item in &report.failed {
        println!("✗ {} ({}) → failed: source missing", item.capture_id, item.id);
    }
    println!();
    println!(
        "Recovered: {}  Failed: {}",
        report.recovered.len(),
        report.failed.len()
    );
    Ok(())
}

async fn retry_item(engine: &Engine, item_id: &str) -> Result<()> {
    let item = engine.queue.retry_failed(item_id).await?;
    println!("✅ Requeued {} as {}", item.capture_id, item.id);
    Ok(())
}

async fn purge_item(engine: &Engine, item_id: &str) -> Result<()> {
    let item = engine.queue.purge(item_id).await?;
    println!("🗑️  Purged {} ({})", item.id, item.status.as_str());
    Ok(())
}

async fn upload(
    engine: &Engine,
    capture_id: &str,
    path: &Path,
    upload_id: Option<String>,
) -> Result<()> {
    require_token(engine)?;

    let size = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("File not found: {}", path.display()))?
        .len();
    let upload_id = upload_id.unwrap_or_else(|| Uuid::new_v4().to_string());

    println!("📤 Uploading {} ({} bytes) as {}", path.display(), size, upload_id);
    let record = engine
        .uploader
        .upload_file(&upload_id, capture_id, path, size)
        .await
        .with_context(|| format!("Upload {} stopped; resume with `capsync resume {}`", upload_id, upload_id))?;

    println!(
        "✅ {} chunk(s) uploaded [{}]",
        record.total_chunks,
        record.status.as_str()
    );
    Ok(())
}

async fn resume_upload(engine: &Engine, upload_id: &str) -> Result<()> {
    require_token(engine)?;

    let record = engine.uploader.resume_upload(upload_id).await?;
    println!(
        "✅ {} finished: {}/{} chunk(s) [{}]",
        record.upload_id,
        record.last_chunk_uploaded + 1,
        record.total_chunks,
        record.status.as_str()
    );
    Ok(())
}

async fn list_uploads(engine: &Engine) -> Result<()> {
    let uploads = engine.uploader.list().await?;
    if uploads.is_empty() {
        println!("No uploads.");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<12} {:<10}", "UPLOAD ID", "CAPTURE", "STATUS", "CHUNKS");
    println!("{}", "-".repeat(82));
    for record in uploads {
        println!(
            "{:<38} {:<20} {:<12} {:<10}",
            record.upload_id,
            truncate(&record.capture_id, 20),
            record.status.as_str(),
            format!("{}/{}", record.last_chunk_uploaded + 1, record.total_chunks)
        );
    }

    Ok(())
}

async fn sync_now(engine: &Engine) -> Result<()> {
    require_token(engine)?;

    let orchestrator = engine.orchestrator()?;
    print_outcome(orchestrator.sync(SyncRequest::manual()).await?);

    let status = orchestrator.refresh_status().await?;
    println!("Pending changes: {}", status.pending_count);
    Ok(())
}

fn print_outcome(outcome: SyncOutcome) {
    match outcome {
        SyncOutcome::Completed(report) => print_report(&report),
        SyncOutcome::Coalesced(Some(report)) => print_report(&report),
        SyncOutcome::Coalesced(None) => println!("⚠️  Joined a sync pass that failed"),
        SyncOutcome::NetworkUnavailable => println!("📴 Offline; nothing synced"),
    }
}

fn print_report(report: &SyncReport) {
    println!("✅ Sync complete");
    println!("  Uploaded:   {}", report.uploaded);
    println!("  Pushed:     {}", report.pushed);
    println!("  Downloaded: {}", report.downloaded);
    println!("  Conflicts:  {}", report.conflicts);
    if report.deferred_uploads > 0 {
        println!("  Deferred:   {}", report.deferred_uploads);
    }
}

async fn list_conflicts(engine: &Engine, all: bool) -> Result<()> {
    let conflicts = if all {
        engine.resolver.list().await?
    } else {
        engine.resolver.unresolved().await?
    };

    if conflicts.is_empty() {
        println!("No conflicts.");
        return Ok(());
    }

    println!("{:<38} {:<28} {:<20} {:<12}", "CONFLICT ID", "ENTITY", "DETECTED", "RESOLUTION");
    println!("{}", "-".repeat(100));
    for conflict in conflicts {
        let resolution = match conflict.resolution_strategy {
            Some(strategy) if conflict.is_resolved() => format!("{:?}", strategy),
            _ => "open".to_string(),
        };
        println!(
            "{:<38} {:<28} {:<20} {:<12}",
            conflict.id,
            truncate(&format!("{}/{}", conflict.entity_type, conflict.entity_id), 28),
            conflict.detected_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            resolution
        );
    }

    Ok(())
}

async fn resolve(
    engine: &Engine,
    conflict_id: &str,
    strategy: &str,
    payload: Option<&str>,
) -> Result<()> {
    let strategy = ResolutionStrategy::parse(strategy)
        .with_context(|| format!("Unknown strategy: {} (use local-wins, remote-wins or merged)", strategy))?;
    let payload = match payload {
        Some(text) => Some(serde_json::from_str(text).context("Merged payload is not valid JSON")?),
        None => None,
    };

    let orchestrator = engine.orchestrator()?;
    let conflict = orchestrator
        .resolve_conflict(conflict_id, strategy, payload)
        .await?;

    println!(
        "✅ Resolved {}/{} with {:?}",
        conflict.entity_type, conflict.entity_id, strategy
    );
    if engine.auth.is_set() {
        println!("   Run `capsync sync` to push the result");
    }
    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::load_config()?;

    println!("Config file: {}", cfg.config_file.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "(none - using defaults)".to_string()));
    println!("Store file:  {}", paths::configured_store_file(&cfg).display());
    println!();
    print!("{}", serde_yaml::to_string(&cfg).context("Failed to render configuration")?);
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
