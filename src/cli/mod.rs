//! Command-line interface for vigil.
//!
//! Provides commands for processing trigger payloads, watching a drop
//! directory, and inspecting the idempotency ledger.

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::adapters::{
    ArtifactStore, CommandBackend, FsArtifactStore, HttpArtifactStore, HttpModelBackend,
    InferenceBackend, InferenceClient, LogNotifier, NotificationSink, TelegramNotifier,
    WebhookNotifier,
};
use crate::config::{
    self, paths, InferenceConfig, LedgerBackend, NotifierConfig, ResolvedConfig, StoreConfig,
};
use crate::core::{
    IdempotencyLedger, JsonlLedgerStore, LedgerStore, MemoryLedgerStore, Orchestrator,
    SqliteLedgerStore,
};
use crate::domain::{ProcessingRecord, TriggerEvent};
use crate::ingest::{DispatchSummary, Dispatcher, SegmentWatcher, Subscription, WatcherConfig};

/// vigil - Idempotent threat analysis for camera segments
#[derive(Parser, Debug)]
#[command(name = "vigil")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process trigger events from a JSON payload
    Process {
        /// Payload file: one event, an array of events, or an object store
        /// notification (reads from stdin if not provided)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Process every segment in the drop directory, then watch for new ones
    Watch {
        /// Directory to watch (defaults to the configured watch_dir)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Scan once and exit instead of watching
        #[arg(long)]
        once: bool,
    },

    /// List recent ledger records
    Ledger {
        /// Maximum number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show the ledger record for one artifact
    Show {
        /// Artifact ID
        artifact_id: String,
    },

    /// Show resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Process { input } => process_payload(input).await,
            Commands::Watch { dir, once } => watch_segments(dir, once).await,
            Commands::Ledger { limit } => list_ledger(limit).await,
            Commands::Show { artifact_id } => show_record(&artifact_id).await,
            Commands::Config => show_config(),
        }
    }
}

/// Process the triggers in a payload file or stdin
async fn process_payload(input_file: Option<PathBuf>) -> Result<()> {
    let payload = if let Some(path) = input_file {
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        anyhow::bail!("No input provided. Use --input <file> or pipe to stdin");
    };

    if payload.trim().is_empty() {
        anyhow::bail!("Input is empty");
    }

    let events = TriggerEvent::parse_batch(&payload).context("Failed to decode trigger payload")?;
    if events.is_empty() {
        eprintln!("Payload contained no triggers");
        return Ok(());
    }

    let cfg = config::config()?;
    let dispatcher = build_dispatcher(cfg, None).await?;

    let mut gave_up = 0usize;
    for event in &events {
        match dispatcher.deliver(event).await {
            Ok(outcome) => println!("{:<50} {}", event.artifact_id, outcome),
            Err(e) => {
                gave_up += 1;
                println!("{:<50} RETRYABLE ({})", event.artifact_id, e);
            }
        }
    }

    if gave_up > 0 {
        anyhow::bail!("{} of {} triggers still failing after redelivery", gave_up, events.len());
    }

    Ok(())
}

/// Drain the drop directory, then keep watching it until interrupted
async fn watch_segments(dir: Option<PathBuf>, once: bool) -> Result<()> {
    let cfg = config::config()?;
    let watch_dir = match dir {
        Some(dir) => dir,
        None => paths::watch_dir()?,
    };

    std::fs::create_dir_all(&watch_dir)
        .with_context(|| format!("Failed to create watch directory: {}", watch_dir.display()))?;

    let dispatcher = build_dispatcher(cfg, Some(watch_dir.clone())).await?;
    let watcher = SegmentWatcher::new(WatcherConfig::new(&watch_dir));

    if once {
        let backlog = watcher.scan_once().await?;
        eprintln!("Found {} segment(s) in {}", backlog.len(), watch_dir.display());
        print_summary(&dispatcher.dispatch_all(backlog).await);
        return Ok(());
    }

    // Subscribe before draining the backlog so nothing written meanwhile is missed
    let Subscription {
        backlog,
        live,
        handle,
    } = watcher.watch_with_backlog().await?;
    eprintln!("Found {} segment(s) in {}", backlog.len(), watch_dir.display());
    print_summary(&dispatcher.dispatch_all(backlog).await);

    eprintln!("Watching {} (Ctrl+C to stop)", watch_dir.display());

    // Stopping the watcher closes the channel, which ends `run`
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        if let Err(e) = handle.stop().await {
            tracing::warn!("Failed to stop watcher: {}", e);
        }
    });

    let summary = dispatcher.run(live).await;
    print_summary(&summary);

    Ok(())
}

/// List recent ledger records
async fn list_ledger(limit: usize) -> Result<()> {
    let cfg = config::config()?;
    let ledger = build_ledger(cfg).await?;
    let records = ledger.list(limit).await?;

    if records.is_empty() {
        println!("Ledger is empty");
        return Ok(());
    }

    println!(
        "{:<44} {:<12} {:<8} {:<8} {:<25}",
        "ARTIFACT", "STATUS", "ATTEMPT", "RISK", "UPDATED"
    );
    println!("{}", "-".repeat(100));

    for record in records {
        let artifact = if record.artifact_id.len() > 43 {
            format!("{}...", truncate(&record.artifact_id, 40))
        } else {
            record.artifact_id.clone()
        };
        let risk = record
            .result_risk_level
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<44} {:<12} {:<8} {:<8} {:<25}",
            artifact,
            format!("{:?}", record.status),
            record.attempt_count,
            risk,
            record.last_updated.to_rfc3339()
        );
    }

    Ok(())
}

/// Show one ledger record
async fn show_record(artifact_id: &str) -> Result<()> {
    let cfg = config::config()?;
    let ledger = build_ledger(cfg).await?;

    let record = ledger
        .get(artifact_id)
        .await?
        .with_context(|| format!("No ledger record for: {}", artifact_id))?;

    print_record(&record);
    Ok(())
}

fn print_record(record: &ProcessingRecord) {
    println!("Artifact:  {}", record.artifact_id);
    println!("Source:    {}", record.source_location);
    println!("Status:    {:?}", record.status);
    println!("Attempts:  {}", record.attempt_count);
    println!("Created:   {}", record.created_at.to_rfc3339());
    println!("Updated:   {}", record.last_updated.to_rfc3339());
    if let (Some(owner), Some(expires)) = (record.lease_owner, record.lease_expires_at) {
        println!("Lease:     {} until {}", owner, expires.to_rfc3339());
    }
    if let Some(risk) = record.result_risk_level {
        println!("Risk:      {}", risk);
    }
    if let Some(error) = &record.last_error {
        println!("Error:     {}", error);
    }
    if let Some(assessment) = &record.assessment {
        println!();
        println!("Summary:   {}", assessment.summary);
        println!("Confidence: {:.2}", assessment.confidence);
        println!();
        println!("{}", assessment.full_analysis);
    }
}

fn print_summary(summary: &DispatchSummary) {
    eprintln!(
        "Processed {}: {} clean, {} alerted, {} duplicate, {} failed, {} gave up",
        summary.total(),
        summary.processed_clean,
        summary.processed_alerted,
        summary.skipped_duplicate,
        summary.failed_permanent,
        summary.gave_up
    );
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("vigil configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:       {}", cfg.home.display());
    println!("  Watch dir:  {}", cfg.watch_dir.display());
    println!("  Ledger:     {} ({:?})", cfg.ledger_path.display(), cfg.ledger_backend);
    println!();
    println!("Pipeline:");
    println!("  Lease:            {}s", cfg.pipeline.lease_seconds);
    println!("  Max attempts:     {}", cfg.pipeline.max_attempts);
    println!("  Alert threshold:  {}", cfg.pipeline.alert_threshold);
    println!("  Workers:          {}", cfg.pipeline.workers);
    println!("  Max redeliveries: {}", cfg.pipeline.max_redeliveries);
    println!();
    println!("Timeouts:");
    println!("  Fetch:     {}s", cfg.timeouts.fetch_seconds);
    println!("  Inference: {}s", cfg.timeouts.inference_seconds);
    println!("  Notify:    {}s", cfg.timeouts.notify_seconds);
    println!();
    println!("Adapters:");
    println!("  Store:     {}", describe_store(&cfg.store));
    println!("  Inference: {}", describe_inference(cfg.inference.as_ref()));
    println!("  Notifier:  {}", describe_notifier(&cfg.notifier));
    println!();
    println!("Limits:");
    println!("  Max segment size: {} bytes", cfg.limits.max_segment_bytes);
    println!("  Accepted:         {}", cfg.limits.accepted_patterns.join(", "));

    Ok(())
}

fn describe_store(store: &StoreConfig) -> String {
    match store {
        StoreConfig::Fs { root: Some(root) } => format!("filesystem ({})", root),
        StoreConfig::Fs { root: None } => "filesystem (watch dir)".to_string(),
        StoreConfig::Http { endpoint, .. } => format!("http ({})", endpoint),
    }
}

fn describe_inference(inference: Option<&InferenceConfig>) -> String {
    match inference {
        Some(InferenceConfig::Http(http)) => format!("http ({}, {})", http.endpoint, http.model_id),
        Some(InferenceConfig::Command { program, .. }) => format!("command ({})", program),
        None => "(not configured)".to_string(),
    }
}

fn describe_notifier(notifier: &NotifierConfig) -> String {
    match notifier {
        NotifierConfig::Log => "log".to_string(),
        NotifierConfig::Webhook { url, .. } => format!("webhook ({})", url),
        NotifierConfig::Telegram(tg) => format!("telegram (chat {})", tg.chat_id),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Open the configured ledger
async fn build_ledger(cfg: &ResolvedConfig) -> Result<IdempotencyLedger> {
    paths::ensure_home()?;

    let store: Arc<dyn LedgerStore> = match cfg.ledger_backend {
        LedgerBackend::Sqlite => {
            ensure_parent(&cfg.ledger_path)?;
            let path = cfg.ledger_path.clone();
            let store = tokio::task::spawn_blocking(move || SqliteLedgerStore::open(&path))
                .await
                .context("Ledger open task failed")?
                .with_context(|| format!("Failed to open ledger: {}", cfg.ledger_path.display()))?;
            Arc::new(store)
        }
        LedgerBackend::Jsonl => {
            ensure_parent(&cfg.ledger_path)?;
            Arc::new(JsonlLedgerStore::new(&cfg.ledger_path))
        }
        LedgerBackend::Memory => Arc::new(MemoryLedgerStore::new()),
    };

    Ok(IdempotencyLedger::new(store, cfg.ledger_settings()))
}

fn ensure_parent(path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

/// Wire an orchestrator and dispatcher from configuration.
///
/// `fs_root` overrides where relative filesystem locators resolve when the
/// store config leaves the root unset.
async fn build_dispatcher(cfg: &ResolvedConfig, fs_root: Option<PathBuf>) -> Result<Dispatcher> {
    let ledger = build_ledger(cfg).await?;

    let store: Arc<dyn ArtifactStore> = match &cfg.store {
        StoreConfig::Fs { root: Some(root) } => Arc::new(FsArtifactStore::new(root)),
        StoreConfig::Fs { root: None } => {
            Arc::new(FsArtifactStore::new(fs_root.unwrap_or_else(|| cfg.watch_dir.clone())))
        }
        StoreConfig::Http { endpoint, token } => {
            Arc::new(HttpArtifactStore::new(endpoint.clone(), token.clone()))
        }
    };

    let backend: Arc<dyn InferenceBackend> = match &cfg.inference {
        Some(InferenceConfig::Http(http)) => Arc::new(HttpModelBackend::new(http.clone())),
        Some(InferenceConfig::Command { program, args }) => {
            Arc::new(CommandBackend::new(program.clone(), args.clone()))
        }
        None => anyhow::bail!(
            "No inference backend configured. Set `inference` in .vigil/config.yaml \
             or VIGIL_INFERENCE_ENDPOINT"
        ),
    };
    let inference = InferenceClient::new(backend, cfg.prompt.clone(), cfg.timeouts.inference());

    let notifier: Arc<dyn NotificationSink> = match &cfg.notifier {
        NotifierConfig::Log => Arc::new(LogNotifier),
        NotifierConfig::Webhook { url, token } => {
            Arc::new(WebhookNotifier::new(url.clone(), token.clone()))
        }
        NotifierConfig::Telegram(tg) => Arc::new(TelegramNotifier::from_config(tg.clone())),
    };

    tracing::debug!(
        ledger = ledger.store_name(),
        store = store.name(),
        inference = inference.backend_name(),
        notifier = notifier.name(),
        "Pipeline wired"
    );

    let orchestrator = Orchestrator::new(store, inference, notifier, ledger)
        .with_settings(cfg.pipeline_settings())
        .with_limits(cfg.limits.clone());

    Ok(Dispatcher::new(Arc::new(orchestrator), cfg.dispatcher_config()))
}
