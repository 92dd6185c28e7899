//! # Remote Media Optimizer - Main Entry Point
//!
//! Questo è il punto di ingresso principale dell'applicazione.
//!
//! ## Responsabilità:
//! - Parsing degli argomenti della command line con `clap`
//! - Inizializzazione del sistema di logging con `tracing`
//! - Composition root: costruisce library, fetcher, tracker, sender, event
//!   bus e orchestratore UNA volta e li inietta esplicitamente (nessun
//!   singleton, nessun lookup globale)
//! - Guida il loop batch pull-based: una pagina per iterazione, finché una
//!   pagina vuota segnala il completamento
//!
//! ## Flusso di esecuzione:
//! 1. Parsa gli argomenti CLI (library, config, subcommand)
//! 2. Configura il logging (INFO o DEBUG a seconda del flag verbose)
//! 3. Carica i settings JSON e applica gli override da CLI
//! 4. Costruisce il grafo dei componenti e dispatcha il subcommand
//!
//! ## Esempio di utilizzo:
//! ```bash
//! remote-optimizer --library /path/to/media scan
//! remote-optimizer --library /path/to/media optimize --all
//! remote-optimizer --library /path/to/media optimize --re-optimize --batch-size 20
//! remote-optimizer --library /path/to/media restore --all
//! remote-optimizer --library /path/to/media stats
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use remote_media_optimizer::file_manager::FileManager;
use remote_media_optimizer::json_output::JsonMessage;
use remote_media_optimizer::progress::{ProgressManager, RunStats};
use remote_media_optimizer::purge::CloudflarePurger;
use remote_media_optimizer::thumbnails::STANDARD_SIZES;
use remote_media_optimizer::{
    AttachmentFetcher, BackupTracker, BatchReport, EventBus, HttpSender, MediaLibrary,
    OptimizationManager, OptimizeMode, RemoteClient, Settings, StatsAggregator, StatsRowObserver,
};

#[derive(Parser)]
#[command(name = "remote-optimizer")]
#[command(about = "Offload image optimization to a remote API and track results per attachment")]
struct Args {
    /// Media library root directory
    #[arg(short, long)]
    library: PathBuf,

    /// Path to a JSON settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output progress and status as JSON
    #[arg(long)]
    json: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register new images found under the library root, generating thumbnails
    Scan,

    /// Send candidate attachments to the remote optimizer
    Optimize {
        /// Keep requesting pages until the library is drained
        #[arg(long)]
        all: bool,

        /// Attachments per page (overrides the configured batch size)
        #[arg(long)]
        batch_size: Option<usize>,

        /// Optimize exactly these attachment ids
        #[arg(long, value_delimiter = ',')]
        ids: Vec<i64>,

        /// Re-process already-optimized attachments under current settings
        #[arg(long)]
        re_optimize: bool,

        /// Only target attachments with a failure record
        #[arg(long)]
        retry_failed_only: bool,

        /// Report candidates without sending or writing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Restore optimized attachments from their pristine backups
    Restore {
        /// Keep restoring pages until none are left
        #[arg(long)]
        all: bool,

        /// Attachments per page
        #[arg(long)]
        batch_size: Option<usize>,

        /// Report candidates without touching anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Clear failed optimizations (restoring backups first where possible)
    ResetFailed,

    /// Run the resumable statistics aggregation and print the totals
    Stats {
        /// Drop the baseline and rebuild the totals from zero
        #[arg(long)]
        recalculate: bool,
    },

    /// Check the configured API key against the validation endpoint
    ValidateKey,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let json = args.json;

    match run(args).await {
        Ok(()) => Ok(()),
        Err(e) => {
            // Fatal failures stay machine-readable under --json
            if json {
                JsonMessage::error(e.to_string()).emit();
            }
            Err(e)
        }
    }
}

async fn run(args: Args) -> Result<()> {
    // Initialize logging
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if !args.library.exists() {
        return Err(anyhow::anyhow!(
            "Library directory does not exist: {}",
            args.library.display()
        ));
    }

    let mut settings = match &args.config {
        Some(path) => Settings::from_file(path).await?,
        None => Settings::default(),
    };
    if args.json {
        settings.json_output = true;
    }

    let library = Arc::new(MediaLibrary::open(&args.library)?);

    match args.command {
        Command::Scan => {
            let added = library.ingest_directory(STANDARD_SIZES)?;
            info!("✅ Scan complete: {} new attachments registered", added);
        }
        Command::Optimize {
            all,
            batch_size,
            ids,
            re_optimize,
            retry_failed_only,
            dry_run,
        } => {
            if let Some(batch_size) = batch_size {
                settings.batch_size = batch_size;
            }
            settings.dry_run = settings.dry_run || dry_run;
            settings.validate()?;

            let manager = build_manager(library, settings.clone(), &args.library)?;

            let mode = if retry_failed_only {
                OptimizeMode::RetryFailed
            } else if re_optimize {
                OptimizeMode::Reoptimize
            } else {
                OptimizeMode::Fresh
            };

            if settings.dry_run {
                info!("🧪 Dry run mode: nothing will be sent or written");
            }

            if !ids.is_empty() {
                let report = manager.optimize_ids(&ids, re_optimize).await?;
                print_report(&report, &settings);
            } else {
                run_batches(&manager, mode, all && !settings.dry_run, &settings).await?;
            }
        }
        Command::Restore {
            all,
            batch_size,
            dry_run,
        } => {
            if let Some(batch_size) = batch_size {
                settings.batch_size = batch_size;
            }
            settings.dry_run = settings.dry_run || dry_run;
            settings.validate()?;

            let manager = build_manager(library, settings.clone(), &args.library)?;
            run_restores(&manager, all && !settings.dry_run, &settings).await?;
        }
        Command::ResetFailed => {
            let manager = build_manager(library, settings.clone(), &args.library)?;
            let reset = manager.reset_failed_optimizations().await?;
            info!("✅ Reset {} failed optimizations", reset);
        }
        Command::Stats { recalculate } => {
            let aggregator = StatsAggregator::new(
                library,
                settings.stats_batch_size,
                Duration::from_secs(settings.stats_time_budget_secs),
            );

            let spinner = (!settings.json_output)
                .then(|| ProgressManager::spinner("Aggregating statistics"));

            let mut outcome = if recalculate {
                aggregator.recalculate()?
            } else {
                aggregator.run()?
            };
            // Each invocation is budget-bounded; keep invoking until drained
            while !outcome.completed {
                match &spinner {
                    Some(spinner) => spinner.set_message(format!(
                        "Aggregating statistics ({}/{})",
                        outcome.task.processed_count, outcome.task.total_count
                    )),
                    None => info!(
                        "…aggregated {}/{} attachments, continuing",
                        outcome.task.processed_count, outcome.task.total_count
                    ),
                }
                outcome = aggregator.run()?;
            }
            if let Some(spinner) = &spinner {
                spinner.finish_and_clear();
            }

            let task = outcome.task;
            info!("=== Library Statistics ===");
            info!("Optimized attachments: {}", task.processed_count);
            info!(
                "Bytes saved: {}",
                FileManager::format_size(task.totals.normal_savings)
            );
            info!(
                "WebP bytes saved: {}",
                FileManager::format_size(task.totals.webp_savings)
            );
            info!("WebP conversions: {}", task.totals.webp_conversions);
            info!("PNG→JPEG conversions: {}", task.totals.png_jpg_conversions);
        }
        Command::ValidateKey => {
            let source_url = source_url(&settings, &args.library);
            let sender = HttpSender::new(settings.clone(), source_url)?;
            match sender.validate_api_key().await {
                Ok(()) => info!("✅ API key is valid"),
                Err(e) => return Err(anyhow::anyhow!("API key validation failed: {}", e)),
            }
        }
    }

    Ok(())
}

fn source_url(settings: &Settings, library_root: &std::path::Path) -> String {
    settings
        .public_base_url
        .clone()
        .unwrap_or_else(|| library_root.display().to_string())
}

/// Composition root: every component is built once and injected explicitly
fn build_manager(
    library: Arc<MediaLibrary>,
    settings: Settings,
    library_root: &std::path::Path,
) -> Result<OptimizationManager<HttpSender>> {
    let fetcher = AttachmentFetcher::new(library.clone(), settings.batch_size);
    let tracker = BackupTracker::new(library.clone(), settings.backup_enabled);
    let sender = HttpSender::new(settings.clone(), source_url(&settings, library_root))?;

    let mut bus = EventBus::new();
    bus.register(Box::new(StatsRowObserver::new(library.clone())));
    if let (Some(token), Some(zone), Some(base)) = (
        settings.cloudflare_api_token.clone(),
        settings.cloudflare_zone_id.clone(),
        settings.public_base_url.clone(),
    ) {
        info!("☁️ Cloudflare cache purging enabled for zone {}", zone);
        bus.register(Box::new(CloudflarePurger::new(
            library.clone(),
            token,
            zone,
            base,
        )?));
    }

    Ok(OptimizationManager::new(
        library, fetcher, tracker, sender, bus, settings,
    ))
}

/// Pull pages from the orchestrator until drained (or once, without `--all`)
async fn run_batches(
    manager: &OptimizationManager<HttpSender>,
    mode: OptimizeMode,
    all: bool,
    settings: &Settings,
) -> Result<()> {
    let candidates = manager.candidates(mode)?;
    info!("Found {} candidate attachments", candidates);

    if settings.json_output {
        JsonMessage::start("optimize", candidates, settings.batch_size, settings.dry_run).emit();
    }

    let progress = (all && !settings.json_output).then(|| ProgressManager::new(candidates));
    let mut stats = RunStats::new();
    let mut last_remaining = candidates;

    loop {
        let report = manager.optimize_batch(mode).await?;
        if report.processed == 0 {
            break;
        }

        stats.add_batch(&report);
        emit_batch(&report, settings, progress.as_ref());

        if !all {
            if report.remaining > 0 {
                info!(
                    "{} attachments remaining, run again to continue",
                    report.remaining
                );
            }
            break;
        }

        // Persistent failures stay in the predicate: stop when a pass makes
        // no forward progress instead of spinning on the same page
        if report.remaining >= last_remaining {
            warn!(
                "No forward progress ({} remaining), stopping; see failure records",
                report.remaining
            );
            break;
        }
        last_remaining = report.remaining;
    }

    if let Some(progress) = &progress {
        progress.finish(&stats.format_summary());
    }
    finish_run(&stats, settings);
    Ok(())
}

/// Pull restore pages until drained (or once, without `--all`)
async fn run_restores(
    manager: &OptimizationManager<HttpSender>,
    all: bool,
    settings: &Settings,
) -> Result<()> {
    let candidates = manager.restore_candidates()?;
    info!("Found {} restorable attachments", candidates);

    if settings.json_output {
        JsonMessage::start("restore", candidates, settings.batch_size, settings.dry_run).emit();
    }

    let progress = (all && !settings.json_output).then(|| ProgressManager::new(candidates));
    let mut stats = RunStats::new();

    loop {
        let report = manager.restore_batch().await?;
        if report.processed == 0 {
            break;
        }

        stats.add_batch(&report);
        emit_batch(&report, settings, progress.as_ref());

        if !all {
            if report.remaining > 0 {
                info!(
                    "{} attachments remaining, run again to continue",
                    report.remaining
                );
            }
            break;
        }
    }

    if let Some(progress) = &progress {
        progress.finish(&stats.format_summary());
    }
    finish_run(&stats, settings);
    Ok(())
}

fn emit_batch(report: &BatchReport, settings: &Settings, progress: Option<&ProgressManager>) {
    if settings.json_output {
        for message in &report.messages {
            JsonMessage::Item {
                message: message.clone(),
            }
            .emit();
        }
        JsonMessage::batch(report).emit();
        return;
    }

    for message in &report.messages {
        match progress {
            Some(progress) => progress.update(message),
            None => info!("{}", message),
        }
    }
}

fn print_report(report: &BatchReport, settings: &Settings) {
    emit_batch(report, settings, None);
    info!(
        "Processed: {} | Optimized: {} | Failed: {} | Saved: {}",
        report.processed,
        report.optimized,
        report.failed,
        FileManager::format_size(report.saved_bytes)
    );
}

fn finish_run(stats: &RunStats, settings: &Settings) {
    if settings.json_output {
        JsonMessage::complete(stats).emit();
    } else {
        info!("=== Run Complete ===");
        info!("{}", stats.format_summary());
    }
}
