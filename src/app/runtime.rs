//! Component wiring and subcommand handlers.

use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result, bail};
use collector_core::orchestrator::{DownloadOrchestrator, DownloadState, FailureReport};
use collector_core::persistence::{StatePersistence, check_integrity};
use collector_core::storage::{DirectoryRemote, LocalTier, RemoteStorage, StorageCoordinator};
use collector_core::{AdaptiveRateLimiter, CollectorConfig, HttpClient, ResilientFetcher, WorkItem};
use tracing::{debug, info, warn};

use crate::ProcessExit;
use crate::app::{exit_handler, progress, terminal};
use crate::cli::{Cli, Command, RunArgs};

pub(crate) async fn run_collector(cli: Cli) -> Result<ProcessExit> {
    let config = load_config(&cli)?;
    debug!(?config, "configuration resolved");

    match &cli.command {
        Command::Run(args) => run_items(&cli, &config, args).await,
        Command::ExportFailures { output } => export_failures(&config, output.as_deref()),
        Command::CheckState { file } => Ok(check_state(file)),
        Command::ClearPermanent { id } => clear_permanent(&config, id),
        Command::Purge { days, pattern } => purge(&config, pattern, *days),
        Command::Sync => sync(&config).await,
    }
}

fn load_config(cli: &Cli) -> Result<CollectorConfig> {
    let mut config = CollectorConfig::load_or_default(cli.config.as_deref())?;
    if let Some(state_dir) = &cli.state_dir {
        config.paths.state_dir.clone_from(state_dir);
    }
    Ok(config)
}

fn persistence(config: &CollectorConfig) -> Arc<StatePersistence> {
    Arc::new(StatePersistence::new(&config.paths.state_dir).with_backups(config.paths.backups))
}

fn storage(config: &CollectorConfig) -> Result<Arc<StorageCoordinator>> {
    let local = LocalTier::open(&config.paths.local_dir).with_context(|| {
        format!(
            "Failed to open local storage '{}'",
            config.paths.local_dir.display()
        )
    })?;
    let remote = config.paths.remote_dir.as_ref().map(|dir| {
        debug!(remote_dir = %dir.display(), "remote tier configured");
        Arc::new(DirectoryRemote::new(dir)) as Arc<dyn RemoteStorage>
    });
    Ok(Arc::new(StorageCoordinator::new(local, remote)))
}

fn orchestrator(
    config: &CollectorConfig,
    concurrency: Option<u8>,
) -> Result<DownloadOrchestrator> {
    let (connect, request) = config.fetch.timeouts();
    let client = HttpClient::with_timeouts(connect, request)?;
    let fetcher = ResilientFetcher::new(client, storage(config)?)
        .with_retry_policy(config.fetch.retry_policy())
        .with_failure_policy(config.orchestrator.failure_policy())
        .with_validator(config.fetch.validator())
        .with_interval_limiter(Arc::new(config.fetch.interval_limiter()));
    let limiter = AdaptiveRateLimiter::new(config.rate_limits.clone());

    let mut settings = config.orchestrator.to_orchestrator_config();
    if let Some(concurrency) = concurrency {
        settings.concurrency = usize::from(concurrency);
    }
    Ok(DownloadOrchestrator::new(
        settings,
        Arc::new(fetcher),
        Arc::new(limiter),
        persistence(config),
        &config.paths.checkpoint_file,
    )?)
}

fn read_items(path: &Path) -> Result<Vec<WorkItem>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read items file '{}'", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse items file '{}'", path.display()))
}

async fn run_items(cli: &Cli, config: &CollectorConfig, args: &RunArgs) -> Result<ProcessExit> {
    let items = read_items(&args.items)?;
    info!(items = items.len(), "Collector starting");

    let mut orchestrator = orchestrator(config, args.concurrency)?;
    let work = orchestrator
        .filter_work(items, args.retry_failed, args.resume)
        .await?;
    if work.is_empty() {
        info!("Nothing to fetch");
        return Ok(ProcessExit::Success);
    }

    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let use_spinner = terminal::should_use_spinner(
        io::stderr().is_terminal(),
        cli.quiet,
        terminal::is_dumb_terminal(),
    );
    let (progress_handle, progress_stop) =
        progress::spawn_progress_ui(use_spinner, orchestrator.status_handle());

    let result = orchestrator.run(work, None).await;

    progress_stop.store(true, Ordering::SeqCst);
    if let Some(handle) = progress_handle {
        let _ = handle.await;
    }
    let summary = result?;

    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        permanent = summary.permanent_failures,
        skipped = summary.skipped,
        "Collection complete"
    );
    if !summary.checkpoint_saved {
        warn!("Final checkpoint was not saved; the next run may repeat work");
    }

    let report = if args.export_failures {
        orchestrator.export_failures(None)?
    } else {
        None
    };
    if let Some(path) = report {
        println!("Failure report: {}", path.display());
    }

    if summary.cancelled > 0 {
        warn!(
            cancelled = summary.cancelled,
            "Interrupted. Run again with --resume to continue."
        );
    }
    Ok(exit_handler::determine_exit_outcome(&summary))
}

fn load_state(config: &CollectorConfig) -> Result<DownloadState> {
    let path = config.checkpoint_path();
    let state = persistence(config)
        .load::<DownloadState>(&path)?
        .unwrap_or_default();
    Ok(state)
}

fn export_failures(config: &CollectorConfig, output: Option<&Path>) -> Result<ProcessExit> {
    let state = load_state(config)?;
    let report = FailureReport::from_state(&state, chrono::Utc::now());
    if report.is_empty() {
        println!("No failures recorded");
        return Ok(ProcessExit::Success);
    }

    let path = output.map_or_else(
        || {
            config.paths.state_dir.join(format!(
                "failed_papers_{}.json",
                report.generated_at.format("%Y%m%d_%H%M%S")
            ))
        },
        Path::to_path_buf,
    );
    persistence(config).save_atomic(&path, &report)?;
    println!(
        "Exported {} failures ({} permanent) to {}",
        report.total_failures,
        report.permanent_failures,
        path.display()
    );
    Ok(ProcessExit::Success)
}

fn check_state(file: &Path) -> ProcessExit {
    let result = check_integrity(file);
    println!("{}: {:?}", result.path.display(), result.status);
    println!("  size: {} bytes", result.size);
    println!("  checksum match: {}", result.checksum_match);
    if let Some(modified) = result.modified {
        println!("  modified: {}", modified.to_rfc3339());
    }
    println!("  recovery: {}", result.recovery_action);
    if result.is_valid() {
        ProcessExit::Success
    } else {
        ProcessExit::Failure
    }
}

fn clear_permanent(config: &CollectorConfig, id: &str) -> Result<ProcessExit> {
    let mut orchestrator = orchestrator(config, None)?;
    if !orchestrator.restore_checkpoint()? {
        bail!(
            "No checkpoint found at '{}'",
            orchestrator.checkpoint_path().display()
        );
    }
    if orchestrator.clear_permanent_failure(id)? {
        println!("Cleared permanent failure for {id}");
        Ok(ProcessExit::Success)
    } else {
        println!("No permanent failure recorded for {id}");
        Ok(ProcessExit::Failure)
    }
}

fn purge(config: &CollectorConfig, pattern: &str, days: u64) -> Result<ProcessExit> {
    let removed: Vec<PathBuf> = persistence(config).purge_older_than(pattern, days)?;
    for path in &removed {
        println!("Removed {}", path.display());
    }
    println!("Removed {} file(s)", removed.len());
    Ok(ProcessExit::Success)
}

async fn sync(config: &CollectorConfig) -> Result<ProcessExit> {
    let storage = storage(config)?;
    if !storage.has_remote() {
        bail!("No remote tier configured (set paths.remote_dir)");
    }
    let report = storage.sync_to_remote().await?;
    println!(
        "Uploaded {}, already present {}, failed {}",
        report.uploaded, report.already_present, report.failed
    );
    if report.failed > 0 {
        Ok(ProcessExit::Partial)
    } else {
        Ok(ProcessExit::Success)
    }
}
