//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Resilient batch collector for academic PDFs.
///
/// Fetches a list of work items with bounded parallelism, adaptive rate
/// limits, and a crash-safe checkpoint so interrupted runs resume cleanly.
#[derive(Parser, Debug)]
#[command(name = "collector")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (JSON). Defaults to $XDG_CONFIG_HOME/collector/config.json
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Override the state directory from the config file
    #[arg(long, global = true, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch the items listed in a JSON file
    Run(RunArgs),
    /// Write the failure report of the current checkpoint
    ExportFailures {
        /// Report path (default: state dir, timestamped)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Classify a state file and suggest a recovery action
    CheckState {
        /// State file to inspect
        file: PathBuf,
    },
    /// Allow a permanently failed item to be retried
    ClearPermanent {
        /// Item identifier
        id: String,
    },
    /// Remove old state files and stale backups
    Purge {
        /// Remove files last modified more than this many days ago
        #[arg(long)]
        days: u64,
        /// File name glob inside the state directory
        #[arg(long, default_value = "*.json")]
        pattern: String,
    },
    /// Upload local items missing from the remote tier
    Sync,
}

/// Arguments for `collector run`.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// JSON file holding an array of work items
    pub items: PathBuf,

    /// Retry items that failed transiently in earlier runs
    #[arg(long)]
    pub retry_failed: bool,

    /// Merge the existing checkpoint before filtering
    #[arg(long)]
    pub resume: bool,

    /// Write a failure report after the run
    #[arg(long)]
    pub export_failures: bool,

    /// Maximum concurrent downloads (1-100), overrides the config file
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,
}
