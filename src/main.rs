//! CLI entry point for the collector tool.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::debug;

mod app;
mod cli;

use cli::Cli;

/// Process outcome mapped onto the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessExit {
    /// Everything requested succeeded.
    Success,
    /// Some items failed, some succeeded.
    Partial,
    /// Nothing succeeded, or the run was interrupted.
    Failure,
}

impl ProcessExit {
    fn code(self) -> ExitCode {
        match self {
            Self::Success => ExitCode::SUCCESS,
            Self::Partial => ExitCode::from(1),
            Self::Failure => ExitCode::from(2),
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();

    app::terminal::init_tracing(app::terminal::default_log_level(cli.quiet, cli.verbose));
    debug!(?cli, "CLI arguments parsed");

    let exit = app::runtime::run_collector(cli).await?;
    Ok(exit.code())
}
