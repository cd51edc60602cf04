//! ptm CLI entry point.

use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use color_eyre::eyre::Result;
use ptm::cli::Cli;
use ptm::logging;
use ptm_common::PtmError;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    let cli = Cli::parse();
    logging::init(cli.debug, cli.log_dir.as_deref(), logging::PTM_LOG)?;

    let result = match cli.load_settings() {
        Ok(settings) => cli.execute(settings).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            tracing::error!(error = %e, "ptm failed");
            eprintln!("error: {e}");
            if matches!(e, PtmError::ArgumentMismatch { .. }) {
                eprintln!();
                eprintln!("{}", Cli::command().render_help());
            }
            Ok(ExitCode::FAILURE)
        }
    }
}
