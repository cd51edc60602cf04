//! Per-host control child.
//!
//! Started by `ptm` inside fresh mount and UTS namespaces. Rebuilds the
//! host from its snapshot, runs one command against its service and
//! reports the outcome through the exit code alone.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use ptm::host::HostSnapshot;
use ptm::isolation::{EXIT_USAGE, exit_code, run_host_control};
use ptm::logging;
use ptm::services::HostSystem;

/// ptm-host-ctl - run one control command for one host
#[derive(Debug, Parser)]
#[command(name = "ptm-host-ctl")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// `start`, `stop` or a service verb
    #[arg(short = 'c', long)]
    command: String,

    /// Host snapshot JSON
    #[arg(short = 'j', long)]
    json: String,

    /// Directory for the log file
    #[arg(short = 'l', long)]
    log_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Verb arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn code(value: i32) -> ExitCode {
    ExitCode::from(u8::try_from(value).unwrap_or(1))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            if e.print().is_err() {
                eprintln!("{e}");
            }
            return if e.use_stderr() {
                code(EXIT_USAGE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    if let Err(e) = logging::init(args.debug, args.log_dir.as_deref(), logging::HOST_CTL_LOG) {
        eprintln!("error: {e}");
        return code(EXIT_USAGE);
    }

    let result = match HostSnapshot::from_json(&args.json) {
        Ok(snapshot) => {
            let ops = HostSystem::new();
            run_host_control(&args.command, &snapshot, &args.args, &ops).await
        }
        Err(e) => Err(e),
    };

    if let Err(e) = &result {
        tracing::error!(command = %args.command, error = %e, "Host control failed");
        eprintln!("error: {e}");
    }
    code(exit_code(&result))
}
