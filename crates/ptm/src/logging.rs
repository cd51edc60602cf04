//! Tracing setup shared by both binaries.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use ptm_common::{PtmError, PtmResult};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Log file of the `ptm` binary.
pub const PTM_LOG: &str = "ptm.log";
/// Log file of the control child.
pub const HOST_CTL_LOG: &str = "ptm-host-ctl.log";

const TARGETS: [&str; 4] = ["ptm", "ptm_common", "ptm_network", "ptm_host_ctl"];

fn directives(debug: bool) -> Vec<String> {
    let level = if debug { "debug" } else { "info" };
    TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect()
}

fn filter(debug: bool) -> PtmResult<EnvFilter> {
    let mut filter = EnvFilter::from_default_env();
    for directive in directives(debug) {
        let directive = directive
            .parse()
            .map_err(|e: tracing_subscriber::filter::ParseError| PtmError::config("log filter", e.to_string()))?;
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}

/// Install the global subscriber: human output on stderr, plus JSON lines
/// appended to `<log_dir>/<file_name>` when a log dir is given.
///
/// A second call is a no-op.
pub fn init(debug: bool, log_dir: Option<&Path>, file_name: &str) -> PtmResult<()> {
    let file_layer = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(file_name))?;
            Some(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };

    let result = tracing_subscriber::registry()
        .with(filter(debug)?)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();
    if result.is_err() {
        tracing::debug!("Tracing already initialized");
    }
    Ok(())
}
