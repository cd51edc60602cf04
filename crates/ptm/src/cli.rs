//! ptm command line.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgGroup, Parser};
use ptm_common::{PtmError, PtmResult, PtmSettings};
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::manager::TopologyManager;
use crate::packages::{DpkgQuery, detect_versions};

/// ptm - build, start and tear down an emulated physical network
#[derive(Debug, Parser)]
#[command(name = "ptm")]
#[command(author, version, about, long_about = None)]
#[command(group(ArgGroup::new("action").args(["startup", "shutdown", "print"])))]
pub struct Cli {
    /// Build the topology and start every service
    #[arg(long)]
    pub startup: bool,

    /// Stop every service and remove the topology
    #[arg(long)]
    pub shutdown: bool,

    /// Print the resolved topology
    #[arg(long)]
    pub print: bool,

    /// Topology JSON file
    #[arg(short = 'c', long = "config-file", value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Directory for log files
    #[arg(short = 'l', long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Settings TOML file (default: $PTM_SETTINGS)
    #[arg(long, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// With --print, emit JSON instead of tables
    #[arg(long, requires = "print")]
    pub json: bool,
}

/// What the invocation asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// `--startup`
    Startup,
    /// `--shutdown`
    Shutdown,
    /// `--print`
    Print,
}

impl Action {
    /// Whether installed package versions pick the services this action
    /// drives. Stop has to reach the same init scripts start used.
    #[must_use]
    pub const fn needs_versions(self) -> bool {
        matches!(self, Self::Startup | Self::Shutdown)
    }
}

#[derive(Tabled)]
struct HostRow {
    #[tabled(rename = "HOST")]
    name: String,
    #[tabled(rename = "KIND")]
    kind: String,
    #[tabled(rename = "CONTEXT")]
    context: String,
    #[tabled(rename = "INTERFACES")]
    interfaces: String,
    #[tabled(rename = "STATE")]
    state: String,
}

#[derive(Tabled)]
struct WiringRow {
    #[tabled(rename = "NEAR")]
    near: String,
    #[tabled(rename = "FAR")]
    far: String,
}

#[derive(Tabled)]
struct GroupRow {
    #[tabled(rename = "GROUP")]
    group: usize,
    #[tabled(rename = "HOSTS")]
    hosts: String,
}

impl Cli {
    /// The requested action.
    pub fn action(&self) -> PtmResult<Action> {
        if self.startup {
            Ok(Action::Startup)
        } else if self.shutdown {
            Ok(Action::Shutdown)
        } else if self.print {
            Ok(Action::Print)
        } else {
            Err(PtmError::ArgumentMismatch {
                message: "one of --startup, --shutdown or --print is required".to_string(),
            })
        }
    }

    /// Settings from `--settings` (or `$PTM_SETTINGS`) with `--log-dir`
    /// applied on top.
    pub fn load_settings(&self) -> PtmResult<PtmSettings> {
        let settings = PtmSettings::load(self.settings.as_deref())?;
        Ok(match &self.log_dir {
            Some(dir) => settings.with_log_dir(dir),
            None => settings,
        })
    }

    /// Run the invocation.
    pub async fn execute(&self, mut settings: PtmSettings) -> PtmResult<()> {
        let action = self.action()?;
        let config_file = self
            .config_file
            .as_deref()
            .ok_or_else(|| PtmError::ArgumentMismatch {
                message: "--config-file is required".to_string(),
            })?;

        if action.needs_versions() {
            detect_versions(&DpkgQuery::system(), &mut settings).await?;
        }
        let mut manager = TopologyManager::live(Arc::new(settings));
        manager.configure_file(config_file)?;

        match action {
            Action::Print => {
                let out = if self.json {
                    render_json(&manager)?
                } else {
                    render_tables(&manager)
                };
                println!("{out}");
                Ok(())
            }
            Action::Startup => {
                manager.settings().paths.create_dirs()?;
                manager.startup().await
            }
            Action::Shutdown => manager.shutdown().await,
        }
    }
}

/// The resolved topology as pretty JSON.
pub fn render_json(manager: &TopologyManager) -> PtmResult<String> {
    let topology = manager.topology().ok_or_else(|| PtmError::ArgumentMismatch {
        message: "no topology configured".to_string(),
    })?;
    Ok(serde_json::to_string_pretty(topology)?)
}

/// Hosts, wiring and start order as tables.
#[must_use]
pub fn render_tables(manager: &TopologyManager) -> String {
    let hosts: Vec<HostRow> = manager
        .hosts()
        .map(|host| HostRow {
            name: host.name.clone(),
            kind: host.kind.to_string(),
            context: host.ctx.to_string(),
            interfaces: host
                .interfaces
                .values()
                .map(|iface| {
                    let addrs: Vec<String> = iface.ip_list.iter().map(ToString::to_string).collect();
                    if addrs.is_empty() {
                        iface.name.clone()
                    } else {
                        format!("{} {}", iface.name, addrs.join(","))
                    }
                })
                .collect::<Vec<_>>()
                .join("\n"),
            state: host.state.to_string(),
        })
        .collect();

    let wiring: Vec<WiringRow> = manager
        .topology()
        .map(|topo| {
            topo.wiring
                .iter()
                .map(|edge| WiringRow {
                    near: edge.near.to_string(),
                    far: edge.far.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    let groups: Vec<GroupRow> = manager
        .start_order()
        .iter()
        .enumerate()
        .map(|(i, group)| GroupRow {
            group: i + 1,
            hosts: group.join(", "),
        })
        .collect();

    let mut out = String::new();
    let _ = writeln!(out, "{}", Table::new(hosts).with(Style::sharp()));
    let _ = writeln!(out, "{}", Table::new(wiring).with(Style::sharp()));
    let _ = write!(out, "{}", Table::new(groups).with(Style::sharp()));
    out
}
