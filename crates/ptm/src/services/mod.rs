//! Per-kind process control.
//!
//! Every host carries a [`ServiceConfig`] describing the daemon it runs.
//! Each variant implements [`ProcessControl`], the hooks the manager and
//! the isolated control child call in order:
//!
//! 1. `prepare_config` writes the host's config files (parent, once)
//! 2. `prepare_environment` bind-mounts them over the system paths (child)
//! 3. `control_start` / `control_stop` run the daemon's init script (child)
//! 4. `wait_for_process_start` / `wait_for_process_stop` poll readiness
//!    (parent)
//! 5. `cleanup_environment` undoes the bind mounts (child)
//!
//! All side effects go through [`ServiceOps`] so the same code runs against
//! the live system ([`HostSystem`]) or a recording fake in tests.

mod cassandra;
mod compute;
mod network;
mod router;
mod system;
mod zookeeper;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ptm_common::{PtmError, PtmPaths, PtmResult, PtmSettings, RetryPolicy};
use ptm_network::{CommandOutput, ExecContext};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::topology::{HostKind, ResolvedHost, ResolvedTopology};

pub use cassandra::CassandraConfig;
pub use compute::ComputeConfig;
pub use network::NetworkConfig;
pub use router::{BgpNeighbor, RouterConfig};
pub use system::HostSystem;
pub use zookeeper::ZookeeperConfig;

/// Side effects a service needs from the machine.
#[async_trait]
pub trait ServiceOps: Send + Sync + fmt::Debug {
    /// Run a command in `ctx` and capture its output.
    async fn run(&self, ctx: &ExecContext, argv: &[String]) -> PtmResult<CommandOutput>;

    /// Write a file, creating parent directories.
    async fn write_file(&self, path: &Path, contents: &str) -> PtmResult<()>;

    /// Read a file; `None` when it does not exist.
    async fn read_file(&self, path: &Path) -> PtmResult<Option<String>>;

    /// Create a directory and its parents.
    async fn create_dir(&self, path: &Path) -> PtmResult<()>;

    /// Bind-mount `source` over `target`.
    async fn bind_mount(&self, source: &Path, target: &Path) -> PtmResult<()>;

    /// Unmount `target`. Unmounting something not mounted succeeds.
    async fn unmount(&self, target: &Path) -> PtmResult<()>;

    /// Send `request` over TCP and return everything the peer answers.
    async fn tcp_request(&self, addr: SocketAddr, request: &str) -> PtmResult<String>;

    /// Check that `addr` accepts TCP connections.
    async fn tcp_connect(&self, addr: SocketAddr) -> PtmResult<()>;
}

/// Everything a service hook needs to know about its host.
#[derive(Clone, Copy)]
pub struct ServiceCtx<'a> {
    /// Host name.
    pub host: &'a str,
    /// Host context.
    pub ctx: &'a ExecContext,
    /// First address of the host.
    pub ip: Option<IpAddr>,
    /// Directory layout.
    pub paths: &'a PtmPaths,
    /// Readiness budget.
    pub readiness: RetryPolicy,
    /// Side effects.
    pub ops: &'a dyn ServiceOps,
}

impl fmt::Debug for ServiceCtx<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCtx")
            .field("host", &self.host)
            .field("ctx", &self.ctx)
            .field("ip", &self.ip)
            .finish_non_exhaustive()
    }
}

impl ServiceCtx<'_> {
    /// The host's address, required by every networked daemon.
    pub fn require_ip(&self) -> PtmResult<IpAddr> {
        self.ip.ok_or_else(|| {
            PtmError::config(self.host, "host has no address for its service to listen on")
        })
    }

    /// Per-host copy of a service's config directory.
    #[must_use]
    pub fn config_dir(&self, service: &str) -> PathBuf {
        self.paths.host_config(self.host, service)
    }

    /// Per-host copy of a service's data directory.
    #[must_use]
    pub fn data_dir(&self, service: &str) -> PathBuf {
        self.paths.host_data(self.host, service)
    }

    /// Per-host copy of a service's log directory.
    #[must_use]
    pub fn log_dir(&self, service: &str) -> PathBuf {
        self.paths.host_logs(self.host, service)
    }

    /// Per-host copy of a service's run (pid file) directory.
    #[must_use]
    pub fn run_dir(&self, service: &str) -> PathBuf {
        self.paths.host_run(self.host).join(service)
    }

    /// Run a command in the host context; non-zero exit is an error.
    pub async fn run(&self, argv: &[&str]) -> PtmResult<CommandOutput> {
        let argv = ptm_network::argv(argv);
        self.ops.run(self.ctx, &argv).await?.check(&argv)
    }

    /// Run `/etc/init.d/<service> <verb>`.
    pub async fn init_script(&self, service: &str, verb: &str) -> PtmResult<()> {
        let script = format!("/etc/init.d/{service}");
        tracing::debug!(host = self.host, service, verb, "Running init script");
        self.run(&[&script, verb]).await?;
        Ok(())
    }

    /// Stop through the init script, tolerating a daemon that is not
    /// running. The stop wait confirms the outcome.
    pub async fn init_script_stop(&self, service: &str) -> PtmResult<()> {
        match self.init_script(service, "stop").await {
            Err(PtmError::CommandFailed { stderr, code, .. }) => {
                tracing::warn!(host = self.host, service, code, stderr, "Stop script failed");
                Ok(())
            }
            other => other,
        }
    }
}

/// Lifecycle hooks of a service.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Packages that must be installed for this service.
    fn packages(&self) -> Vec<String> {
        Vec::new()
    }

    /// `(per-host source, system target)` directories to bind-mount.
    fn bind_mounts(&self, _cx: &ServiceCtx<'_>) -> Vec<(PathBuf, PathBuf)> {
        Vec::new()
    }

    /// Write the host's config files.
    async fn prepare_config(&self, _cx: &ServiceCtx<'_>) -> PtmResult<()> {
        Ok(())
    }

    /// Bind-mount the host's directories over the system paths.
    async fn prepare_environment(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        for (source, target) in self.bind_mounts(cx) {
            cx.ops.create_dir(&source).await?;
            cx.ops.bind_mount(&source, &target).await?;
        }
        Ok(())
    }

    /// Start the daemon.
    async fn control_start(&self, _cx: &ServiceCtx<'_>) -> PtmResult<()> {
        Ok(())
    }

    /// Wait until the daemon answers.
    async fn wait_for_process_start(&self, _cx: &ServiceCtx<'_>) -> PtmResult<()> {
        Ok(())
    }

    /// Stop the daemon.
    async fn control_stop(&self, _cx: &ServiceCtx<'_>) -> PtmResult<()> {
        Ok(())
    }

    /// Wait until the daemon is gone.
    async fn wait_for_process_stop(&self, _cx: &ServiceCtx<'_>) -> PtmResult<()> {
        Ok(())
    }

    /// Undo the bind mounts.
    async fn cleanup_environment(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        for (_, target) in self.bind_mounts(cx).into_iter().rev() {
            cx.ops.unmount(&target).await?;
        }
        Ok(())
    }

    /// Whether the daemon currently answers its readiness probe.
    async fn status(&self, _cx: &ServiceCtx<'_>) -> bool {
        true
    }

    /// Run an extra verb. Every service knows `status`.
    async fn control(&self, cx: &ServiceCtx<'_>, verb: &str, _args: &[String]) -> PtmResult<()> {
        match verb {
            "status" => report_status(cx, self.status(cx).await),
            _ => Err(unknown_verb(verb)),
        }
    }
}

/// Log the outcome of a `status` verb.
#[allow(clippy::unnecessary_wraps)]
fn report_status(cx: &ServiceCtx<'_>, running: bool) -> PtmResult<()> {
    tracing::info!(host = cx.host, running, "Service status");
    Ok(())
}

fn unknown_verb(verb: &str) -> PtmError {
    PtmError::ArgumentMismatch {
        message: format!("unknown control command '{verb}'"),
    }
}

/// Poll `status` until it reports `running`.
async fn wait_until<S>(svc: &S, cx: &ServiceCtx<'_>, operation: &str, running: bool) -> PtmResult<()>
where
    S: ProcessControl + ?Sized,
{
    cx.readiness
        .poll(cx.host, operation, || async move {
            Ok(svc.status(cx).await == running)
        })
        .await
}

/// A host that runs no daemon.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoService;

impl ProcessControl for NoService {}

/// The daemon a host runs, with its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceConfig {
    /// The root host.
    Root,
    /// A bare namespace host.
    Generic,
    /// Zookeeper.
    Zookeeper(ZookeeperConfig),
    /// Cassandra.
    Cassandra(CassandraConfig),
    /// Network agent.
    Compute(ComputeConfig),
    /// Quagga BGP.
    Router(RouterConfig),
    /// API / cluster.
    Network(NetworkConfig),
}

impl ServiceConfig {
    /// Build the config for `host` from its kwargs, injecting the topology
    /// wide peer lists and detected versions where kwargs leave them out.
    pub fn build(
        host: &ResolvedHost,
        topology: &ResolvedTopology,
        settings: &PtmSettings,
    ) -> PtmResult<Self> {
        let mut kwargs = host.kwargs.clone();
        let mut default = |key: &str, value: Value| {
            kwargs.entry(key.to_string()).or_insert(value);
        };
        let zookeeper_ips = json!(topology.zookeeper_ips);
        let cassandra_ips = json!(topology.cassandra_ips);

        match host.kind {
            HostKind::RootHost => return Ok(Self::Root),
            HostKind::NetNSHost => return Ok(Self::Generic),
            HostKind::ZookeeperHost => {
                let id = topology
                    .hosts_of(HostKind::ZookeeperHost)
                    .position(|h| h.name == host.name)
                    .map_or(1, |i| i + 1);
                default("id", json!(id));
                default("zookeeper_ips", zookeeper_ips);
            }
            HostKind::CassandraHost => {
                if !host.options.trim().is_empty() {
                    default("init_token", json!(host.options.trim()));
                }
                default("cassandra_ips", cassandra_ips);
            }
            HostKind::ComputeHost => {
                default("zookeeper_ips", zookeeper_ips);
                default("cassandra_ips", cassandra_ips);
            }
            HostKind::RouterHost => {
                if let Some(ip) = host.first_address() {
                    default("router_id", json!(ip));
                }
            }
            HostKind::NetworkHost => {
                let service = match settings.major_version("midonet") {
                    Some(major) if major < 5 => "midonet-api",
                    _ => "midonet-cluster",
                };
                default("service", json!(service));
                default("api_url", json!(settings.api_url));
                default("zookeeper_ips", zookeeper_ips);
                default("cassandra_ips", cassandra_ips);
            }
        }

        let kind = host.kind;
        Ok(match kind {
            HostKind::ZookeeperHost => Self::Zookeeper(from_kwargs(&host.name, kwargs)?),
            HostKind::CassandraHost => Self::Cassandra(from_kwargs(&host.name, kwargs)?),
            HostKind::ComputeHost => Self::Compute(from_kwargs(&host.name, kwargs)?),
            HostKind::RouterHost => Self::Router(from_kwargs(&host.name, kwargs)?),
            HostKind::NetworkHost => Self::Network(from_kwargs(&host.name, kwargs)?),
            HostKind::RootHost => Self::Root,
            HostKind::NetNSHost => Self::Generic,
        })
    }

    /// The lifecycle hooks for this config.
    #[must_use]
    pub fn process(&self) -> &dyn ProcessControl {
        match self {
            Self::Root | Self::Generic => &NoService,
            Self::Zookeeper(c) => c,
            Self::Cassandra(c) => c,
            Self::Compute(c) => c,
            Self::Router(c) => c,
            Self::Network(c) => c,
        }
    }

    /// Short name used in tables and logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Generic => "generic",
            Self::Zookeeper(_) => "zookeeper",
            Self::Cassandra(_) => "cassandra",
            Self::Compute(_) => "compute",
            Self::Router(_) => "router",
            Self::Network(_) => "network",
        }
    }
}

fn from_kwargs<T: DeserializeOwned>(host: &str, kwargs: Map<String, Value>) -> PtmResult<T> {
    serde_json::from_value(Value::Object(kwargs))
        .map_err(|e| PtmError::config(format!("implementation[{host}].kwargs"), e.to_string()))
}

/// Join addresses as `ip:port` with commas.
fn join_with_port(ips: &[IpAddr], port: u16) -> String {
    ips.iter()
        .map(|ip| SocketAddr::new(*ip, port).to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Join addresses with commas.
fn join_ips(ips: &[IpAddr]) -> String {
    ips.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
