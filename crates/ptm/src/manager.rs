//! The topology manager.
//!
//! Owns the host graph built from a topology document and drives it
//! through startup and shutdown. Network phases are barriers: every host
//! finishes one before any host begins the next. Service start fans out
//! inside each start-order group; stop runs strictly in reverse.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use ptm_common::{PtmError, PtmResult, PtmSettings};
use ptm_network::{ExecContext, FarEnd, IpRoute2, NetOps};
use tracing::Instrument;

use crate::host::{Host, HostState};
use crate::isolation::{ControlLauncher, ControlRequest, UnshareLauncher};
use crate::packages::{DpkgQuery, PackageQuery};
use crate::services::{HostSystem, ServiceConfig, ServiceOps};
use crate::state::{RunState, StateStore};
use crate::topology::{HostKind, PhysicalTopologyConfig, ResolvedTopology};
use crate::tunnel::TunnelZone;

/// A step of startup or shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Package check.
    Preflight,
    /// Namespaces.
    Create,
    /// Devices.
    Boot,
    /// Links up and addressed.
    NetUp,
    /// Peer routes.
    NetFinalize,
    /// Service config files.
    PrepareConfig,
    /// Service start and readiness.
    Start,
    /// Service stop.
    Stop,
    /// Links down.
    NetDown,
    /// Devices removed.
    Shutdown,
    /// Namespaces removed.
    Remove,
}

impl Phase {
    /// Snake-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Preflight => "preflight",
            Self::Create => "create",
            Self::Boot => "boot",
            Self::NetUp => "net_up",
            Self::NetFinalize => "net_finalize",
            Self::PrepareConfig => "prepare_config",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::NetDown => "net_down",
            Self::Shutdown => "shutdown",
            Self::Remove => "remove",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const NETWORK_PHASES: [Phase; 5] = [
    Phase::Create,
    Phase::Boot,
    Phase::NetUp,
    Phase::NetFinalize,
    Phase::PrepareConfig,
];

const TEARDOWN_PHASES: [Phase; 3] = [Phase::NetDown, Phase::Shutdown, Phase::Remove];

/// Builds, starts and tears down a physical topology.
pub struct TopologyManager {
    settings: Arc<PtmSettings>,
    net: Arc<dyn NetOps>,
    ops: Arc<dyn ServiceOps>,
    launcher: Arc<dyn ControlLauncher>,
    packages: Option<Arc<dyn PackageQuery>>,
    tunnel_zone: Option<Arc<dyn TunnelZone>>,
    state: StateStore,
    topology: Option<ResolvedTopology>,
    topology_file: Option<PathBuf>,
    hosts: BTreeMap<String, Host>,
    visits: Mutex<Vec<(Phase, String)>>,
}

impl fmt::Debug for TopologyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopologyManager")
            .field("hosts", &self.hosts.keys().collect::<Vec<_>>())
            .field("topology_file", &self.topology_file)
            .finish_non_exhaustive()
    }
}

impl TopologyManager {
    /// Manager with explicit collaborators.
    pub fn new(
        settings: Arc<PtmSettings>,
        net: Arc<dyn NetOps>,
        ops: Arc<dyn ServiceOps>,
        launcher: Arc<dyn ControlLauncher>,
    ) -> Self {
        let state = StateStore::new(settings.paths.state_file());
        Self {
            settings,
            net,
            ops,
            launcher,
            packages: None,
            tunnel_zone: None,
            state,
            topology: None,
            topology_file: None,
            hosts: BTreeMap::new(),
            visits: Mutex::new(Vec::new()),
        }
    }

    /// Manager acting on this machine: `ip` commands, real files and
    /// mounts, namespaced control children and the dpkg database.
    pub fn live(settings: Arc<PtmSettings>) -> Self {
        let launcher = UnshareLauncher::new(&settings.control_binary);
        Self::new(
            settings,
            Arc::new(IpRoute2::system()),
            Arc::new(HostSystem::new()),
            Arc::new(launcher),
        )
        .with_package_query(Arc::new(DpkgQuery::system()))
    }

    /// Check installed packages before startup.
    #[must_use]
    pub fn with_package_query(mut self, query: Arc<dyn PackageQuery>) -> Self {
        self.packages = Some(query);
        self
    }

    /// Report compute hosts to a tunnel zone after startup.
    #[must_use]
    pub fn with_tunnel_zone(mut self, zone: Arc<dyn TunnelZone>) -> Self {
        self.tunnel_zone = Some(zone);
        self
    }

    /// Settings in use.
    #[must_use]
    pub fn settings(&self) -> &PtmSettings {
        &self.settings
    }

    /// The resolved topology, once configured.
    #[must_use]
    pub const fn topology(&self) -> Option<&ResolvedTopology> {
        self.topology.as_ref()
    }

    /// Host by name.
    pub fn host(&self, name: &str) -> PtmResult<&Host> {
        self.hosts
            .get(name)
            .ok_or_else(|| PtmError::not_found("host", name))
    }

    /// Hosts in start order.
    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.flat_order()
            .into_iter()
            .filter_map(move |name| self.hosts.get(&name))
    }

    /// Start-order groups.
    #[must_use]
    pub fn start_order(&self) -> &[Vec<String>] {
        self.topology
            .as_ref()
            .map_or(&[], |topo| topo.start_order.as_slice())
    }

    /// Every `(phase, host)` step taken so far, in order.
    #[must_use]
    pub fn visits(&self) -> Vec<(Phase, String)> {
        self.visits.lock().clone()
    }

    fn flat_order(&self) -> Vec<String> {
        self.start_order().iter().flatten().cloned().collect()
    }

    fn record(&self, phase: Phase, host: &str) {
        self.visits.lock().push((phase, host.to_string()));
    }

    /// Load and configure from a topology file.
    pub fn configure_file(&mut self, path: &Path) -> PtmResult<()> {
        let topology = PhysicalTopologyConfig::from_file(path)?;
        self.configure(&topology)?;
        self.topology_file = Some(path.to_path_buf());
        Ok(())
    }

    /// Resolve `topology`, build every host and wire the veths.
    ///
    /// Nothing is touched on failure, neither the OS nor the manager.
    pub fn configure(&mut self, topology: &PhysicalTopologyConfig) -> PtmResult<()> {
        let resolved = topology.resolve()?;

        let mut hosts = BTreeMap::new();
        for def in &resolved.hosts {
            let service = ServiceConfig::build(def, &resolved, &self.settings)?;
            hosts.insert(def.name.clone(), Host::new(def, service));
        }

        let mut wired: BTreeSet<(String, String)> = BTreeSet::new();
        for edge in &resolved.wiring {
            let far = hosts
                .get(&edge.far.host)
                .ok_or_else(|| PtmError::not_found("host", edge.far.host.clone()))?;
            let far = FarEnd {
                host: far.name.clone(),
                ctx: far.ctx.clone(),
                interface: edge.far.interface.clone(),
            };
            hosts
                .get_mut(&edge.near.host)
                .ok_or_else(|| PtmError::not_found("host", edge.near.host.clone()))?
                .wire(&edge.near.interface, Some(far))?;
            wired.insert((edge.near.host.clone(), edge.near.interface.clone()));
            wired.insert((edge.far.host.clone(), edge.far.interface.clone()));
        }

        // Unwired interfaces of namespace hosts have nothing to deliver
        // them, so they become veths with a local peer.
        for host in hosts.values_mut() {
            if host.ctx == ExecContext::Root {
                continue;
            }
            let loose: Vec<String> = host
                .interfaces
                .keys()
                .filter(|iface| !wired.contains(&(host.name.clone(), (*iface).clone())))
                .cloned()
                .collect();
            for iface in loose {
                host.wire(&iface, None)?;
            }
        }

        tracing::info!(
            hosts = hosts.len(),
            wiring = resolved.wiring.len(),
            "Topology configured"
        );
        self.hosts = hosts;
        self.topology = Some(resolved);
        Ok(())
    }

    fn require_configured(&self) -> PtmResult<()> {
        if self.topology.is_some() {
            Ok(())
        } else {
            Err(PtmError::ArgumentMismatch {
                message: "no topology configured".to_string(),
            })
        }
    }

    fn save_state(&self, phase: Phase) {
        let hosts = self
            .hosts
            .iter()
            .map(|(name, host)| (name.clone(), host.state))
            .collect();
        let state = RunState::new(self.topology_file.clone(), phase.as_str(), hosts);
        if let Err(e) = self.state.save(&state) {
            tracing::warn!(phase = %phase, error = %e, "Could not save run state");
        }
    }

    /// Bring the whole topology up.
    pub async fn startup(&mut self) -> PtmResult<()> {
        self.require_configured()?;
        tracing::info!("Starting topology");

        self.preflight().await?;

        for phase in NETWORK_PHASES {
            let result = self.forward(phase).await;
            self.save_state(phase);
            result?;
        }

        let result = self.start_all().await;
        self.save_state(Phase::Start);
        result?;

        if let Some(zone) = &self.tunnel_zone {
            let members: BTreeMap<String, IpAddr> = self
                .hosts
                .values()
                .filter(|host| host.kind == HostKind::ComputeHost)
                .filter_map(|host| host.ip.map(|ip| (host.name.clone(), ip)))
                .collect();
            if !members.is_empty() {
                zone.add_members(&members).await?;
            }
        }

        tracing::info!("Topology started");
        Ok(())
    }

    async fn preflight(&self) -> PtmResult<()> {
        let Some(query) = self.packages.as_ref().filter(|_| self.settings.check_packages) else {
            return Ok(());
        };
        for host in self.hosts() {
            self.record(Phase::Preflight, &host.name);
            for package in host.service.process().packages() {
                if !query.is_installed(&package).await? {
                    return Err(PtmError::config(
                        host.name.clone(),
                        format!("package '{package}' is not installed"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Run a forward phase over every host in start order, stopping at the
    /// first failure.
    async fn forward(&mut self, phase: Phase) -> PtmResult<()> {
        tracing::debug!(phase = %phase, "Phase");
        for name in self.flat_order() {
            self.record(phase, &name);
            self.step(phase, &name).await?;
        }
        Ok(())
    }

    /// Run one phase on one host.
    async fn step(&mut self, phase: Phase, name: &str) -> PtmResult<()> {
        let net = self.net.as_ref();
        let ops = self.ops.as_ref();
        let paths = &self.settings.paths;
        let readiness = self.settings.readiness;
        let host = self
            .hosts
            .get_mut(name)
            .ok_or_else(|| PtmError::not_found("host", name))?;
        let span = host.span().clone();
        let fut = async move {
            match phase {
                Phase::Create => host.create(net).await,
                Phase::Boot => host.boot(net).await,
                Phase::NetUp => host.net_up(net).await,
                Phase::NetFinalize => host.net_finalize(net).await,
                Phase::PrepareConfig => host.prepare_config(paths, readiness, ops).await,
                Phase::NetDown => host.net_down(net).await,
                Phase::Shutdown => host.shutdown(net).await,
                Phase::Remove => host.remove(net).await,
                Phase::Preflight | Phase::Start | Phase::Stop => Ok(()),
            }
        };
        fut.instrument(span).await
    }

    async fn start_all(&mut self) -> PtmResult<()> {
        let groups = self.start_order().to_vec();
        for group in groups {
            let results = join_all(group.iter().map(|name| self.start_host(name))).await;
            let mut first_error = None;
            for (name, result) in group.iter().zip(results) {
                match result {
                    Ok(()) => {
                        if let Some(host) = self.hosts.get_mut(name) {
                            host.mark_started()?;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(host = %name, error = %e, "Service failed to start");
                        first_error.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        Ok(())
    }

    async fn start_host(&self, name: &str) -> PtmResult<()> {
        let host = self.host(name)?;
        self.record(Phase::Start, name);
        let span = host.span().clone();
        async {
            self.unshare_control("start", name, &[]).await?;
            let cx = host.service_ctx(&self.settings.paths, self.settings.readiness, self.ops.as_ref());
            host.service.process().wait_for_process_start(&cx).await?;
            tracing::info!(host = %name, "Service started");
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn stop_host(&self, name: &str) -> PtmResult<()> {
        let host = self.host(name)?;
        self.record(Phase::Stop, name);
        let span = host.span().clone();
        async {
            self.unshare_control("stop", name, &[]).await?;
            let cx = host.service_ctx(&self.settings.paths, self.settings.readiness, self.ops.as_ref());
            host.service.process().wait_for_process_stop(&cx).await?;
            tracing::info!(host = %name, "Service stopped");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Tear everything down in reverse start order.
    ///
    /// Every host is visited in every phase even when some fail; the first
    /// error is returned at the end.
    pub async fn shutdown(&mut self) -> PtmResult<()> {
        self.require_configured()?;
        match self.state.load() {
            Ok(Some(previous)) => tracing::info!(
                phase = %previous.phase,
                updated_at = %previous.updated_at,
                "Previous run state found"
            ),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Could not read previous run state"),
        }
        tracing::info!("Stopping topology");

        let order: Vec<String> = self.flat_order().into_iter().rev().collect();
        let mut errors = Vec::new();

        for name in &order {
            if let Err(e) = self.stop_host(name).await {
                tracing::warn!(host = %name, error = %e, "Stop failed");
                errors.push(e);
            }
            if let Some(host) = self.hosts.get_mut(name) {
                host.mark_stopped();
            }
        }

        for phase in TEARDOWN_PHASES {
            for name in &order {
                self.record(phase, name);
                if let Err(e) = self.step(phase, name).await {
                    tracing::warn!(host = %name, phase = %phase, error = %e, "Teardown step failed");
                    errors.push(e);
                }
            }
        }

        if let Err(e) = self.state.delete() {
            errors.push(e);
        }

        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => {
                tracing::info!("Topology stopped");
                Ok(())
            }
        }
    }

    /// Run `command` for one host in the isolated control child.
    pub async fn unshare_control(&self, command: &str, host: &str, args: &[String]) -> PtmResult<()> {
        let snapshot = self
            .host(host)?
            .snapshot(&self.settings.paths, self.settings.readiness);
        let request = ControlRequest {
            host: host.to_string(),
            command: command.to_string(),
            snapshot: snapshot.to_json()?,
            log_dir: self.settings.paths.log_dir.clone(),
            args: args.to_vec(),
        };

        let code = self.launcher.launch(&request).await?;
        if code == 0 {
            Ok(())
        } else {
            Err(PtmError::HostControlFailed {
                host: host.to_string(),
                command: command.to_string(),
                code,
            })
        }
    }

    /// Send a service verb to one host.
    pub async fn control(&self, host: &str, verb: &str, args: &[String]) -> PtmResult<()> {
        self.host(host)?;
        self.unshare_control(verb, host, args).await
    }

    /// States of every host, by name.
    #[must_use]
    pub fn host_states(&self) -> BTreeMap<String, HostState> {
        self.hosts
            .iter()
            .map(|(name, host)| (name.clone(), host.state))
            .collect()
    }
}
