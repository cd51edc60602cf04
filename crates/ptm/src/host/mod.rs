//! Hosts and their lifecycle.
//!
//! A [`Host`] owns the bridges and interfaces of one execution context and
//! walks a fixed state machine. Forward steps check that the host is
//! exactly in the preceding state; reverse steps always run and treat
//! missing devices as already removed, so teardown works in a fresh
//! process after a crash.

mod snapshot;

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use ptm_common::{PtmError, PtmPaths, PtmResult, RetryPolicy};
use ptm_network::{
    Bridge, BridgePort, ExecContext, FarEnd, Interface, NetOps, ensure_netns, loopback_up,
    remove_netns,
};
use serde::{Deserialize, Serialize};

use crate::services::{ServiceConfig, ServiceCtx, ServiceOps};
use crate::topology::{HostKind, ResolvedHost};

pub use snapshot::{HostSnapshot, SNAPSHOT_SCHEMA_VERSION};

/// Lifecycle position of a host.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    /// Nothing exists yet.
    #[default]
    NotCreated,
    /// Namespace exists.
    Created,
    /// Devices exist.
    Booted,
    /// Devices are up and addressed.
    NetUp,
    /// Peer routes installed.
    NetFinalized,
    /// Service config written.
    Configured,
    /// Service answered its readiness probe.
    ProcessStarted,
    /// Service stopped.
    ProcessStopped,
    /// Devices are down.
    NetDown,
    /// Devices removed.
    ShutDown,
    /// Namespace removed.
    Removed,
}

impl HostState {
    /// Snake-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotCreated => "not_created",
            Self::Created => "created",
            Self::Booted => "booted",
            Self::NetUp => "net_up",
            Self::NetFinalized => "net_finalized",
            Self::Configured => "configured",
            Self::ProcessStarted => "process_started",
            Self::ProcessStopped => "process_stopped",
            Self::NetDown => "net_down",
            Self::ShutDown => "shut_down",
            Self::Removed => "removed",
        }
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A simulated machine: one execution context with its devices and
/// service.
#[derive(Debug)]
pub struct Host {
    /// Host name.
    pub name: String,
    /// Implementation kind.
    pub kind: HostKind,
    /// Where the host's devices and processes live.
    pub ctx: ExecContext,
    /// Address the host's service binds to.
    pub ip: Option<IpAddr>,
    /// Bridges by name.
    pub bridges: BTreeMap<String, Bridge>,
    /// Interfaces by name.
    pub interfaces: BTreeMap<String, Interface>,
    /// Lifecycle position.
    pub state: HostState,
    /// The daemon this host runs.
    pub service: ServiceConfig,
    span: tracing::Span,
}

impl Host {
    /// Build a host from its resolved definition.
    ///
    /// Every interface starts out physical; the manager turns wired ones
    /// into veths afterwards.
    #[must_use]
    pub fn new(resolved: &ResolvedHost, service: ServiceConfig) -> Self {
        let ctx = if resolved.kind == HostKind::RootHost {
            ExecContext::Root
        } else {
            ExecContext::Netns(resolved.name.clone())
        };

        let bridges: BTreeMap<String, Bridge> = resolved
            .bridges
            .iter()
            .map(|def| {
                let bridge = Bridge::new(def.name.clone(), ctx.clone())
                    .with_options(def.options.clone())
                    .with_addresses(def.ip_list.clone());
                (def.name.clone(), bridge)
            })
            .collect();

        let interfaces = resolved
            .interfaces
            .iter()
            .map(|def| {
                let mut iface = Interface::physical(def.name.clone(), resolved.name.clone(), ctx.clone())
                    .with_addresses(def.ip_list.clone())
                    .with_mac(def.mac_address.clone())
                    .with_vlans(def.vlans.clone());
                if let Some(link) = &def.bridge_link {
                    let gateway = bridges.get(&link.name).and_then(Bridge::gateway);
                    iface = iface.with_bridge(BridgePort {
                        bridge: link.name.clone(),
                        gateway,
                    });
                }
                (def.name.clone(), iface)
            })
            .collect();

        Self {
            span: tracing::info_span!("host", name = %resolved.name),
            name: resolved.name.clone(),
            kind: resolved.kind,
            ctx,
            ip: resolved.first_address(),
            bridges,
            interfaces,
            state: HostState::NotCreated,
            service,
        }
    }

    /// The host's tracing span.
    #[must_use]
    pub const fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Make `interface` the near end of a veth pair.
    pub fn wire(&mut self, interface: &str, far: Option<FarEnd>) -> PtmResult<()> {
        let iface = self
            .interfaces
            .remove(interface)
            .ok_or_else(|| PtmError::not_found("interface", format!("{}/{interface}", self.name)))?;
        self.interfaces
            .insert(interface.to_string(), iface.into_veth(far));
        Ok(())
    }

    /// Service hook context for this host.
    #[must_use]
    pub fn service_ctx<'a>(
        &'a self,
        paths: &'a PtmPaths,
        readiness: RetryPolicy,
        ops: &'a dyn ServiceOps,
    ) -> ServiceCtx<'a> {
        ServiceCtx {
            host: &self.name,
            ctx: &self.ctx,
            ip: self.ip,
            paths,
            readiness,
            ops,
        }
    }

    fn expect_state(&self, operation: &str, expected: HostState) -> PtmResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(PtmError::InvalidState {
                host: self.name.clone(),
                operation: operation.to_string(),
                state: self.state.to_string(),
            })
        }
    }

    /// Create the namespace. An existing one is reused.
    pub async fn create(&mut self, net: &dyn NetOps) -> PtmResult<()> {
        self.expect_state("create", HostState::NotCreated)?;
        if let Some(ns) = self.ctx.netns() {
            ensure_netns(net, ns).await?;
        }
        self.state = HostState::Created;
        Ok(())
    }

    /// Create, address and raise every bridge, create every interface and
    /// raise loopback.
    pub async fn boot(&mut self, net: &dyn NetOps) -> PtmResult<()> {
        self.expect_state("boot", HostState::Created)?;
        for bridge in self.bridges.values_mut() {
            bridge.create(net).await?;
            bridge.config_addr(net).await?;
            bridge.up(net).await?;
        }
        for iface in self.interfaces.values() {
            iface.create(net).await?;
        }
        loopback_up(net, &self.ctx).await?;
        self.state = HostState::Booted;
        tracing::debug!(host = %self.name, "Booted");
        Ok(())
    }

    /// Raise and address every interface, attach it to its bridge and
    /// start its VLANs.
    pub async fn net_up(&mut self, net: &dyn NetOps) -> PtmResult<()> {
        self.expect_state("net_up", HostState::Booted)?;
        for iface in self.interfaces.values_mut() {
            iface.up(net).await?;
            iface.config_addr(net).await?;
            if let Some(port) = &iface.bridge {
                let bridge = self.bridges.get_mut(&port.bridge).ok_or_else(|| {
                    PtmError::not_found("bridge", format!("{}/{}", self.name, port.bridge))
                })?;
                bridge.link_interface(net, &iface.name).await?;
            }
            iface.start_vlans(net).await?;
        }
        self.state = HostState::NetUp;
        Ok(())
    }

    /// Install the default routes of the far ends of this host's veths.
    pub async fn net_finalize(&mut self, net: &dyn NetOps) -> PtmResult<()> {
        self.expect_state("net_finalize", HostState::NetUp)?;
        for iface in self.interfaces.values() {
            iface.add_peer_route(net).await?;
        }
        self.state = HostState::NetFinalized;
        Ok(())
    }

    /// Write the service's config files.
    pub async fn prepare_config(
        &mut self,
        paths: &PtmPaths,
        readiness: RetryPolicy,
        ops: &dyn ServiceOps,
    ) -> PtmResult<()> {
        self.expect_state("prepare_config", HostState::NetFinalized)?;
        {
            let cx = self.service_ctx(paths, readiness, ops);
            self.service.process().prepare_config(&cx).await?;
        }
        self.state = HostState::Configured;
        Ok(())
    }

    /// Record that the service started and answered.
    pub fn mark_started(&mut self) -> PtmResult<()> {
        self.expect_state("start", HostState::Configured)?;
        self.state = HostState::ProcessStarted;
        Ok(())
    }

    /// Record that the service stopped.
    pub fn mark_stopped(&mut self) {
        self.state = HostState::ProcessStopped;
    }

    /// Stop VLANs, lower every interface, then every bridge.
    pub async fn net_down(&mut self, net: &dyn NetOps) -> PtmResult<()> {
        for iface in self.interfaces.values_mut() {
            iface.stop_vlans(net).await?;
            iface.down(net).await?;
        }
        for bridge in self.bridges.values_mut() {
            bridge.down(net).await?;
        }
        self.state = HostState::NetDown;
        Ok(())
    }

    /// Detach and delete interfaces, then delete bridges.
    pub async fn shutdown(&mut self, net: &dyn NetOps) -> PtmResult<()> {
        for iface in self.interfaces.values() {
            if let Some(bridge) = iface
                .bridge
                .as_ref()
                .and_then(|port| self.bridges.get_mut(&port.bridge))
            {
                bridge.del_link_interface(net, &iface.name).await?;
            }
            iface.remove(net).await?;
        }
        for bridge in self.bridges.values_mut() {
            bridge.unlink_all(net).await?;
            bridge.remove(net).await?;
        }
        self.state = HostState::ShutDown;
        Ok(())
    }

    /// Delete the namespace.
    pub async fn remove(&mut self, net: &dyn NetOps) -> PtmResult<()> {
        if let Some(ns) = self.ctx.netns() {
            remove_netns(net, ns).await?;
        }
        self.state = HostState::Removed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ptm_common::PtmSettings;
    use ptm_network::sim::SimNet;
    use ptm_network::{LinkState, peer_name_for};

    use super::*;
    use crate::topology::PhysicalTopologyConfig;

    const DOC: &str = r#"{
        "bridges": [{"name": "br0", "ip_list": [{"ip": "10.0.0.240", "subnet": "16"}]}],
        "zookeepers": [{"name": "zoo1", "bridge_link": {"name": "br0"},
                        "ip_list": [{"ip": "10.0.0.2"}]}],
        "hosts": [{"name": "edge", "interfaces": [
            {"name": "eth0", "ip_list": [{"ip": "192.168.1.1"}],
             "vlans": {"100": [{"ip": "172.16.0.1"}]}}
        ]}]
    }"#;

    fn hosts() -> (Host, Host, Host) {
        let topo = PhysicalTopologyConfig::from_json(DOC)
            .unwrap()
            .resolve()
            .unwrap();
        let settings = PtmSettings::default();
        let build = |name: &str| {
            let resolved = topo.host(name).unwrap();
            Host::new(resolved, ServiceConfig::build(resolved, &topo, &settings).unwrap())
        };
        (build("root"), build("zoo1"), build("edge"))
    }

    #[test]
    fn contexts_and_ports() {
        let (root, zoo1, _) = hosts();
        assert_eq!(root.ctx, ExecContext::Root);
        assert_eq!(zoo1.ctx, ExecContext::Netns("zoo1".into()));
        assert_eq!(zoo1.ip, Some("10.0.0.2".parse().unwrap()));

        let uplink = &root.interfaces["vzoo1eth0"];
        let port = uplink.bridge.as_ref().unwrap();
        assert_eq!(port.bridge, "br0");
        assert_eq!(port.gateway, Some("10.0.0.240".parse().unwrap()));
    }

    #[tokio::test]
    async fn forward_steps_require_previous_state() {
        let net = SimNet::new();
        let (_, mut zoo1, _) = hosts();

        let err = zoo1.boot(&net).await.unwrap_err();
        match err {
            PtmError::InvalidState { host, operation, state } => {
                assert_eq!(host, "zoo1");
                assert_eq!(operation, "boot");
                assert_eq!(state, "not_created");
            }
            other => panic!("unexpected error: {other}"),
        }

        zoo1.create(&net).await.unwrap();
        assert_eq!(zoo1.state, HostState::Created);
        assert!(zoo1.create(&net).await.is_err());
        assert!(zoo1.mark_started().is_err());
    }

    #[tokio::test]
    async fn full_cycle_on_sim() {
        let net = SimNet::new();
        let (mut root, mut zoo1, _) = hosts();
        root.wire(
            "vzoo1eth0",
            Some(FarEnd {
                host: "zoo1".into(),
                ctx: zoo1.ctx.clone(),
                interface: "eth0".into(),
            }),
        )
        .unwrap();

        for host in [&mut root, &mut zoo1] {
            host.create(&net).await.unwrap();
        }
        for host in [&mut root, &mut zoo1] {
            host.boot(&net).await.unwrap();
        }
        for host in [&mut root, &mut zoo1] {
            host.net_up(&net).await.unwrap();
        }
        for host in [&mut root, &mut zoo1] {
            host.net_finalize(&net).await.unwrap();
        }

        let br0 = net.link(&ExecContext::Root, "br0").unwrap();
        assert_eq!(br0.state, LinkState::Up);
        let uplink = net.link(&ExecContext::Root, "vzoo1eth0").unwrap();
        assert_eq!(uplink.master.as_deref(), Some("br0"));
        assert!(net.reachable(&ExecContext::Root, "10.0.0.2".parse().unwrap()));
        assert_eq!(
            net.default_route(&zoo1.ctx),
            Some("10.0.0.240".parse().unwrap())
        );
        assert!(net.link(&zoo1.ctx, &peer_name_for("vzoo1eth0")).is_none());

        for host in [&mut zoo1, &mut root] {
            host.mark_stopped();
            host.net_down(&net).await.unwrap();
        }
        for host in [&mut zoo1, &mut root] {
            host.shutdown(&net).await.unwrap();
        }
        for host in [&mut zoo1, &mut root] {
            host.remove(&net).await.unwrap();
        }
        assert!(net.is_pristine());
        assert_eq!(root.state, HostState::Removed);

        // Teardown again from a fresh view of the same topology.
        let (mut root, mut zoo1, _) = hosts();
        for host in [&mut zoo1, &mut root] {
            host.net_down(&net).await.unwrap();
            host.shutdown(&net).await.unwrap();
            host.remove(&net).await.unwrap();
        }
        assert!(net.is_pristine());
    }

    #[tokio::test]
    async fn dangling_veth_with_vlans() {
        let net = SimNet::new();
        let (_, _, mut edge) = hosts();
        edge.wire("eth0", None).unwrap();

        edge.create(&net).await.unwrap();
        edge.boot(&net).await.unwrap();
        edge.net_up(&net).await.unwrap();

        let vlan = net.link(&edge.ctx, "eth0.100").unwrap();
        assert_eq!(vlan.state, LinkState::Up);
        assert!(net.link(&edge.ctx, &peer_name_for("eth0")).is_some());

        edge.net_down(&net).await.unwrap();
        edge.shutdown(&net).await.unwrap();
        edge.remove(&net).await.unwrap();
        assert!(net.is_pristine());
    }

    #[test]
    fn wiring_an_unknown_interface_fails() {
        let (mut root, _, _) = hosts();
        let err = root.wire("nope", None).unwrap_err();
        assert!(matches!(err, PtmError::ObjectNotFound { kind: "interface", .. }));
    }
}
