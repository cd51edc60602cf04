//! Host interfaces.
//!
//! An [`Interface`] is either a device that already exists in its context
//! ([`InterfaceKind::Physical`]) or the near end of a veth pair
//! ([`InterfaceKind::Veth`]) that this host creates and whose peer is
//! delivered into another host's context.

use std::collections::BTreeMap;
use std::net::IpAddr;

use ptm_common::PtmResult;
use serde::{Deserialize, Serialize};

use crate::addr::{DEFAULT_MAC, IpDef};
use crate::exec::ExecContext;
use crate::ops::{LinkState, NetOps, ignore_not_found};
use crate::veth::{FarEnd, VethPeer, vlan_name};

/// Membership of an interface in a bridge on the same host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgePort {
    /// Bridge name.
    pub bridge: String,
    /// First address of the bridge, used as the far side's default route.
    pub gateway: Option<IpAddr>,
}

/// Kind of interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InterfaceKind {
    /// Existing device, never created or destroyed in the root context.
    Physical,
    /// Near end of a veth pair.
    Veth(VethPeer),
}

/// An interface on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    /// Device name.
    pub name: String,
    /// Owning host.
    pub host: String,
    /// Context of the owning host.
    pub ctx: ExecContext,
    /// MAC address, or `"default"` to keep the kernel's.
    pub mac: String,
    /// Addresses in the order they are applied.
    pub ip_list: Vec<IpDef>,
    /// Bridge this interface is attached to.
    pub bridge: Option<BridgePort>,
    /// VLAN sub-interfaces by id.
    pub vlans: BTreeMap<u16, Vec<IpDef>>,
    /// Last state applied.
    pub state: LinkState,
    /// Physical device or veth.
    pub kind: InterfaceKind,
}

impl Interface {
    /// A physical interface `name` on `host`.
    pub fn physical(name: impl Into<String>, host: impl Into<String>, ctx: ExecContext) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            ctx,
            mac: DEFAULT_MAC.to_string(),
            ip_list: Vec::new(),
            bridge: None,
            vlans: BTreeMap::new(),
            state: LinkState::Down,
            kind: InterfaceKind::Physical,
        }
    }

    /// Set the addresses.
    #[must_use]
    pub fn with_addresses(mut self, ip_list: Vec<IpDef>) -> Self {
        self.ip_list = ip_list;
        self
    }

    /// Set the MAC address.
    #[must_use]
    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = mac.into();
        self
    }

    /// Attach to a bridge.
    #[must_use]
    pub fn with_bridge(mut self, port: BridgePort) -> Self {
        self.bridge = Some(port);
        self
    }

    /// Set the VLAN map.
    #[must_use]
    pub fn with_vlans(mut self, vlans: BTreeMap<u16, Vec<IpDef>>) -> Self {
        self.vlans = vlans;
        self
    }

    /// Turn this interface into the near end of a veth pair whose peer is
    /// delivered to `far`, or left local when `far` is `None`.
    #[must_use]
    pub fn into_veth(mut self, far: Option<FarEnd>) -> Self {
        let peer = match far {
            Some(far) => VethPeer::to(&self.name, far),
            None => VethPeer::dangling(&self.name),
        };
        self.kind = InterfaceKind::Veth(peer);
        self
    }

    /// Veth peer, if this is a veth.
    #[must_use]
    pub fn peer(&self) -> Option<&VethPeer> {
        match &self.kind {
            InterfaceKind::Veth(peer) => Some(peer),
            InterfaceKind::Physical => None,
        }
    }

    /// Create the device.
    ///
    /// Physical interfaces already exist. A veth pair is created in this
    /// context and its peer moved and renamed into the far context, if one
    /// is declared. If delivering the peer fails the near device is deleted
    /// again before the error is returned.
    pub async fn create(&self, net: &dyn NetOps) -> PtmResult<()> {
        let InterfaceKind::Veth(peer) = &self.kind else {
            return Ok(());
        };

        if net.link_exists(&self.ctx, &self.name).await? {
            tracing::debug!(interface = %self.name, "Veth already exists");
            return match &peer.far {
                Some(far) => self.resume_delivery(net, &peer.peer_name, far).await,
                None => Ok(()),
            };
        }

        tracing::debug!(interface = %self.name, peer = %peer.peer_name, "Creating veth pair");
        net.add_veth(&self.ctx, &self.name, &peer.peer_name).await?;

        let Some(far) = &peer.far else {
            return Ok(());
        };
        if let Err(e) = self.deliver_peer(net, &peer.peer_name, far).await {
            tracing::warn!(interface = %self.name, error = %e, "Peer delivery failed, removing veth");
            if let Err(cleanup) = ignore_not_found(net.delete_link(&self.ctx, &self.name).await) {
                tracing::warn!(interface = %self.name, error = %cleanup, "Cleanup failed");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Finish delivering a peer left behind by an interrupted create.
    async fn resume_delivery(
        &self,
        net: &dyn NetOps,
        peer_name: &str,
        far: &FarEnd,
    ) -> PtmResult<()> {
        if net.link_exists(&far.ctx, &far.interface).await? {
            return Ok(());
        }
        tracing::debug!(interface = %self.name, peer = %peer_name, "Resuming peer delivery");
        if far.ctx != self.ctx && net.link_exists(&self.ctx, peer_name).await? {
            net.set_link_netns(&self.ctx, peer_name, &far.ctx).await?;
        }
        if far.interface != peer_name {
            net.rename_link(&far.ctx, peer_name, &far.interface).await?;
        }
        Ok(())
    }

    async fn deliver_peer(&self, net: &dyn NetOps, peer_name: &str, far: &FarEnd) -> PtmResult<()> {
        if far.ctx != self.ctx {
            net.set_link_netns(&self.ctx, peer_name, &far.ctx).await?;
        }
        if far.interface != peer_name {
            net.rename_link(&far.ctx, peer_name, &far.interface).await?;
        }
        Ok(())
    }

    /// Bring the interface up. A veth also brings its peer up.
    pub async fn up(&mut self, net: &dyn NetOps) -> PtmResult<()> {
        net.set_link_state(&self.ctx, &self.name, LinkState::Up)
            .await?;
        if let Some(peer) = self.peer() {
            let (ctx, name) = peer.delivered(&self.ctx);
            net.set_link_state(&ctx, &name, LinkState::Up).await?;
        }
        self.state = LinkState::Up;
        Ok(())
    }

    /// Bring the interface down, with its peer. Missing devices are
    /// already down.
    pub async fn down(&mut self, net: &dyn NetOps) -> PtmResult<()> {
        ignore_not_found(
            net.set_link_state(&self.ctx, &self.name, LinkState::Down)
                .await,
        )?;
        if let Some(peer) = self.peer() {
            let (ctx, name) = peer.delivered(&self.ctx);
            ignore_not_found(net.set_link_state(&ctx, &name, LinkState::Down).await)?;
        }
        self.state = LinkState::Down;
        Ok(())
    }

    /// Apply the MAC address (unless `"default"`) and every address in
    /// declared order.
    pub async fn config_addr(&self, net: &dyn NetOps) -> PtmResult<()> {
        if self.mac != DEFAULT_MAC {
            net.set_link_mac(&self.ctx, &self.name, &self.mac).await?;
        }
        for addr in &self.ip_list {
            net.add_address(&self.ctx, &self.name, addr).await?;
        }
        Ok(())
    }

    /// Route the far side through this interface's bridge.
    ///
    /// Only a veth with a delivered peer, attached to a bridge that has a
    /// gateway address, installs anything.
    pub async fn add_peer_route(&self, net: &dyn NetOps) -> PtmResult<()> {
        let Some(far) = self.peer().and_then(|peer| peer.far.as_ref()) else {
            return Ok(());
        };
        let Some(gateway) = self.bridge.as_ref().and_then(|port| port.gateway) else {
            return Ok(());
        };
        tracing::debug!(interface = %self.name, far = %far.ctx, %gateway, "Adding peer route");
        net.add_default_route(&far.ctx, gateway).await
    }

    /// Create, address and bring up every VLAN sub-interface.
    pub async fn start_vlans(&self, net: &dyn NetOps) -> PtmResult<()> {
        for (id, addrs) in &self.vlans {
            let name = vlan_name(&self.name, *id);
            if !net.link_exists(&self.ctx, &name).await? {
                net.add_vlan(&self.ctx, &self.name, &name, *id).await?;
            }
            for addr in addrs {
                net.add_address(&self.ctx, &name, addr).await?;
            }
            net.set_link_state(&self.ctx, &name, LinkState::Up).await?;
        }
        Ok(())
    }

    /// Delete every VLAN sub-interface, ignoring missing ones.
    pub async fn stop_vlans(&self, net: &dyn NetOps) -> PtmResult<()> {
        for id in self.vlans.keys() {
            let name = vlan_name(&self.name, *id);
            ignore_not_found(net.delete_link(&self.ctx, &name).await)?;
        }
        Ok(())
    }

    /// Delete the device, ignoring a missing one. Physical devices in the
    /// root context are left alone.
    pub async fn remove(&self, net: &dyn NetOps) -> PtmResult<()> {
        if matches!(self.kind, InterfaceKind::Physical) && self.ctx.is_root() {
            return Ok(());
        }
        tracing::debug!(interface = %self.name, ctx = %self.ctx, "Deleting interface");
        ignore_not_found(net.delete_link(&self.ctx, &self.name).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimNet;

    fn zoo1() -> ExecContext {
        ExecContext::Netns("zoo1".into())
    }

    fn far_eth0() -> FarEnd {
        FarEnd {
            host: "zoo1".into(),
            ctx: zoo1(),
            interface: "eth0".into(),
        }
    }

    #[tokio::test]
    async fn physical_create_is_noop() {
        let net = SimNet::new();
        let iface = Interface::physical("eth0", "root", ExecContext::Root);
        iface.create(&net).await.unwrap();
        assert!(net.log().is_empty());
    }

    #[tokio::test]
    async fn veth_delivered_to_far_host() {
        let net = SimNet::new();
        net.create_netns("zoo1").await.unwrap();
        let mut iface = Interface::physical("vzoo1eth0", "root", ExecContext::Root)
            .into_veth(Some(far_eth0()));

        iface.create(&net).await.unwrap();
        iface.create(&net).await.unwrap();
        assert!(net.link_exists(&zoo1(), "eth0").await.unwrap());
        assert!(!net.link_exists(&ExecContext::Root, "vzoo1eth0.p").await.unwrap());

        iface.up(&net).await.unwrap();
        assert_eq!(net.link(&zoo1(), "eth0").unwrap().state, LinkState::Up);

        iface.down(&net).await.unwrap();
        assert_eq!(net.link(&zoo1(), "eth0").unwrap().state, LinkState::Down);
    }

    #[tokio::test]
    async fn interrupted_delivery_is_finished_on_retry() {
        let net = SimNet::new();
        net.create_netns("zoo1").await.unwrap();
        let iface = Interface::physical("vzoo1eth0", "root", ExecContext::Root)
            .into_veth(Some(far_eth0()));

        // Pair created, peer never moved.
        net.add_veth(&ExecContext::Root, "vzoo1eth0", "vzoo1eth0.p")
            .await
            .unwrap();
        iface.create(&net).await.unwrap();
        assert!(net.link_exists(&zoo1(), "eth0").await.unwrap());
        assert!(!net.link_exists(&ExecContext::Root, "vzoo1eth0.p").await.unwrap());
    }

    #[tokio::test]
    async fn moved_but_unrenamed_peer_is_renamed_on_retry() {
        let net = SimNet::new();
        net.create_netns("zoo1").await.unwrap();
        let iface = Interface::physical("vzoo1eth0", "root", ExecContext::Root)
            .into_veth(Some(far_eth0()));

        net.add_veth(&ExecContext::Root, "vzoo1eth0", "vzoo1eth0.p")
            .await
            .unwrap();
        net.set_link_netns(&ExecContext::Root, "vzoo1eth0.p", &zoo1())
            .await
            .unwrap();
        iface.create(&net).await.unwrap();
        assert!(net.link_exists(&zoo1(), "eth0").await.unwrap());
        assert!(!net.link_exists(&zoo1(), "vzoo1eth0.p").await.unwrap());
    }

    #[tokio::test]
    async fn dangling_veth_keeps_peer_local() {
        let net = SimNet::new();
        let mut iface =
            Interface::physical("veth0", "root", ExecContext::Root).into_veth(None);

        iface.create(&net).await.unwrap();
        assert!(net.link_exists(&ExecContext::Root, "veth0").await.unwrap());
        assert!(net.link_exists(&ExecContext::Root, "veth0.p").await.unwrap());

        iface.up(&net).await.unwrap();
        iface.add_peer_route(&net).await.unwrap();
        assert_eq!(
            net.link(&ExecContext::Root, "veth0.p").unwrap().state,
            LinkState::Up
        );
    }

    #[tokio::test]
    async fn failed_delivery_removes_near_device() {
        let net = SimNet::new();
        net.create_netns("zoo1").await.unwrap();
        net.fail_on("rename_link", "vzoo1eth0.p");
        let iface = Interface::physical("vzoo1eth0", "root", ExecContext::Root)
            .into_veth(Some(far_eth0()));

        assert!(iface.create(&net).await.is_err());
        assert!(!net.link_exists(&ExecContext::Root, "vzoo1eth0").await.unwrap());
        assert_eq!(net.links(&zoo1()), vec!["lo".to_string()]);
    }

    #[tokio::test]
    async fn addresses_mac_and_vlans() {
        let net = SimNet::new();
        net.add_veth(&ExecContext::Root, "eth1", "eth1.p")
            .await
            .unwrap();
        let iface = Interface::physical("eth1", "root", ExecContext::Root)
            .with_mac("02:00:00:00:00:01")
            .with_addresses(vec!["10.0.1.1/24".parse().unwrap()])
            .with_vlans(BTreeMap::from([(
                100,
                vec!["172.16.0.1/24".parse().unwrap()],
            )]));

        iface.config_addr(&net).await.unwrap();
        iface.start_vlans(&net).await.unwrap();

        let link = net.link(&ExecContext::Root, "eth1").unwrap();
        assert_eq!(link.mac.as_deref(), Some("02:00:00:00:00:01"));
        assert_eq!(link.addresses.len(), 1);
        let vlan = net.link(&ExecContext::Root, "eth1.100").unwrap();
        assert_eq!(vlan.state, LinkState::Up);

        iface.stop_vlans(&net).await.unwrap();
        iface.stop_vlans(&net).await.unwrap();
        assert!(net.link(&ExecContext::Root, "eth1.100").is_none());
    }

    #[tokio::test]
    async fn peer_route_via_bridge_gateway() {
        let net = SimNet::new();
        net.create_netns("zoo1").await.unwrap();
        let mut near = Interface::physical("vzoo1eth0", "root", ExecContext::Root)
            .with_bridge(BridgePort {
                bridge: "br0".into(),
                gateway: Some("10.0.0.240".parse().unwrap()),
            })
            .into_veth(Some(far_eth0()));
        near.create(&net).await.unwrap();
        near.up(&net).await.unwrap();

        let far = Interface::physical("eth0", "zoo1", zoo1())
            .with_addresses(vec!["10.0.0.2/16".parse().unwrap()]);
        far.config_addr(&net).await.unwrap();

        near.add_peer_route(&net).await.unwrap();
        assert_eq!(
            net.default_route(&zoo1()),
            Some("10.0.0.240".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_spares_root_physical() {
        let net = SimNet::new();
        net.add_veth(&ExecContext::Root, "eth0", "eth0.p")
            .await
            .unwrap();
        let physical = Interface::physical("eth0", "root", ExecContext::Root);
        physical.remove(&net).await.unwrap();
        assert!(net.link_exists(&ExecContext::Root, "eth0").await.unwrap());

        let veth = Interface::physical("eth0", "root", ExecContext::Root).into_veth(None);
        veth.remove(&net).await.unwrap();
        veth.remove(&net).await.unwrap();
        assert!(!net.link_exists(&ExecContext::Root, "eth0").await.unwrap());
    }
}
