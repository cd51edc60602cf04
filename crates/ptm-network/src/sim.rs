//! In-memory network simulator.
//!
//! [`SimNet`] implements [`NetOps`] against a small model of the kernel:
//! namespaces, links (loopback, veth, bridge, VLAN), addresses, bridge
//! membership and default routes. It enforces the same rules the kernel
//! does where the topology manager depends on them (a device must be down
//! to be renamed, moving a device flushes its addresses, deleting one end
//! of a veth pair deletes the other, deleting a namespace destroys its
//! devices). Tests use it to check what a lifecycle leaves behind.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::IpAddr;

use async_trait::async_trait;
use parking_lot::Mutex;
use ptm_common::{PtmError, PtmResult};

use crate::addr::IpDef;
use crate::exec::ExecContext;
use crate::ops::{LinkState, NetOps};

type LinkKey = (ExecContext, String);

/// Kind of a simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimLinkKind {
    /// Loopback device.
    Loopback,
    /// One end of a veth pair.
    Veth {
        /// Context and name of the other end.
        peer: (ExecContext, String),
    },
    /// Bridge device.
    Bridge {
        /// Spanning tree enabled.
        stp: bool,
    },
    /// 802.1Q sub-interface.
    Vlan {
        /// Parent device.
        parent: String,
        /// VLAN id.
        id: u16,
    },
}

/// A simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimLink {
    /// Device kind.
    pub kind: SimLinkKind,
    /// Administrative state.
    pub state: LinkState,
    /// MAC address, if set explicitly.
    pub mac: Option<String>,
    /// Assigned addresses, in order.
    pub addresses: Vec<IpDef>,
    /// Bridge this device is enslaved to.
    pub master: Option<String>,
}

impl SimLink {
    fn new(kind: SimLinkKind) -> Self {
        Self {
            kind,
            state: LinkState::Down,
            mac: None,
            addresses: Vec::new(),
            master: None,
        }
    }

    fn is_up(&self) -> bool {
        self.state == LinkState::Up
    }
}

#[derive(Debug)]
struct SimState {
    namespaces: BTreeSet<String>,
    links: BTreeMap<LinkKey, SimLink>,
    routes: BTreeMap<ExecContext, IpAddr>,
    log: Vec<String>,
    faults: Vec<(String, String)>,
}

impl Default for SimState {
    fn default() -> Self {
        let mut links = BTreeMap::new();
        links.insert(
            (ExecContext::Root, "lo".to_string()),
            SimLink::new(SimLinkKind::Loopback),
        );
        Self {
            namespaces: BTreeSet::new(),
            links,
            routes: BTreeMap::new(),
            log: Vec::new(),
            faults: Vec::new(),
        }
    }
}

impl SimState {
    fn record(&mut self, op: &str, ctx: &ExecContext, args: &[&str]) -> PtmResult<()> {
        self.log.push(format!("{op} {ctx} {}", args.join(" ")));
        let name = args.first().copied().unwrap_or_default();
        if self
            .faults
            .iter()
            .any(|(fop, fname)| fop == op && (fname == name || fname == "*"))
        {
            return Err(PtmError::CommandFailed {
                command: format!("{op} {}", args.join(" ")),
                code: 2,
                stderr: "injected fault".to_string(),
            });
        }
        Ok(())
    }

    fn ensure_ctx(&self, ctx: &ExecContext) -> PtmResult<()> {
        match ctx.netns() {
            Some(ns) if !self.namespaces.contains(ns) => Err(PtmError::NamespaceNotFound {
                name: ns.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn key(ctx: &ExecContext, name: &str) -> LinkKey {
        (ctx.clone(), name.to_string())
    }

    fn link_mut(&mut self, ctx: &ExecContext, name: &str) -> PtmResult<&mut SimLink> {
        self.ensure_ctx(ctx)?;
        self.links
            .get_mut(&Self::key(ctx, name))
            .ok_or_else(|| PtmError::LinkNotFound {
                name: name.to_string(),
                context: ctx.to_string(),
            })
    }

    fn ensure_free(&self, ctx: &ExecContext, name: &str) -> PtmResult<()> {
        if self.links.contains_key(&Self::key(ctx, name)) {
            return Err(PtmError::CommandFailed {
                command: format!("link add {name}"),
                code: 2,
                stderr: "RTNETLINK answers: File exists".to_string(),
            });
        }
        Ok(())
    }

    /// Remove a device plus everything the kernel removes with it.
    fn remove_link(&mut self, key: &LinkKey) {
        let Some(link) = self.links.remove(key) else {
            return;
        };
        match link.kind {
            SimLinkKind::Veth { peer } => {
                self.links.remove(&peer);
                self.remove_children(&peer);
            }
            SimLinkKind::Bridge { .. } => {
                for (k, l) in &mut self.links {
                    if k.0 == key.0 && l.master.as_deref() == Some(key.1.as_str()) {
                        l.master = None;
                    }
                }
            }
            _ => {}
        }
        self.remove_children(key);
    }

    fn remove_children(&mut self, parent: &LinkKey) {
        let children: Vec<LinkKey> = self
            .links
            .iter()
            .filter(|(k, l)| {
                k.0 == parent.0
                    && matches!(&l.kind, SimLinkKind::Vlan { parent: p, .. } if *p == parent.1)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for child in children {
            self.links.remove(&child);
        }
    }

    fn repoint_peer(&mut self, old: &LinkKey, new: &LinkKey) {
        let peer = match self.links.get(new).map(|l| &l.kind) {
            Some(SimLinkKind::Veth { peer }) => peer.clone(),
            _ => return,
        };
        if let Some(p) = self.links.get_mut(&peer) {
            if let SimLinkKind::Veth { peer: back } = &mut p.kind {
                if back == old {
                    *back = new.clone();
                }
            }
        }
    }

    /// Devices in the same L2 segment as `start`, following only up links.
    fn l2_domain(&self, start: &LinkKey) -> BTreeSet<LinkKey> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([start.clone()]);

        while let Some(key) = queue.pop_front() {
            let Some(link) = self.links.get(&key) else {
                continue;
            };
            if !link.is_up() || !seen.insert(key.clone()) {
                continue;
            }
            if let Some(master) = &link.master {
                queue.push_back((key.0.clone(), master.clone()));
            }
            match &link.kind {
                SimLinkKind::Veth { peer } => queue.push_back(peer.clone()),
                SimLinkKind::Bridge { .. } => {
                    for (k, l) in &self.links {
                        if k.0 == key.0 && l.master.as_deref() == Some(key.1.as_str()) {
                            queue.push_back(k.clone());
                        }
                    }
                }
                _ => {}
            }
        }
        seen
    }

    fn owner_of(&self, ip: IpAddr) -> Option<&ExecContext> {
        self.links
            .iter()
            .find(|(_, l)| l.is_up() && l.addresses.iter().any(|a| a.ip == ip))
            .map(|(k, _)| &k.0)
    }

    fn on_link(&self, from: &ExecContext, target: IpAddr) -> bool {
        self.links
            .iter()
            .filter(|(k, l)| k.0 == *from && l.is_up())
            .filter(|(_, l)| l.addresses.iter().any(|a| a.contains(target)))
            .any(|(k, _)| {
                self.l2_domain(k).iter().any(|d| {
                    self.links
                        .get(d)
                        .is_some_and(|l| l.addresses.iter().any(|a| a.ip == target))
                })
            })
    }
}

/// In-memory [`NetOps`] implementation.
#[derive(Debug, Default)]
pub struct SimNet {
    state: Mutex<SimState>,
}

impl SimNet {
    /// A fresh simulated machine with only a root loopback device.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next operations named `op` on device (or namespace) `name`
    /// fail. `"*"` matches every name.
    pub fn fail_on(&self, op: &str, name: &str) {
        self.state
            .lock()
            .faults
            .push((op.to_string(), name.to_string()));
    }

    /// Remove all injected faults.
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Existing namespaces.
    #[must_use]
    pub fn namespaces(&self) -> Vec<String> {
        self.state.lock().namespaces.iter().cloned().collect()
    }

    /// Device names in `ctx`.
    #[must_use]
    pub fn links(&self, ctx: &ExecContext) -> Vec<String> {
        self.state
            .lock()
            .links
            .keys()
            .filter(|(c, _)| c == ctx)
            .map(|(_, n)| n.clone())
            .collect()
    }

    /// A snapshot of one device.
    #[must_use]
    pub fn link(&self, ctx: &ExecContext, name: &str) -> Option<SimLink> {
        self.state
            .lock()
            .links
            .get(&(ctx.clone(), name.to_string()))
            .cloned()
    }

    /// Default gateway in `ctx`.
    #[must_use]
    pub fn default_route(&self, ctx: &ExecContext) -> Option<IpAddr> {
        self.state.lock().routes.get(ctx).copied()
    }

    /// Every operation issued so far, one line each.
    #[must_use]
    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// True when nothing beyond the root loopback exists.
    #[must_use]
    pub fn is_pristine(&self) -> bool {
        let state = self.state.lock();
        state.namespaces.is_empty() && state.links.len() == 1 && state.routes.is_empty()
    }

    /// Whether a packet from `from` can reach `target`.
    ///
    /// A target is reachable when it sits on the same L2 segment as an up
    /// device in `from` whose subnet covers it, or when the default gateway
    /// of `from` is reachable that way and can in turn reach the target
    /// directly.
    #[must_use]
    pub fn reachable(&self, from: &ExecContext, target: IpAddr) -> bool {
        let state = self.state.lock();
        if state.on_link(from, target) {
            return true;
        }
        let Some(gateway) = state.routes.get(from).copied() else {
            return false;
        };
        if !state.on_link(from, gateway) {
            return false;
        }
        state
            .owner_of(gateway)
            .is_some_and(|owner| state.on_link(owner, target))
    }
}

#[async_trait]
impl NetOps for SimNet {
    async fn create_netns(&self, name: &str) -> PtmResult<()> {
        let mut st = self.state.lock();
        st.record("create_netns", &ExecContext::Root, &[name])?;
        if !st.namespaces.insert(name.to_string()) {
            return Err(PtmError::CommandFailed {
                command: format!("netns add {name}"),
                code: 1,
                stderr: "Cannot create namespace file: File exists".to_string(),
            });
        }
        st.links.insert(
            (ExecContext::Netns(name.to_string()), "lo".to_string()),
            SimLink::new(SimLinkKind::Loopback),
        );
        Ok(())
    }

    async fn delete_netns(&self, name: &str) -> PtmResult<()> {
        let mut st = self.state.lock();
        st.record("delete_netns", &ExecContext::Root, &[name])?;
        if !st.namespaces.remove(name) {
            return Err(PtmError::NamespaceNotFound {
                name: name.to_string(),
            });
        }
        let ctx = ExecContext::Netns(name.to_string());
        let keys: Vec<LinkKey> = st.links.keys().filter(|k| k.0 == ctx).cloned().collect();
        for key in keys {
            st.remove_link(&key);
        }
        st.routes.remove(&ctx);
        Ok(())
    }

    async fn netns_exists(&self, name: &str) -> PtmResult<bool> {
        Ok(self.state.lock().namespaces.contains(name))
    }

    async fn link_exists(&self, ctx: &ExecContext, name: &str) -> PtmResult<bool> {
        let st = self.state.lock();
        Ok(st.links.contains_key(&SimState::key(ctx, name)))
    }

    async fn add_veth(&self, ctx: &ExecContext, name: &str, peer: &str) -> PtmResult<()> {
        let mut st = self.state.lock();
        st.record("add_veth", ctx, &[name, peer])?;
        st.ensure_ctx(ctx)?;
        st.ensure_free(ctx, name)?;
        st.ensure_free(ctx, peer)?;
        let near = SimState::key(ctx, name);
        let far = SimState::key(ctx, peer);
        st.links.insert(
            near.clone(),
            SimLink::new(SimLinkKind::Veth { peer: far.clone() }),
        );
        st.links
            .insert(far, SimLink::new(SimLinkKind::Veth { peer: near }));
        Ok(())
    }

    async fn add_bridge(&self, ctx: &ExecContext, name: &str) -> PtmResult<()> {
        let mut st = self.state.lock();
        st.record("add_bridge", ctx, &[name])?;
        st.ensure_ctx(ctx)?;
        st.ensure_free(ctx, name)?;
        st.links.insert(
            SimState::key(ctx, name),
            SimLink::new(SimLinkKind::Bridge { stp: false }),
        );
        Ok(())
    }

    async fn set_bridge_stp(&self, ctx: &ExecContext, name: &str, enabled: bool) -> PtmResult<()> {
        let mut st = self.state.lock();
        st.record("set_bridge_stp", ctx, &[name])?;
        let link = st.link_mut(ctx, name)?;
        match &mut link.kind {
            SimLinkKind::Bridge { stp } => {
                *stp = enabled;
                Ok(())
            }
            _ => Err(PtmError::CommandFailed {
                command: format!("link set dev {name} type bridge"),
                code: 2,
                stderr: "Operation not supported".to_string(),
            }),
        }
    }

    async fn add_vlan(
        &self,
        ctx: &ExecContext,
        parent: &str,
        name: &str,
        id: u16,
    ) -> PtmResult<()> {
        let mut st = self.state.lock();
        st.record("add_vlan", ctx, &[name, parent])?;
        st.link_mut(ctx, parent)?;
        st.ensure_free(ctx, name)?;
        st.links.insert(
            SimState::key(ctx, name),
            SimLink::new(SimLinkKind::Vlan {
                parent: parent.to_string(),
                id,
            }),
        );
        Ok(())
    }

    async fn set_link_netns(
        &self,
        ctx: &ExecContext,
        name: &str,
        target: &ExecContext,
    ) -> PtmResult<()> {
        let mut st = self.state.lock();
        let target_name = target.to_string();
        st.record("set_link_netns", ctx, &[name, target_name.as_str()])?;
        st.ensure_ctx(target)?;
        st.link_mut(ctx, name)?;
        st.ensure_free(target, name)?;

        let old = SimState::key(ctx, name);
        let new = SimState::key(target, name);
        let Some(mut link) = st.links.remove(&old) else {
            return Ok(());
        };
        link.state = LinkState::Down;
        link.addresses.clear();
        link.master = None;
        st.links.insert(new.clone(), link);
        st.repoint_peer(&old, &new);
        Ok(())
    }

    async fn rename_link(&self, ctx: &ExecContext, name: &str, new_name: &str) -> PtmResult<()> {
        let mut st = self.state.lock();
        st.record("rename_link", ctx, &[name, new_name])?;
        if st.link_mut(ctx, name)?.is_up() {
            return Err(PtmError::CommandFailed {
                command: format!("link set dev {name} name {new_name}"),
                code: 2,
                stderr: "RTNETLINK answers: Device or resource busy".to_string(),
            });
        }
        st.ensure_free(ctx, new_name)?;

        let old = SimState::key(ctx, name);
        let new = SimState::key(ctx, new_name);
        if let Some(link) = st.links.remove(&old) {
            st.links.insert(new.clone(), link);
        }
        st.repoint_peer(&old, &new);
        for (k, l) in &mut st.links {
            if k.0 == *ctx && l.master.as_deref() == Some(name) {
                l.master = Some(new_name.to_string());
            }
        }
        Ok(())
    }

    async fn set_link_state(
        &self,
        ctx: &ExecContext,
        name: &str,
        state: LinkState,
    ) -> PtmResult<()> {
        let mut st = self.state.lock();
        st.record("set_link_state", ctx, &[name, state.as_str()])?;
        st.link_mut(ctx, name)?.state = state;
        Ok(())
    }

    async fn set_link_mac(&self, ctx: &ExecContext, name: &str, mac: &str) -> PtmResult<()> {
        let mut st = self.state.lock();
        st.record("set_link_mac", ctx, &[name, mac])?;
        st.link_mut(ctx, name)?.mac = Some(mac.to_string());
        Ok(())
    }

    async fn add_address(&self, ctx: &ExecContext, name: &str, addr: &IpDef) -> PtmResult<()> {
        let mut st = self.state.lock();
        let shown = addr.to_string();
        st.record("add_address", ctx, &[name, shown.as_str()])?;
        let link = st.link_mut(ctx, name)?;
        if !link.addresses.contains(addr) {
            link.addresses.push(*addr);
        }
        Ok(())
    }

    async fn set_master(&self, ctx: &ExecContext, name: &str, bridge: &str) -> PtmResult<()> {
        let mut st = self.state.lock();
        st.record("set_master", ctx, &[name, bridge])?;
        let is_bridge = matches!(
            st.link_mut(ctx, bridge)?.kind,
            SimLinkKind::Bridge { .. }
        );
        if !is_bridge {
            return Err(PtmError::CommandFailed {
                command: format!("link set dev {name} master {bridge}"),
                code: 2,
                stderr: "Operation not supported".to_string(),
            });
        }
        st.link_mut(ctx, name)?.master = Some(bridge.to_string());
        Ok(())
    }

    async fn set_nomaster(&self, ctx: &ExecContext, name: &str) -> PtmResult<()> {
        let mut st = self.state.lock();
        st.record("set_nomaster", ctx, &[name])?;
        st.link_mut(ctx, name)?.master = None;
        Ok(())
    }

    async fn delete_link(&self, ctx: &ExecContext, name: &str) -> PtmResult<()> {
        let mut st = self.state.lock();
        st.record("delete_link", ctx, &[name])?;
        st.link_mut(ctx, name)?;
        st.remove_link(&SimState::key(ctx, name));
        Ok(())
    }

    async fn add_default_route(&self, ctx: &ExecContext, gateway: IpAddr) -> PtmResult<()> {
        let mut st = self.state.lock();
        let shown = gateway.to_string();
        st.record("add_default_route", ctx, &[shown.as_str()])?;
        st.ensure_ctx(ctx)?;
        let covered = st
            .links
            .iter()
            .filter(|(k, l)| k.0 == *ctx && l.is_up())
            .any(|(_, l)| l.addresses.iter().any(|a| a.contains(gateway)));
        if !covered {
            return Err(PtmError::CommandFailed {
                command: format!("route replace default via {gateway}"),
                code: 2,
                stderr: "RTNETLINK answers: Network is unreachable".to_string(),
            });
        }
        st.routes.insert(ctx.clone(), gateway);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(name: &str) -> ExecContext {
        ExecContext::Netns(name.to_string())
    }

    fn ip(s: &str) -> IpDef {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn netns_lifecycle() {
        let net = SimNet::new();
        net.create_netns("zoo1").await.unwrap();
        assert!(net.netns_exists("zoo1").await.unwrap());
        assert!(net.link_exists(&ns("zoo1"), "lo").await.unwrap());
        assert!(net.create_netns("zoo1").await.is_err());

        net.delete_netns("zoo1").await.unwrap();
        assert!(net.is_pristine());
        assert!(net.delete_netns("zoo1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn veth_move_rename_and_delete_peer() {
        let net = SimNet::new();
        net.create_netns("zoo1").await.unwrap();
        net.add_veth(&ExecContext::Root, "vzoo1eth0", "vzoo1eth0.p")
            .await
            .unwrap();
        net.set_link_netns(&ExecContext::Root, "vzoo1eth0.p", &ns("zoo1"))
            .await
            .unwrap();
        net.rename_link(&ns("zoo1"), "vzoo1eth0.p", "eth0")
            .await
            .unwrap();

        let near = net.link(&ExecContext::Root, "vzoo1eth0").unwrap();
        assert_eq!(
            near.kind,
            SimLinkKind::Veth {
                peer: (ns("zoo1"), "eth0".to_string())
            }
        );

        net.delete_link(&ExecContext::Root, "vzoo1eth0").await.unwrap();
        assert!(!net.link_exists(&ns("zoo1"), "eth0").await.unwrap());
    }

    #[tokio::test]
    async fn rename_requires_link_down() {
        let net = SimNet::new();
        net.add_veth(&ExecContext::Root, "a", "b").await.unwrap();
        net.set_link_state(&ExecContext::Root, "a", LinkState::Up)
            .await
            .unwrap();
        assert!(net.rename_link(&ExecContext::Root, "a", "c").await.is_err());
    }

    #[tokio::test]
    async fn deleting_namespace_destroys_veth_pair() {
        let net = SimNet::new();
        net.create_netns("cass1").await.unwrap();
        net.add_veth(&ExecContext::Root, "vcass1eth0", "p")
            .await
            .unwrap();
        net.set_link_netns(&ExecContext::Root, "p", &ns("cass1"))
            .await
            .unwrap();
        net.delete_netns("cass1").await.unwrap();
        assert!(!net.link_exists(&ExecContext::Root, "vcass1eth0").await.unwrap());
    }

    #[tokio::test]
    async fn reachability_over_bridge_and_veth() {
        let net = SimNet::new();
        let root = ExecContext::Root;
        net.create_netns("zoo1").await.unwrap();
        net.add_bridge(&root, "br0").await.unwrap();
        net.add_address(&root, "br0", &ip("10.0.0.240/16")).await.unwrap();
        net.set_link_state(&root, "br0", LinkState::Up).await.unwrap();
        net.add_veth(&root, "vzoo1eth0", "eth0").await.unwrap();
        net.set_link_netns(&root, "eth0", &ns("zoo1")).await.unwrap();
        net.set_master(&root, "vzoo1eth0", "br0").await.unwrap();
        net.set_link_state(&root, "vzoo1eth0", LinkState::Up)
            .await
            .unwrap();
        net.add_address(&ns("zoo1"), "eth0", &ip("10.0.0.2/24"))
            .await
            .unwrap();

        let target = "10.0.0.2".parse().unwrap();
        assert!(!net.reachable(&root, target), "far end still down");

        net.set_link_state(&ns("zoo1"), "eth0", LinkState::Up)
            .await
            .unwrap();
        assert!(net.reachable(&root, target));
        assert!(net.reachable(&ns("zoo1"), "10.0.0.240".parse().unwrap()));
    }

    #[tokio::test]
    async fn default_route_needs_covering_address() {
        let net = SimNet::new();
        net.create_netns("zoo1").await.unwrap();
        let gw = "10.0.0.240".parse().unwrap();
        assert!(net.add_default_route(&ns("zoo1"), gw).await.is_err());
    }

    #[tokio::test]
    async fn injected_fault() {
        let net = SimNet::new();
        net.fail_on("add_bridge", "br0");
        assert!(net.add_bridge(&ExecContext::Root, "br0").await.is_err());
        net.clear_faults();
        net.add_bridge(&ExecContext::Root, "br0").await.unwrap();
        assert_eq!(net.log().len(), 2);
    }
}
