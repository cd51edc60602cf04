//! Shorthand expansion and reference checking.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use ptm_common::{PtmError, PtmResult};
use serde::Serialize;
use serde_json::{Map, Value};

use super::PhysicalTopologyConfig;
use super::defs::{
    BridgeDef, BridgeLinkDef, HostDef, HostInterfaceRef, HostKind, HostedVmDef, InterfaceDef,
    ServiceHostDef, WiringDef,
};

/// Name of the root host when no `RootHost` implementation names another.
pub const ROOT_HOST: &str = "root";

/// Order hosts start in when the document gives no start order.
const DERIVED_ORDER: [HostKind; 6] = [
    HostKind::ZookeeperHost,
    HostKind::CassandraHost,
    HostKind::RouterHost,
    HostKind::ComputeHost,
    HostKind::NetNSHost,
    HostKind::NetworkHost,
];

/// A host after expansion, with its implementation decided.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedHost {
    /// Host name.
    pub name: String,
    /// Implementation kind.
    pub kind: HostKind,
    /// Service parameters from the `implementation` section.
    pub kwargs: Map<String, Value>,
    /// Free-form options.
    pub options: String,
    /// Interfaces, including bridge uplinks added by expansion.
    pub interfaces: Vec<InterfaceDef>,
    /// Bridges owned by this host.
    pub bridges: Vec<BridgeDef>,
}

impl ResolvedHost {
    fn new(name: impl Into<String>, options: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: HostKind::NetNSHost,
            kwargs: Map::new(),
            options: options.into(),
            interfaces: Vec::new(),
            bridges: Vec::new(),
        }
    }

    fn from_def(def: &HostDef) -> Self {
        Self {
            interfaces: def.interfaces.clone(),
            bridges: def.bridges.clone(),
            ..Self::new(def.name.clone(), def.options.clone())
        }
    }

    /// Interface by name.
    #[must_use]
    pub fn interface(&self, name: &str) -> Option<&InterfaceDef> {
        self.interfaces.iter().find(|iface| iface.name == name)
    }

    /// Bridge by name.
    #[must_use]
    pub fn bridge(&self, name: &str) -> Option<&BridgeDef> {
        self.bridges.iter().find(|bridge| bridge.name == name)
    }

    /// First address of the first addressed interface.
    #[must_use]
    pub fn first_address(&self) -> Option<IpAddr> {
        self.interfaces
            .iter()
            .find_map(|iface| iface.ip_list.first())
            .map(|def| def.ip)
    }
}

/// A fully expanded and validated topology.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedTopology {
    /// Name of the root host.
    pub root: String,
    /// Hosts in declaration order.
    pub hosts: Vec<ResolvedHost>,
    /// Veth wiring, explicit and generated.
    pub wiring: Vec<WiringDef>,
    /// Start order groups.
    pub start_order: Vec<Vec<String>>,
    /// First address of every Zookeeper host.
    pub zookeeper_ips: Vec<IpAddr>,
    /// First address of every Cassandra host.
    pub cassandra_ips: Vec<IpAddr>,
    /// VMs declared on compute hosts.
    pub hosted_vms: Vec<HostedVmDef>,
}

impl ResolvedTopology {
    /// Host by name.
    #[must_use]
    pub fn host(&self, name: &str) -> Option<&ResolvedHost> {
        self.hosts.iter().find(|host| host.name == name)
    }

    /// Hosts of `kind`, in declaration order.
    pub fn hosts_of(&self, kind: HostKind) -> impl Iterator<Item = &ResolvedHost> {
        self.hosts.iter().filter(move |host| host.kind == kind)
    }

    /// Start order flattened.
    #[must_use]
    pub fn flat_order(&self) -> Vec<String> {
        self.start_order.iter().flatten().cloned().collect()
    }

    /// The wiring edge whose near end is `host`/`interface`.
    #[must_use]
    pub fn wiring_from(&self, host: &str, interface: &str) -> Option<&WiringDef> {
        self.wiring
            .iter()
            .find(|edge| edge.near.host == host && edge.near.interface == interface)
    }
}

struct Builder {
    root: String,
    hosts: Vec<ResolvedHost>,
    default_kinds: BTreeMap<String, HostKind>,
    wiring: Vec<WiringDef>,
}

impl Builder {
    fn add_host(&mut self, key: &str, host: ResolvedHost) -> PtmResult<()> {
        if self.hosts.iter().any(|h| h.name == host.name) {
            return Err(PtmError::config(
                key,
                format!("host '{}' is declared more than once", host.name),
            ));
        }
        self.hosts.push(host);
        Ok(())
    }

    fn host_mut(&mut self, name: &str) -> PtmResult<&mut ResolvedHost> {
        self.hosts
            .iter_mut()
            .find(|h| h.name == name)
            .ok_or_else(|| PtmError::not_found("host", name))
    }

    fn host(&self, name: &str) -> PtmResult<&ResolvedHost> {
        self.hosts
            .iter()
            .find(|h| h.name == name)
            .ok_or_else(|| PtmError::not_found("host", name))
    }

    /// `""` means the root host.
    fn owner<'a>(&'a self, host: &'a str) -> &'a str {
        if host.is_empty() { &self.root } else { host }
    }

    fn add_service(&mut self, key: &str, def: &ServiceHostDef, kind: HostKind) -> PtmResult<()> {
        let bridge_host = self.owner(&def.bridge_link.host).to_string();
        let mut host = ResolvedHost::new(def.name.clone(), def.options.clone());
        host.interfaces
            .push(InterfaceDef::new(def.interface.clone(), def.ip_list.clone()));
        self.add_host(key, host)?;
        self.default_kinds.insert(def.name.clone(), kind);

        let uplink = InterfaceDef {
            bridge_link: Some(BridgeLinkDef {
                host: bridge_host.clone(),
                name: def.bridge_link.name.clone(),
            }),
            ..InterfaceDef::new(def.uplink_name(), Vec::new())
        };
        self.host_mut(&bridge_host)?.interfaces.push(uplink);
        self.wiring.push(WiringDef {
            near: HostInterfaceRef::new(bridge_host, def.uplink_name()),
            far: HostInterfaceRef::new(def.name.clone(), def.interface.clone()),
        });
        Ok(())
    }
}

pub(super) fn resolve(topo: &PhysicalTopologyConfig) -> PtmResult<ResolvedTopology> {
    let root = root_name(topo)?;
    let mut b = Builder {
        root: root.clone(),
        hosts: Vec::new(),
        default_kinds: BTreeMap::new(),
        wiring: Vec::new(),
    };

    for (i, def) in topo.hosts.iter().enumerate() {
        b.add_host(&format!("hosts[{i}]"), ResolvedHost::from_def(def))?;
    }
    match b.hosts.iter().position(|h| h.name == root) {
        Some(pos) => {
            let host = b.hosts.remove(pos);
            b.hosts.insert(0, host);
        }
        None => {
            tracing::debug!(root = %root, "Synthesizing root host");
            b.hosts.insert(0, ResolvedHost::new(root.clone(), ""));
        }
    }

    for bridge in &topo.bridges {
        let owner = b.owner(&bridge.host).to_string();
        let def = BridgeDef {
            host: owner.clone(),
            ..bridge.clone()
        };
        b.host_mut(&owner)?.bridges.push(def);
    }

    let sections = [
        ("zookeepers", &topo.zookeepers, HostKind::ZookeeperHost),
        ("cassandras", &topo.cassandras, HostKind::CassandraHost),
        ("computes", &topo.computes, HostKind::ComputeHost),
        ("networks", &topo.networks, HostKind::NetworkHost),
    ];
    for (section, defs, kind) in sections {
        for (i, def) in defs.iter().enumerate() {
            b.add_service(&format!("{section}[{i}]"), def, kind)?;
        }
    }

    for (i, router) in topo.routers.iter().enumerate() {
        let mut host = ResolvedHost::new(router.name.clone(), router.options.clone());
        for peer in &router.peers {
            host.interfaces
                .push(InterfaceDef::new(peer.name.clone(), peer.ip_list.clone()));
            b.wiring.push(WiringDef {
                near: HostInterfaceRef::new(router.name.clone(), peer.name.clone()),
                far: peer.target.clone(),
            });
        }
        b.add_host(&format!("routers[{i}]"), host)?;
        b.default_kinds
            .insert(router.name.clone(), HostKind::RouterHost);
    }

    b.wiring.extend(topo.wiring.iter().cloned());

    for vlan in &topo.vlans {
        for member in &vlan.host_list {
            let host = b.host_mut(&member.host)?;
            for iface_def in &member.interface_list {
                let name = format!("{}/{}", member.host, iface_def.name);
                let iface = host
                    .interfaces
                    .iter_mut()
                    .find(|iface| iface.name == iface_def.name)
                    .ok_or_else(|| PtmError::not_found("interface", name))?;
                iface
                    .vlans
                    .entry(vlan.vlan_id)
                    .or_default()
                    .extend(iface_def.ip_list.iter().copied());
            }
        }
    }

    let mut explicit = BTreeSet::new();
    for (i, implementation) in topo.implementation.iter().enumerate() {
        if !explicit.insert(implementation.host.clone()) {
            return Err(PtmError::config(
                format!("implementation[{i}]"),
                format!(
                    "host '{}' has more than one implementation",
                    implementation.host
                ),
            ));
        }
        let host = b.host_mut(&implementation.host)?;
        host.kind = implementation.kind;
        host.kwargs = implementation.kwargs.clone();
    }
    for host in &mut b.hosts {
        if explicit.contains(&host.name) {
            continue;
        }
        host.kind = match b.default_kinds.get(&host.name) {
            Some(kind) => *kind,
            None if host.name == b.root => HostKind::RootHost,
            None => HostKind::NetNSHost,
        };
    }

    check_hosts(&b)?;
    check_wiring(&b)?;

    let mut hosted_vms = Vec::new();
    for (i, vm) in topo.hosted_vms.iter().enumerate() {
        let host = b.host(&vm.host)?;
        if host.kind != HostKind::ComputeHost {
            return Err(PtmError::config(
                format!("hosted_vms[{i}]"),
                format!("VM '{}' is placed on '{}', which is not a compute host", vm.name, vm.host),
            ));
        }
        hosted_vms.push(vm.clone());
    }

    let peer_ips = |kind: HostKind| -> Vec<IpAddr> {
        b.hosts
            .iter()
            .filter(|h| h.kind == kind)
            .filter_map(|h| {
                let ip = h.first_address();
                if ip.is_none() {
                    tracing::warn!(host = %h.name, "Host has no address, left out of peer list");
                }
                ip
            })
            .collect()
    };
    let zookeeper_ips = peer_ips(HostKind::ZookeeperHost);
    let cassandra_ips = peer_ips(HostKind::CassandraHost);

    let start_order = start_order(topo, &b)?;

    Ok(ResolvedTopology {
        root,
        hosts: b.hosts,
        wiring: b.wiring,
        start_order,
        zookeeper_ips,
        cassandra_ips,
        hosted_vms,
    })
}

fn root_name(topo: &PhysicalTopologyConfig) -> PtmResult<String> {
    let roots: Vec<&str> = topo
        .implementation
        .iter()
        .filter(|i| i.kind == HostKind::RootHost)
        .map(|i| i.host.as_str())
        .collect();
    match roots.as_slice() {
        [] => Ok(ROOT_HOST.to_string()),
        [root] => Ok((*root).to_string()),
        _ => Err(PtmError::config(
            "implementation",
            format!("more than one RootHost: {}", roots.join(", ")),
        )),
    }
}

fn check_hosts(b: &Builder) -> PtmResult<()> {
    let roots = b
        .hosts
        .iter()
        .filter(|h| h.kind == HostKind::RootHost)
        .count();
    if roots != 1 {
        return Err(PtmError::config(
            "implementation",
            format!("expected exactly one RootHost, found {roots}"),
        ));
    }

    for host in &b.hosts {
        let mut names = BTreeSet::new();
        for iface in &host.interfaces {
            if !names.insert(iface.name.as_str()) {
                return Err(PtmError::config(
                    format!("{}/{}", host.name, iface.name),
                    "interface is declared more than once",
                ));
            }
        }
        let mut bridges = BTreeSet::new();
        for bridge in &host.bridges {
            if !bridges.insert(bridge.name.as_str()) {
                return Err(PtmError::config(
                    format!("{}/{}", host.name, bridge.name),
                    "bridge is declared more than once",
                ));
            }
        }

        for iface in &host.interfaces {
            let Some(link) = &iface.bridge_link else {
                continue;
            };
            let owner = b.owner(&link.host);
            let bridge_host = b.host(owner)?;
            if bridge_host.bridge(&link.name).is_none() {
                return Err(PtmError::not_found(
                    "bridge",
                    format!("{owner}/{}", link.name),
                ));
            }
            if owner != host.name {
                return Err(PtmError::config(
                    format!("{}/{}", host.name, iface.name),
                    format!(
                        "bridge '{}' lives on host '{owner}', not in the interface's context",
                        link.name
                    ),
                ));
            }
        }
    }
    Ok(())
}

fn check_wiring(b: &Builder) -> PtmResult<()> {
    let mut nears = BTreeSet::new();
    let mut fars = BTreeSet::new();

    for (i, edge) in b.wiring.iter().enumerate() {
        for end in [&edge.near, &edge.far] {
            if b.host(&end.host)?.interface(&end.interface).is_none() {
                return Err(PtmError::not_found("interface", end.to_string()));
            }
        }
        if !nears.insert(&edge.near) {
            return Err(PtmError::config(
                format!("wiring[{i}]"),
                format!("'{}' is the near end of more than one veth", edge.near),
            ));
        }
        if !fars.insert(&edge.far) {
            return Err(PtmError::config(
                format!("wiring[{i}]"),
                format!("'{}' is the far end of more than one veth", edge.far),
            ));
        }
    }

    if let Some(both) = nears.intersection(&fars).next() {
        return Err(PtmError::config(
            "wiring",
            format!("'{both}' is both a near and a far end"),
        ));
    }
    Ok(())
}

fn start_order(topo: &PhysicalTopologyConfig, b: &Builder) -> PtmResult<Vec<Vec<String>>> {
    if topo.host_start_order.is_empty() {
        let mut groups = vec![vec![b.root.clone()]];
        for kind in DERIVED_ORDER {
            let group: Vec<String> = b
                .hosts
                .iter()
                .filter(|h| h.kind == kind)
                .map(|h| h.name.clone())
                .collect();
            if !group.is_empty() {
                groups.push(group);
            }
        }
        return Ok(groups);
    }

    let groups: Vec<Vec<String>> = topo
        .host_start_order
        .iter()
        .map(super::StartOrderItem::hosts)
        .collect();

    let mut position = BTreeMap::new();
    for (g, group) in groups.iter().enumerate() {
        for name in group {
            b.host(name)?;
            if position.insert(name.as_str(), g).is_some() {
                return Err(PtmError::config(
                    "host_start_order",
                    format!("host '{name}' appears more than once"),
                ));
            }
        }
    }

    if let Some(missing) = b.hosts.iter().find(|h| !position.contains_key(h.name.as_str())) {
        return Err(PtmError::config(
            "host_start_order",
            format!("host '{}' is missing", missing.name),
        ));
    }

    if groups.first().map(Vec::as_slice) != Some(std::slice::from_ref(&b.root)) {
        return Err(PtmError::config(
            "host_start_order",
            format!("root host '{}' must be started first, on its own", b.root),
        ));
    }

    for host in &b.hosts {
        for dep_kind in host.kind.depends_on() {
            for dep in b.hosts.iter().filter(|h| h.kind == *dep_kind) {
                if position[dep.name.as_str()] >= position[host.name.as_str()] {
                    return Err(PtmError::config(
                        "host_start_order",
                        format!(
                            "'{}' ({}) must start after '{}' ({})",
                            host.name, host.kind, dep.name, dep.kind
                        ),
                    ));
                }
            }
        }
    }

    Ok(groups)
}
