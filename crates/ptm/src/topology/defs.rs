//! Topology document definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ptm_common::names::{validate_host_name, validate_ifname};
use ptm_common::{PtmError, PtmResult};
use ptm_network::{DEFAULT_MAC, IpDef};
use serde::{Deserialize, Serialize};

/// Interface name service shorthand hosts get when none is given.
pub const DEFAULT_SERVICE_INTERFACE: &str = "eth0";

fn default_mac() -> String {
    DEFAULT_MAC.to_string()
}

fn default_service_interface() -> String {
    DEFAULT_SERVICE_INTERFACE.to_string()
}

/// Per-element validation run after parsing.
pub(crate) trait Validate {
    fn validate(&self, key: &str) -> PtmResult<()>;
}

fn validate_ips(key: &str, ips: &[IpDef]) -> PtmResult<()> {
    for ip in ips {
        ip.validate().map_err(|msg| PtmError::config(key, msg))?;
    }
    Ok(())
}

/// Reference to a bridge: `host` empty means the root host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeLinkDef {
    /// Host owning the bridge.
    #[serde(default)]
    pub host: String,
    /// Bridge name.
    pub name: String,
}

/// A bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeDef {
    /// Bridge name.
    pub name: String,
    /// Owning host; empty means the root host.
    #[serde(default)]
    pub host: String,
    /// Addresses; the first is the gateway for attached hosts.
    #[serde(default)]
    pub ip_list: Vec<IpDef>,
    /// Space separated option tokens.
    #[serde(default)]
    pub options: String,
}

impl Validate for BridgeDef {
    fn validate(&self, key: &str) -> PtmResult<()> {
        validate_ifname(key, &self.name)?;
        validate_ips(key, &self.ip_list)
    }
}

/// An interface on a declared host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDef {
    /// Device name.
    pub name: String,
    /// Bridge on the same host to attach to.
    #[serde(default)]
    pub bridge_link: Option<BridgeLinkDef>,
    /// Addresses in the order they are applied.
    #[serde(default)]
    pub ip_list: Vec<IpDef>,
    /// MAC address or `"default"`.
    #[serde(default = "default_mac")]
    pub mac_address: String,
    /// VLAN id to addresses.
    #[serde(default)]
    pub vlans: BTreeMap<u16, Vec<IpDef>>,
}

impl InterfaceDef {
    /// An interface with only a name and addresses.
    pub fn new(name: impl Into<String>, ip_list: Vec<IpDef>) -> Self {
        Self {
            name: name.into(),
            bridge_link: None,
            ip_list,
            mac_address: default_mac(),
            vlans: BTreeMap::new(),
        }
    }
}

impl Validate for InterfaceDef {
    fn validate(&self, key: &str) -> PtmResult<()> {
        validate_ifname(key, &self.name)?;
        validate_ips(key, &self.ip_list)?;
        for (id, ips) in &self.vlans {
            validate_ifname(key, &ptm_network::vlan_name(&self.name, *id))?;
            validate_ips(key, ips)?;
        }
        Ok(())
    }
}

/// A host declared in full.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDef {
    /// Host name.
    pub name: String,
    /// Interfaces.
    #[serde(default)]
    pub interfaces: Vec<InterfaceDef>,
    /// Bridges owned by the host.
    #[serde(default)]
    pub bridges: Vec<BridgeDef>,
    /// Free-form options.
    #[serde(default)]
    pub options: String,
}

impl Validate for HostDef {
    fn validate(&self, key: &str) -> PtmResult<()> {
        validate_host_name(key, &self.name)?;
        for (i, iface) in self.interfaces.iter().enumerate() {
            iface.validate(&format!("{key}.interfaces[{i}]"))?;
        }
        for (i, bridge) in self.bridges.iter().enumerate() {
            bridge.validate(&format!("{key}.bridges[{i}]"))?;
        }
        Ok(())
    }
}

/// Shorthand for a namespace host with one interface wired to a bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHostDef {
    /// Host name.
    pub name: String,
    /// Bridge the host hangs off.
    pub bridge_link: BridgeLinkDef,
    /// Addresses of the host's interface.
    #[serde(default)]
    pub ip_list: Vec<IpDef>,
    /// Interface name inside the host.
    #[serde(default = "default_service_interface")]
    pub interface: String,
    /// Free-form options.
    #[serde(default)]
    pub options: String,
}

impl ServiceHostDef {
    /// Name of the bridge-side interface: `v{host}{interface}`.
    #[must_use]
    pub fn uplink_name(&self) -> String {
        format!("v{}{}", self.name, self.interface)
    }
}

impl Validate for ServiceHostDef {
    fn validate(&self, key: &str) -> PtmResult<()> {
        validate_host_name(key, &self.name)?;
        validate_ifname(key, &self.interface)?;
        validate_ifname(key, &self.uplink_name())?;
        validate_ips(key, &self.ip_list)
    }
}

/// A `(host, interface)` pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostInterfaceRef {
    /// Host name.
    pub host: String,
    /// Interface name.
    pub interface: String,
}

impl HostInterfaceRef {
    /// Build a reference.
    pub fn new(host: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            interface: interface.into(),
        }
    }
}

impl fmt::Display for HostInterfaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.interface)
    }
}

/// One port of a router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterPeerDef {
    /// Port interface name on the router.
    pub name: String,
    /// Port addresses.
    #[serde(default)]
    pub ip_list: Vec<IpDef>,
    /// Interface the port is wired to.
    pub target: HostInterfaceRef,
}

/// A router host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterDef {
    /// Host name.
    pub name: String,
    /// Ports.
    #[serde(default)]
    pub peers: Vec<RouterPeerDef>,
    /// Free-form options.
    #[serde(default)]
    pub options: String,
}

impl Validate for RouterDef {
    fn validate(&self, key: &str) -> PtmResult<()> {
        validate_host_name(key, &self.name)?;
        for (i, peer) in self.peers.iter().enumerate() {
            let key = format!("{key}.peers[{i}]");
            validate_ifname(&key, &peer.name)?;
            validate_ips(&key, &peer.ip_list)?;
        }
        Ok(())
    }
}

/// A VM the virtual topology layer places on a compute host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostedVmDef {
    /// VM name.
    pub name: String,
    /// Compute host.
    pub host: String,
    /// VM interfaces.
    #[serde(default)]
    pub interfaces: Vec<InterfaceDef>,
}

impl Validate for HostedVmDef {
    fn validate(&self, key: &str) -> PtmResult<()> {
        for (i, iface) in self.interfaces.iter().enumerate() {
            iface.validate(&format!("{key}.interfaces[{i}]"))?;
        }
        Ok(())
    }
}

/// VLAN addresses for one interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanInterfaceDef {
    /// Parent interface.
    pub name: String,
    /// Addresses on the sub-interface.
    #[serde(default)]
    pub ip_list: Vec<IpDef>,
}

/// VLAN membership of one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanHostDef {
    /// Host name.
    pub host: String,
    /// Interfaces carrying the VLAN.
    #[serde(default)]
    pub interface_list: Vec<VlanInterfaceDef>,
}

/// A VLAN spanning hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanDef {
    /// 802.1Q id.
    pub vlan_id: u16,
    /// Member hosts.
    #[serde(default)]
    pub host_list: Vec<VlanHostDef>,
}

impl Validate for VlanDef {
    fn validate(&self, key: &str) -> PtmResult<()> {
        if self.vlan_id == 0 || self.vlan_id > 4094 {
            return Err(PtmError::config(
                key,
                format!("vlan_id {} is outside 1-4094", self.vlan_id),
            ));
        }
        for host in &self.host_list {
            for iface in &host.interface_list {
                validate_ips(key, &iface.ip_list)?;
            }
        }
        Ok(())
    }
}

/// An explicit veth wiring edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WiringDef {
    /// Interface that becomes the near end of the veth.
    pub near: HostInterfaceRef,
    /// Interface the peer is delivered as.
    pub far: HostInterfaceRef,
}

impl Validate for WiringDef {
    fn validate(&self, _key: &str) -> PtmResult<()> {
        Ok(())
    }
}

/// Host implementation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HostKind {
    /// The base OS.
    RootHost,
    /// A bare namespace host.
    NetNSHost,
    /// Zookeeper node.
    ZookeeperHost,
    /// Cassandra node.
    CassandraHost,
    /// Network agent node.
    ComputeHost,
    /// Quagga BGP router.
    RouterHost,
    /// API / cluster node.
    NetworkHost,
}

impl HostKind {
    /// Every kind, in registry order.
    pub const ALL: [Self; 7] = [
        Self::RootHost,
        Self::NetNSHost,
        Self::ZookeeperHost,
        Self::CassandraHost,
        Self::ComputeHost,
        Self::RouterHost,
        Self::NetworkHost,
    ];

    /// Registry name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RootHost => "RootHost",
            Self::NetNSHost => "NetNSHost",
            Self::ZookeeperHost => "ZookeeperHost",
            Self::CassandraHost => "CassandraHost",
            Self::ComputeHost => "ComputeHost",
            Self::RouterHost => "RouterHost",
            Self::NetworkHost => "NetworkHost",
        }
    }

    /// Kinds that must be started before this one.
    #[must_use]
    pub const fn depends_on(&self) -> &'static [Self] {
        match self {
            Self::CassandraHost | Self::NetworkHost => &[Self::ZookeeperHost],
            Self::ComputeHost => &[Self::ZookeeperHost, Self::CassandraHost],
            _ => &[],
        }
    }
}

impl fmt::Display for HostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.strip_prefix("PTM.").unwrap_or(s);
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| format!("unknown host implementation '{s}'"))
    }
}

impl TryFrom<String> for HostKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HostKind> for String {
    fn from(kind: HostKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Implementation override for a host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplementationDef {
    /// Host name.
    pub host: String,
    /// Implementation kind.
    #[serde(rename = "impl")]
    pub kind: HostKind,
    /// Service parameters.
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl Validate for ImplementationDef {
    fn validate(&self, key: &str) -> PtmResult<()> {
        validate_host_name(key, &self.host)
    }
}

/// One entry of `host_start_order`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StartOrderItem {
    /// A single host.
    Host(String),
    /// Hosts started together.
    Group(Vec<String>),
}

impl StartOrderItem {
    /// Host names in this entry.
    #[must_use]
    pub fn hosts(&self) -> Vec<String> {
        match self {
            Self::Host(name) => vec![name.clone()],
            Self::Group(names) => names.clone(),
        }
    }
}

impl Validate for StartOrderItem {
    fn validate(&self, key: &str) -> PtmResult<()> {
        if matches!(self, Self::Group(names) if names.is_empty()) {
            return Err(PtmError::config(key, "empty start order group"));
        }
        Ok(())
    }
}
