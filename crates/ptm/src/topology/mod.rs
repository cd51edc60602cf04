//! Physical topology documents.
//!
//! A topology is a JSON document describing hosts, bridges, interfaces,
//! VLANs and veth wiring. [`PhysicalTopologyConfig`] is the parsed
//! document; [`PhysicalTopologyConfig::resolve`] expands the shorthand
//! sections and checks every cross reference, producing a
//! [`ResolvedTopology`] the manager can build from.

mod defs;
mod resolve;

use std::path::Path;

use ptm_common::{PtmError, PtmResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use defs::{
    BridgeDef, BridgeLinkDef, DEFAULT_SERVICE_INTERFACE, HostDef, HostInterfaceRef, HostKind,
    HostedVmDef, ImplementationDef, InterfaceDef, RouterDef, RouterPeerDef, ServiceHostDef,
    StartOrderItem, VlanDef, VlanHostDef, VlanInterfaceDef, WiringDef,
};
pub use resolve::{ResolvedHost, ResolvedTopology, ROOT_HOST};

use defs::Validate;

/// Top-level keys of a topology document.
pub const SECTIONS: [&str; 12] = [
    "bridges",
    "zookeepers",
    "cassandras",
    "computes",
    "networks",
    "routers",
    "hosts",
    "hosted_vms",
    "vlans",
    "wiring",
    "implementation",
    "host_start_order",
];

/// A parsed topology document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicalTopologyConfig {
    /// Bridges, attached to their owning host.
    pub bridges: Vec<BridgeDef>,
    /// Zookeeper hosts (shorthand).
    pub zookeepers: Vec<ServiceHostDef>,
    /// Cassandra hosts (shorthand).
    pub cassandras: Vec<ServiceHostDef>,
    /// Compute hosts (shorthand).
    pub computes: Vec<ServiceHostDef>,
    /// API / cluster hosts (shorthand).
    pub networks: Vec<ServiceHostDef>,
    /// Router hosts.
    pub routers: Vec<RouterDef>,
    /// Fully declared hosts.
    pub hosts: Vec<HostDef>,
    /// VMs on compute hosts.
    pub hosted_vms: Vec<HostedVmDef>,
    /// VLANs.
    pub vlans: Vec<VlanDef>,
    /// Explicit veth wiring.
    pub wiring: Vec<WiringDef>,
    /// Implementation overrides.
    pub implementation: Vec<ImplementationDef>,
    /// Start order; derived when empty.
    pub host_start_order: Vec<StartOrderItem>,
}

impl PhysicalTopologyConfig {
    /// Parse a JSON document.
    pub fn from_json(json: &str) -> PtmResult<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| PtmError::config("<document>", e.to_string()))?;
        Self::from_value(value)
    }

    /// Read and parse a JSON document.
    pub fn from_file(path: &Path) -> PtmResult<Self> {
        tracing::debug!(path = %path.display(), "Loading topology");
        let json = std::fs::read_to_string(path).map_err(|e| {
            PtmError::config(path.display().to_string(), format!("cannot read topology: {e}"))
        })?;
        Self::from_json(&json)
    }

    /// Parse a JSON value, element by element, so errors name the object.
    pub fn from_value(value: Value) -> PtmResult<Self> {
        let Value::Object(mut doc) = value else {
            return Err(PtmError::config(
                "<document>",
                "topology must be a JSON object",
            ));
        };

        for key in doc.keys() {
            if !SECTIONS.contains(&key.as_str()) {
                tracing::warn!(key = %key, "Ignoring unknown topology section");
            }
        }

        let mut take = |key: &str| doc.remove(key).unwrap_or(Value::Null);

        Ok(Self {
            bridges: parse_section("bridges", take("bridges"))?,
            zookeepers: parse_section("zookeepers", take("zookeepers"))?,
            cassandras: parse_section("cassandras", take("cassandras"))?,
            computes: parse_section("computes", take("computes"))?,
            networks: parse_section("networks", take("networks"))?,
            routers: parse_section("routers", take("routers"))?,
            hosts: parse_section("hosts", take("hosts"))?,
            hosted_vms: parse_section("hosted_vms", take("hosted_vms"))?,
            vlans: parse_section("vlans", take("vlans"))?,
            wiring: parse_section("wiring", take("wiring"))?,
            implementation: parse_section("implementation", take("implementation"))?,
            host_start_order: parse_section("host_start_order", take("host_start_order"))?,
        })
    }

    /// Serialize with every key and default present.
    pub fn to_value(&self) -> PtmResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> PtmResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Expand shorthand sections and validate every reference.
    pub fn resolve(&self) -> PtmResult<ResolvedTopology> {
        resolve::resolve(self)
    }
}

fn parse_section<T>(section: &str, value: Value) -> PtmResult<Vec<T>>
where
    T: DeserializeOwned + Validate,
{
    let items = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        other => {
            return Err(PtmError::config(
                section,
                format!("expected a list, found {}", type_name(&other)),
            ));
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| -> PtmResult<T> {
            let key = format!("{section}[{i}]");
            let name = item
                .get("name")
                .or_else(|| item.get("host"))
                .and_then(Value::as_str)
                .map(ToString::to_string);
            let parsed: T = serde_json::from_value(item).map_err(|e| {
                let message = match &name {
                    Some(name) => format!("{e} (in '{name}')"),
                    None => e.to_string(),
                };
                PtmError::config(key.as_str(), message)
            })?;
            parsed.validate(&key)?;
            Ok(parsed)
        })
        .collect()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZOO1: &str = r#"{
        "bridges": [{"name": "br0", "ip_list": [{"ip": "10.0.0.240", "subnet": "16"}]}],
        "zookeepers": [{"name": "zoo1", "bridge_link": {"name": "br0"},
                        "ip_list": [{"ip": "10.0.0.2"}]}],
        "host_start_order": ["root", "zoo1"]
    }"#;

    #[test]
    fn parse_minimal() {
        let topo = PhysicalTopologyConfig::from_json(ZOO1).unwrap();
        assert_eq!(topo.bridges[0].name, "br0");
        assert_eq!(topo.bridges[0].ip_list[0].subnet, 16);
        assert_eq!(topo.zookeepers[0].ip_list[0].subnet, 24);
        assert!(topo.hosts.is_empty());
    }

    #[test]
    fn empty_document_is_valid() {
        let topo = PhysicalTopologyConfig::from_json("{}").unwrap();
        assert_eq!(topo, PhysicalTopologyConfig::default());
    }

    #[test]
    fn missing_field_names_the_object() {
        let err = PhysicalTopologyConfig::from_json(
            r#"{"zookeepers": [
                {"name": "zoo1", "bridge_link": {"name": "br0"}},
                {"name": "zoo2"}
            ]}"#,
        )
        .unwrap_err();

        match err {
            PtmError::Config { key, message } => {
                assert_eq!(key, "zookeepers[1]");
                assert!(message.contains("bridge_link"), "{message}");
                assert!(message.contains("zoo2"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn section_must_be_a_list() {
        let err = PhysicalTopologyConfig::from_json(r#"{"hosts": {"name": "x"}}"#).unwrap_err();
        assert!(matches!(err, PtmError::Config { ref key, .. } if key == "hosts"));
    }

    #[test]
    fn long_interface_name_is_rejected() {
        let err = PhysicalTopologyConfig::from_json(
            r#"{"hosts": [{"name": "h1", "interfaces": [{"name": "averyveryverylongname"}]}]}"#,
        )
        .unwrap_err();
        assert!(
            matches!(err, PtmError::Config { ref key, .. } if key == "hosts[0].interfaces[0]")
        );
    }

    #[test]
    fn unknown_implementation_is_rejected() {
        let err = PhysicalTopologyConfig::from_json(
            r#"{"implementation": [{"host": "zoo1", "impl": "PTM.FooHost"}]}"#,
        )
        .unwrap_err();
        match err {
            PtmError::Config { key, message } => {
                assert_eq!(key, "implementation[0]");
                assert!(message.contains("FooHost"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn defaults_are_written_back() {
        let topo = PhysicalTopologyConfig::from_json(ZOO1).unwrap();
        let value = topo.to_value().unwrap();
        for key in SECTIONS {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["zookeepers"][0]["interface"], "eth0");
        assert_eq!(value["zookeepers"][0]["ip_list"][0]["subnet"], "24");
        assert_eq!(value["bridges"][0]["host"], "");

        let back = PhysicalTopologyConfig::from_value(value).unwrap();
        assert_eq!(back, topo);
    }
}
