//! Serialized host description handed to the isolated control child.

use std::collections::BTreeMap;
use std::net::IpAddr;

use ptm_common::{PtmError, PtmPaths, PtmResult, RetryPolicy};
use ptm_network::{ExecContext, Interface, IpDef};
use serde::{Deserialize, Serialize};

use super::{Host, HostState};
use crate::services::ServiceConfig;
use crate::topology::HostKind;

/// Version of the [`HostSnapshot`] layout.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Everything the control child needs to drive one host's service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSnapshot {
    /// Layout version; only [`SNAPSHOT_SCHEMA_VERSION`] is accepted.
    pub schema_version: u32,
    /// Host name.
    pub name: String,
    /// Implementation kind.
    pub kind: HostKind,
    /// Execution context.
    pub ctx: ExecContext,
    /// Service address.
    pub ip: Option<IpAddr>,
    /// Interface addresses by interface name.
    pub interfaces: BTreeMap<String, Vec<IpDef>>,
    /// Lifecycle position when the snapshot was taken.
    pub state: HostState,
    /// Service parameters.
    pub service: ServiceConfig,
    /// Directory layout.
    pub paths: PtmPaths,
    /// Readiness budget.
    pub readiness: RetryPolicy,
}

impl HostSnapshot {
    /// Parse and version-check a snapshot.
    pub fn from_json(json: &str) -> PtmResult<Self> {
        let snapshot: Self = serde_json::from_str(json)?;
        snapshot.check_version()?;
        Ok(snapshot)
    }

    /// Serialize to compact JSON for the command line.
    pub fn to_json(&self) -> PtmResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn check_version(&self) -> PtmResult<()> {
        if self.schema_version == SNAPSHOT_SCHEMA_VERSION {
            Ok(())
        } else {
            Err(PtmError::config(
                "schema_version",
                format!(
                    "unsupported host snapshot version {} (expected {SNAPSHOT_SCHEMA_VERSION})",
                    self.schema_version
                ),
            ))
        }
    }
}

impl Host {
    /// Describe this host for the control child.
    #[must_use]
    pub fn snapshot(&self, paths: &PtmPaths, readiness: RetryPolicy) -> HostSnapshot {
        HostSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            name: self.name.clone(),
            kind: self.kind,
            ctx: self.ctx.clone(),
            ip: self.ip,
            interfaces: self
                .interfaces
                .iter()
                .map(|(name, iface)| (name.clone(), iface.ip_list.clone()))
                .collect(),
            state: self.state,
            service: self.service.clone(),
            paths: paths.clone(),
            readiness,
        }
    }

    /// Rebuild a host from a snapshot.
    ///
    /// Interfaces come back as plain devices with their addresses; wiring
    /// and bridges stay with the manager.
    pub fn from_snapshot(snapshot: HostSnapshot) -> PtmResult<Self> {
        snapshot.check_version()?;
        let interfaces = snapshot
            .interfaces
            .into_iter()
            .map(|(name, ips)| {
                let iface = Interface::physical(name.clone(), snapshot.name.clone(), snapshot.ctx.clone())
                    .with_addresses(ips);
                (name, iface)
            })
            .collect();

        Ok(Self {
            span: tracing::info_span!("host", name = %snapshot.name),
            name: snapshot.name,
            kind: snapshot.kind,
            ctx: snapshot.ctx,
            ip: snapshot.ip,
            bridges: BTreeMap::new(),
            interfaces,
            state: snapshot.state,
            service: snapshot.service,
        })
    }
}
