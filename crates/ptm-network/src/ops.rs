//! Typed network operations.
//!
//! Everything the topology manager does to the kernel's networking state
//! goes through [`NetOps`]. The live backend is
//! [`IpRoute2`](crate::iproute::IpRoute2); tests use
//! [`SimNet`](crate::sim::SimNet).

use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use ptm_common::PtmResult;
use serde::{Deserialize, Serialize};

use crate::addr::IpDef;
use crate::exec::ExecContext;

/// Administrative link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// Link is down.
    #[default]
    Down,
    /// Link is up.
    Up,
}

impl LinkState {
    /// The `ip link set` keyword.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Down => "down",
            Self::Up => "up",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations on namespaces, links, addresses and routes.
///
/// Implementations report a missing device as
/// [`PtmError::LinkNotFound`](ptm_common::PtmError::LinkNotFound) and a
/// missing namespace as
/// [`PtmError::NamespaceNotFound`](ptm_common::PtmError::NamespaceNotFound)
/// so callers never need to inspect command output.
#[async_trait]
pub trait NetOps: Send + Sync + fmt::Debug {
    /// Create a named network namespace.
    async fn create_netns(&self, name: &str) -> PtmResult<()>;

    /// Delete a named network namespace.
    async fn delete_netns(&self, name: &str) -> PtmResult<()>;

    /// Check whether a named network namespace exists.
    async fn netns_exists(&self, name: &str) -> PtmResult<bool>;

    /// Check whether a device exists in `ctx`.
    async fn link_exists(&self, ctx: &ExecContext, name: &str) -> PtmResult<bool>;

    /// Create a veth pair `name` <-> `peer` in `ctx`.
    async fn add_veth(&self, ctx: &ExecContext, name: &str, peer: &str) -> PtmResult<()>;

    /// Create a bridge device.
    async fn add_bridge(&self, ctx: &ExecContext, name: &str) -> PtmResult<()>;

    /// Enable or disable spanning tree on a bridge.
    async fn set_bridge_stp(&self, ctx: &ExecContext, name: &str, enabled: bool) -> PtmResult<()>;

    /// Create an 802.1Q sub-interface `name` of `parent`.
    async fn add_vlan(&self, ctx: &ExecContext, parent: &str, name: &str, id: u16)
    -> PtmResult<()>;

    /// Move a device from `ctx` into `target`.
    async fn set_link_netns(
        &self,
        ctx: &ExecContext,
        name: &str,
        target: &ExecContext,
    ) -> PtmResult<()>;

    /// Rename a device.
    async fn rename_link(&self, ctx: &ExecContext, name: &str, new_name: &str) -> PtmResult<()>;

    /// Set the administrative state of a device.
    async fn set_link_state(&self, ctx: &ExecContext, name: &str, state: LinkState)
    -> PtmResult<()>;

    /// Set the MAC address of a device.
    async fn set_link_mac(&self, ctx: &ExecContext, name: &str, mac: &str) -> PtmResult<()>;

    /// Add an address to a device. Adding an existing address succeeds.
    async fn add_address(&self, ctx: &ExecContext, name: &str, addr: &IpDef) -> PtmResult<()>;

    /// Enslave a device to a bridge.
    async fn set_master(&self, ctx: &ExecContext, name: &str, bridge: &str) -> PtmResult<()>;

    /// Release a device from its bridge.
    async fn set_nomaster(&self, ctx: &ExecContext, name: &str) -> PtmResult<()>;

    /// Delete a device (and its veth peer, wherever it is).
    async fn delete_link(&self, ctx: &ExecContext, name: &str) -> PtmResult<()>;

    /// Install or replace the default route in `ctx`.
    async fn add_default_route(&self, ctx: &ExecContext, gateway: IpAddr) -> PtmResult<()>;
}

/// Treat "already gone" as success. Used by teardown paths.
///
/// # Errors
///
/// Passes through every error other than a missing link or namespace.
pub fn ignore_not_found<T>(result: PtmResult<T>) -> PtmResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => {
            tracing::debug!(error = %e, "Already gone");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
