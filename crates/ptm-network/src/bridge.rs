//! Linux bridge management.

use std::collections::BTreeSet;
use std::net::IpAddr;

use ptm_common::PtmResult;
use serde::{Deserialize, Serialize};

use crate::addr::IpDef;
use crate::exec::ExecContext;
use crate::ops::{LinkState, NetOps, ignore_not_found};

/// A bridge owned by a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bridge {
    /// Bridge device name.
    pub name: String,
    /// Context of the owning host.
    pub ctx: ExecContext,
    /// Space separated option tokens (`stp`).
    #[serde(default)]
    pub options: String,
    /// Addresses assigned to the bridge. The first one is the gateway.
    #[serde(default)]
    pub ip_list: Vec<IpDef>,
    /// Interfaces currently enslaved.
    #[serde(default)]
    pub linked: BTreeSet<String>,
    /// Last state applied.
    #[serde(default)]
    pub state: LinkState,
}

impl Bridge {
    /// A bridge named `name` in `ctx`.
    pub fn new(name: impl Into<String>, ctx: ExecContext) -> Self {
        Self {
            name: name.into(),
            ctx,
            options: String::new(),
            ip_list: Vec::new(),
            linked: BTreeSet::new(),
            state: LinkState::Down,
        }
    }

    /// Set the option string.
    #[must_use]
    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = options.into();
        self
    }

    /// Set the addresses.
    #[must_use]
    pub fn with_addresses(mut self, ip_list: Vec<IpDef>) -> Self {
        self.ip_list = ip_list;
        self
    }

    /// Whether spanning tree is requested.
    #[must_use]
    pub fn stp(&self) -> bool {
        self.options.split_whitespace().any(|opt| opt == "stp")
    }

    /// Address attached hosts route through.
    #[must_use]
    pub fn gateway(&self) -> Option<IpAddr> {
        self.ip_list.first().map(|def| def.ip)
    }

    /// Create the bridge device. An existing device is reused.
    pub async fn create(&self, net: &dyn NetOps) -> PtmResult<()> {
        if net.link_exists(&self.ctx, &self.name).await? {
            tracing::debug!(bridge = %self.name, "Bridge already exists");
        } else {
            net.add_bridge(&self.ctx, &self.name).await?;
        }
        if self.stp() {
            net.set_bridge_stp(&self.ctx, &self.name, true).await?;
        }
        tracing::info!(bridge = %self.name, ctx = %self.ctx, "Bridge created");
        Ok(())
    }

    /// Assign the configured addresses.
    pub async fn config_addr(&self, net: &dyn NetOps) -> PtmResult<()> {
        for addr in &self.ip_list {
            net.add_address(&self.ctx, &self.name, addr).await?;
        }
        Ok(())
    }

    /// Bring the bridge up.
    pub async fn up(&mut self, net: &dyn NetOps) -> PtmResult<()> {
        net.set_link_state(&self.ctx, &self.name, LinkState::Up)
            .await?;
        self.state = LinkState::Up;
        Ok(())
    }

    /// Bring the bridge down. A missing bridge is already down.
    pub async fn down(&mut self, net: &dyn NetOps) -> PtmResult<()> {
        ignore_not_found(
            net.set_link_state(&self.ctx, &self.name, LinkState::Down)
                .await,
        )?;
        self.state = LinkState::Down;
        Ok(())
    }

    /// Enslave `interface` to this bridge.
    pub async fn link_interface(&mut self, net: &dyn NetOps, interface: &str) -> PtmResult<()> {
        tracing::debug!(bridge = %self.name, interface, "Adding interface to bridge");
        net.set_master(&self.ctx, interface, &self.name).await?;
        self.linked.insert(interface.to_string());
        Ok(())
    }

    /// Release `interface` from this bridge, ignoring a missing device.
    pub async fn del_link_interface(&mut self, net: &dyn NetOps, interface: &str) -> PtmResult<()> {
        ignore_not_found(net.set_nomaster(&self.ctx, interface).await)?;
        self.linked.remove(interface);
        Ok(())
    }

    /// Release every linked interface.
    pub async fn unlink_all(&mut self, net: &dyn NetOps) -> PtmResult<()> {
        let linked: Vec<String> = self.linked.iter().cloned().collect();
        for interface in linked {
            self.del_link_interface(net, &interface).await?;
        }
        Ok(())
    }

    /// Delete the bridge device, ignoring a missing one.
    pub async fn remove(&self, net: &dyn NetOps) -> PtmResult<()> {
        tracing::debug!(bridge = %self.name, "Deleting bridge");
        ignore_not_found(net.delete_link(&self.ctx, &self.name).await)
    }
}
