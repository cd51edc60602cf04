//! Tunnel-zone membership sink.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use parking_lot::Mutex;
use ptm_common::PtmResult;

/// Receives the compute hosts once they run, so the controller can put
/// them in a tunnel zone.
#[async_trait]
pub trait TunnelZone: Send + Sync + fmt::Debug {
    /// Add `members` (host name to tunnel address).
    async fn add_members(&self, members: &BTreeMap<String, IpAddr>) -> PtmResult<()>;
}

/// Keeps every member it is given. Handy when no controller is reachable.
#[derive(Debug, Default)]
pub struct RecordingTunnelZone {
    members: Mutex<BTreeMap<String, IpAddr>>,
}

impl RecordingTunnelZone {
    /// Members received so far.
    #[must_use]
    pub fn members(&self) -> BTreeMap<String, IpAddr> {
        self.members.lock().clone()
    }
}

#[async_trait]
impl TunnelZone for RecordingTunnelZone {
    async fn add_members(&self, members: &BTreeMap<String, IpAddr>) -> PtmResult<()> {
        for (host, ip) in members {
            tracing::info!(host = %host, %ip, "Tunnel zone member");
        }
        self.members
            .lock()
            .extend(members.iter().map(|(k, v)| (k.clone(), *v)));
        Ok(())
    }
}
