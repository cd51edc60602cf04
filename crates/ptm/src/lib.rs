//! # ptm
//!
//! Physical topology manager.
//!
//! ptm turns a JSON topology document into live network namespaces,
//! veth pairs, bridges and VLANs on one Linux box, starts a daemon
//! (Zookeeper, Cassandra, the network agent, Quagga or the API) inside
//! each host, and tears all of it down again in reverse order.
//!
//! - [`topology`]: the document model and shorthand expansion
//! - [`host`]: one simulated machine and its lifecycle
//! - [`services`]: per-daemon config files, mounts and readiness probes
//! - [`manager`]: phase ordering across hosts
//! - [`isolation`]: the per-host control child

#![warn(missing_docs)]

pub mod cli;
pub mod host;
pub mod isolation;
pub mod logging;
pub mod manager;
pub mod packages;
pub mod services;
pub mod state;
pub mod topology;
pub mod tunnel;

pub use host::{Host, HostSnapshot, HostState};
pub use isolation::{ControlLauncher, ControlRequest, InProcessLauncher, UnshareLauncher};
pub use manager::{Phase, TopologyManager};
pub use services::{HostSystem, ServiceConfig, ServiceOps};
pub use topology::{PhysicalTopologyConfig, ResolvedTopology};
pub use tunnel::{RecordingTunnelZone, TunnelZone};
