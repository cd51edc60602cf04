//! # ptm-network
//!
//! Network primitives for the physical topology manager.
//!
//! Every change to the kernel's networking state goes through the typed
//! [`NetOps`] trait. [`IpRoute2`] drives the real kernel with `ip`
//! commands; with the `sim` feature, [`sim::SimNet`] models it in memory.

#![warn(missing_docs)]

pub mod addr;
pub mod bridge;
pub mod exec;
pub mod interface;
pub mod iproute;
pub mod netns;
pub mod ops;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod veth;

pub use addr::{DEFAULT_MAC, DEFAULT_PREFIX_LEN, IpDef};
pub use bridge::Bridge;
pub use exec::{CommandOutput, CommandRunner, ExecContext, SystemRunner, argv};
pub use interface::{BridgePort, Interface, InterfaceKind};
pub use iproute::IpRoute2;
pub use netns::{ensure_netns, loopback_up, remove_netns};
pub use ops::{LinkState, NetOps, ignore_not_found};
pub use veth::{FarEnd, IFNAMSIZ, VethPeer, peer_name_for, vlan_name};
