//! Virtual ethernet pair wiring.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::exec::ExecContext;

/// Kernel limit on interface name length.
pub const IFNAMSIZ: usize = 15;

/// The interface at the far end of a veth pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarEnd {
    /// Host owning the far interface.
    pub host: String,
    /// Context the far interface lives in.
    pub ctx: ExecContext,
    /// Final name of the far interface.
    pub interface: String,
}

/// Peer side of a veth interface.
///
/// The peer device is created next to the near device under
/// [`peer_name`](Self::peer_name), then moved into the far context and
/// renamed. A pair without a far end stays local.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VethPeer {
    /// Temporary name of the peer device in the near context.
    pub peer_name: String,
    /// Where the peer ends up, if anywhere.
    pub far: Option<FarEnd>,
}

impl VethPeer {
    /// A pair for interface `near` whose peer goes nowhere.
    #[must_use]
    pub fn dangling(near: &str) -> Self {
        Self {
            peer_name: peer_name_for(near),
            far: None,
        }
    }

    /// A pair for interface `near` delivered to `far`.
    #[must_use]
    pub fn to(near: &str, far: FarEnd) -> Self {
        Self {
            peer_name: peer_name_for(near),
            far: Some(far),
        }
    }

    /// Context and device name the peer has once delivered.
    #[must_use]
    pub fn delivered(&self, near_ctx: &ExecContext) -> (ExecContext, String) {
        match &self.far {
            Some(far) => (far.ctx.clone(), far.interface.clone()),
            None => (near_ctx.clone(), self.peer_name.clone()),
        }
    }
}

/// Temporary peer name for near interface `name`, kept within
/// [`IFNAMSIZ`].
///
/// Short names just gain the suffix. Longer ones keep a prefix and a
/// digest of the whole name, so names sharing a long prefix still get
/// distinct peers.
#[must_use]
pub fn peer_name_for(name: &str) -> String {
    const SUFFIX: &str = ".p";
    const DIGEST_CHARS: usize = 6;
    if name.len() + SUFFIX.len() <= IFNAMSIZ {
        return format!("{name}{SUFFIX}");
    }
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    let keep = IFNAMSIZ - SUFFIX.len() - DIGEST_CHARS;
    let stem: String = name.chars().take(keep).collect();
    format!("{stem}{}{SUFFIX}", &digest[..DIGEST_CHARS])
}

/// Name of the 802.1Q sub-interface `id` of `parent`.
#[must_use]
pub fn vlan_name(parent: &str, id: u16) -> String {
    format!("{parent}.{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_names_fit_the_kernel_limit() {
        assert_eq!(peer_name_for("vzoo1eth0"), "vzoo1eth0.p");
        assert_eq!(peer_name_for("uplinkinterf0"), "uplinkinterf0.p");
        let long = peer_name_for("vcassandra1eth0");
        assert!(long.starts_with("vcassan"));
        assert!(long.ends_with(".p"));
        assert_eq!(long.len(), IFNAMSIZ);
        assert_eq!(long, peer_name_for("vcassandra1eth0"));
    }

    #[test]
    fn long_names_with_a_shared_prefix_get_distinct_peers() {
        let a = peer_name_for("uplinkinterfa0");
        let b = peer_name_for("uplinkinterfa1");
        assert_ne!(a, b);
        assert!(a.len() <= IFNAMSIZ && b.len() <= IFNAMSIZ);
    }

    #[test]
    fn delivered_location() {
        let near = ExecContext::Root;
        let dangling = VethPeer::dangling("veth0");
        assert_eq!(
            dangling.delivered(&near),
            (ExecContext::Root, "veth0.p".to_string())
        );

        let wired = VethPeer::to(
            "vzoo1eth0",
            FarEnd {
                host: "zoo1".into(),
                ctx: ExecContext::Netns("zoo1".into()),
                interface: "eth0".into(),
            },
        );
        assert_eq!(
            wired.delivered(&near),
            (ExecContext::Netns("zoo1".into()), "eth0".to_string())
        );
    }

    #[test]
    fn vlan_names() {
        assert_eq!(vlan_name("eth1", 100), "eth1.100");
    }
}
