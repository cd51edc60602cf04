//! Network namespace operations.

use ptm_common::PtmResult;

use crate::exec::ExecContext;
use crate::ops::{LinkState, NetOps, ignore_not_found};

/// Create namespace `name` unless it already exists.
///
/// Returns `true` when a namespace was created.
pub async fn ensure_netns(net: &dyn NetOps, name: &str) -> PtmResult<bool> {
    if net.netns_exists(name).await? {
        tracing::debug!(name, "Reusing existing network namespace");
        return Ok(false);
    }
    tracing::debug!(name, "Creating network namespace");
    net.create_netns(name).await?;
    Ok(true)
}

/// Delete namespace `name`, ignoring a missing one.
pub async fn remove_netns(net: &dyn NetOps, name: &str) -> PtmResult<()> {
    tracing::debug!(name, "Deleting network namespace");
    ignore_not_found(net.delete_netns(name).await)
}

/// Bring up the loopback device of `ctx`.
pub async fn loopback_up(net: &dyn NetOps, ctx: &ExecContext) -> PtmResult<()> {
    net.set_link_state(ctx, "lo", LinkState::Up).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimNet;

    #[tokio::test]
    async fn ensure_and_remove_are_idempotent() {
        let net = SimNet::new();
        assert!(ensure_netns(&net, "zoo1").await.unwrap());
        assert!(!ensure_netns(&net, "zoo1").await.unwrap());

        let ctx = ExecContext::Netns("zoo1".into());
        loopback_up(&net, &ctx).await.unwrap();
        assert_eq!(net.link(&ctx, "lo").unwrap().state, LinkState::Up);

        remove_netns(&net, "zoo1").await.unwrap();
        remove_netns(&net, "zoo1").await.unwrap();
        assert!(net.namespaces().is_empty());
    }
}
