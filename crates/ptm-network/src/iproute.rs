//! `NetOps` backend built on the iproute2 `ip` tool.

use std::net::IpAddr;

use async_trait::async_trait;
use ptm_common::{PtmError, PtmResult};

use crate::addr::IpDef;
use crate::exec::{CommandOutput, CommandRunner, ExecContext, SystemRunner};
use crate::ops::{LinkState, NetOps};

/// Drives the kernel through `ip` command lines.
///
/// Namespaced operations use `ip -n <ns>`, so the runner itself always
/// executes in the root context.
#[derive(Debug, Clone, Default)]
pub struct IpRoute2<R: CommandRunner = SystemRunner> {
    runner: R,
}

impl IpRoute2<SystemRunner> {
    /// Backend that spawns real `ip` processes.
    #[must_use]
    pub fn system() -> Self {
        Self::new(SystemRunner)
    }
}

impl<R: CommandRunner> IpRoute2<R> {
    /// Create a backend on top of `runner`.
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    /// The `ip` argv for `ctx`.
    fn ip(ctx: &ExecContext, parts: &[&str]) -> Vec<String> {
        let mut argv = vec!["ip".to_string()];
        if let Some(ns) = ctx.netns() {
            argv.push("-n".to_string());
            argv.push(ns.to_string());
        }
        argv.extend(parts.iter().map(ToString::to_string));
        argv
    }

    /// Run an `ip` command, mapping well-known failures to typed errors.
    async fn exec(&self, ctx: &ExecContext, parts: &[&str], link: Option<&str>) -> PtmResult<CommandOutput> {
        let argv = Self::ip(ctx, parts);
        let output = self.runner.run(&ExecContext::Root, &argv).await?;
        if output.success() {
            return Ok(output);
        }

        let stderr = output.stderr.as_str();
        if stderr.contains("Cannot open network namespace") {
            return Err(PtmError::NamespaceNotFound {
                name: ctx.netns().unwrap_or_default().to_string(),
            });
        }
        if let Some(link) = link {
            if stderr.contains("Cannot find device") || stderr.contains("does not exist") {
                return Err(PtmError::LinkNotFound {
                    name: link.to_string(),
                    context: ctx.to_string(),
                });
            }
        }
        output.check(&argv)
    }
}

fn already_exists(err: &PtmError) -> bool {
    match err {
        PtmError::CommandFailed { stderr, .. } => {
            stderr.contains("File exists") || stderr.contains("already assigned")
        }
        _ => false,
    }
}

#[async_trait]
impl<R: CommandRunner> NetOps for IpRoute2<R> {
    async fn create_netns(&self, name: &str) -> PtmResult<()> {
        tracing::debug!(name, "Creating network namespace");
        self.exec(&ExecContext::Root, &["netns", "add", name], None)
            .await?;
        Ok(())
    }

    async fn delete_netns(&self, name: &str) -> PtmResult<()> {
        tracing::debug!(name, "Deleting network namespace");
        match self
            .exec(&ExecContext::Root, &["netns", "delete", name], None)
            .await
        {
            Err(PtmError::CommandFailed { stderr, .. }) if stderr.contains("No such file") => {
                Err(PtmError::NamespaceNotFound {
                    name: name.to_string(),
                })
            }
            other => other.map(|_| ()),
        }
    }

    async fn netns_exists(&self, name: &str) -> PtmResult<bool> {
        let output = self
            .exec(&ExecContext::Root, &["netns", "list"], None)
            .await?;
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .any(|ns| ns == name))
    }

    async fn link_exists(&self, ctx: &ExecContext, name: &str) -> PtmResult<bool> {
        match self.exec(ctx, &["link", "show", "dev", name], Some(name)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn add_veth(&self, ctx: &ExecContext, name: &str, peer: &str) -> PtmResult<()> {
        tracing::debug!(%ctx, name, peer, "Creating veth pair");
        self.exec(
            ctx,
            &["link", "add", name, "type", "veth", "peer", "name", peer],
            None,
        )
        .await?;
        Ok(())
    }

    async fn add_bridge(&self, ctx: &ExecContext, name: &str) -> PtmResult<()> {
        tracing::debug!(%ctx, name, "Creating bridge");
        self.exec(ctx, &["link", "add", "name", name, "type", "bridge"], None)
            .await?;
        Ok(())
    }

    async fn set_bridge_stp(&self, ctx: &ExecContext, name: &str, enabled: bool) -> PtmResult<()> {
        let stp = if enabled { "1" } else { "0" };
        self.exec(
            ctx,
            &["link", "set", "dev", name, "type", "bridge", "stp_state", stp],
            Some(name),
        )
        .await?;
        Ok(())
    }

    async fn add_vlan(
        &self,
        ctx: &ExecContext,
        parent: &str,
        name: &str,
        id: u16,
    ) -> PtmResult<()> {
        tracing::debug!(%ctx, parent, name, id, "Creating VLAN interface");
        let id = id.to_string();
        self.exec(
            ctx,
            &["link", "add", "link", parent, "name", name, "type", "vlan", "id", &id],
            Some(parent),
        )
        .await?;
        Ok(())
    }

    async fn set_link_netns(
        &self,
        ctx: &ExecContext,
        name: &str,
        target: &ExecContext,
    ) -> PtmResult<()> {
        tracing::debug!(%ctx, name, %target, "Moving link");
        // PID 1 lives in the root network namespace.
        let target = target.netns().unwrap_or("1");
        self.exec(ctx, &["link", "set", "dev", name, "netns", target], Some(name))
            .await?;
        Ok(())
    }

    async fn rename_link(&self, ctx: &ExecContext, name: &str, new_name: &str) -> PtmResult<()> {
        self.exec(ctx, &["link", "set", "dev", name, "name", new_name], Some(name))
            .await?;
        Ok(())
    }

    async fn set_link_state(
        &self,
        ctx: &ExecContext,
        name: &str,
        state: LinkState,
    ) -> PtmResult<()> {
        self.exec(ctx, &["link", "set", "dev", name, state.as_str()], Some(name))
            .await?;
        Ok(())
    }

    async fn set_link_mac(&self, ctx: &ExecContext, name: &str, mac: &str) -> PtmResult<()> {
        self.exec(ctx, &["link", "set", "dev", name, "address", mac], Some(name))
            .await?;
        Ok(())
    }

    async fn add_address(&self, ctx: &ExecContext, name: &str, addr: &IpDef) -> PtmResult<()> {
        let addr = addr.to_string();
        match self
            .exec(ctx, &["addr", "add", &addr, "dev", name], Some(name))
            .await
        {
            Err(e) if already_exists(&e) => {
                tracing::debug!(%ctx, name, addr, "Address already assigned");
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    async fn set_master(&self, ctx: &ExecContext, name: &str, bridge: &str) -> PtmResult<()> {
        self.exec(ctx, &["link", "set", "dev", name, "master", bridge], Some(name))
            .await?;
        Ok(())
    }

    async fn set_nomaster(&self, ctx: &ExecContext, name: &str) -> PtmResult<()> {
        self.exec(ctx, &["link", "set", "dev", name, "nomaster"], Some(name))
            .await?;
        Ok(())
    }

    async fn delete_link(&self, ctx: &ExecContext, name: &str) -> PtmResult<()> {
        tracing::debug!(%ctx, name, "Deleting link");
        self.exec(ctx, &["link", "delete", "dev", name], Some(name))
            .await?;
        Ok(())
    }

    async fn add_default_route(&self, ctx: &ExecContext, gateway: IpAddr) -> PtmResult<()> {
        tracing::debug!(%ctx, %gateway, "Setting default route");
        let gateway = gateway.to_string();
        self.exec(ctx, &["route", "replace", "default", "via", &gateway], None)
            .await?;
        Ok(())
    }
}
