//! Quagga BGP router.

use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use ptm_common::{PtmError, PtmResult};
use serde::{Deserialize, Serialize};

use super::{ProcessControl, ServiceCtx, report_status, unknown_verb};

const SERVICE: &str = "quagga";
const DAEMONS: [&str; 2] = ["zebra", "bgpd"];

fn default_asn() -> u32 {
    64512
}

/// A BGP session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BgpNeighbor {
    /// Neighbor address.
    pub ip: IpAddr,
    /// Neighbor AS.
    pub asn: u32,
}

/// Router running zebra and bgpd.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Local AS.
    #[serde(default = "default_asn")]
    pub asn: u32,
    /// BGP router id; the first port address by default.
    #[serde(default)]
    pub router_id: Option<IpAddr>,
    /// Configured sessions.
    #[serde(default)]
    pub neighbors: Vec<BgpNeighbor>,
}

impl RouterConfig {
    fn zebra_conf(host: &str) -> String {
        format!("hostname {host}\npassword zebra\nlog file /var/log/quagga/zebra.log\n")
    }

    fn bgpd_conf(&self, host: &str) -> String {
        let mut conf = format!("hostname {host}\npassword zebra\nrouter bgp {}\n", self.asn);
        if let Some(id) = self.router_id {
            let _ = writeln!(conf, " bgp router-id {id}");
        }
        for neighbor in &self.neighbors {
            let _ = writeln!(conf, " neighbor {} remote-as {}", neighbor.ip, neighbor.asn);
        }
        conf.push_str("!\nlog file /var/log/quagga/bgpd.log\n");
        conf
    }

    fn pid_file(cx: &ServiceCtx<'_>, daemon: &str) -> PathBuf {
        cx.run_dir(SERVICE).join(format!("{daemon}.pid"))
    }

    /// Pids of the daemons that left a pid file behind.
    async fn pids(cx: &ServiceCtx<'_>) -> PtmResult<Vec<(&'static str, String)>> {
        let mut pids = Vec::new();
        for daemon in DAEMONS {
            if let Some(pid) = cx.ops.read_file(&Self::pid_file(cx, daemon)).await? {
                pids.push((daemon, pid.trim().to_string()));
            }
        }
        Ok(pids)
    }

    async fn add_neighbor(&self, cx: &ServiceCtx<'_>, args: &[String]) -> PtmResult<()> {
        let [ip, asn] = args else {
            return Err(PtmError::ArgumentMismatch {
                message: "add_neighbor takes <ip> <asn>".to_string(),
            });
        };
        let neighbor = BgpNeighbor {
            ip: ip.parse().map_err(|e| PtmError::ArgumentMismatch {
                message: format!("bad neighbor address '{ip}': {e}"),
            })?,
            asn: asn.parse().map_err(|e| PtmError::ArgumentMismatch {
                message: format!("bad neighbor AS '{asn}': {e}"),
            })?,
        };

        let mut updated = self.clone();
        updated.neighbors.retain(|n| n.ip != neighbor.ip);
        updated.neighbors.push(neighbor.clone());
        cx.ops
            .write_file(
                &cx.config_dir(SERVICE).join("bgpd.conf"),
                &updated.bgpd_conf(cx.host),
            )
            .await?;

        let router = format!("router bgp {}", self.asn);
        let session = format!("neighbor {} remote-as {}", neighbor.ip, neighbor.asn);
        cx.run(&["vtysh", "-c", "configure terminal", "-c", &router, "-c", &session])
            .await?;
        tracing::info!(host = cx.host, neighbor = %neighbor.ip, asn = neighbor.asn, "Added BGP neighbor");
        Ok(())
    }
}

#[async_trait]
impl ProcessControl for RouterConfig {
    fn packages(&self) -> Vec<String> {
        vec![SERVICE.to_string()]
    }

    fn bind_mounts(&self, cx: &ServiceCtx<'_>) -> Vec<(PathBuf, PathBuf)> {
        vec![
            (cx.config_dir(SERVICE), PathBuf::from("/etc/quagga")),
            (cx.log_dir(SERVICE), PathBuf::from("/var/log/quagga")),
            (cx.run_dir(SERVICE), PathBuf::from("/var/run/quagga")),
        ]
    }

    async fn prepare_config(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        let conf = cx.config_dir(SERVICE);
        cx.ops
            .write_file(&conf.join("zebra.conf"), &Self::zebra_conf(cx.host))
            .await?;
        cx.ops
            .write_file(&conf.join("bgpd.conf"), &self.bgpd_conf(cx.host))
            .await?;
        cx.ops.create_dir(&cx.log_dir(SERVICE)).await?;
        cx.ops.create_dir(&cx.run_dir(SERVICE)).await?;
        Ok(())
    }

    async fn control_start(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        for daemon in DAEMONS {
            let conf = format!("/etc/quagga/{daemon}.conf");
            let pid = format!("/var/run/quagga/{daemon}.pid");
            cx.run(&[daemon, "-d", "-f", &conf, "-i", &pid]).await?;
        }
        Ok(())
    }

    async fn wait_for_process_start(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        cx.readiness
            .poll(cx.host, "quagga start", || async move {
                Ok(Self::pids(cx).await?.len() == DAEMONS.len())
            })
            .await
    }

    async fn control_stop(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        for (daemon, pid) in Self::pids(cx).await? {
            if let Err(e) = cx.run(&["kill", &pid]).await {
                tracing::warn!(host = cx.host, daemon, pid, error = %e, "Kill failed");
            }
        }
        Ok(())
    }

    async fn wait_for_process_stop(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        cx.readiness
            .poll(cx.host, "quagga stop", || async move {
                for (_, pid) in Self::pids(cx).await? {
                    if cx.run(&["kill", "-0", &pid]).await.is_ok() {
                        return Ok(false);
                    }
                }
                Ok(true)
            })
            .await
    }

    async fn status(&self, cx: &ServiceCtx<'_>) -> bool {
        Self::pids(cx)
            .await
            .is_ok_and(|pids| pids.len() == DAEMONS.len())
    }

    async fn control(&self, cx: &ServiceCtx<'_>, verb: &str, args: &[String]) -> PtmResult<()> {
        match verb {
            "add_neighbor" => self.add_neighbor(cx, args).await,
            "status" => report_status(cx, self.status(cx).await),
            _ => Err(unknown_verb(verb)),
        }
    }
}
