//! Network agent (midolman).

use std::net::IpAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use ptm_common::PtmResult;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ProcessControl, ServiceCtx, join_ips, join_with_port, report_status, unknown_verb};

const SERVICE: &str = "midolman";
const STARTED_MARKER: &str = "Midolman fully started";

/// Compute host running the network agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeConfig {
    /// Zookeeper ensemble.
    #[serde(default)]
    pub zookeeper_ips: Vec<IpAddr>,
    /// Cassandra ring.
    #[serde(default)]
    pub cassandra_ips: Vec<IpAddr>,
    /// Agent host id; random when not given.
    #[serde(default = "Uuid::new_v4")]
    pub host_uuid: Uuid,
}

impl ComputeConfig {
    fn midolman_conf(&self) -> String {
        format!(
            "[zookeeper]\n\
             zookeeper_hosts = {zk}\n\
             session_timeout = 30000\n\
             root_key = /midonet/v1\n\
             \n\
             [cassandra]\n\
             servers = {cass}\n\
             replication_factor = 1\n\
             cluster = midonet\n\
             \n\
             [midolman]\n\
             bgp_keepalive = 1\n\
             bgp_holdtime = 3\n\
             bgp_connect_retry = 1\n",
            zk = join_with_port(&self.zookeeper_ips, 2181),
            cass = join_ips(&self.cassandra_ips),
        )
    }

    fn log_file(cx: &ServiceCtx<'_>) -> PathBuf {
        cx.log_dir(SERVICE).join("midolman.log")
    }

    fn pid_file(cx: &ServiceCtx<'_>) -> PathBuf {
        cx.run_dir(SERVICE).join("midolman.pid")
    }

    async fn restart(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        self.control_stop(cx).await?;
        self.wait_for_process_stop(cx).await?;
        cx.ops.write_file(&Self::log_file(cx), "").await?;
        self.control_start(cx).await?;
        self.wait_for_process_start(cx).await
    }
}

#[async_trait]
impl ProcessControl for ComputeConfig {
    fn packages(&self) -> Vec<String> {
        vec![SERVICE.to_string()]
    }

    fn bind_mounts(&self, cx: &ServiceCtx<'_>) -> Vec<(PathBuf, PathBuf)> {
        vec![
            (cx.config_dir(SERVICE), PathBuf::from("/etc/midolman")),
            (cx.log_dir(SERVICE), PathBuf::from("/var/log/midolman")),
            (cx.run_dir(SERVICE), PathBuf::from("/var/run/midolman")),
        ]
    }

    async fn prepare_config(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        let conf = cx.config_dir(SERVICE);

        cx.ops
            .write_file(&conf.join("midolman.conf"), &self.midolman_conf())
            .await?;
        cx.ops
            .write_file(
                &conf.join("host_uuid.properties"),
                &format!("host_uuid={}\n", self.host_uuid),
            )
            .await?;
        cx.ops.create_dir(&cx.run_dir(SERVICE)).await?;
        // A stale log would satisfy the start probe.
        cx.ops.write_file(&Self::log_file(cx), "").await?;

        tracing::debug!(host = cx.host, uuid = %self.host_uuid, "Wrote midolman config");
        Ok(())
    }

    async fn control_start(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        cx.init_script(SERVICE, "start").await
    }

    async fn wait_for_process_start(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        let log = Self::log_file(cx);
        let log = &log;
        cx.readiness
            .poll(cx.host, "midolman start", || async move {
                Ok(cx
                    .ops
                    .read_file(log)
                    .await?
                    .is_some_and(|text| text.contains(STARTED_MARKER)))
            })
            .await
    }

    async fn control_stop(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        cx.init_script_stop(SERVICE).await
    }

    async fn wait_for_process_stop(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        let pid = Self::pid_file(cx);
        let pid = &pid;
        cx.readiness
            .poll(cx.host, "midolman stop", || async move {
                Ok(cx.ops.read_file(pid).await?.is_none())
            })
            .await
    }

    async fn status(&self, cx: &ServiceCtx<'_>) -> bool {
        matches!(cx.ops.read_file(&Self::pid_file(cx)).await, Ok(Some(_)))
    }

    async fn control(&self, cx: &ServiceCtx<'_>, verb: &str, _args: &[String]) -> PtmResult<()> {
        match verb {
            "restart" => self.restart(cx).await,
            "status" => report_status(cx, self.status(cx).await),
            _ => Err(unknown_verb(verb)),
        }
    }
}
