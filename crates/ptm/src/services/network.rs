//! API / cluster node.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use async_trait::async_trait;
use ptm_common::PtmResult;
use serde::{Deserialize, Serialize};

use super::{ProcessControl, ServiceCtx, join_ips, join_with_port, wait_until};

const CLUSTER: &str = "midonet-cluster";

fn default_service() -> String {
    CLUSTER.to_string()
}

fn default_port() -> u16 {
    8181
}

/// Node serving the REST API, either the cluster daemon (5.x and later)
/// or the standalone API webapp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Init script name: `midonet-cluster` or `midonet-api`.
    #[serde(default = "default_service")]
    pub service: String,
    /// Advertised API URL.
    #[serde(default)]
    pub api_url: String,
    /// Zookeeper ensemble.
    #[serde(default)]
    pub zookeeper_ips: Vec<IpAddr>,
    /// Cassandra ring.
    #[serde(default)]
    pub cassandra_ips: Vec<IpAddr>,
    /// API listen port.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl NetworkConfig {
    fn is_cluster(&self) -> bool {
        self.service == CLUSTER
    }

    fn config_file(&self) -> (&'static str, String) {
        let zk = join_with_port(&self.zookeeper_ips, 2181);
        let cass = join_ips(&self.cassandra_ips);
        if self.is_cluster() {
            (
                "midonet.conf",
                format!(
                    "[zookeeper]\n\
                     zookeeper_hosts = {zk}\n\
                     root_key = /midonet/v1\n\
                     \n\
                     [cassandra]\n\
                     servers = {cass}\n\
                     \n\
                     [rest_api]\n\
                     http_port = {port}\n\
                     api_url = {url}\n",
                    port = self.port,
                    url = self.api_url,
                ),
            )
        } else {
            (
                "web.xml.properties",
                format!(
                    "rest_api-base_uri={url}\n\
                     zookeeper-zookeeper_hosts={zk}\n\
                     zookeeper-midolman_root_key=/midonet/v1\n\
                     cassandra-servers={cass}\n\
                     auth-auth_provider=org.midonet.api.auth.MockAuthService\n",
                    url = self.api_url,
                ),
            )
        }
    }
}

#[async_trait]
impl ProcessControl for NetworkConfig {
    fn packages(&self) -> Vec<String> {
        vec![self.service.clone()]
    }

    fn bind_mounts(&self, cx: &ServiceCtx<'_>) -> Vec<(PathBuf, PathBuf)> {
        vec![
            (
                cx.config_dir(&self.service),
                PathBuf::from(format!("/etc/{}", self.service)),
            ),
            (
                cx.log_dir(&self.service),
                PathBuf::from(format!("/var/log/{}", self.service)),
            ),
        ]
    }

    async fn prepare_config(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        let (name, contents) = self.config_file();
        cx.ops
            .write_file(&cx.config_dir(&self.service).join(name), &contents)
            .await?;
        cx.ops.create_dir(&cx.log_dir(&self.service)).await?;
        tracing::debug!(host = cx.host, service = %self.service, "Wrote API config");
        Ok(())
    }

    async fn control_start(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        cx.init_script(&self.service, "start").await
    }

    async fn wait_for_process_start(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        wait_until(self, cx, "api start", true).await
    }

    async fn control_stop(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        cx.init_script_stop(&self.service).await
    }

    async fn wait_for_process_stop(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        wait_until(self, cx, "api stop", false).await
    }

    /// The API port accepts connections.
    async fn status(&self, cx: &ServiceCtx<'_>) -> bool {
        let Some(ip) = cx.ip else {
            return false;
        };
        cx.ops
            .tcp_connect(SocketAddr::new(ip, self.port))
            .await
            .is_ok()
    }
}
