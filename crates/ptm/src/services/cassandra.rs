//! Cassandra.

use std::net::IpAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use ptm_common::PtmResult;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{ProcessControl, ServiceCtx, join_ips, wait_until};

const SERVICE: &str = "cassandra";

fn default_cluster_name() -> String {
    "midonet".to_string()
}

/// Cassandra ring member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CassandraConfig {
    /// Seed list: every ring member, in declaration order.
    #[serde(default)]
    pub cassandra_ips: Vec<IpAddr>,
    /// Fixed `initial_token`; vnodes when absent.
    #[serde(default)]
    pub init_token: Option<String>,
    /// Cluster name.
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
}

impl CassandraConfig {
    fn cassandra_yaml(&self, ip: IpAddr) -> String {
        let seeds = if self.cassandra_ips.is_empty() {
            ip.to_string()
        } else {
            join_ips(&self.cassandra_ips)
        };
        let tokens = match &self.init_token {
            Some(token) => format!("num_tokens: 1\ninitial_token: {token}\n"),
            None => "num_tokens: 256\n".to_string(),
        };

        format!(
            "cluster_name: '{cluster}'\n\
             {tokens}\
             seed_provider:\n  \
               - class_name: org.apache.cassandra.locator.SimpleSeedProvider\n    \
                 parameters:\n      \
                   - seeds: \"{seeds}\"\n\
             listen_address: {ip}\n\
             rpc_address: {ip}\n\
             data_file_directories:\n  \
               - /var/lib/cassandra/data\n\
             commitlog_directory: /var/lib/cassandra/commitlog\n\
             saved_caches_directory: /var/lib/cassandra/saved_caches\n\
             endpoint_snitch: SimpleSnitch\n",
            cluster = self.cluster_name,
        )
    }

    fn pid_file(cx: &ServiceCtx<'_>) -> PathBuf {
        cx.run_dir(SERVICE).join("cassandra.pid")
    }
}

#[async_trait]
impl ProcessControl for CassandraConfig {
    fn packages(&self) -> Vec<String> {
        vec![SERVICE.to_string(), "dsc22".to_string()]
    }

    fn bind_mounts(&self, cx: &ServiceCtx<'_>) -> Vec<(PathBuf, PathBuf)> {
        vec![
            (cx.config_dir(SERVICE), PathBuf::from("/etc/cassandra")),
            (cx.data_dir(SERVICE), PathBuf::from("/var/lib/cassandra")),
            (cx.log_dir(SERVICE), PathBuf::from("/var/log/cassandra")),
            (cx.run_dir(SERVICE), PathBuf::from("/var/run/cassandra")),
        ]
    }

    async fn prepare_config(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        let ip = cx.require_ip()?;
        let conf = cx.config_dir(SERVICE);

        cx.ops
            .write_file(&conf.join("cassandra.yaml"), &self.cassandra_yaml(ip))
            .await?;
        cx.ops
            .write_file(
                &conf.join("cassandra-env.sh"),
                &format!(
                    "MAX_HEAP_SIZE=\"128M\"\n\
                     HEAP_NEWSIZE=\"64M\"\n\
                     JVM_OPTS=\"$JVM_OPTS -Djava.rmi.server.hostname={ip}\"\n"
                ),
            )
            .await?;
        for dir in [cx.data_dir(SERVICE), cx.log_dir(SERVICE), cx.run_dir(SERVICE)] {
            cx.ops.create_dir(&dir).await?;
        }

        tracing::debug!(host = cx.host, seeds = self.cassandra_ips.len(), "Wrote cassandra config");
        Ok(())
    }

    async fn control_start(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        cx.init_script(SERVICE, "start").await
    }

    async fn wait_for_process_start(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        wait_until(self, cx, "cassandra start", true).await
    }

    async fn control_stop(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        cx.init_script_stop(SERVICE).await
    }

    async fn wait_for_process_stop(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        let pid_file = Self::pid_file(cx);
        let pid_file = &pid_file;
        cx.readiness
            .poll(cx.host, "cassandra stop", || async move {
                Ok(cx.ops.read_file(pid_file).await?.is_none())
            })
            .await
    }

    /// The node reports itself Up/Normal in `nodetool status`.
    async fn status(&self, cx: &ServiceCtx<'_>) -> bool {
        let Some(ip) = cx.ip else {
            return false;
        };
        let ip = ip.to_string();
        let Ok(output) = cx.run(&["nodetool", "-h", &ip, "status"]).await else {
            return false;
        };
        Regex::new(&format!(r"(?m)^UN\s+{}\s", regex::escape(&ip)))
            .is_ok_and(|re| re.is_match(&output.stdout))
    }
}
