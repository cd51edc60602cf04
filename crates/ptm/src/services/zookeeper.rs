//! Zookeeper.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use async_trait::async_trait;
use ptm_common::PtmResult;
use serde::{Deserialize, Serialize};

use super::{ProcessControl, ServiceCtx, wait_until};

const SERVICE: &str = "zookeeper";

fn default_client_port() -> u16 {
    2181
}

/// Zookeeper ensemble member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZookeeperConfig {
    /// `myid`, 1-based position in the ensemble.
    pub id: usize,
    /// Every ensemble member, in declaration order.
    #[serde(default)]
    pub zookeeper_ips: Vec<IpAddr>,
    /// Client port.
    #[serde(default = "default_client_port")]
    pub client_port: u16,
}

impl ZookeeperConfig {
    fn zoo_cfg(&self, ip: IpAddr) -> String {
        let mut cfg = format!(
            "tickTime=2000\n\
             initLimit=10\n\
             syncLimit=5\n\
             dataDir=/var/lib/zookeeper\n\
             clientPort={port}\n\
             clientPortAddress={ip}\n\
             4lw.commands.whitelist=*\n",
            port = self.client_port,
        );

        if self.zookeeper_ips.is_empty() {
            cfg.push_str(&format!("server.{}={ip}:2888:3888\n", self.id));
        }
        for (i, server) in self.zookeeper_ips.iter().enumerate() {
            cfg.push_str(&format!("server.{}={server}:2888:3888\n", i + 1));
        }
        cfg
    }
}

#[async_trait]
impl ProcessControl for ZookeeperConfig {
    fn packages(&self) -> Vec<String> {
        vec![SERVICE.to_string()]
    }

    fn bind_mounts(&self, cx: &ServiceCtx<'_>) -> Vec<(PathBuf, PathBuf)> {
        vec![
            (cx.config_dir(SERVICE), PathBuf::from("/etc/zookeeper/conf")),
            (cx.data_dir(SERVICE), PathBuf::from("/var/lib/zookeeper")),
            (cx.log_dir(SERVICE), PathBuf::from("/var/log/zookeeper")),
        ]
    }

    async fn prepare_config(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        let ip = cx.require_ip()?;
        let conf = cx.config_dir(SERVICE);
        let data = cx.data_dir(SERVICE);

        cx.ops
            .write_file(&conf.join("zoo.cfg"), &self.zoo_cfg(ip))
            .await?;
        cx.ops
            .write_file(
                &conf.join("environment"),
                "NAME=zookeeper\n\
                 ZOOCFGDIR=/etc/zookeeper/conf\n\
                 ZOO_LOG_DIR=/var/log/zookeeper\n\
                 JVMFLAGS=\"-Djava.net.preferIPv4Stack=true\"\n",
            )
            .await?;
        cx.ops
            .write_file(&data.join("myid"), &format!("{}\n", self.id))
            .await?;
        cx.ops.create_dir(&cx.log_dir(SERVICE)).await?;

        tracing::debug!(host = cx.host, id = self.id, "Wrote zookeeper config");
        Ok(())
    }

    async fn control_start(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        cx.init_script(SERVICE, "start").await
    }

    async fn wait_for_process_start(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        wait_until(self, cx, "zookeeper start", true).await
    }

    async fn control_stop(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        cx.init_script_stop(SERVICE).await
    }

    async fn wait_for_process_stop(&self, cx: &ServiceCtx<'_>) -> PtmResult<()> {
        wait_until(self, cx, "zookeeper stop", false).await
    }

    async fn status(&self, cx: &ServiceCtx<'_>) -> bool {
        let Some(ip) = cx.ip else {
            return false;
        };
        match cx
            .ops
            .tcp_request(SocketAddr::new(ip, self.client_port), "ruok")
            .await
        {
            Ok(reply) => reply.trim() == "imok",
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use ptm_common::{PtmError, PtmPaths};
    use ptm_network::ExecContext;

    use super::super::testing::{FakeOps, cx};
    use super::*;

    fn config() -> ZookeeperConfig {
        ZookeeperConfig {
            id: 2,
            zookeeper_ips: vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()],
            client_port: 2181,
        }
    }

    #[tokio::test]
    async fn writes_ensemble_config() {
        let ops = FakeOps::default();
        let paths = PtmPaths::with_root("/run/ptm");
        let ctx = ExecContext::Netns("zoo2".into());
        let cx = cx("zoo2", &ctx, &paths, &ops);

        config().prepare_config(&cx).await.unwrap();

        let cfg = ops
            .file(Path::new("/run/ptm/zoo2/etc/zookeeper/zoo.cfg"))
            .unwrap();
        assert!(cfg.contains("server.1=10.0.0.1:2888:3888\n"));
        assert!(cfg.contains("server.2=10.0.0.2:2888:3888\n"));
        assert!(cfg.contains("4lw.commands.whitelist=*"));
        assert!(cfg.contains("clientPortAddress=10.0.0.2"));
        assert_eq!(
            ops.file(Path::new("/run/ptm/zoo2/var/lib/zookeeper/myid"))
                .as_deref(),
            Some("2\n")
        );
    }

    #[tokio::test]
    async fn start_and_stop_wait_on_ruok() {
        let ops = FakeOps::default();
        let paths = PtmPaths::with_root("/run/ptm");
        let ctx = ExecContext::Netns("zoo2".into());
        let cx = cx("zoo2", &ctx, &paths, &ops);
        let zk = config();

        assert!(!zk.status(&cx).await);
        zk.control_start(&cx).await.unwrap();
        zk.wait_for_process_start(&cx).await.unwrap();
        assert!(zk.status(&cx).await);

        zk.control_stop(&cx).await.unwrap();
        zk.wait_for_process_stop(&cx).await.unwrap();
        assert_eq!(
            ops.commands.lock().as_slice(),
            [
                "netns:zoo2: /etc/init.d/zookeeper start",
                "netns:zoo2: /etc/init.d/zookeeper stop"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn start_times_out_when_never_ready() {
        let ops = FakeOps::default();
        let paths = PtmPaths::with_root("/run/ptm");
        let ctx = ExecContext::Netns("zoo2".into());
        let cx = cx("zoo2", &ctx, &paths, &ops);

        let err = config().wait_for_process_start(&cx).await.unwrap_err();
        assert!(
            matches!(err, PtmError::Timeout { ref host, ref operation } if host == "zoo2" && operation == "zookeeper start")
        );
    }

    #[tokio::test]
    async fn environment_is_mounted_and_released() {
        let ops = FakeOps::default();
        let paths = PtmPaths::with_root("/run/ptm");
        let ctx = ExecContext::Netns("zoo2".into());
        let cx = cx("zoo2", &ctx, &paths, &ops);
        let zk = config();

        zk.prepare_environment(&cx).await.unwrap();
        assert_eq!(ops.mounts.lock().len(), 3);
        zk.cleanup_environment(&cx).await.unwrap();
        assert!(ops.mounts.lock().is_empty());
    }
}
