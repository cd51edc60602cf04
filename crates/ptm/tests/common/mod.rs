//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use ptm::isolation::InProcessLauncher;
use ptm::services::ServiceOps;
use ptm::{PhysicalTopologyConfig, TopologyManager};
use ptm_common::{PtmError, PtmPaths, PtmResult, PtmSettings, RetryPolicy};
use ptm_network::sim::SimNet;
use ptm_network::{CommandOutput, ExecContext};

/// One root bridge and one Zookeeper host hanging off it.
pub const ZOO1: &str = r#"{
    "bridges": [{"name": "br0", "ip_list": [{"ip": "10.0.0.240", "subnet": "16"}]}],
    "zookeepers": [{"name": "zoo1", "bridge_link": {"name": "br0"},
                    "ip_list": [{"ip": "10.0.0.2", "subnet": "24"}]}],
    "host_start_order": ["root", "zoo1"]
}"#;

/// A small cluster: two Zookeepers started together, two Cassandras, a
/// compute node and a bare namespace host with an unwired interface.
pub const CLUSTER: &str = r#"{
    "bridges": [{"name": "br0", "ip_list": [{"ip": "10.0.0.240", "subnet": "16"}]}],
    "zookeepers": [
        {"name": "zoo1", "bridge_link": {"name": "br0"}, "ip_list": [{"ip": "10.0.0.2", "subnet": "16"}]},
        {"name": "zoo2", "bridge_link": {"name": "br0"}, "ip_list": [{"ip": "10.0.0.3", "subnet": "16"}]}
    ],
    "cassandras": [
        {"name": "cass1", "bridge_link": {"name": "br0"}, "ip_list": [{"ip": "10.0.0.5", "subnet": "16"}]},
        {"name": "cass2", "bridge_link": {"name": "br0"}, "ip_list": [{"ip": "10.0.0.6", "subnet": "16"}]}
    ],
    "computes": [
        {"name": "cmp1", "bridge_link": {"name": "br0"}, "ip_list": [{"ip": "10.0.0.8", "subnet": "16"}]}
    ],
    "hosts": [
        {"name": "edge", "interfaces": [
            {"name": "eth0", "ip_list": [{"ip": "192.168.10.1", "subnet": "24"}]}
        ]}
    ],
    "host_start_order": ["root", ["zoo1", "zoo2"], "cass1", "cass2", "cmp1", "edge"]
}"#;

/// A [`ServiceOps`] that plays the daemons against a [`SimNet`].
///
/// Init scripts toggle a per-context running set. Probes only succeed
/// when the daemon runs and the simulated network can deliver the packet
/// from the root context.
#[derive(Debug)]
pub struct ScriptedOps {
    net: Arc<SimNet>,
    paths: PtmPaths,
    pub commands: Mutex<Vec<String>>,
    pub files: Mutex<BTreeMap<PathBuf, String>>,
    pub mounts: Mutex<Vec<PathBuf>>,
    pub running: Mutex<BTreeSet<(String, String)>>,
    pub probes: Mutex<Vec<SocketAddr>>,
    /// Services (`zookeeper`) or host services (`zoo2/zookeeper`) whose
    /// init script succeeds without starting anything.
    pub hung: Mutex<BTreeSet<String>>,
}

impl ScriptedOps {
    pub fn new(net: Arc<SimNet>, paths: PtmPaths) -> Self {
        Self {
            net,
            paths,
            commands: Mutex::default(),
            files: Mutex::default(),
            mounts: Mutex::default(),
            running: Mutex::default(),
            probes: Mutex::default(),
            hung: Mutex::default(),
        }
    }

    pub fn file(&self, path: &Path) -> Option<String> {
        self.files.lock().get(path).cloned()
    }

    pub fn is_running(&self, service: &str) -> bool {
        self.running.lock().iter().any(|(_, s)| s == service)
    }

    fn is_hung(&self, host: &str, service: &str) -> bool {
        let hung = self.hung.lock();
        hung.contains(service) || hung.contains(&format!("{host}/{service}"))
    }

    /// Namespace host holding `ip` on one of its links.
    fn owner_of(&self, ip: IpAddr) -> Option<String> {
        self.net.namespaces().into_iter().find(|ns| {
            let ctx = ExecContext::Netns(ns.clone());
            self.net.links(&ctx).iter().any(|name| {
                self.net
                    .link(&ctx, name)
                    .is_some_and(|link| link.addresses.iter().any(|a| a.ip == ip))
            })
        })
    }

    fn refused(addr: SocketAddr) -> PtmError {
        PtmError::Socket {
            address: addr.to_string(),
            message: "connection refused".into(),
        }
    }

    fn midolman_started(&self, host: &str) {
        let log = self.paths.host_logs(host, "midolman").join("midolman.log");
        let pid = self.paths.host_run(host).join("midolman").join("midolman.pid");
        let mut files = self.files.lock();
        files.insert(log, "INFO Midolman fully started\n".into());
        files.insert(pid, "4242\n".into());
    }

    fn midolman_stopped(&self, host: &str) {
        let pid = self.paths.host_run(host).join("midolman").join("midolman.pid");
        self.files.lock().remove(&pid);
    }
}

#[async_trait]
impl ServiceOps for ScriptedOps {
    async fn run(&self, ctx: &ExecContext, argv: &[String]) -> PtmResult<CommandOutput> {
        self.commands.lock().push(format!("{ctx}: {}", argv.join(" ")));
        let host = ctx.netns().unwrap_or("root").to_string();

        match argv {
            [script, verb] if script.starts_with("/etc/init.d/") => {
                let service = script.trim_start_matches("/etc/init.d/").to_string();
                match verb.as_str() {
                    "start" if self.is_hung(&host, &service) => {}
                    "start" => {
                        if service == "midolman" {
                            self.midolman_started(&host);
                        }
                        self.running.lock().insert((host, service));
                    }
                    "stop" => {
                        if service == "midolman" {
                            self.midolman_stopped(&host);
                        }
                        self.running.lock().remove(&(host, service));
                    }
                    _ => {}
                }
                Ok(CommandOutput::ok())
            }
            [tool, _, ip, _] if tool == "nodetool" => {
                let up = self
                    .running
                    .lock()
                    .contains(&(host.clone(), "cassandra".to_string()));
                let reachable = ip
                    .parse()
                    .is_ok_and(|ip| self.net.reachable(&ExecContext::Root, ip));
                if up && reachable {
                    Ok(CommandOutput::with_stdout(format!(
                        "Datacenter: datacenter1\n--  Address  Load  Tokens  Owns\nUN  {ip}  1.2 MB  256  100%\n"
                    )))
                } else {
                    Ok(CommandOutput {
                        code: 1,
                        stdout: String::new(),
                        stderr: "Failed to connect".into(),
                    })
                }
            }
            _ => Ok(CommandOutput::ok()),
        }
    }

    async fn write_file(&self, path: &Path, contents: &str) -> PtmResult<()> {
        self.files
            .lock()
            .insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> PtmResult<Option<String>> {
        Ok(self.file(path))
    }

    async fn create_dir(&self, _path: &Path) -> PtmResult<()> {
        Ok(())
    }

    async fn bind_mount(&self, _source: &Path, target: &Path) -> PtmResult<()> {
        self.mounts.lock().push(target.to_path_buf());
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> PtmResult<()> {
        let mut mounts = self.mounts.lock();
        if let Some(pos) = mounts.iter().rposition(|m| m == target) {
            mounts.remove(pos);
        }
        Ok(())
    }

    async fn tcp_request(&self, addr: SocketAddr, request: &str) -> PtmResult<String> {
        self.probes.lock().push(addr);
        let zookeeper_up = self.owner_of(addr.ip()).is_some_and(|owner| {
            self.running
                .lock()
                .contains(&(owner, "zookeeper".to_string()))
        });
        if request == "ruok"
            && addr.port() == 2181
            && zookeeper_up
            && self.net.reachable(&ExecContext::Root, addr.ip())
        {
            return Ok("imok".into());
        }
        Err(Self::refused(addr))
    }

    async fn tcp_connect(&self, addr: SocketAddr) -> PtmResult<()> {
        self.probes.lock().push(addr);
        let api_up = self.is_running("midonet-cluster") || self.is_running("midonet-api");
        if api_up && self.net.reachable(&ExecContext::Root, addr.ip()) {
            return Ok(());
        }
        Err(Self::refused(addr))
    }
}

/// Everything a lifecycle test needs.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub net: Arc<SimNet>,
    pub ops: Arc<ScriptedOps>,
    pub settings: Arc<PtmSettings>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let settings = PtmSettings::default()
            .with_root(dir.path())
            .with_readiness(RetryPolicy::new(5, 10));
        let net = Arc::new(SimNet::new());
        let ops = Arc::new(ScriptedOps::new(net.clone(), settings.paths.clone()));
        Self {
            dir,
            net,
            ops,
            settings: Arc::new(settings),
        }
    }

    /// A manager on this harness's network and daemons.
    pub fn manager(&self) -> TopologyManager {
        TopologyManager::new(
            self.settings.clone(),
            self.net.clone(),
            self.ops.clone(),
            Arc::new(InProcessLauncher::new(self.ops.clone())),
        )
    }

    /// A manager configured with `json`.
    pub fn configured(&self, json: &str) -> TopologyManager {
        let mut manager = self.manager();
        manager
            .configure(&PhysicalTopologyConfig::from_json(json).unwrap())
            .unwrap();
        manager
    }

    pub fn paths(&self) -> &PtmPaths {
        &self.settings.paths
    }
}
