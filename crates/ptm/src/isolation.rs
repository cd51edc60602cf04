#![allow(unsafe_code)]
//! Isolation boundary for per-host process control.
//!
//! Starting or stopping a daemon happens in a child process with its own
//! mount and UTS namespaces, so the bind mounts a service sets up and the
//! hostname it sees belong to that host alone. The child gets the host's
//! [`HostSnapshot`] on its command line and reports back only through its
//! exit code.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use ptm_common::{PtmError, PtmResult};

use crate::host::{Host, HostSnapshot};
use crate::services::ServiceOps;

/// Exit code for a successful control command.
pub const EXIT_OK: i32 = 0;
/// Exit code for a failed control command.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code for bad arguments or an unreadable snapshot.
pub const EXIT_USAGE: i32 = 2;

/// One invocation of the control child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    /// Host the command is for; also the child's hostname.
    pub host: String,
    /// `start`, `stop` or a service verb.
    pub command: String,
    /// Serialized [`HostSnapshot`].
    pub snapshot: String,
    /// Where the child writes its log.
    pub log_dir: PathBuf,
    /// Extra verb arguments.
    pub args: Vec<String>,
}

impl ControlRequest {
    /// Command line for the control binary.
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![
            "-c".to_string(),
            self.command.clone(),
            "-j".to_string(),
            self.snapshot.clone(),
            "-l".to_string(),
            self.log_dir.display().to_string(),
        ];
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// Runs a [`ControlRequest`] and returns the exit code.
#[async_trait]
pub trait ControlLauncher: Send + Sync + fmt::Debug {
    /// Launch and wait.
    async fn launch(&self, request: &ControlRequest) -> PtmResult<i32>;
}

/// Re-executes the control binary in fresh mount and UTS namespaces.
#[derive(Debug, Clone)]
pub struct UnshareLauncher {
    binary: PathBuf,
}

impl UnshareLauncher {
    /// Launch `binary`. A bare name is looked up next to the running
    /// executable first, then on `PATH`.
    #[must_use]
    pub fn new(binary: &Path) -> Self {
        Self {
            binary: resolve_binary(binary),
        }
    }

    /// The binary that will be run.
    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

fn resolve_binary(binary: &Path) -> PathBuf {
    if binary.is_absolute() {
        return binary.to_path_buf();
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(binary)))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| binary.to_path_buf())
}

/// Runs in the forked child before exec.
#[cfg(target_os = "linux")]
fn isolate(hostname: &str) -> io::Result<()> {
    use rustix::mount::{MountPropagationFlags, mount_change};
    use rustix::thread::{UnshareFlags, unshare_unsafe};

    // Safety: called between fork and exec in a single-threaded child.
    unsafe { unshare_unsafe(UnshareFlags::NEWNS | UnshareFlags::NEWUTS)? };
    mount_change("/", MountPropagationFlags::PRIVATE | MountPropagationFlags::REC)?;
    rustix::system::sethostname(hostname.as_bytes())?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn isolate(_hostname: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "namespace isolation needs Linux",
    ))
}

#[async_trait]
impl ControlLauncher for UnshareLauncher {
    async fn launch(&self, request: &ControlRequest) -> PtmResult<i32> {
        tracing::debug!(
            host = %request.host,
            command = %request.command,
            binary = %self.binary.display(),
            "Launching host control"
        );

        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(request.argv())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let hostname = request.host.clone();
        // Safety: `isolate` only issues async-signal-safe syscalls.
        unsafe {
            cmd.pre_exec(move || isolate(&hostname));
        }

        let status = cmd.status().await?;
        Ok(status.code().unwrap_or(-1))
    }
}

/// Runs the control logic in this process. Used by tests and dry runs,
/// where no isolation is wanted.
#[derive(Debug, Clone)]
pub struct InProcessLauncher {
    ops: Arc<dyn ServiceOps>,
}

impl InProcessLauncher {
    /// Drive services through `ops`.
    #[must_use]
    pub fn new(ops: Arc<dyn ServiceOps>) -> Self {
        Self { ops }
    }
}

#[async_trait]
impl ControlLauncher for InProcessLauncher {
    async fn launch(&self, request: &ControlRequest) -> PtmResult<i32> {
        let result = match HostSnapshot::from_json(&request.snapshot) {
            Ok(snapshot) => {
                run_host_control(&request.command, &snapshot, &request.args, self.ops.as_ref())
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            tracing::warn!(host = %request.host, command = %request.command, error = %e, "Host control failed");
        }
        Ok(exit_code(&result))
    }
}

/// Exit code the control child reports for `result`.
#[must_use]
pub fn exit_code(result: &PtmResult<()>) -> i32 {
    match result {
        Ok(()) => EXIT_OK,
        Err(PtmError::ArgumentMismatch { .. } | PtmError::Serialization(_)) => EXIT_USAGE,
        Err(_) => EXIT_FAILURE,
    }
}

/// The control child's work: set up the host's environment and run
/// `command` against its service.
///
/// `start` mounts the host's directories and starts the daemon. `stop`
/// mounts them again (so the init script sees the host's config), stops
/// the daemon and unmounts. Any other command is a service verb.
pub async fn run_host_control(
    command: &str,
    snapshot: &HostSnapshot,
    args: &[String],
    ops: &dyn ServiceOps,
) -> PtmResult<()> {
    let host = Host::from_snapshot(snapshot.clone())?;
    let cx = host.service_ctx(&snapshot.paths, snapshot.readiness, ops);
    let service = host.service.process();
    tracing::info!(host = %host.name, command, "Host control");

    match command {
        "start" => {
            service.prepare_environment(&cx).await?;
            service.control_start(&cx).await
        }
        "stop" => {
            if let Err(e) = service.prepare_environment(&cx).await {
                tracing::warn!(host = %host.name, error = %e, "Environment setup failed before stop");
            }
            service.control_stop(&cx).await?;
            service.cleanup_environment(&cx).await
        }
        verb => {
            service.prepare_environment(&cx).await?;
            service.control(&cx, verb, args).await
        }
    }
}

#[cfg(test)]
mod tests {
    use ptm_common::{PtmPaths, PtmSettings, RetryPolicy};

    use super::*;
    use crate::host::SNAPSHOT_SCHEMA_VERSION;
    use crate::services::ServiceConfig;
    use crate::services::testing::FakeOps;
    use crate::topology::PhysicalTopologyConfig;

    fn snapshot() -> HostSnapshot {
        let topo = PhysicalTopologyConfig::from_json(
            r#"{
                "bridges": [{"name": "br0", "ip_list": [{"ip": "10.0.0.240", "subnet": "16"}]}],
                "zookeepers": [{"name": "zoo1", "bridge_link": {"name": "br0"},
                                "ip_list": [{"ip": "10.0.0.2"}]}]
            }"#,
        )
        .unwrap()
        .resolve()
        .unwrap();
        let resolved = topo.host("zoo1").unwrap();
        let service = ServiceConfig::build(resolved, &topo, &PtmSettings::default()).unwrap();
        Host::new(resolved, service).snapshot(&PtmPaths::with_root("/tmp/ptm"), RetryPolicy::new(3, 10))
    }

    #[test]
    fn request_argv() {
        let request = ControlRequest {
            host: "quagga".into(),
            command: "add_neighbor".into(),
            snapshot: "{}".into(),
            log_dir: PathBuf::from("/tmp/ptm/logs"),
            args: vec!["10.0.0.1".into(), "65000".into()],
        };
        assert_eq!(
            request.argv(),
            ["-c", "add_neighbor", "-j", "{}", "-l", "/tmp/ptm/logs", "10.0.0.1", "65000"]
        );
    }

    #[test]
    fn relative_binary_falls_back_to_path_lookup() {
        let launcher = UnshareLauncher::new(Path::new("definitely-not-installed-ctl"));
        assert_eq!(launcher.binary(), Path::new("definitely-not-installed-ctl"));

        let launcher = UnshareLauncher::new(Path::new("/usr/bin/ptm-host-ctl"));
        assert_eq!(launcher.binary(), Path::new("/usr/bin/ptm-host-ctl"));
    }

    #[tokio::test]
    async fn start_mounts_then_starts() {
        let ops = FakeOps::default();
        let snapshot = snapshot();

        run_host_control("start", &snapshot, &[], &ops).await.unwrap();
        assert_eq!(ops.mounts.lock().len(), 3);
        assert!(ops.running.lock().contains("zookeeper"));

        run_host_control("stop", &snapshot, &[], &ops).await.unwrap();
        assert!(ops.mounts.lock().is_empty());
        assert!(!ops.running.lock().contains("zookeeper"));
    }

    #[tokio::test]
    async fn control_rebuilds_the_host_from_its_snapshot() {
        let ops = FakeOps::default();
        let mut stale = snapshot();
        stale.schema_version = SNAPSHOT_SCHEMA_VERSION + 1;

        let err = run_host_control("start", &stale, &[], &ops).await.unwrap_err();
        assert!(matches!(err, PtmError::Config { ref key, .. } if key == "schema_version"));
        assert!(ops.commands.lock().is_empty());
    }

    #[tokio::test]
    async fn stop_tolerates_a_dead_daemon() {
        let ops = FakeOps::default();
        ops.fail_commands
            .lock()
            .insert("/etc/init.d/zookeeper stop".into());

        run_host_control("stop", &snapshot(), &[], &ops).await.unwrap();
    }

    #[tokio::test]
    async fn in_process_exit_codes() {
        let ops = Arc::new(FakeOps::default());
        let launcher = InProcessLauncher::new(ops.clone());
        let mut request = ControlRequest {
            host: "zoo1".into(),
            command: "start".into(),
            snapshot: snapshot().to_json().unwrap(),
            log_dir: PathBuf::from("/tmp/ptm/logs"),
            args: Vec::new(),
        };
        assert_eq!(launcher.launch(&request).await.unwrap(), EXIT_OK);

        request.command = "explode".into();
        assert_eq!(launcher.launch(&request).await.unwrap(), EXIT_USAGE);

        ops.fail_commands
            .lock()
            .insert("/etc/init.d/zookeeper start".into());
        request.command = "start".into();
        assert_eq!(launcher.launch(&request).await.unwrap(), EXIT_FAILURE);

        request.snapshot = "not json".into();
        assert_eq!(launcher.launch(&request).await.unwrap(), EXIT_USAGE);
    }
}
