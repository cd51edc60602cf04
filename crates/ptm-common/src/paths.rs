//! Standard filesystem paths for the topology manager.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default root directory for per-instance service state.
pub const DEFAULT_ROOT: &str = "/var/lib/ptm";

/// Default log directory.
pub const DEFAULT_LOG_DIR: &str = "/var/log/ptm";

/// Name of the persisted run-state file under the root directory.
pub const STATE_FILE: &str = "topology-state.json";

/// Standard paths used by the topology manager.
///
/// Every service instance gets its own tree under `<root>/<host>/` so that
/// several instances of the same daemon can coexist on one machine. Those
/// directories are bind-mounted over the daemon's well-known paths inside
/// the isolated control process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtmPaths {
    /// Root data directory (default: /var/lib/ptm).
    pub root: PathBuf,
    /// Log directory (default: /var/log/ptm).
    pub log_dir: PathBuf,
}

impl PtmPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let log_dir = root.join("logs");
        Self { root, log_dir }
    }

    /// Override the log directory.
    #[must_use]
    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = log_dir.into();
        self
    }

    /// Directory holding everything that belongs to one host.
    #[must_use]
    pub fn host(&self, host: &str) -> PathBuf {
        self.root.join(host)
    }

    /// Per-instance configuration directory for a service.
    #[must_use]
    pub fn host_config(&self, host: &str, service: &str) -> PathBuf {
        self.host(host).join("etc").join(service)
    }

    /// Per-instance data directory for a service.
    #[must_use]
    pub fn host_data(&self, host: &str, service: &str) -> PathBuf {
        self.host(host).join("var/lib").join(service)
    }

    /// Per-instance log directory for a service.
    #[must_use]
    pub fn host_logs(&self, host: &str, service: &str) -> PathBuf {
        self.host(host).join("var/log").join(service)
    }

    /// Per-instance runtime directory (PID files).
    #[must_use]
    pub fn host_run(&self, host: &str) -> PathBuf {
        self.host(host).join("run")
    }

    /// Persisted run-state file.
    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    /// Create the root and log directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }
}

impl Default for PtmPaths {
    fn default() -> Self {
        let root = std::env::var("PTM_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_ROOT));
        let log_dir = std::env::var("PTM_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_DIR));
        Self { root, log_dir }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root() {
        let paths = PtmPaths::with_root("/tmp/ptm-test");
        assert_eq!(paths.log_dir, PathBuf::from("/tmp/ptm-test/logs"));
        assert_eq!(
            paths.state_file(),
            PathBuf::from("/tmp/ptm-test/topology-state.json")
        );
    }

    #[test]
    fn host_dirs() {
        let paths = PtmPaths::with_root("/tmp/ptm-test");
        assert_eq!(
            paths.host_config("zoo1", "zookeeper"),
            PathBuf::from("/tmp/ptm-test/zoo1/etc/zookeeper")
        );
        assert_eq!(
            paths.host_data("cass1", "cassandra"),
            PathBuf::from("/tmp/ptm-test/cass1/var/lib/cassandra")
        );
        assert_eq!(
            paths.host_logs("cmp1", "midolman"),
            PathBuf::from("/tmp/ptm-test/cmp1/var/log/midolman")
        );
        assert_eq!(paths.host_run("r1"), PathBuf::from("/tmp/ptm-test/r1/run"));
    }

    #[test]
    fn log_dir_override() {
        let paths = PtmPaths::with_root("/a").with_log_dir("/b");
        assert_eq!(paths.log_dir, PathBuf::from("/b"));
        assert_eq!(paths.root, PathBuf::from("/a"));
    }
}
