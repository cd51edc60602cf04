//! Process-wide settings.
//!
//! Settings are built once when a binary starts and handed to every
//! component through an `Arc`. Nothing reads ambient global state after
//! that point.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PtmResult;
use crate::paths::PtmPaths;
use crate::retry::RetryPolicy;

/// Environment variable naming a settings file.
pub const SETTINGS_ENV: &str = "PTM_SETTINGS";

/// Default name of the host-control binary.
pub const DEFAULT_CONTROL_BINARY: &str = "ptm-host-ctl";

/// Default controller API endpoint.
pub const DEFAULT_API_URL: &str = "http://localhost:8181/midonet-api";

/// Settings for the topology manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtmSettings {
    /// Filesystem locations.
    pub paths: PtmPaths,
    /// Host-control binary launched inside the isolation boundary.
    pub control_binary: PathBuf,
    /// Controller API endpoint handed to services that need it.
    pub api_url: String,
    /// Check required packages before touching the OS.
    pub check_packages: bool,
    /// Readiness polling budget.
    pub readiness: RetryPolicy,
    /// Installed package versions (package name to version string).
    pub versions: BTreeMap<String, String>,
}

impl Default for PtmSettings {
    fn default() -> Self {
        Self {
            paths: PtmPaths::new(),
            control_binary: PathBuf::from(DEFAULT_CONTROL_BINARY),
            api_url: DEFAULT_API_URL.to_string(),
            check_packages: true,
            readiness: RetryPolicy::default(),
            versions: BTreeMap::new(),
        }
    }
}

/// On-disk settings layout. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    root_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    control_binary: Option<PathBuf>,
    api_url: Option<String>,
    check_packages: Option<bool>,
    readiness: Option<RetryPolicy>,
    #[serde(default)]
    versions: BTreeMap<String, String>,
}

impl PtmSettings {
    /// Parse settings from TOML, filling in defaults.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the document is malformed.
    pub fn from_toml(content: &str) -> PtmResult<Self> {
        let file: SettingsFile = toml::from_str(content)?;
        let mut settings = Self::default();

        if let Some(root) = file.root_dir {
            let log_dir = file.log_dir.clone().unwrap_or_else(|| root.join("logs"));
            settings.paths = PtmPaths::with_root(root).with_log_dir(log_dir);
        } else if let Some(log_dir) = file.log_dir {
            settings.paths = settings.paths.with_log_dir(log_dir);
        }
        if let Some(binary) = file.control_binary {
            settings.control_binary = binary;
        }
        if let Some(url) = file.api_url {
            settings.api_url = url;
        }
        if let Some(check) = file.check_packages {
            settings.check_packages = check;
        }
        if let Some(readiness) = file.readiness {
            settings.readiness = readiness;
        }
        settings.versions = file.versions;

        Ok(settings)
    }

    /// Load settings from `path`, else from `$PTM_SETTINGS`, else defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a named file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> PtmResult<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(SETTINGS_ENV).map(PathBuf::from));

        match path {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Loading settings");
                let content = std::fs::read_to_string(&path)?;
                Self::from_toml(&content)
            }
            None => Ok(Self::default()),
        }
    }

    /// Set the root directory (log dir follows unless set later).
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = PtmPaths::with_root(root);
        self
    }

    /// Set the log directory.
    #[must_use]
    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.paths = self.paths.with_log_dir(log_dir);
        self
    }

    /// Set the readiness budget.
    #[must_use]
    pub fn with_readiness(mut self, readiness: RetryPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    /// Enable or disable the package pre-flight.
    #[must_use]
    pub fn with_package_check(mut self, check: bool) -> Self {
        self.check_packages = check;
        self
    }

    /// Record an installed version unless one is already configured.
    pub fn detect_version(&mut self, package: &str, version: impl Into<String>) {
        self.versions
            .entry(package.to_string())
            .or_insert_with(|| version.into());
    }

    /// Major version of an installed package, if known.
    #[must_use]
    pub fn major_version(&self, package: &str) -> Option<u32> {
        let version = self.versions.get(package)?;
        let digits: String = version
            .trim_start_matches(|c: char| !c.is_ascii_digit())
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        digits.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings() {
        let settings = PtmSettings::default();
        assert!(settings.check_packages);
        assert_eq!(settings.readiness.attempts, 60);
        assert_eq!(settings.control_binary, PathBuf::from("ptm-host-ctl"));
    }

    #[test]
    fn parse_toml() {
        let settings = PtmSettings::from_toml(
            r#"
root_dir = "/tmp/ptm"
api_url = "http://10.0.0.10:8181/midonet-api"
check_packages = false

[readiness]
attempts = 10
interval_ms = 250

[versions]
midonet = "5.4.1"
"#,
        )
        .unwrap();

        assert_eq!(settings.paths.root, PathBuf::from("/tmp/ptm"));
        assert_eq!(settings.paths.log_dir, PathBuf::from("/tmp/ptm/logs"));
        assert!(!settings.check_packages);
        assert_eq!(settings.readiness, RetryPolicy::new(10, 250));
        assert_eq!(settings.major_version("midonet"), Some(5));
    }

    #[test]
    fn unknown_key_is_config_error() {
        let err = PtmSettings::from_toml("rooot_dir = \"/x\"").unwrap_err();
        assert!(matches!(err, crate::PtmError::Config { .. }));
    }

    #[test]
    fn detected_version_does_not_override_configured() {
        let mut settings = PtmSettings::from_toml("[versions]\nmidonet = \"1.9\"").unwrap();
        settings.detect_version("midonet", "5.2");
        settings.detect_version("zookeeper", "3.4.5");
        assert_eq!(settings.major_version("midonet"), Some(1));
        assert_eq!(settings.major_version("zookeeper"), Some(3));
        assert_eq!(settings.major_version("quagga"), None);
    }

    #[test]
    fn builder_pattern() {
        let settings = PtmSettings::default()
            .with_root("/custom/root")
            .with_log_dir("/custom/logs")
            .with_readiness(RetryPolicy::new(3, 10))
            .with_package_check(false);

        assert_eq!(settings.paths.root, PathBuf::from("/custom/root"));
        assert_eq!(settings.paths.log_dir, PathBuf::from("/custom/logs"));
        assert!(!settings.check_packages);
    }
}
