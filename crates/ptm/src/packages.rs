//! Installed package queries.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use ptm_common::{PtmError, PtmResult, PtmSettings};
use ptm_network::{CommandRunner, ExecContext, SystemRunner, argv};

/// Packages whose versions change service behaviour.
pub const VERSIONED_PACKAGES: [&str; 2] = ["midonet", "midolman"];

/// Answers questions about installed packages.
#[async_trait]
pub trait PackageQuery: Send + Sync + fmt::Debug {
    /// Whether `package` is installed.
    async fn is_installed(&self, package: &str) -> PtmResult<bool>;

    /// Installed version of `package`, if any.
    async fn version(&self, package: &str) -> PtmResult<Option<String>>;
}

/// `dpkg-query` backed package database.
#[derive(Debug, Clone)]
pub struct DpkgQuery<R: CommandRunner = SystemRunner> {
    runner: Arc<R>,
}

impl DpkgQuery<SystemRunner> {
    /// Query the local dpkg database.
    #[must_use]
    pub fn system() -> Self {
        Self::new(SystemRunner)
    }
}

impl Default for DpkgQuery {
    fn default() -> Self {
        Self::system()
    }
}

impl<R: CommandRunner> DpkgQuery<R> {
    /// Query through `runner`.
    pub fn new(runner: R) -> Self {
        Self {
            runner: Arc::new(runner),
        }
    }

    /// `(status, version)` of `package`, or `None` when dpkg does not know
    /// it or is not available.
    async fn query(&self, package: &str) -> PtmResult<Option<(String, String)>> {
        let cmd = argv(&["dpkg-query", "-W", "-f=${Status} ${Version}", package]);
        let output = match self.runner.run(&ExecContext::Root, &cmd).await {
            Ok(output) => output,
            Err(PtmError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("dpkg-query not available");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if !output.success() {
            return Ok(None);
        }

        // "install ok installed 5.4.0-1"
        let fields: Vec<&str> = output.stdout.split_whitespace().collect();
        match fields.as_slice() {
            [want, flag, status, version] => {
                Ok(Some((format!("{want} {flag} {status}"), (*version).to_string())))
            }
            [want, flag, status] => Ok(Some((format!("{want} {flag} {status}"), String::new()))),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl<R: CommandRunner + 'static> PackageQuery for DpkgQuery<R> {
    async fn is_installed(&self, package: &str) -> PtmResult<bool> {
        Ok(self
            .query(package)
            .await?
            .is_some_and(|(status, _)| status == "install ok installed"))
    }

    async fn version(&self, package: &str) -> PtmResult<Option<String>> {
        Ok(self
            .query(package)
            .await?
            .filter(|(status, version)| status == "install ok installed" && !version.is_empty())
            .map(|(_, version)| version))
    }
}

/// Record installed versions of [`VERSIONED_PACKAGES`] in `settings`.
///
/// Versions already set (from the settings file) win.
pub async fn detect_versions(query: &dyn PackageQuery, settings: &mut PtmSettings) -> PtmResult<()> {
    for package in VERSIONED_PACKAGES {
        if settings.versions.contains_key(package) {
            continue;
        }
        if let Some(version) = query.version(package).await? {
            tracing::debug!(package, %version, "Detected package version");
            settings.detect_version(package, version);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ptm_network::CommandOutput;

    use super::*;

    #[derive(Debug, Default)]
    struct Dpkg {
        installed: BTreeMap<&'static str, &'static str>,
    }

    #[async_trait]
    impl CommandRunner for Dpkg {
        async fn run(&self, _ctx: &ExecContext, argv: &[String]) -> PtmResult<CommandOutput> {
            let package = argv.last().map(String::as_str).unwrap_or_default();
            Ok(match self.installed.get(package) {
                Some(version) => {
                    CommandOutput::with_stdout(format!("install ok installed {version}"))
                }
                None => CommandOutput {
                    code: 1,
                    stdout: String::new(),
                    stderr: format!("dpkg-query: no packages found matching {package}"),
                },
            })
        }
    }

    fn dpkg() -> DpkgQuery<Dpkg> {
        DpkgQuery::new(Dpkg {
            installed: BTreeMap::from([("zookeeper", "3.4.5"), ("midonet", "5.4.1")]),
        })
    }

    #[tokio::test]
    async fn installed_packages() {
        let query = dpkg();
        assert!(query.is_installed("zookeeper").await.unwrap());
        assert!(!query.is_installed("quagga").await.unwrap());
        assert_eq!(query.version("midonet").await.unwrap().as_deref(), Some("5.4.1"));
        assert_eq!(query.version("quagga").await.unwrap(), None);
    }

    #[tokio::test]
    async fn detection_keeps_configured_versions() {
        let mut settings = PtmSettings::default();
        settings.detect_version("midolman", "1.9");

        detect_versions(&dpkg(), &mut settings).await.unwrap();

        assert_eq!(settings.major_version("midonet"), Some(5));
        assert_eq!(settings.versions["midolman"], "1.9");
    }
}
