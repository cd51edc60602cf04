//! Run-state persistence.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ptm_common::PtmResult;
use serde::{Deserialize, Serialize};

use crate::host::HostState;

/// What the last run got to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    /// When this was written.
    pub updated_at: DateTime<Utc>,
    /// Topology document the run was started from.
    pub topology_file: Option<PathBuf>,
    /// Last phase that ran.
    pub phase: String,
    /// State of every host.
    pub hosts: BTreeMap<String, HostState>,
}

impl RunState {
    /// A state stamped now.
    pub fn new(
        topology_file: Option<PathBuf>,
        phase: impl Into<String>,
        hosts: BTreeMap<String, HostState>,
    ) -> Self {
        Self {
            updated_at: Utc::now(),
            topology_file,
            phase: phase.into(),
            hosts,
        }
    }
}

/// Reads and writes the run-state file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The state file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Save the state.
    pub fn save(&self, state: &RunState) -> PtmResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(state)?;
        std::fs::write(&self.path, json)?;

        tracing::debug!(
            phase = %state.phase,
            path = %self.path.display(),
            "Saved run state"
        );
        Ok(())
    }

    /// Load the state, if a previous run left one.
    pub fn load(&self) -> PtmResult<Option<RunState>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let json = std::fs::read_to_string(&self.path)?;
        let state: RunState = serde_json::from_str(&json)?;

        tracing::debug!(
            phase = %state.phase,
            path = %self.path.display(),
            "Loaded run state"
        );
        Ok(Some(state))
    }

    /// Delete the state file.
    pub fn delete(&self) -> PtmResult<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
            tracing::debug!(path = %self.path.display(), "Deleted run state");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> RunState {
        let hosts = BTreeMap::from([
            ("root".to_string(), HostState::ProcessStarted),
            ("zoo1".to_string(), HostState::Configured),
        ]);
        RunState::new(Some(PathBuf::from("/etc/ptm/zoo1.json")), "start", hosts)
    }

    #[test]
    fn save_and_load_state() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path().join("nested/topology-state.json"));

        assert_eq!(store.load().unwrap(), None);
        let state = sample();
        store.save(&state).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.hosts["zoo1"], HostState::Configured);
    }

    #[test]
    fn delete_state() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path().join("topology-state.json"));

        store.save(&sample()).unwrap();
        assert!(store.path().exists());

        store.delete().unwrap();
        assert!(!store.path().exists());
        store.delete().unwrap();
    }
}
