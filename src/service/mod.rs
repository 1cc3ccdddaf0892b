//! Operational state of replication jobs.
//!
//! A job is invoked automatically only while it is [ServiceState::Online].
//! Once the coordinator faults it, it stays in [ServiceState::Maintenance]
//! until an operator clears it.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};

/// Operational state of a job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    #[default]
    #[display("online")]
    Online,
    #[display("disabled")]
    Disabled,
    /// Faulted; requires operator intervention.
    #[display("maintenance")]
    Maintenance,
}

#[derive(Debug, Display, Error, From)]
pub enum ServiceStateError {
    /// Reading or writing the state file failed.
    #[display("Accessing the state file {} failed: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    /// The state file is not valid TOML.
    #[display("Parsing the state file {} failed: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[from]
    Serialize(toml::ser::Error),
}

/// Store of the operational state of jobs.
pub trait ServiceStateStore {
    fn state(&self, job: &str) -> Result<ServiceState, ServiceStateError>;

    fn set_state(&self, job: &str, state: ServiceState) -> Result<(), ServiceStateError>;

    fn is_enabled(&self, job: &str) -> Result<bool, ServiceStateError> {
        Ok(self.state(job)? == ServiceState::Online)
    }

    fn disable(&self, job: &str) -> Result<(), ServiceStateError> {
        self.set_state(job, ServiceState::Disabled)
    }

    /// Puts the job into the maintenance state.
    fn mark_faulted(&self, job: &str) -> Result<(), ServiceStateError> {
        self.set_state(job, ServiceState::Maintenance)
    }

    /// Returns the job to service, clearing any fault.
    fn enable(&self, job: &str) -> Result<(), ServiceStateError> {
        self.set_state(job, ServiceState::Online)
    }
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct StateFile {
    #[serde(default)]
    jobs: BTreeMap<String, JobState>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct JobState {
    state: ServiceState,
}

/// [ServiceStateStore] persisted in a TOML file.
///
/// ```toml
/// [jobs.offsite]
/// state = "maintenance"
/// ```
#[derive(Debug, Clone)]
pub struct FileServiceStore {
    path: PathBuf,
}

impl FileServiceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> ServiceStateError {
        ServiceStateError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn load(&self) -> Result<StateFile, ServiceStateError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StateFile::default()),
            Err(e) => return Err(self.io_error(e)),
        };

        toml::from_str(&content).map_err(|source| ServiceStateError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Writes a sibling temp file and renames it over the state file.
    fn store(&self, state: &StateFile) -> Result<(), ServiceStateError> {
        let content = toml::to_string_pretty(state)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let mut tmp = fs::File::create(&tmp_path).map_err(|e| self.io_error(e))?;
        tmp.write_all(content.as_bytes())
            .and_then(|()| tmp.sync_all())
            .map_err(|e| self.io_error(e))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| self.io_error(e))
    }
}

impl ServiceStateStore for FileServiceStore {
    fn state(&self, job: &str) -> Result<ServiceState, ServiceStateError> {
        Ok(self
            .load()?
            .jobs
            .get(job)
            .map(|job| job.state)
            .unwrap_or_default())
    }

    fn set_state(&self, job: &str, state: ServiceState) -> Result<(), ServiceStateError> {
        let mut file = self.load()?;
        file.jobs.insert(job.to_string(), JobState { state });
        self.store(&file)?;

        log::info!(target: "service", "Job {job} is now {state}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_job_is_online() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileServiceStore::new(dir.path().join("state.toml"));

        assert_eq!(store.state("offsite").unwrap(), ServiceState::Online);
        assert!(store.is_enabled("offsite").unwrap());
        assert!(!store.path().exists());
    }

    #[test]
    fn fault_persists_until_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.toml");
        let store = FileServiceStore::new(&path);

        store.mark_faulted("offsite").unwrap();
        store.disable("other").unwrap();

        let reopened = FileServiceStore::new(&path);
        assert_eq!(reopened.state("offsite").unwrap(), ServiceState::Maintenance);
        assert_eq!(reopened.state("other").unwrap(), ServiceState::Disabled);
        assert!(!reopened.is_enabled("offsite").unwrap());

        reopened.enable("offsite").unwrap();
        assert!(store.is_enabled("offsite").unwrap());
        assert_eq!(store.state("other").unwrap(), ServiceState::Disabled);
    }

    #[test]
    fn malformed_state_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.toml");
        fs::write(&path, "jobs = 3").unwrap();

        let store = FileServiceStore::new(&path);
        assert!(matches!(
            store.state("offsite"),
            Err(ServiceStateError::Parse { .. })
        ));
    }
}
