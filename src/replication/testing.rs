//! In-memory collaborators for deterministic tests of the replication core.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use super::{Job, JobKeys, TRIGGER_ALL};
use crate::catalog::{CatalogError, Dataset, DatasetName, Snapshot, SnapshotCatalog, SnapshotName};
use crate::service::{ServiceState, ServiceStateError, ServiceStateStore};
use crate::transfer::{
    ConfigurationError, Destination, TransferError, TransferExecutor, TransferOutcome, TransferPlan,
};

pub const SCHEDULE: &str = "daily";
pub const JOB: &str = "zfs-send";

pub fn keys() -> JobKeys {
    JobKeys::new("org.opensolaris:time-slider-plugin", JOB)
}

pub fn job() -> Job {
    Job {
        keys: keys(),
        destination: Destination::new(vec!["/usr/sbin/zfs".into(), "receive".into()]),
        trigger_on: vec![TRIGGER_ALL.into()],
    }
}

pub fn ds(name: &str) -> DatasetName {
    DatasetName::parse(name).unwrap()
}

pub fn snap(name: &str) -> SnapshotName {
    SnapshotName::parse(name).unwrap()
}

#[derive(Debug, Default)]
struct FakeDataset {
    mounted: Option<bool>,
    schedules: BTreeSet<String>,
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct Pool {
    datasets: BTreeMap<DatasetName, FakeDataset>,
    snapshots: BTreeMap<SnapshotName, BTreeSet<String>>,
}

fn missing(what: impl std::fmt::Display) -> CatalogError {
    CatalogError::CommandFailed {
        command: "fake".into(),
        error: format!("cannot open '{what}': dataset does not exist"),
    }
}

/// [SnapshotCatalog] over an in-memory pool.
#[derive(Debug, Default)]
pub struct FakeCatalog {
    pool: RefCell<Pool>,
    get_tag_calls: Cell<usize>,
    /// Makes every [SnapshotCatalog::release_hold] fail.
    pub fail_release: Cell<bool>,
    /// Makes every [SnapshotCatalog::set_tag] fail.
    pub fail_set_tag: Cell<bool>,
}

impl FakeCatalog {
    pub fn add_dataset(&self, name: &str, mounted: Option<bool>, schedules: &[&str]) -> DatasetName {
        let name = ds(name);
        self.pool.borrow_mut().datasets.insert(
            name.clone(),
            FakeDataset {
                mounted,
                schedules: schedules.iter().map(|s| s.to_string()).collect(),
                tags: BTreeMap::new(),
            },
        );
        name
    }

    /// Adds a mounted dataset of [SCHEDULE] enabled for replication.
    pub fn eligible(&self, name: &str) -> DatasetName {
        let name = self.add_dataset(name, Some(true), &[SCHEDULE]);
        self.set(&name, keys().enable(), "true");
        name
    }

    pub fn add_snapshot(&self, name: &str) -> SnapshotName {
        let name = snap(name);
        self.pool
            .borrow_mut()
            .snapshots
            .insert(name.clone(), BTreeSet::new());
        name
    }

    pub fn destroy_snapshot(&self, name: &SnapshotName) {
        self.pool.borrow_mut().snapshots.remove(name);
    }

    pub fn set(&self, dataset: &DatasetName, key: &str, value: &str) {
        self.pool
            .borrow_mut()
            .datasets
            .get_mut(dataset)
            .expect("dataset should exist")
            .tags
            .insert(key.to_string(), value.to_string());
    }

    pub fn tag(&self, dataset: &DatasetName, key: &str) -> String {
        self.pool.borrow().datasets[dataset]
            .tags
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn holds_of(&self, snapshot: &SnapshotName) -> BTreeSet<String> {
        self.pool.borrow().snapshots[snapshot].clone()
    }

    pub fn get_tag_calls(&self) -> usize {
        self.get_tag_calls.get()
    }
}

impl SnapshotCatalog for FakeCatalog {
    fn list_snapshots(&self, label: &str) -> Result<Vec<Snapshot>, CatalogError> {
        Ok(self
            .pool
            .borrow()
            .snapshots
            .keys()
            .filter(|name| name.label() == label)
            .map(|name| Snapshot {
                name: name.clone(),
                created: DateTime::<Utc>::UNIX_EPOCH,
            })
            .collect())
    }

    fn list_set_members(&self, schedule: &str) -> Result<BTreeSet<DatasetName>, CatalogError> {
        Ok(self
            .pool
            .borrow()
            .datasets
            .iter()
            .filter(|(_, ds)| ds.schedules.contains(schedule))
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn list_datasets(&self) -> Result<Vec<Dataset>, CatalogError> {
        Ok(self
            .pool
            .borrow()
            .datasets
            .iter()
            .map(|(name, ds)| Dataset {
                name: name.clone(),
                mounted: ds.mounted,
            })
            .collect())
    }

    fn get_tag(&self, dataset: &DatasetName, key: &str) -> Result<String, CatalogError> {
        self.get_tag_calls.set(self.get_tag_calls.get() + 1);
        let pool = self.pool.borrow();
        if !pool.datasets.contains_key(dataset) {
            return Err(missing(dataset));
        }
        // ancestors sort first, the nearest one last
        Ok(pool
            .datasets
            .iter()
            .filter(|(name, _)| *name == dataset || name.is_ancestor_of(dataset))
            .filter_map(|(_, ds)| ds.tags.get(key))
            .next_back()
            .cloned()
            .unwrap_or_default())
    }

    fn get_local_tag(&self, dataset: &DatasetName, key: &str) -> Result<String, CatalogError> {
        self.get_tag_calls.set(self.get_tag_calls.get() + 1);
        let pool = self.pool.borrow();
        let ds = pool.datasets.get(dataset).ok_or_else(|| missing(dataset))?;
        Ok(ds.tags.get(key).cloned().unwrap_or_default())
    }

    fn set_tag(&self, dataset: &DatasetName, key: &str, value: &str) -> Result<(), CatalogError> {
        if self.fail_set_tag.get() {
            return Err(CatalogError::CommandFailed {
                command: "fake set".into(),
                error: "permission denied".into(),
            });
        }
        let mut pool = self.pool.borrow_mut();
        let ds = pool.datasets.get_mut(dataset).ok_or_else(|| missing(dataset))?;
        ds.tags.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn holds(&self, snapshot: &SnapshotName) -> Result<BTreeSet<String>, CatalogError> {
        self.pool
            .borrow()
            .snapshots
            .get(snapshot)
            .cloned()
            .ok_or_else(|| missing(snapshot))
    }

    fn place_hold(&self, snapshot: &SnapshotName, tag: &str) -> Result<(), CatalogError> {
        let mut pool = self.pool.borrow_mut();
        let holds = pool.snapshots.get_mut(snapshot).ok_or_else(|| missing(snapshot))?;
        if !holds.insert(tag.to_string()) {
            return Err(CatalogError::CommandFailed {
                command: "fake hold".into(),
                error: "tag already exists on this dataset".into(),
            });
        }
        Ok(())
    }

    fn release_hold(&self, snapshot: &SnapshotName, tag: &str) -> Result<(), CatalogError> {
        if self.fail_release.get() {
            return Err(CatalogError::CommandFailed {
                command: "fake release".into(),
                error: "interrupted".into(),
            });
        }
        let mut pool = self.pool.borrow_mut();
        let holds = pool.snapshots.get_mut(snapshot).ok_or_else(|| missing(snapshot))?;
        if !holds.remove(tag) {
            return Err(CatalogError::CommandFailed {
                command: "fake release".into(),
                error: "no such tag on this dataset".into(),
            });
        }
        Ok(())
    }

    fn exists(&self, snapshot: &SnapshotName) -> Result<bool, CatalogError> {
        Ok(self.pool.borrow().snapshots.contains_key(snapshot))
    }
}

/// [TransferExecutor] recording the transfers it was asked for.
#[derive(Debug, Default)]
pub struct FakeExecutor {
    transfers: RefCell<Vec<(DatasetName, TransferPlan)>>,
    /// Transfers of this dataset fail.
    pub fail_on: RefCell<Option<DatasetName>>,
    /// Returned by [TransferExecutor::validate] if set.
    pub invalid: RefCell<Option<ConfigurationError>>,
}

impl FakeExecutor {
    pub fn transfers(&self) -> Vec<(DatasetName, TransferPlan)> {
        self.transfers.borrow().clone()
    }

    pub fn transferred(&self) -> Vec<String> {
        self.transfers
            .borrow()
            .iter()
            .map(|(ds, _)| ds.to_string())
            .collect()
    }
}

impl TransferExecutor for FakeExecutor {
    fn validate(&self, _destination: &Destination) -> Result<(), ConfigurationError> {
        match self.invalid.borrow().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn transfer(
        &self,
        dataset: &DatasetName,
        plan: &TransferPlan,
        _destination: &Destination,
    ) -> Result<TransferOutcome, TransferError> {
        if self.fail_on.borrow().as_ref() == Some(dataset) {
            return Err(TransferError::Pipe(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "receive side went away",
            )));
        }
        self.transfers
            .borrow_mut()
            .push((dataset.clone(), plan.clone()));
        Ok(TransferOutcome { bytes: 1024 })
    }
}

/// [ServiceStateStore] kept in memory.
#[derive(Debug, Default)]
pub struct FakeService {
    states: RefCell<BTreeMap<String, ServiceState>>,
}

impl ServiceStateStore for FakeService {
    fn state(&self, job: &str) -> Result<ServiceState, ServiceStateError> {
        Ok(self.states.borrow().get(job).copied().unwrap_or_default())
    }

    fn set_state(&self, job: &str, state: ServiceState) -> Result<(), ServiceStateError> {
        self.states.borrow_mut().insert(job.to_string(), state);
        Ok(())
    }
}
