//! Replication of newly created auto-snapshots as an incremental chain.
//!
//! A run for a `(schedule, label)` pair
//!
//! 1. [selects](select) the datasets with a new snapshot labeled `label`,
//! 2. [holds](HoldManager) those snapshots so retention can't destroy them,
//! 3. [plans](plan) a full or incremental transfer for every candidate,
//! 4. transfers them parent before child, recording the replicated label on
//!    each dataset and releasing the superseded base.
//!
//! No run record is kept. Markers and holds are the only durable state, so a
//! restarted run derives a safe plan from the catalog alone.

use std::collections::HashMap;

use derive_more::{Display, Error, From};

use crate::catalog::{CatalogError, DatasetName, SnapshotCatalog, SnapshotName};
use crate::service::ServiceStateError;
use crate::transfer::{ConfigurationError, Destination, TransferError};

mod controller;
mod hold;
mod planner;
mod selector;
#[cfg(test)]
mod testing;

pub use controller::{CompletedTransfer, Controller, RunReport, RunState, SkipReason};
pub use hold::{HoldAction, HoldError, HoldManager};
pub use planner::{plan, PlanError};
pub use selector::select;

/// Trigger matching every schedule.
pub const TRIGGER_ALL: &str = "all";

/// Dataset properties owned by one replication job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobKeys {
    job: String,
    marker: String,
    enable: String,
}

impl JobKeys {
    /// Derives the keys of `job` below `prefix`,
    /// e.g. `org.opensolaris:time-slider-plugin:zfs-send`.
    pub fn new(prefix: &str, job: &str) -> Self {
        Self {
            job: job.to_string(),
            marker: format!("{prefix}:{job}"),
            enable: format!("{prefix}-enabled:{job}"),
        }
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    /// Tag holding the label of the last replicated snapshot.
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Tag of the holds placed on snapshots awaiting or serving as base of a transfer.
    pub fn hold_tag(&self) -> &str {
        &self.marker
    }

    /// Tag that must be `true` for a dataset to be replicated.
    pub fn enable(&self) -> &str {
        &self.enable
    }
}

/// A configured replication job.
#[derive(Debug, Clone)]
pub struct Job {
    pub keys: JobKeys,
    pub destination: Destination,
    /// Schedules this job reacts to, [TRIGGER_ALL] for every schedule.
    pub trigger_on: Vec<String>,
}

impl Job {
    pub fn id(&self) -> &str {
        self.keys.job()
    }

    pub fn is_triggered_by(&self, schedule: &str) -> bool {
        self.trigger_on
            .iter()
            .any(|trigger| trigger == TRIGGER_ALL || trigger == schedule)
    }
}

#[derive(Debug, Display, Error, From)]
/// Errors aborting a replication run.
pub enum ReplicationError {
    /// The snapshot catalog couldn't be read or updated.
    #[display("Snapshot catalog operation failed: {_0}")]
    #[from]
    Catalog(CatalogError),
    #[from]
    Hold(HoldError),
    /// The recorded base of an incremental transfer was destroyed.
    #[display("Previously sent snapshot no longer exists: {dataset}@{base_label}")]
    BaseMissing {
        dataset: DatasetName,
        base_label: String,
    },
    /// The transfer pipeline failed.
    #[display("Error during snapshot send/receive of {snapshot}: {source}")]
    Transfer {
        snapshot: SnapshotName,
        source: TransferError,
    },
    #[from]
    Configuration(ConfigurationError),
    /// The job's service state couldn't be read.
    #[display("Service state unavailable: {_0}")]
    #[from]
    Service(ServiceStateError),
}

impl ReplicationError {
    /// Returns if the error requires operator review, putting the job into
    /// maintenance.
    pub fn faults_job(&self) -> bool {
        matches!(
            self,
            Self::BaseMissing { .. } | Self::Transfer { .. } | Self::Configuration(_)
        )
    }
}

impl From<PlanError> for ReplicationError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::Catalog(e) => Self::Catalog(e),
            PlanError::BaseMissing {
                dataset,
                base_label,
            } => Self::BaseMissing {
                dataset,
                base_label,
            },
        }
    }
}

/// State of a single run, discarded when the run ends.
///
/// Tag lookups are memoized for the run only, so a later run never sees
/// stale values.
pub struct RunContext<'a, C: ?Sized> {
    catalog: &'a C,
    keys: &'a JobKeys,
    /// Keyed by dataset, tag and whether only the local value was read.
    tags: HashMap<(DatasetName, String, bool), String>,
}

impl<'a, C: SnapshotCatalog + ?Sized> RunContext<'a, C> {
    pub fn new(catalog: &'a C, keys: &'a JobKeys) -> Self {
        Self {
            catalog,
            keys,
            tags: HashMap::new(),
        }
    }

    pub fn catalog(&self) -> &'a C {
        self.catalog
    }

    pub fn keys(&self) -> &'a JobKeys {
        self.keys
    }

    /// Value of `key` on `dataset`, possibly inherited from an ancestor.
    pub fn tag(&mut self, dataset: &DatasetName, key: &str) -> Result<String, CatalogError> {
        self.lookup(dataset, key, false)
    }

    /// Value of `key` set on `dataset` itself.
    pub fn local_tag(&mut self, dataset: &DatasetName, key: &str) -> Result<String, CatalogError> {
        self.lookup(dataset, key, true)
    }

    fn lookup(&mut self, dataset: &DatasetName, key: &str, local: bool) -> Result<String, CatalogError> {
        let cache_key = (dataset.clone(), key.to_string(), local);
        if let Some(value) = self.tags.get(&cache_key) {
            return Ok(value.clone());
        }

        let value = if local {
            self.catalog.get_local_tag(dataset, key)?
        } else {
            self.catalog.get_tag(dataset, key)?
        };
        self.tags.insert(cache_key, value.clone());
        Ok(value)
    }

    pub fn set_tag(&mut self, dataset: &DatasetName, key: &str, value: &str) -> Result<(), CatalogError> {
        self.catalog.set_tag(dataset, key, value)?;
        // descendants may inherit the new value
        self.tags.retain(|(_, k, local), _| *local || k != key);
        self.tags
            .insert((dataset.clone(), key.to_string(), true), value.to_string());
        Ok(())
    }

    /// Label of the last snapshot of `dataset` replicated by this job, empty if none.
    ///
    /// Only the dataset's own marker counts, a child never continues the
    /// chain of its parent.
    pub fn marker(&mut self, dataset: &DatasetName) -> Result<String, CatalogError> {
        let key = self.keys.marker();
        self.local_tag(dataset, key)
    }

    pub fn set_marker(&mut self, dataset: &DatasetName, label: &str) -> Result<(), CatalogError> {
        let key = self.keys.marker();
        self.set_tag(dataset, key, label)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{keys, FakeCatalog};
    use super::*;

    #[test]
    fn job_keys() {
        let keys = JobKeys::new("org.opensolaris:time-slider-plugin", "zfs-send");
        assert_eq!(keys.marker(), "org.opensolaris:time-slider-plugin:zfs-send");
        assert_eq!(keys.hold_tag(), keys.marker());
        assert_eq!(keys.enable(), "org.opensolaris:time-slider-plugin-enabled:zfs-send");
    }

    #[test]
    fn triggers() {
        let mut job = Job {
            keys: keys(),
            destination: Destination::new(vec!["cat".into()]),
            trigger_on: vec!["daily".into(), "weekly".into()],
        };
        assert!(job.is_triggered_by("daily"));
        assert!(!job.is_triggered_by("hourly"));

        job.trigger_on = vec![TRIGGER_ALL.into()];
        assert!(job.is_triggered_by("hourly"));

        job.trigger_on.clear();
        assert!(!job.is_triggered_by("daily"));
    }

    #[test]
    fn context_memoizes_tags_within_a_run() {
        let catalog = FakeCatalog::default();
        let ds = catalog.eligible("tank/home");
        catalog.set(&ds, keys().marker(), "2024-01-01");
        let keys = keys();

        let mut ctx = RunContext::new(&catalog, &keys);
        assert_eq!(ctx.marker(&ds).unwrap(), "2024-01-01");
        assert_eq!(ctx.marker(&ds).unwrap(), "2024-01-01");
        assert_eq!(catalog.get_tag_calls(), 1);

        ctx.set_marker(&ds, "2024-01-02").unwrap();
        assert_eq!(ctx.marker(&ds).unwrap(), "2024-01-02");
        assert_eq!(catalog.tag(&ds, keys.marker()), "2024-01-02");
        assert_eq!(catalog.get_tag_calls(), 1);

        // a new run reads the catalog again
        let mut ctx = RunContext::new(&catalog, &keys);
        assert_eq!(ctx.marker(&ds).unwrap(), "2024-01-02");
        assert_eq!(catalog.get_tag_calls(), 2);
    }

    #[test]
    fn faulting_errors() {
        let ds = DatasetName::parse("tank/home").unwrap();
        let base_missing = ReplicationError::BaseMissing {
            dataset: ds,
            base_label: "2024-01-01".into(),
        };
        assert!(base_missing.faults_job());
        assert_eq!(
            base_missing.to_string(),
            "Previously sent snapshot no longer exists: tank/home@2024-01-01"
        );

        assert!(ReplicationError::from(ConfigurationError::Unset).faults_job());

        let catalog = ReplicationError::from(CatalogError::CommandFailed {
            command: "zfs list".into(),
            error: "pool unavailable".into(),
        });
        assert!(!catalog.faults_job());
    }
}
