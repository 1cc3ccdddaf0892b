//! Access to the snapshot catalog of the storage pool.
//!
//! The replication core only talks to the pool through the
//! [SnapshotCatalog] trait. [ZfsCatalog] implements it by running the
//! `zfs(8)` command.

use std::collections::BTreeSet;
use std::io;

use chrono::{DateTime, Utc};
use derive_more::{Display, Error, From};

mod names;
mod zfs;

pub use names::{validate_label, DatasetName, NameError, SnapshotName};
pub use zfs::ZfsCatalog;

/// A dataset as reported by [SnapshotCatalog::list_datasets].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub name: DatasetName,
    /// Mount state of a filesystem, [None] for datasets without one (volumes).
    pub mounted: Option<bool>,
}

impl Dataset {
    /// Only datasets known to be unmounted count as unmounted.
    pub fn is_unmounted(&self) -> bool {
        self.mounted == Some(false)
    }
}

/// A snapshot as reported by [SnapshotCatalog::list_snapshots].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub name: SnapshotName,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Display, Error, From)]
/// Failure talking to the snapshot catalog.
///
/// These are treated as environment issues: they abort a replication run
/// but never fault the job.
pub enum CatalogError {
    /// The catalog command could not be started.
    #[display("Unable to run {command}: {source}")]
    CommandNotRun { command: String, source: io::Error },
    /// The catalog command exited unsuccessfully.
    #[display("{command} failed: {error}")]
    CommandFailed { command: String, error: String },
    /// The catalog command printed something we can't interpret.
    #[display("Unexpected output of {command}: {line:?}")]
    UnexpectedOutput { command: String, line: String },
    /// A name reported by or passed to the catalog is malformed.
    #[from]
    Name(NameError),
}

/// Operations on the snapshot catalog needed for replication.
///
/// Single property writes are expected to be atomic.
pub trait SnapshotCatalog {
    /// Snapshots whose label is exactly `label`.
    fn list_snapshots(&self, label: &str) -> Result<Vec<Snapshot>, CatalogError>;

    /// Datasets belonging to the auto-snapshot set of `schedule`.
    fn list_set_members(&self, schedule: &str) -> Result<BTreeSet<DatasetName>, CatalogError>;

    /// All datasets of the pool with their mount state.
    fn list_datasets(&self) -> Result<Vec<Dataset>, CatalogError>;

    /// Value of the tag `key` on `dataset`, empty if unset.
    ///
    /// A value set on an ancestor is inherited.
    fn get_tag(&self, dataset: &DatasetName, key: &str) -> Result<String, CatalogError>;

    /// Value of the tag `key` set on `dataset` itself, empty if unset or only
    /// inherited.
    fn get_local_tag(&self, dataset: &DatasetName, key: &str) -> Result<String, CatalogError>;

    fn set_tag(&self, dataset: &DatasetName, key: &str, value: &str) -> Result<(), CatalogError>;

    /// Tags of all holds on `snapshot`.
    fn holds(&self, snapshot: &SnapshotName) -> Result<BTreeSet<String>, CatalogError>;

    fn place_hold(&self, snapshot: &SnapshotName, tag: &str) -> Result<(), CatalogError>;

    fn release_hold(&self, snapshot: &SnapshotName, tag: &str) -> Result<(), CatalogError>;

    fn exists(&self, snapshot: &SnapshotName) -> Result<bool, CatalogError>;
}
