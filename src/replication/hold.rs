use derive_more::{Display, Error};

use crate::catalog::{CatalogError, SnapshotCatalog, SnapshotName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum HoldAction {
    #[display("Placing")]
    Place,
    #[display("Releasing")]
    Release,
}

/// The catalog failed while placing or releasing a hold.
#[derive(Debug, Display, Error)]
#[display("{action} hold {tag} on {snapshot} failed: {source}")]
pub struct HoldError {
    pub action: HoldAction,
    pub snapshot: SnapshotName,
    pub tag: String,
    pub source: CatalogError,
}

/// Places and releases the holds protecting snapshots until they are transferred.
///
/// Both operations are idempotent, so they can be repeated by a restarted run.
pub struct HoldManager<'a, C: ?Sized> {
    catalog: &'a C,
}

impl<'a, C: SnapshotCatalog + ?Sized> HoldManager<'a, C> {
    pub fn new(catalog: &'a C) -> Self {
        Self { catalog }
    }

    /// Makes sure `snapshot` carries the hold `tag`.
    ///
    /// Returns if a new hold was placed.
    pub fn ensure_hold(&self, snapshot: &SnapshotName, tag: &str) -> Result<bool, HoldError> {
        let error = |source: CatalogError| HoldError {
            action: HoldAction::Place,
            snapshot: snapshot.clone(),
            tag: tag.to_string(),
            source,
        };

        if self.catalog.holds(snapshot).map_err(error)?.contains(tag) {
            return Ok(false);
        }

        log::debug!(target: "replication::hold", "Placing hold on {snapshot}");
        self.catalog.place_hold(snapshot, tag).map_err(error)?;
        Ok(true)
    }

    /// Releases the hold `tag` on `snapshot` if the snapshot still carries it.
    ///
    /// Returns if a hold was released.
    pub fn release(&self, snapshot: &SnapshotName, tag: &str) -> Result<bool, HoldError> {
        let error = |source: CatalogError| HoldError {
            action: HoldAction::Release,
            snapshot: snapshot.clone(),
            tag: tag.to_string(),
            source,
        };

        if !self.catalog.exists(snapshot).map_err(error)? {
            log::debug!(target: "replication::hold", "No hold to release: {snapshot} no longer exists");
            return Ok(false);
        }
        if !self.catalog.holds(snapshot).map_err(error)?.contains(tag) {
            return Ok(false);
        }

        log::debug!(target: "replication::hold", "Releasing hold on {snapshot}");
        self.catalog.release_hold(snapshot, tag).map_err(error)?;
        Ok(true)
    }
}
