use derive_more::{Display, Error, From};

use super::RunContext;
use crate::catalog::{CatalogError, DatasetName, SnapshotCatalog};
use crate::transfer::TransferPlan;

#[derive(Debug, Display, Error, From)]
pub enum PlanError {
    #[from]
    Catalog(CatalogError),
    /// The recorded base snapshot is gone.
    ///
    /// Its hold should have kept it alive, so something else released it.
    #[display("Previously sent snapshot no longer exists: {dataset}@{base_label}")]
    BaseMissing {
        dataset: DatasetName,
        base_label: String,
    },
}

/// Decides how `dataset@target_label` is transferred.
///
/// Without a recorded marker the snapshot is sent in full, otherwise
/// incrementally from the recorded snapshot. A recorded snapshot that no
/// longer exists is an error and never falls back to a full transfer.
pub fn plan<C: SnapshotCatalog + ?Sized>(
    ctx: &mut RunContext<'_, C>,
    dataset: &DatasetName,
    target_label: &str,
) -> Result<TransferPlan, PlanError> {
    let base_label = ctx.marker(dataset)?;
    if base_label.is_empty() {
        log::debug!(target: "replication::planner", "No previous replication registered for {dataset}");
        return Ok(TransferPlan::Full {
            target: target_label.to_string(),
        });
    }

    let base = dataset.snapshot(&base_label).map_err(CatalogError::from)?;
    log::debug!(target: "replication::planner", "Previously sent snapshot: {base}");
    if !ctx.catalog().exists(&base)? {
        return Err(PlanError::BaseMissing {
            dataset: dataset.clone(),
            base_label,
        });
    }

    Ok(TransferPlan::Incremental {
        base: base_label,
        target: target_label.to_string(),
    })
}
