use std::collections::{BTreeSet, HashMap};

use super::RunContext;
use crate::catalog::{CatalogError, DatasetName, SnapshotCatalog};

/// Selects the datasets with a snapshot labeled `label` to replicate.
///
/// A dataset qualifies if it
/// - belongs to the auto-snapshot set of `schedule`,
/// - carries the job's enable tag with value `true`,
/// - is not unmounted,
/// - hasn't already been replicated up to `label`.
///
/// The set membership check rules out snapshots received from another pool
/// that merely match the label.
///
/// The result is deduplicated and sorted ascending, which puts every
/// dataset after its ancestors.
pub fn select<C: SnapshotCatalog + ?Sized>(
    ctx: &mut RunContext<'_, C>,
    label: &str,
    schedule: &str,
) -> Result<Vec<DatasetName>, CatalogError> {
    let catalog = ctx.catalog();
    let enable_key = ctx.keys().enable();

    let snapshots = catalog.list_snapshots(label)?;
    let members = catalog.list_set_members(schedule)?;
    let datasets: HashMap<_, _> = catalog
        .list_datasets()?
        .into_iter()
        .map(|ds| (ds.name.clone(), ds))
        .collect();

    let mut candidates = BTreeSet::new();
    for snapshot in snapshots {
        let name = snapshot.name.dataset();

        if !members.contains(name) {
            log::debug!(target: "replication::selector", "Skipping {}: not part of the {schedule} snapshot set", snapshot.name);
            continue;
        }
        if ctx.tag(name, enable_key)? != "true" {
            log::debug!(target: "replication::selector", "Skipping {}: replication not enabled on {name}", snapshot.name);
            continue;
        }
        match datasets.get(name) {
            None => {
                log::warn!(target: "replication::selector", "Skipping {}: dataset {name} is not listed", snapshot.name);
                continue;
            }
            Some(ds) if ds.is_unmounted() => {
                log::info!(target: "replication::selector", "Ignoring snapshot of unmounted dataset: {}", snapshot.name);
                continue;
            }
            Some(_) => {}
        }
        if ctx.marker(name)? == label {
            log::debug!(target: "replication::selector", "Skipping {}: already replicated", snapshot.name);
            continue;
        }

        log::debug!(target: "replication::selector", "Selected {} created {}", snapshot.name, snapshot.created);
        candidates.insert(name.clone());
    }

    let candidates: Vec<_> = candidates.into_iter().collect();
    debug_assert!(candidates
        .windows(2)
        .all(|pair| !pair[1].is_ancestor_of(&pair[0])));
    Ok(candidates)
}
