use derive_more::Display;

use super::{plan, select, HoldManager, Job, ReplicationError, RunContext};
use crate::catalog::{validate_label, CatalogError, DatasetName, SnapshotCatalog};
use crate::service::ServiceStateStore;
use crate::transfer::{TransferExecutor, TransferPlan};

/// Progress of a replication run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RunState {
    #[display("idle")]
    Idle,
    #[display("selecting")]
    Selecting,
    #[display("holding candidates")]
    HoldingCandidates,
    #[display("planning")]
    Planning,
    #[display("transferring #{_0}")]
    Transferring(usize),
    #[display("recording #{_0}")]
    Recording(usize),
    #[display("releasing prior hold #{_0}")]
    ReleasingPriorHold(usize),
    #[display("done")]
    Done,
    #[display("faulted")]
    Faulted,
}

impl RunState {
    /// Returns if a run may move from `self` to `next`.
    ///
    /// Any state but a terminal one may fault, or return to [RunState::Idle]
    /// when a catalog failure aborts the run without faulting the job.
    pub fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;

        match (self, next) {
            (Done | Faulted, Faulted) => false,
            (_, Faulted) => true,
            (Faulted, _) => false,
            (_, Idle) => true,
            (Idle, Selecting) => true,
            (Selecting, HoldingCandidates | Done) => true,
            (HoldingCandidates, Planning) => true,
            (Planning, Transferring(0)) => true,
            (Transferring(i), Recording(j)) => i == j,
            (Recording(i), ReleasingPriorHold(j)) => i == j,
            (ReleasingPriorHold(i), Transferring(j)) => j == i + 1,
            (ReleasingPriorHold(_), Done) => true,
            _ => false,
        }
    }
}

/// Why a run didn't replicate anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, serde::Serialize)]
pub enum SkipReason {
    /// The job doesn't react to the schedule.
    #[display("job is not triggered by this schedule")]
    NotTriggered,
    /// The job is disabled or awaiting operator intervention.
    #[display("job is not enabled")]
    NotEnabled,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CompletedTransfer {
    pub dataset: DatasetName,
    pub plan: TransferPlan,
    pub bytes: u64,
}

/// Outcome of a run that didn't fail.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum RunReport {
    Skipped(SkipReason),
    /// Transfers in the order they were made, possibly none.
    Completed { transfers: Vec<CompletedTransfer> },
}

/// Tracks the [RunState] of one run and logs its transitions.
struct Run<'a> {
    job: &'a str,
    state: RunState,
}

impl<'a> Run<'a> {
    fn new(job: &'a str) -> Self {
        Self {
            job,
            state: RunState::Idle,
        }
    }

    fn advance(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid run transition {} -> {next}",
            self.state
        );
        log::trace!(target: "replication::controller", "{}: {} -> {next}", self.job, self.state);
        self.state = next;
    }
}

/// Drives replication runs of a job.
///
/// Only the controller faults jobs. Runs of the same job must not overlap.
pub struct Controller<'a, C: ?Sized, T: ?Sized, S: ?Sized> {
    catalog: &'a C,
    executor: &'a T,
    service: &'a S,
}

impl<'a, C, T, S> Controller<'a, C, T, S>
where
    C: SnapshotCatalog + ?Sized,
    T: TransferExecutor + ?Sized,
    S: ServiceStateStore + ?Sized,
{
    pub fn new(catalog: &'a C, executor: &'a T, service: &'a S) -> Self {
        Self {
            catalog,
            executor,
            service,
        }
    }

    /// Replicates the snapshots labeled `label` just taken by `schedule`.
    ///
    /// Errors requiring operator review put the job into maintenance before
    /// they are returned.
    pub fn run(&self, job: &Job, schedule: &str, label: &str) -> Result<RunReport, ReplicationError> {
        if !job.is_triggered_by(schedule) {
            log::debug!(target: "replication::controller", "Job {} is not triggered by schedule {schedule}", job.id());
            return Ok(RunReport::Skipped(SkipReason::NotTriggered));
        }
        if !self.service.is_enabled(job.id())? {
            log::info!(target: "replication::controller", "Job {} is not enabled. Skipping execution", job.id());
            return Ok(RunReport::Skipped(SkipReason::NotEnabled));
        }

        log::info!(target: "replication::controller", "Replicating snapshots labeled {label} of schedule {schedule} for job {}", job.id());
        let mut run = Run::new(job.id());
        match self.replicate(&mut run, job, schedule, label) {
            Ok(report) => {
                run.advance(RunState::Idle);
                Ok(report)
            }
            Err(e) if e.faults_job() => {
                log::error!(target: "replication::controller", "Job {} failed while {}: {e}", job.id(), run.state);
                run.advance(RunState::Faulted);
                log::error!(target: "replication::controller", "Placing job {} into maintenance state", job.id());
                if let Err(se) = self.service.mark_faulted(job.id()) {
                    log::error!(target: "replication::controller", "Unable to fault job {}: {se}", job.id());
                }
                Err(e)
            }
            Err(e) => {
                log::error!(target: "replication::controller", "Job {} aborted while {}: {e}", job.id(), run.state);
                run.advance(RunState::Idle);
                Err(e)
            }
        }
    }

    fn replicate(
        &self,
        run: &mut Run<'_>,
        job: &Job,
        schedule: &str,
        label: &str,
    ) -> Result<RunReport, ReplicationError> {
        validate_label(label).map_err(CatalogError::from)?;
        self.executor.validate(&job.destination)?;

        let mut ctx = RunContext::new(self.catalog, &job.keys);
        let tag = job.keys.hold_tag();

        run.advance(RunState::Selecting);
        let candidates = select(&mut ctx, label, schedule)?;
        if candidates.is_empty() {
            log::info!(target: "replication::controller", "No new snapshots labeled {label} to replicate");
            run.advance(RunState::Done);
            return Ok(RunReport::Completed {
                transfers: Vec::new(),
            });
        }

        // hold every target before the first transfer, so a crash never
        // leaves a new snapshot unprotected
        run.advance(RunState::HoldingCandidates);
        let holds = HoldManager::new(self.catalog);
        let targets = candidates
            .iter()
            .map(|ds| ds.snapshot(label))
            .collect::<Result<Vec<_>, _>>()
            .map_err(CatalogError::from)?;
        for target in &targets {
            holds.ensure_hold(target, tag)?;
        }

        // a single missing base aborts the run before anything is sent
        run.advance(RunState::Planning);
        let plans = candidates
            .iter()
            .map(|ds| plan(&mut ctx, ds, label))
            .collect::<Result<Vec<_>, _>>()?;

        let mut transfers = Vec::with_capacity(candidates.len());
        for (i, ((dataset, plan), snapshot)) in candidates.into_iter().zip(plans).zip(targets).enumerate() {
            run.advance(RunState::Transferring(i));
            log::info!(target: "replication::controller", "Sending {plan} of {dataset}");
            let outcome = self
                .executor
                .transfer(&dataset, &plan, &job.destination)
                .map_err(|source| ReplicationError::Transfer {
                    snapshot: snapshot.clone(),
                    source,
                })?;

            run.advance(RunState::Recording(i));
            ctx.set_marker(&dataset, label)?;

            // the new snapshot stays held as base of the next run
            run.advance(RunState::ReleasingPriorHold(i));
            if let Some(base) = plan.base_label() {
                let base = dataset.snapshot(base).map_err(CatalogError::from)?;
                log::debug!(target: "replication::controller", "Releasing hold on previous snapshot: {base}");
                holds.release(&base, tag)?;
            }

            log::info!(target: "replication::controller", "Replicated {snapshot} ({} bytes)", outcome.bytes);
            transfers.push(CompletedTransfer {
                dataset,
                plan,
                bytes: outcome.bytes,
            });
        }

        run.advance(RunState::Done);
        log::info!(target: "replication::controller", "Sending of {label} snapshot streams completed");
        Ok(RunReport::Completed { transfers })
    }
}
