//! Transfer of snapshot streams to the replication target.

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use derive_more::{Display, Error};

use crate::catalog::{DatasetName, NameError};

mod pipe;

pub use pipe::ZfsSendReceive;

/// How a dataset's target snapshot is transferred.
#[derive(Debug, Clone, PartialEq, Eq, Display, serde::Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransferPlan {
    /// Complete stream of `target`, no prior replication exists.
    #[display("full @{target}")]
    Full { target: String },
    /// Delta between the previously replicated `base` and `target`.
    #[display("incremental @{base} -> @{target}")]
    Incremental { base: String, target: String },
}

impl TransferPlan {
    pub fn target_label(&self) -> &str {
        match self {
            Self::Full { target } | Self::Incremental { target, .. } => target,
        }
    }

    pub fn base_label(&self) -> Option<&str> {
        match self {
            Self::Full { .. } => None,
            Self::Incremental { base, .. } => Some(base),
        }
    }

    /// Arguments of `zfs` producing the stream of this plan for `dataset`.
    pub fn send_args(&self, dataset: &DatasetName) -> Result<Vec<String>, NameError> {
        let target = dataset.snapshot(self.target_label())?.to_string();
        Ok(match self.base_label() {
            None => vec!["send".into(), target],
            Some(base) => {
                let base = dataset.snapshot(base)?.to_string();
                vec!["send".into(), "-i".into(), base, target]
            }
        })
    }
}

/// Command receiving the snapshot stream on its stdin,
/// e.g. `ssh backup zfs receive -d -F backup`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub receive_command: Vec<String>,
}

impl Destination {
    pub fn new(receive_command: Vec<String>) -> Self {
        Self { receive_command }
    }
}

/// Result of a successful transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferOutcome {
    /// Number of stream bytes handed to the receiving side.
    pub bytes: u64,
}

/// Side of the transfer pipeline that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TransferPhase {
    #[display("send")]
    Send,
    #[display("receive")]
    Receive,
}

#[derive(Debug, Display, Error)]
/// Failure of the external transfer pipeline.
pub enum TransferError {
    /// A pipeline process could not be started.
    #[display("Unable to start {phase} command: {source}")]
    Spawn { phase: TransferPhase, source: io::Error },
    /// Streaming between the pipeline processes failed.
    #[display("Streaming to receive command failed: {_0}")]
    Pipe(io::Error),
    /// A pipeline process exited unsuccessfully.
    #[display("{phase} command {command} failed with {status}. Error message:\n{stderr}")]
    Failed {
        phase: TransferPhase,
        command: String,
        status: ExitStatus,
        stderr: String,
    },
    /// The plan does not name valid snapshots.
    #[display("Invalid snapshot in transfer plan: {_0}")]
    Name(NameError),
}

impl TransferError {
    pub fn phase(&self) -> Option<TransferPhase> {
        match self {
            Self::Spawn { phase, .. } | Self::Failed { phase, .. } => Some(*phase),
            Self::Pipe(_) => Some(TransferPhase::Receive),
            Self::Name(_) => None,
        }
    }

    /// Exit code of the failed process, [None] if it was killed by a signal
    /// or never ran.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Failed { status, .. } => status.code(),
            _ => None,
        }
    }
}

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
/// The transfer destination is misconfigured.
pub enum ConfigurationError {
    /// No receive command is configured.
    #[display("No receive command configured")]
    Unset,
    /// The receive command can't be found.
    #[display("Can not access the configured receive command: {}", _0.display())]
    NotFound(#[error(ignore)] PathBuf),
    /// The receive command isn't executable.
    #[display("Configured receive command is not executable: {}", _0.display())]
    NotExecutable(#[error(ignore)] PathBuf),
}

/// Executes transfers of snapshots to a [Destination].
pub trait TransferExecutor {
    /// Checks `destination` before any dataset is touched.
    fn validate(&self, destination: &Destination) -> Result<(), ConfigurationError>;

    /// Transfers `dataset` according to `plan`, returning only once the
    /// receiving side has finished.
    fn transfer(
        &self,
        dataset: &DatasetName,
        plan: &TransferPlan,
        destination: &Destination,
    ) -> Result<TransferOutcome, TransferError>;
}
