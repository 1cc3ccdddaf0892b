use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

use crate::catalog::SnapshotName;
use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long, global = true)]
    pub verbose: Option<LevelFilter>,

    /// Configuration file. A default one is created if it doesn't exist.
    #[arg(long, short = 'c', global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Replicate the snapshots just taken by an auto-snapshot schedule.
    Replicate(ReplicateArgs),
    /// Show the operational state of replication jobs.
    Status(StatusArgs),
    /// Return a faulted or disabled job to service.
    Clear(JobArgs),
    /// Stop a job from being run.
    Disable(JobArgs),
    /// Release the hold a job placed on a snapshot.
    Release(ReleaseArgs),
}

#[derive(Args, Debug)]
pub struct ReplicateArgs {
    /// Label of the snapshot set just taken, the part after the `@`.
    #[arg(long, env = "AUTOSNAP_LABEL")]
    pub label: String,

    /// Schedule that took the snapshots, e.g. `daily`.
    ///
    /// A service identifier like `svc:/system/filesystem/zfs/auto-snapshot:daily`
    /// is reduced to the part after its last `:`.
    #[arg(long, env = "AUTOSNAP_FMRI", value_parser = instance_name)]
    pub schedule: String,

    /// Replication job to run.
    #[arg(long, env = "PLUGIN_FMRI", value_parser = instance_name)]
    pub job: String,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Only show this job.
    #[arg(long, value_parser = instance_name)]
    pub job: Option<String>,

    /// Print the status as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct JobArgs {
    #[arg(long, env = "PLUGIN_FMRI", value_parser = instance_name)]
    pub job: String,
}

#[derive(Args, Debug)]
pub struct ReleaseArgs {
    #[command(flatten)]
    pub job: JobArgs,

    /// Snapshot to release, `dataset@label`.
    pub snapshot: SnapshotName,
}

/// Instance part of a service identifier: the text after the last `:`.
fn instance_name(s: &str) -> Result<String, String> {
    let instance = s.rsplit(':').next().unwrap_or(s).trim();
    if instance.is_empty() {
        Err(format!("no instance name in {s:?}"))
    } else {
        Ok(instance.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_names() {
        assert_eq!(
            instance_name("svc:/system/filesystem/zfs/auto-snapshot:daily").unwrap(),
            "daily"
        );
        assert_eq!(instance_name("offsite").unwrap(), "offsite");
        assert!(instance_name("svc:/application/time-slider/plugin:").is_err());
    }
}
