use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Command;

use chrono::DateTime;

use super::{validate_label, CatalogError, Dataset, DatasetName, Snapshot, SnapshotCatalog, SnapshotName};

const DEFAULT_ZFS_COMMAND: &str = "zfs";

/// Property marking a dataset for snapshots of every schedule.
const AUTO_SNAPSHOT_PROP: &str = "com.sun:auto-snapshot";

/// [SnapshotCatalog] backed by the `zfs` command line tool.
#[derive(Debug, Clone)]
pub struct ZfsCatalog {
    zfs: PathBuf,
    /// Command prefixed to every modifying `zfs` invocation, e.g. `pfexec`.
    elevate: Option<PathBuf>,
}

impl Default for ZfsCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_ZFS_COMMAND, None)
    }
}

impl ZfsCatalog {
    pub fn new(zfs: impl Into<PathBuf>, elevate: Option<PathBuf>) -> Self {
        Self {
            zfs: zfs.into(),
            elevate,
        }
    }

    fn command(&self, modifying: bool) -> Command {
        match self.elevate.as_ref().filter(|_| modifying) {
            Some(elevate) => {
                let mut cmd = Command::new(elevate);
                cmd.arg(&self.zfs);
                cmd
            }
            None => Command::new(&self.zfs),
        }
    }

    fn execute(&self, mut cmd: Command) -> Result<String, CatalogError> {
        let command = format!("{cmd:?}");
        log::trace!(target: "catalog::zfs", "Running: {command}");

        let output = cmd.output().map_err(|source| CatalogError::CommandNotRun {
            command: command.clone(),
            source,
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(CatalogError::CommandFailed {
                command,
                error: stderr.trim_end().to_string(),
            });
        }

        // relay stderr
        if !stderr.is_empty() {
            log::warn!(target: "catalog::zfs", "{}", stderr.trim_end());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Reads a property, only its local value if `local`.
    fn get(&self, dataset: &DatasetName, key: &str, local: bool) -> Result<String, CatalogError> {
        let mut cmd = self.command(false);
        cmd.arg("get").arg("-H").arg("-o").arg("value");
        if local {
            cmd.arg("-s").arg("local");
        }
        cmd.arg(key).arg(dataset.as_str());

        let value = self.execute(cmd)?;
        Ok(unset_as_empty(value.trim_end_matches('\n')).to_string())
    }

    fn list(&self, args: &[&str]) -> Result<(String, String), CatalogError> {
        let mut cmd = self.command(false);
        cmd.arg("list").arg("-H").args(args);
        let command = format!("{cmd:?}");
        Ok((command, self.execute(cmd)?))
    }
}

impl SnapshotCatalog for ZfsCatalog {
    fn list_snapshots(&self, label: &str) -> Result<Vec<Snapshot>, CatalogError> {
        validate_label(label)?;
        let (command, stdout) = self.list(&["-p", "-t", "snapshot", "-o", "name,creation"])?;

        let mut snapshots = Vec::new();
        for line in stdout.lines() {
            let labeled = line
                .split_once('\t')
                .and_then(|(name, _)| name.split_once('@'))
                .is_some_and(|(_, snap_label)| snap_label == label);
            if !labeled {
                continue;
            }

            let parsed = parse_snapshot_line(line).ok_or_else(|| unexpected(&command, line))?;
            snapshots.extend(skip_malformed(parsed, line));
        }

        log::debug!(target: "catalog::zfs", "Found {} snapshot(s) labeled {label}", snapshots.len());
        Ok(snapshots)
    }

    fn list_set_members(&self, schedule: &str) -> Result<BTreeSet<DatasetName>, CatalogError> {
        validate_label(schedule)?;
        let columns = format!("name,{AUTO_SNAPSHOT_PROP}:{schedule},{AUTO_SNAPSHOT_PROP}");
        let (command, stdout) = self.list(&["-t", "filesystem,volume", "-o", columns.as_str()])?;

        let mut members = BTreeSet::new();
        for line in stdout.lines() {
            let parsed = parse_membership_line(line).ok_or_else(|| unexpected(&command, line))?;
            members.extend(skip_malformed(parsed, line).flatten());
        }
        Ok(members)
    }

    fn list_datasets(&self) -> Result<Vec<Dataset>, CatalogError> {
        let (command, stdout) = self.list(&["-t", "filesystem,volume", "-o", "name,mounted"])?;

        let mut datasets = Vec::new();
        for line in stdout.lines() {
            let parsed = parse_dataset_line(line).ok_or_else(|| unexpected(&command, line))?;
            datasets.extend(skip_malformed(parsed, line));
        }
        Ok(datasets)
    }

    fn get_tag(&self, dataset: &DatasetName, key: &str) -> Result<String, CatalogError> {
        self.get(dataset, key, false)
    }

    fn get_local_tag(&self, dataset: &DatasetName, key: &str) -> Result<String, CatalogError> {
        self.get(dataset, key, true)
    }

    fn set_tag(&self, dataset: &DatasetName, key: &str, value: &str) -> Result<(), CatalogError> {
        log::debug!(target: "catalog::zfs", "Setting {key}={value} on {dataset}");
        let mut cmd = self.command(true);
        cmd.arg("set").arg(format!("{key}={value}")).arg(dataset.as_str());
        self.execute(cmd).map(drop)
    }

    fn holds(&self, snapshot: &SnapshotName) -> Result<BTreeSet<String>, CatalogError> {
        let mut cmd = self.command(false);
        cmd.arg("holds").arg("-H").arg(snapshot.to_string());
        let command = format!("{cmd:?}");

        self.execute(cmd)?
            .lines()
            .map(|line| {
                parse_hold_line(line).ok_or_else(|| CatalogError::UnexpectedOutput {
                    command: command.clone(),
                    line: line.to_string(),
                })
            })
            .collect()
    }

    fn place_hold(&self, snapshot: &SnapshotName, tag: &str) -> Result<(), CatalogError> {
        let mut cmd = self.command(true);
        cmd.arg("hold").arg(tag).arg(snapshot.to_string());
        self.execute(cmd).map(drop)
    }

    fn release_hold(&self, snapshot: &SnapshotName, tag: &str) -> Result<(), CatalogError> {
        let mut cmd = self.command(true);
        cmd.arg("release").arg(tag).arg(snapshot.to_string());
        self.execute(cmd).map(drop)
    }

    fn exists(&self, snapshot: &SnapshotName) -> Result<bool, CatalogError> {
        let mut cmd = self.command(false);
        cmd.arg("list")
            .arg("-H")
            .arg("-o")
            .arg("name")
            .arg("-t")
            .arg("snapshot")
            .arg(snapshot.to_string());

        match self.execute(cmd) {
            Ok(_) => Ok(true),
            Err(CatalogError::CommandFailed { error, .. }) if error.contains("does not exist") => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

fn unexpected(command: &str, line: &str) -> CatalogError {
    CatalogError::UnexpectedOutput {
        command: command.to_string(),
        line: line.to_string(),
    }
}

/// Drops entries whose name `zfs` accepts but we don't, e.g. one containing
/// spaces. Such datasets are never replicated.
fn skip_malformed<T>(parsed: Result<T, CatalogError>, line: &str) -> Option<T> {
    parsed
        .map_err(|e| log::warn!(target: "catalog::zfs", "Ignoring {line:?}: {e}"))
        .ok()
}

/// `zfs` prints `-` for unset properties.
fn unset_as_empty(value: &str) -> &str {
    if value == "-" {
        ""
    } else {
        value
    }
}

/// Parses `name<TAB>creation` with `creation` in epoch seconds.
fn parse_snapshot_line(line: &str) -> Option<Result<Snapshot, CatalogError>> {
    let (name, creation) = line.split_once('\t')?;
    let created = DateTime::from_timestamp(creation.trim().parse().ok()?, 0)?;
    Some(SnapshotName::parse(name).map(|name| Snapshot { name, created }).map_err(Into::into))
}

/// Parses `name<TAB>schedule-property<TAB>generic-property`.
///
/// A schedule specific value wins over the generic one.
fn parse_membership_line(line: &str) -> Option<Result<Option<DatasetName>, CatalogError>> {
    let mut fields = line.split('\t');
    let name = fields.next()?;
    let scheduled = unset_as_empty(fields.next()?);
    let generic = unset_as_empty(fields.next()?);

    let member = match scheduled {
        "" => generic == "true",
        value => value == "true",
    };
    if !member {
        return Some(Ok(None));
    }
    Some(DatasetName::parse(name).map(Some).map_err(Into::into))
}

/// Parses `name<TAB>mounted` where `mounted` is `yes`, `no` or `-`.
fn parse_dataset_line(line: &str) -> Option<Result<Dataset, CatalogError>> {
    let (name, mounted) = line.split_once('\t')?;
    let mounted = match mounted {
        "yes" => Some(true),
        "no" => Some(false),
        "-" => None,
        _ => return None,
    };
    Some(DatasetName::parse(name).map(|name| Dataset { name, mounted }).map_err(Into::into))
}

/// Parses `snapshot<TAB>tag<TAB>timestamp` of `zfs holds -H`.
fn parse_hold_line(line: &str) -> Option<String> {
    line.split('\t').nth(1).map(str::to_string)
}
