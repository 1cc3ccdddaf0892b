use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use derive_more::{Display, Error};
use regex::Regex;

/// Characters allowed in a single dataset path component or snapshot label.
static COMPONENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.:-]+$").expect("component regex is valid"));

/// A dataset name or snapshot name is malformed.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    /// The dataset path is empty or contains an invalid component.
    #[display("Invalid dataset name: {_0:?}")]
    Dataset(#[error(ignore)] String),
    /// The snapshot label is empty or contains invalid characters.
    #[display("Invalid snapshot label: {_0:?}")]
    Label(#[error(ignore)] String),
    /// A snapshot name lacks the `@` separator.
    #[display("Not a snapshot name: {_0:?}")]
    NotASnapshot(#[error(ignore)] String),
}

/// Name of a node in the hierarchical dataset namespace, e.g. `tank/home`.
///
/// Ordering is plain string ordering. Since every ancestor is a strict
/// prefix of its descendants, ascending order puts parents first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(transparent)]
pub struct DatasetName(String);

impl DatasetName {
    /// Validates `name` as a `/`-separated dataset path.
    pub fn parse(name: &str) -> Result<Self, NameError> {
        let valid = !name.is_empty() && name.split('/').all(|c| COMPONENT.is_match(c));
        if valid {
            Ok(Self(name.to_string()))
        } else {
            Err(NameError::Dataset(name.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns if `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &DatasetName) -> bool {
        other
            .0
            .strip_prefix(&self.0)
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Name of the snapshot `self@label`.
    pub fn snapshot(&self, label: &str) -> Result<SnapshotName, NameError> {
        validate_label(label)?;
        Ok(SnapshotName {
            dataset: self.clone(),
            label: label.to_string(),
        })
    }
}

impl fmt::Display for DatasetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DatasetName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Name of an immutable point-in-time snapshot: `dataset@label`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotName {
    dataset: DatasetName,
    label: String,
}

impl SnapshotName {
    pub fn parse(name: &str) -> Result<Self, NameError> {
        let (dataset, label) = name
            .split_once('@')
            .ok_or_else(|| NameError::NotASnapshot(name.to_string()))?;
        DatasetName::parse(dataset)?.snapshot(label)
    }

    pub fn dataset(&self) -> &DatasetName {
        &self.dataset
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.dataset, self.label)
    }
}

impl FromStr for SnapshotName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Checks that `label` is usable as the part after `@`.
pub fn validate_label(label: &str) -> Result<(), NameError> {
    if COMPONENT.is_match(label) {
        Ok(())
    } else {
        Err(NameError::Label(label.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_names_are_validated() {
        assert!(DatasetName::parse("tank").is_ok());
        assert!(DatasetName::parse("tank/home/user.name_1").is_ok());
        assert!(DatasetName::parse("").is_err());
        assert!(DatasetName::parse("tank//home").is_err());
        assert!(DatasetName::parse("tank/home/").is_err());
        assert!(DatasetName::parse("tank home").is_err());
    }

    #[test]
    fn ancestry_requires_separator() {
        let a = DatasetName::parse("tank/a").unwrap();
        let ab = DatasetName::parse("tank/a/b").unwrap();
        let ax = DatasetName::parse("tank/ax").unwrap();

        assert!(a.is_ancestor_of(&ab));
        assert!(!a.is_ancestor_of(&ax));
        assert!(!a.is_ancestor_of(&a));
        assert!(!ab.is_ancestor_of(&a));
    }

    #[test]
    fn ancestors_sort_first() {
        let mut names: Vec<DatasetName> = ["tank/a/b", "tank/a-b", "tank/a", "tank", "tank/a.b/c"]
            .into_iter()
            .map(|n| DatasetName::parse(n).unwrap())
            .collect();
        names.sort();

        for (i, later) in names.iter().enumerate() {
            for earlier in &names[..i] {
                assert!(!later.is_ancestor_of(earlier), "{later} sorted after {earlier}");
            }
        }
        assert_eq!(names[0].as_str(), "tank");
    }

    #[test]
    fn snapshot_name_splits_on_at() {
        let snap = SnapshotName::parse("tank/home@zfs-auto-snap_daily-2024-01-01-00h00").unwrap();
        assert_eq!(snap.dataset().as_str(), "tank/home");
        assert_eq!(snap.label(), "zfs-auto-snap_daily-2024-01-01-00h00");
        assert_eq!(snap.to_string(), "tank/home@zfs-auto-snap_daily-2024-01-01-00h00");

        assert_eq!(
            SnapshotName::parse("tank/home"),
            Err(NameError::NotASnapshot("tank/home".into()))
        );
        assert_eq!(
            SnapshotName::parse("tank/home@"),
            Err(NameError::Label(String::new()))
        );
    }
}
