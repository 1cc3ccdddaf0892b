//! Configuration file of the replicator.
//!
//! ```toml
//! property_prefix = "org.opensolaris:time-slider-plugin"
//! elevate = "/usr/bin/pfexec"
//!
//! [jobs.offsite]
//! receive_command = ["/usr/bin/ssh", "backup@vault", "zfs", "receive", "-d", "-F", "backup"]
//! trigger_on = ["daily", "weekly"]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error};

use crate::replication::{Job, JobKeys, TRIGGER_ALL};
use crate::transfer::Destination;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/snap-replicate/config.toml";
const DEFAULT_PROPERTY_PREFIX: &str = "org.opensolaris:time-slider-plugin";
const DEFAULT_ZFS_COMMAND: &str = "zfs";
const DEFAULT_STATE_FILE: &str = "/var/lib/snap-replicate/state.toml";
const DEFAULT_JOB: &str = "zfs-send";

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
/// Configuration of the replicator and all of its jobs.
pub struct ReplicatorConfig {
    /// Namespace of the dataset properties and hold tags owned by the jobs.
    #[serde(default = "default_property_prefix")]
    pub property_prefix: String,

    /// The `zfs(8)` command.
    #[serde(default = "default_zfs_command")]
    pub zfs_command: PathBuf,

    /// Command used to run modifying `zfs` invocations and the transfer
    /// pipeline with elevated privileges, e.g. `pfexec` or `sudo`.
    #[serde(default)]
    pub elevate: Option<PathBuf>,

    /// File keeping the operational state of the jobs.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Replication jobs by name.
    #[serde(default)]
    pub jobs: BTreeMap<String, JobConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
/// Configuration of a single replication job.
pub struct JobConfig {
    /// Command receiving the snapshot streams on stdin.
    #[serde(default)]
    pub receive_command: Vec<String>,

    /// Schedules triggering the job, `"all"` for every schedule.
    #[serde(default = "default_triggers")]
    pub trigger_on: Vec<String>,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            property_prefix: default_property_prefix(),
            zfs_command: default_zfs_command(),
            elevate: None,
            state_file: default_state_file(),
            jobs: BTreeMap::from([(DEFAULT_JOB.to_string(), JobConfig::default())]),
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            receive_command: Vec::new(),
            trigger_on: default_triggers(),
        }
    }
}

fn default_property_prefix() -> String {
    DEFAULT_PROPERTY_PREFIX.to_string()
}

fn default_zfs_command() -> PathBuf {
    DEFAULT_ZFS_COMMAND.into()
}

fn default_state_file() -> PathBuf {
    DEFAULT_STATE_FILE.into()
}

fn default_triggers() -> Vec<String> {
    vec![TRIGGER_ALL.to_string()]
}

#[derive(Debug, Display, Error)]
pub enum ConfigError {
    #[display("Reading the config file {} failed: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[display("Parsing the config file {} failed: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// No job of that name is configured.
    #[display("No replication job configured with name {_0:?}")]
    UnknownJob(#[error(ignore)] String),
}

impl ReplicatorConfig {
    /// Loads the config at `path`.
    ///
    /// A missing file is replaced by the default config, which is written to
    /// `path` for later editing.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!(
                    "Writing default config to {} because it doesn't exist yet",
                    path.display()
                );
                let default_config = Self::default();
                match toml::to_string_pretty(&default_config) {
                    Ok(config_str) => {
                        if let Err(e) = fs::write(path, config_str) {
                            log::warn!("Writing default config to {} failed {e}", path.display());
                        }
                    }
                    Err(e) => log::warn!("Serializing the default config failed: {e}"),
                }
                Ok(default_config)
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Resolves the job named `name`.
    pub fn job(&self, name: &str) -> Result<Job, ConfigError> {
        let cfg = self
            .jobs
            .get(name)
            .ok_or_else(|| ConfigError::UnknownJob(name.to_string()))?;

        Ok(Job {
            keys: JobKeys::new(&self.property_prefix, name),
            destination: Destination::new(cfg.receive_command.clone()),
            trigger_on: cfg.trigger_on.clone(),
        })
    }
}
