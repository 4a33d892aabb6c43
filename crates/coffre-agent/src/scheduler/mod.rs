//! Periodic task scheduler.
//!
//! Declares maintenance tasks and task sets (backup, check, restore,
//! sync), each becoming a worker loop that sleeps its interval and then
//! drives the corresponding subcommand through the agent RPC path, so
//! every serialization guarantee of the daemon applies to scheduled work
//! too. A `retention` value adds a follow-up `rm` bounded at
//! `now - retention`.

pub mod client;
pub mod server;
pub mod tasks;

use std::path::PathBuf;
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};

use coffre_storage::backend::StoreConfig;
use coffre_storage::CancelToken;

use crate::error::{AgentError, AgentResult};
use crate::subcommand::SyncDirection;

/// A standalone maintenance loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceTask {
    /// Backend configuration of the repository to maintain.
    pub repository: StoreConfig,
    /// Seconds between runs.
    pub interval_secs: u64,
    /// When set, follow up with `rm -before now-retention -apply`.
    #[serde(default)]
    pub retention_secs: Option<u64>,
}

/// Backup member of a task set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupTask {
    /// Source tree to capture.
    pub path: String,
    /// Seconds between runs.
    pub interval_secs: u64,
    /// When set, follow up with `rm -before now-retention -apply`.
    #[serde(default)]
    pub retention_secs: Option<u64>,
    /// Path substrings to skip.
    #[serde(default)]
    pub ignore: Vec<String>,
    /// Verify each capture right after it lands.
    #[serde(default)]
    pub check: bool,
}

/// Check member of a task set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckTask {
    /// Snapshot id prefix to verify; empty means by-latest.
    #[serde(default)]
    pub path: String,
    /// Seconds between runs.
    pub interval_secs: u64,
    /// Verify only the most recent snapshot.
    #[serde(default)]
    pub latest: bool,
}

/// Restore member of a task set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreTask {
    /// Snapshot id prefix to restore; empty means latest.
    #[serde(default)]
    pub path: String,
    /// Directory restored files land in.
    pub target: String,
    /// Seconds between runs.
    pub interval_secs: u64,
}

/// Sync member of a task set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTask {
    /// Peer repository location.
    pub peer: String,
    /// Direction of synchronization.
    pub direction: SyncDirection,
    /// Seconds between runs.
    pub interval_secs: u64,
}

/// A named group of tasks against one repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSet {
    /// Job name recorded on produced snapshots.
    pub name: String,
    /// Backend configuration of the repository.
    pub repository: StoreConfig,
    /// Optional backup loop.
    #[serde(default)]
    pub backup: Option<BackupTask>,
    /// Check loops.
    #[serde(default)]
    pub check: Vec<CheckTask>,
    /// Restore loops.
    #[serde(default)]
    pub restore: Vec<RestoreTask>,
    /// Sync loops.
    #[serde(default)]
    pub sync: Vec<SyncTask>,
}

/// The scheduler's task declaration, loaded from the tasks file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maintenance loops.
    #[serde(default)]
    pub maintenance: Vec<MaintenanceTask>,
    /// Task sets.
    #[serde(default)]
    pub tasks: Vec<TaskSet>,
}

impl SchedulerConfig {
    /// Parses the tasks file.
    pub fn parse(bytes: &[u8]) -> AgentResult<SchedulerConfig> {
        let config: SchedulerConfig = serde_json::from_slice(bytes)
            .map_err(|e| AgentError::Usage(format!("tasks configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> AgentResult<()> {
        let check_interval = |interval: u64, what: &str| {
            if interval == 0 {
                Err(AgentError::Usage(format!("{what}: interval must be positive")))
            } else {
                Ok(())
            }
        };
        let check_repo = |repository: &StoreConfig, what: &str| {
            if repository.contains_key("location") {
                Ok(())
            } else {
                Err(AgentError::Usage(format!("{what}: repository needs a location")))
            }
        };

        for (i, task) in self.maintenance.iter().enumerate() {
            check_interval(task.interval_secs, &format!("maintenance[{i}]"))?;
            check_repo(&task.repository, &format!("maintenance[{i}]"))?;
        }
        for set in &self.tasks {
            check_repo(&set.repository, &set.name)?;
            if let Some(backup) = &set.backup {
                check_interval(backup.interval_secs, &set.name)?;
            }
            for check in &set.check {
                check_interval(check.interval_secs, &set.name)?;
            }
            for restore in &set.restore {
                check_interval(restore.interval_secs, &set.name)?;
                if restore.target.is_empty() {
                    return Err(AgentError::Usage(format!(
                        "{}: restore target must be set",
                        set.name
                    )));
                }
            }
            for sync in &set.sync {
                check_interval(sync.interval_secs, &set.name)?;
            }
        }
        Ok(())
    }
}

/// Spawns and owns the task worker threads.
pub struct Scheduler {
    config: SchedulerConfig,
    cache_dir: PathBuf,
}

impl Scheduler {
    /// Builds a scheduler over a parsed configuration.
    pub fn new(config: SchedulerConfig, cache_dir: PathBuf) -> Self {
        Scheduler { config, cache_dir }
    }

    /// Starts one worker thread per declared task. Workers run until the
    /// token fires.
    pub fn spawn(&self, token: &CancelToken) -> Vec<JoinHandle<()>> {
        let mut workers = Vec::new();

        for task in &self.config.maintenance {
            workers.push(tasks::spawn_maintenance(
                token.clone(),
                self.cache_dir.clone(),
                task.clone(),
            ));
        }
        for set in &self.config.tasks {
            if let Some(backup) = &set.backup {
                workers.push(tasks::spawn_backup(
                    token.clone(),
                    self.cache_dir.clone(),
                    set.clone(),
                    backup.clone(),
                ));
            }
            for check in &set.check {
                workers.push(tasks::spawn_check(
                    token.clone(),
                    self.cache_dir.clone(),
                    set.clone(),
                    check.clone(),
                ));
            }
            for restore in &set.restore {
                workers.push(tasks::spawn_restore(
                    token.clone(),
                    self.cache_dir.clone(),
                    set.clone(),
                    restore.clone(),
                ));
            }
            for sync in &set.sync {
                workers.push(tasks::spawn_sync(
                    token.clone(),
                    self.cache_dir.clone(),
                    set.clone(),
                    sync.clone(),
                ));
            }
        }
        workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let json = br#"{
            "maintenance": [
                {"repository": {"location": "fs:///srv/kloset"}, "interval_secs": 3600, "retention_secs": 86400}
            ],
            "tasks": [
                {
                    "name": "nightly",
                    "repository": {"location": "fs:///srv/kloset"},
                    "backup": {"path": "/home", "interval_secs": 86400, "ignore": [".cache"], "check": true},
                    "check": [{"interval_secs": 7200, "latest": true}],
                    "sync": [{"peer": "fs:///srv/mirror", "direction": "to", "interval_secs": 3600}]
                }
            ]
        }"#;
        let config = SchedulerConfig::parse(json).unwrap();
        assert_eq!(config.maintenance.len(), 1);
        assert_eq!(config.tasks.len(), 1);
        let set = &config.tasks[0];
        assert!(set.backup.is_some());
        assert_eq!(set.check.len(), 1);
        assert_eq!(set.sync[0].direction, SyncDirection::To);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let json = br#"{
            "maintenance": [
                {"repository": {"location": "fs:///x"}, "interval_secs": 0}
            ]
        }"#;
        assert!(SchedulerConfig::parse(json).is_err());
    }

    #[test]
    fn test_missing_location_rejected() {
        let json = br#"{
            "tasks": [{"name": "broken", "repository": {}}]
        }"#;
        assert!(SchedulerConfig::parse(json).is_err());
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config = SchedulerConfig::parse(b"{}").unwrap();
        assert!(config.maintenance.is_empty());
        assert!(config.tasks.is_empty());
    }
}
