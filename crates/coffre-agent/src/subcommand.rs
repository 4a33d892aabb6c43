//! The closed set of subcommands and their dispatch.
//!
//! Subcommands travel the wire as a name path plus msgpack-encoded
//! arguments; the dispatcher pattern-matches the name path into the
//! matching variant, decodes the payload into it, and runs it. The set is
//! known at compile time; registration is this module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coffre_policy::Criteria;
use coffre_repository::Repository;

use crate::commands;
use crate::context::ExecContext;
use crate::error::{AgentError, AgentResult};

/// Capability and lifecycle flags for a subcommand.
pub mod flags {
    /// Can be invoked through the agent.
    pub const AGENT_SUPPORT: u32 = 1 << 0;
    /// Run without opening a repository.
    pub const BEFORE_REPOSITORY_OPEN: u32 = 1 << 1;
    /// Run with storage configuration but no opened repository.
    pub const BEFORE_REPOSITORY_WITH_STORAGE: u32 = 1 << 2;
    /// Skip the handshake version check.
    pub const IGNORE_VERSION: u32 = 1 << 3;
}

/// `agent start` arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStartArgs {
    /// Idle grace in seconds before the daemon tears down.
    pub teardown_secs: u64,
}

impl Default for AgentStartArgs {
    fn default() -> Self {
        AgentStartArgs { teardown_secs: 5 }
    }
}

/// `scheduler start` arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStartArgs {
    /// Path of the tasks configuration file.
    pub tasks: String,
}

/// `create` arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateArgs {
    /// Encrypt the repository with this passphrase.
    pub passphrase: Option<String>,
    /// Store blobs uncompressed.
    pub no_compression: bool,
}

/// `backup` arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupArgs {
    /// Source tree to capture.
    pub path: String,
    /// Job name recorded in the snapshot header.
    pub name: String,
    /// Tags recorded in the snapshot header.
    pub tags: Vec<String>,
    /// Path substrings to skip.
    pub ignore: Vec<String>,
    /// Verify the snapshot right after capturing it.
    pub check: bool,
}

/// `check` arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckArgs {
    /// Snapshot id prefixes to verify; empty with `latest` unset means all.
    pub snapshots: Vec<String>,
    /// Verify only the most recent snapshot.
    pub latest: bool,
}

/// `restore` arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreArgs {
    /// Snapshot id prefix; empty means latest.
    pub snapshot: Option<String>,
    /// Directory restored files land in.
    pub target: String,
}

/// Sync direction relative to the local repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    /// Push local snapshots to the peer.
    To,
    /// Pull peer snapshots locally.
    From,
    /// Both directions.
    With,
}

/// `sync` arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncArgs {
    /// Peer repository location.
    pub peer: String,
    /// Peer passphrase when the peer is encrypted.
    pub peer_passphrase: Option<String>,
    /// Direction of synchronization.
    pub direction: SyncDirection,
}

/// `rm` arguments: selection filters plus plan/apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RmArgs {
    /// Snapshot id prefixes to select.
    pub ids: Vec<String>,
    /// Select only the most recent snapshot.
    pub latest: bool,
    /// Select snapshots captured strictly before this instant.
    pub before: Option<DateTime<Utc>>,
    /// Select snapshots recorded under this job name.
    pub name: Option<String>,
    /// Delete instead of printing the plan.
    pub apply: bool,
}

impl RmArgs {
    /// Whether no filter narrows the selection.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && !self.latest && self.before.is_none() && self.name.is_none()
    }
}

/// `prune` arguments: a retention policy plus plan/apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruneArgs {
    /// Name of the policy, for display; criteria travel resolved.
    pub policy: Option<String>,
    /// Retention criteria applied to all snapshots.
    pub criteria: Criteria,
    /// Delete instead of printing the plan.
    pub apply: bool,
}

/// The closed sum of supported subcommands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Subcommand {
    /// Run the daemon.
    AgentStart(AgentStartArgs),
    /// Stop the running daemon.
    AgentStop,
    /// Run the scheduler.
    SchedulerStart(SchedulerStartArgs),
    /// Stop the running scheduler.
    SchedulerStop,
    /// Create a repository.
    Create(CreateArgs),
    /// Capture a snapshot.
    Backup(BackupArgs),
    /// Verify snapshots.
    Check(CheckArgs),
    /// Restore a snapshot.
    Restore(RestoreArgs),
    /// Synchronize with a peer repository.
    Sync(SyncArgs),
    /// Remove snapshots by filter.
    Rm(RmArgs),
    /// Remove snapshots by retention policy.
    Prune(PruneArgs),
    /// Garbage-collect and compact the repository.
    Maintenance,
}

impl Subcommand {
    /// The wire name path of this subcommand.
    pub fn name(&self) -> Vec<String> {
        let parts: &[&str] = match self {
            Subcommand::AgentStart(_) => &["agent", "start"],
            Subcommand::AgentStop => &["agent", "stop"],
            Subcommand::SchedulerStart(_) => &["scheduler", "start"],
            Subcommand::SchedulerStop => &["scheduler", "stop"],
            Subcommand::Create(_) => &["create"],
            Subcommand::Backup(_) => &["backup"],
            Subcommand::Check(_) => &["check"],
            Subcommand::Restore(_) => &["restore"],
            Subcommand::Sync(_) => &["sync"],
            Subcommand::Rm(_) => &["rm"],
            Subcommand::Prune(_) => &["prune"],
            Subcommand::Maintenance => &["maintenance"],
        };
        parts.iter().map(|s| s.to_string()).collect()
    }

    /// Capability flags.
    pub fn flags(&self) -> u32 {
        use flags::*;
        match self {
            Subcommand::AgentStart(_) => BEFORE_REPOSITORY_OPEN,
            Subcommand::AgentStop => AGENT_SUPPORT | BEFORE_REPOSITORY_OPEN | IGNORE_VERSION,
            Subcommand::SchedulerStart(_) => BEFORE_REPOSITORY_OPEN,
            Subcommand::SchedulerStop => BEFORE_REPOSITORY_OPEN,
            Subcommand::Create(_) => AGENT_SUPPORT | BEFORE_REPOSITORY_WITH_STORAGE,
            Subcommand::Backup(_)
            | Subcommand::Check(_)
            | Subcommand::Restore(_)
            | Subcommand::Sync(_)
            | Subcommand::Rm(_)
            | Subcommand::Prune(_)
            | Subcommand::Maintenance => AGENT_SUPPORT,
        }
    }

    /// Serializes the arguments for the wire.
    pub fn encode_args(&self) -> AgentResult<Vec<u8>> {
        let bytes = match self {
            Subcommand::AgentStart(args) => rmp_serde::to_vec(args),
            Subcommand::AgentStop => rmp_serde::to_vec(&()),
            Subcommand::SchedulerStart(args) => rmp_serde::to_vec(args),
            Subcommand::SchedulerStop => rmp_serde::to_vec(&()),
            Subcommand::Create(args) => rmp_serde::to_vec(args),
            Subcommand::Backup(args) => rmp_serde::to_vec(args),
            Subcommand::Check(args) => rmp_serde::to_vec(args),
            Subcommand::Restore(args) => rmp_serde::to_vec(args),
            Subcommand::Sync(args) => rmp_serde::to_vec(args),
            Subcommand::Rm(args) => rmp_serde::to_vec(args),
            Subcommand::Prune(args) => rmp_serde::to_vec(args),
            Subcommand::Maintenance => rmp_serde::to_vec(&()),
        };
        bytes.map_err(|e| AgentError::Wire(e.to_string()))
    }

    /// Resolves a name path and argument payload into a subcommand.
    pub fn decode(name: &[String], payload: &[u8]) -> AgentResult<Subcommand> {
        fn args<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> AgentResult<T> {
            rmp_serde::from_slice(payload).map_err(|e| AgentError::Wire(e.to_string()))
        }

        let parts: Vec<&str> = name.iter().map(String::as_str).collect();
        match parts.as_slice() {
            ["agent", "start"] => Ok(Subcommand::AgentStart(args(payload)?)),
            ["agent", "stop"] => Ok(Subcommand::AgentStop),
            ["scheduler", "start"] => Ok(Subcommand::SchedulerStart(args(payload)?)),
            ["scheduler", "stop"] => Ok(Subcommand::SchedulerStop),
            ["create"] => Ok(Subcommand::Create(args(payload)?)),
            ["backup"] => Ok(Subcommand::Backup(args(payload)?)),
            ["check"] => Ok(Subcommand::Check(args(payload)?)),
            ["restore"] => Ok(Subcommand::Restore(args(payload)?)),
            ["sync"] => Ok(Subcommand::Sync(args(payload)?)),
            ["rm"] => Ok(Subcommand::Rm(args(payload)?)),
            ["prune"] => Ok(Subcommand::Prune(args(payload)?)),
            ["maintenance"] => Ok(Subcommand::Maintenance),
            _ => Err(AgentError::UnknownCommand(name.join(" "))),
        }
    }

    /// Runs the subcommand. `repo` is present unless the flags said to
    /// skip repository opening.
    pub fn execute(
        &self,
        ctx: &mut ExecContext,
        repo: Option<&Repository>,
    ) -> AgentResult<i32> {
        match self {
            Subcommand::AgentStart(args) => commands::agent::start(ctx, args),
            Subcommand::AgentStop => commands::agent::stop(ctx),
            Subcommand::SchedulerStart(args) => commands::scheduler_cmd::start(ctx, args),
            Subcommand::SchedulerStop => commands::scheduler_cmd::stop(ctx),
            Subcommand::Create(args) => commands::create::run(ctx, args),
            Subcommand::Backup(args) => commands::backup::run(ctx, require(repo)?, args),
            Subcommand::Check(args) => commands::check::run(ctx, require(repo)?, args),
            Subcommand::Restore(args) => commands::restore::run(ctx, require(repo)?, args),
            Subcommand::Sync(args) => commands::sync_cmd::run(ctx, require(repo)?, args),
            Subcommand::Rm(args) => commands::rm::run(ctx, require(repo)?, args),
            Subcommand::Prune(args) => commands::prune::run(ctx, require(repo)?, args),
            Subcommand::Maintenance => commands::maintenance::run(ctx, require(repo)?),
        }
    }
}

fn require(repo: Option<&Repository>) -> AgentResult<&Repository> {
    repo.ok_or_else(|| AgentError::Usage("command requires an opened repository".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_decode_round_trip() {
        let commands = vec![
            Subcommand::AgentStart(AgentStartArgs::default()),
            Subcommand::AgentStop,
            Subcommand::SchedulerStop,
            Subcommand::Create(CreateArgs::default()),
            Subcommand::Backup(BackupArgs {
                path: "/data".into(),
                ..Default::default()
            }),
            Subcommand::Rm(RmArgs {
                latest: true,
                apply: true,
                ..Default::default()
            }),
            Subcommand::Prune(PruneArgs::default()),
            Subcommand::Maintenance,
        ];
        for cmd in commands {
            let name = cmd.name();
            let payload = cmd.encode_args().unwrap();
            let back = Subcommand::decode(&name, &payload).unwrap();
            assert_eq!(back.name(), name);
        }
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(
            Subcommand::decode(&["frobnicate".to_string()], &[]),
            Err(AgentError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_rm_filter_emptiness() {
        assert!(RmArgs::default().is_empty());
        assert!(!RmArgs {
            latest: true,
            ..Default::default()
        }
        .is_empty());
        assert!(!RmArgs {
            before: Some(Utc::now()),
            ..Default::default()
        }
        .is_empty());
    }

    #[test]
    fn test_flags() {
        assert_ne!(
            Subcommand::Maintenance.flags() & flags::AGENT_SUPPORT,
            0
        );
        assert_ne!(
            Subcommand::AgentStop.flags() & flags::IGNORE_VERSION,
            0
        );
        assert_ne!(
            Subcommand::Create(CreateArgs::default()).flags()
                & flags::BEFORE_REPOSITORY_WITH_STORAGE,
            0
        );
        assert_eq!(
            Subcommand::AgentStart(AgentStartArgs::default()).flags() & flags::AGENT_SUPPORT,
            0
        );
    }

    #[test]
    fn test_rm_args_round_trip_preserves_before() {
        let before = Utc::now();
        let cmd = Subcommand::Rm(RmArgs {
            before: Some(before),
            ..Default::default()
        });
        let back = Subcommand::decode(&cmd.name(), &cmd.encode_args().unwrap()).unwrap();
        match back {
            Subcommand::Rm(args) => assert_eq!(args.before, Some(before)),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
