//! Command-line front-end.
//!
//! Parses the command tree, builds the matching [`Subcommand`], and either
//! shells it through the agent (the default for agent-capable commands) or
//! executes it locally when `--agentless` or `COFFRE_AGENTLESS` says so.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand as ClapSubcommand};

use coffre_policy::Criteria;
use coffre_storage::backend::StoreConfig;
use coffre_storage::cancel_pair;

use crate::client;
use crate::commands::open_repository;
use crate::context::{default_cache_dir, default_config_dir, ExecContext};
use crate::error::{AgentError, AgentResult};
use crate::subcommand::{
    flags, AgentStartArgs, BackupArgs, CheckArgs, CreateArgs, PruneArgs, RestoreArgs, RmArgs,
    SchedulerStartArgs, Subcommand, SyncArgs, SyncDirection,
};

/// Coffre: content-addressed, deduplicating, snapshot-oriented backups.
#[derive(Debug, Parser)]
#[command(name = "coffre", version, about)]
pub struct Cli {
    /// Repository location (e.g. fs:///srv/kloset).
    #[arg(long, global = true)]
    pub store: Option<String>,

    /// Repository passphrase.
    #[arg(long, global = true)]
    pub passphrase: Option<String>,

    /// Cache directory holding the agent sockets.
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Configuration directory holding the policies file.
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Execute locally instead of through the agent.
    #[arg(long, global = true)]
    pub agentless: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Agent lifecycle verbs.
#[derive(Debug, ClapSubcommand)]
pub enum AgentAction {
    /// Start the daemon in the foreground.
    Start {
        /// Idle grace in seconds before the daemon tears down.
        #[arg(long, default_value_t = 5)]
        teardown: u64,
    },
    /// Stop the running daemon.
    Stop,
}

/// Scheduler lifecycle verbs.
#[derive(Debug, ClapSubcommand)]
pub enum SchedulerAction {
    /// Start the scheduler in the foreground.
    Start {
        /// Tasks configuration file.
        #[arg(long)]
        tasks: String,
    },
    /// Stop the running scheduler.
    Stop,
}

/// Retention criteria flags shared by prune.
#[derive(Debug, Clone, Default, Args)]
pub struct CriteriaArgs {
    /// Keep the last N minute buckets.
    #[arg(long, default_value_t = 0)]
    pub keep_minutes: u32,
    /// Keep the last N hour buckets.
    #[arg(long, default_value_t = 0)]
    pub keep_hours: u32,
    /// Keep the last N day buckets.
    #[arg(long, default_value_t = 0)]
    pub keep_days: u32,
    /// Keep the last N ISO-week buckets.
    #[arg(long, default_value_t = 0)]
    pub keep_weeks: u32,
    /// Keep the last N month buckets.
    #[arg(long, default_value_t = 0)]
    pub keep_months: u32,
    /// Keep the last N year buckets.
    #[arg(long, default_value_t = 0)]
    pub keep_years: u32,
    /// Keep up to N snapshots per minute bucket.
    #[arg(long, default_value_t = 0)]
    pub keep_per_minute: u32,
    /// Keep up to N snapshots per hour bucket.
    #[arg(long, default_value_t = 0)]
    pub keep_per_hour: u32,
    /// Keep up to N snapshots per day bucket.
    #[arg(long, default_value_t = 0)]
    pub keep_per_day: u32,
    /// Keep up to N snapshots per ISO-week bucket.
    #[arg(long, default_value_t = 0)]
    pub keep_per_week: u32,
    /// Keep up to N snapshots per month bucket.
    #[arg(long, default_value_t = 0)]
    pub keep_per_month: u32,
    /// Keep up to N snapshots per year bucket.
    #[arg(long, default_value_t = 0)]
    pub keep_per_year: u32,
}

impl CriteriaArgs {
    fn merge_into(&self, criteria: &mut Criteria) {
        let fields = [
            (self.keep_minutes, &mut criteria.keep_minutes),
            (self.keep_hours, &mut criteria.keep_hours),
            (self.keep_days, &mut criteria.keep_days),
            (self.keep_weeks, &mut criteria.keep_weeks),
            (self.keep_months, &mut criteria.keep_months),
            (self.keep_years, &mut criteria.keep_years),
            (self.keep_per_minute, &mut criteria.keep_per_minute),
            (self.keep_per_hour, &mut criteria.keep_per_hour),
            (self.keep_per_day, &mut criteria.keep_per_day),
            (self.keep_per_week, &mut criteria.keep_per_week),
            (self.keep_per_month, &mut criteria.keep_per_month),
            (self.keep_per_year, &mut criteria.keep_per_year),
        ];
        for (value, slot) in fields {
            if value != 0 {
                *slot = value;
            }
        }
    }
}

/// The command tree.
#[derive(Debug, ClapSubcommand)]
pub enum Command {
    /// Initialize a repository.
    Create {
        /// Store blobs uncompressed.
        #[arg(long)]
        no_compression: bool,
    },
    /// Capture a snapshot of a source tree.
    Backup {
        /// Source path.
        path: String,
        /// Job name recorded in the snapshot.
        #[arg(long, default_value = "")]
        name: String,
        /// Tags recorded in the snapshot.
        #[arg(long)]
        tag: Vec<String>,
        /// Path substrings to skip.
        #[arg(long)]
        ignore: Vec<String>,
        /// Verify the snapshot right after capturing it.
        #[arg(long)]
        check: bool,
    },
    /// Verify snapshots read back intact.
    Check {
        /// Snapshot id prefixes; none with --latest unset verifies all.
        snapshots: Vec<String>,
        /// Verify only the most recent snapshot.
        #[arg(long)]
        latest: bool,
    },
    /// Restore a snapshot.
    Restore {
        /// Snapshot id prefix; omitted means latest.
        snapshot: Option<String>,
        /// Directory restored files land in.
        #[arg(long)]
        target: String,
    },
    /// Synchronize with a peer repository.
    Sync {
        /// Peer repository location.
        peer: String,
        /// Direction: to, from or with.
        #[arg(long, default_value = "with")]
        direction: String,
        /// Peer passphrase when the peer is encrypted.
        #[arg(long)]
        peer_passphrase: Option<String>,
    },
    /// Remove snapshots by filter; prints a plan unless --apply.
    Rm {
        /// Snapshot id prefixes.
        ids: Vec<String>,
        /// Select only the most recent snapshot.
        #[arg(long)]
        latest: bool,
        /// Select snapshots captured before this RFC 3339 instant.
        #[arg(long)]
        before: Option<String>,
        /// Select snapshots recorded under this job name.
        #[arg(long)]
        name: Option<String>,
        /// Do the actual removal.
        #[arg(long)]
        apply: bool,
    },
    /// Remove snapshots by retention policy; prints a plan unless --apply.
    Prune {
        /// Named policy from the policies file.
        #[arg(long)]
        policy: Option<String>,
        #[command(flatten)]
        criteria: CriteriaArgs,
        /// Do the actual removal.
        #[arg(long)]
        apply: bool,
    },
    /// Garbage-collect and compact the repository.
    Maintenance,
    /// Daemon lifecycle.
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },
    /// Scheduler lifecycle.
    Scheduler {
        #[command(subcommand)]
        action: SchedulerAction,
    },
}

/// Loads the policies file: a JSON map from policy name to criteria.
pub fn load_policy(config_dir: &std::path::Path, name: &str) -> AgentResult<Criteria> {
    let path = config_dir.join("policies.json");
    let bytes = std::fs::read(&path).map_err(|e| {
        AgentError::Usage(format!("failed to load policies from {}: {e}", path.display()))
    })?;
    let policies: BTreeMap<String, Criteria> = serde_json::from_slice(&bytes)
        .map_err(|e| AgentError::Usage(format!("policies file: {e}")))?;
    policies
        .get(name)
        .copied()
        .ok_or_else(|| AgentError::Usage(format!("policy {name:?} not found")))
}

fn build_subcommand(cli: &Cli, config_dir: &std::path::Path) -> AgentResult<Subcommand> {
    Ok(match &cli.command {
        Command::Create { no_compression } => Subcommand::Create(CreateArgs {
            passphrase: cli.passphrase.clone(),
            no_compression: *no_compression,
        }),
        Command::Backup {
            path,
            name,
            tag,
            ignore,
            check,
        } => Subcommand::Backup(BackupArgs {
            path: path.clone(),
            name: name.clone(),
            tags: tag.clone(),
            ignore: ignore.clone(),
            check: *check,
        }),
        Command::Check { snapshots, latest } => Subcommand::Check(CheckArgs {
            snapshots: snapshots.clone(),
            latest: *latest,
        }),
        Command::Restore { snapshot, target } => Subcommand::Restore(RestoreArgs {
            snapshot: snapshot.clone(),
            target: target.clone(),
        }),
        Command::Sync {
            peer,
            direction,
            peer_passphrase,
        } => {
            let direction = match direction.as_str() {
                "to" => SyncDirection::To,
                "from" => SyncDirection::From,
                "with" => SyncDirection::With,
                other => {
                    return Err(AgentError::Usage(format!("invalid sync direction: {other}")))
                }
            };
            Subcommand::Sync(SyncArgs {
                peer: peer.clone(),
                peer_passphrase: peer_passphrase.clone(),
                direction,
            })
        }
        Command::Rm {
            ids,
            latest,
            before,
            name,
            apply,
        } => {
            let before = match before {
                Some(text) => Some(
                    chrono::DateTime::parse_from_rfc3339(text)
                        .map_err(|e| AgentError::Usage(format!("--before: {e}")))?
                        .with_timezone(&chrono::Utc),
                ),
                None => None,
            };
            Subcommand::Rm(RmArgs {
                ids: ids.clone(),
                latest: *latest,
                before,
                name: name.clone(),
                apply: *apply,
            })
        }
        Command::Prune {
            policy,
            criteria,
            apply,
        } => {
            let mut resolved = match policy {
                Some(name) => load_policy(config_dir, name)?,
                None => Criteria::default(),
            };
            criteria.merge_into(&mut resolved);
            Subcommand::Prune(PruneArgs {
                policy: policy.clone(),
                criteria: resolved,
                apply: *apply,
            })
        }
        Command::Maintenance => Subcommand::Maintenance,
        Command::Agent { action } => match action {
            AgentAction::Start { teardown } => Subcommand::AgentStart(AgentStartArgs {
                teardown_secs: *teardown,
            }),
            AgentAction::Stop => Subcommand::AgentStop,
        },
        Command::Scheduler { action } => match action {
            SchedulerAction::Start { tasks } => Subcommand::SchedulerStart(SchedulerStartArgs {
                tasks: tasks.clone(),
            }),
            SchedulerAction::Stop => Subcommand::SchedulerStop,
        },
    })
}

fn build_store_config(cli: &Cli) -> StoreConfig {
    let mut config = StoreConfig::new();
    if let Some(store) = &cli.store {
        config.insert("location".into(), store.clone());
    }
    if let Some(passphrase) = &cli.passphrase {
        config.insert("passphrase".into(), passphrase.clone());
    }
    config
}

/// Runs one locally-executed subcommand with real standard streams.
fn execute_local(ctx: &mut ExecContext, subcommand: &Subcommand) -> AgentResult<i32> {
    let cmd_flags = subcommand.flags();
    let repo = if cmd_flags & (flags::BEFORE_REPOSITORY_OPEN | flags::BEFORE_REPOSITORY_WITH_STORAGE)
        != 0
    {
        None
    } else {
        Some(open_repository(&ctx.token, &ctx.store_config)?)
    };
    let status = subcommand.execute(ctx, repo.as_ref());
    if let Some(repo) = repo {
        repo.close()?;
    }
    status
}

/// Parses arguments and runs the selected command, returning the process
/// exit code.
pub fn run(cli: Cli) -> AgentResult<i32> {
    let (token, cancel) = cancel_pair();
    install_signal_cancel(cancel);

    let config_dir = cli.config_dir.clone().unwrap_or_else(default_config_dir);
    let subcommand = build_subcommand(&cli, &config_dir)?;
    let store_config = build_store_config(&cli);

    let mut ctx = ExecContext::local(token, store_config.clone());
    ctx.cache_dir = cli.cache_dir.clone().unwrap_or_else(default_cache_dir);
    ctx.config_dir = config_dir;

    let agentless = cli.agentless || std::env::var_os("COFFRE_AGENTLESS").is_some();
    let through_agent = subcommand.flags() & flags::AGENT_SUPPORT != 0 && !agentless;

    if through_agent {
        client::execute_rpc(&mut ctx, &subcommand, &store_config)
    } else {
        execute_local(&mut ctx, &subcommand)
    }
}

fn install_signal_cancel(cancel: coffre_storage::CancelHandle) {
    // SIGINT cancels the root context; a second one kills the process the
    // default way because the handler restores default disposition.
    static HANDLE: std::sync::OnceLock<coffre_storage::CancelHandle> = std::sync::OnceLock::new();
    let _ = HANDLE.set(cancel);

    extern "C" fn on_sigint(_sig: libc::c_int) {
        // restore default disposition first: a second interrupt always
        // kills, even if cancellation wedges
        unsafe {
            libc::signal(libc::SIGINT, libc::SIG_DFL);
        }
        if let Some(handle) = HANDLE.get() {
            handle.cancel();
        }
    }
    let handler: extern "C" fn(libc::c_int) = on_sigint;
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(args)
    }

    #[test]
    fn test_rm_parses_filters() {
        let cli = parse(&[
            "coffre",
            "--store",
            "fs:///srv/kloset",
            "rm",
            "--latest",
            "--apply",
        ]);
        let sub = build_subcommand(&cli, std::path::Path::new("/nonexistent")).unwrap();
        match sub {
            Subcommand::Rm(args) => {
                assert!(args.latest);
                assert!(args.apply);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_rm_before_must_be_rfc3339() {
        let cli = parse(&["coffre", "rm", "--before", "yesterday"]);
        assert!(build_subcommand(&cli, std::path::Path::new("/nonexistent")).is_err());
        let cli = parse(&["coffre", "rm", "--before", "2025-08-20T12:00:00Z"]);
        assert!(build_subcommand(&cli, std::path::Path::new("/nonexistent")).is_ok());
    }

    #[test]
    fn test_prune_flags_override_policy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("policies.json"),
            br#"{"standard": {"keep_days": 7, "keep_per_day": 1}}"#,
        )
        .unwrap();

        let cli = parse(&[
            "coffre",
            "prune",
            "--policy",
            "standard",
            "--keep-days",
            "30",
        ]);
        let sub = build_subcommand(&cli, dir.path()).unwrap();
        match sub {
            Subcommand::Prune(args) => {
                assert_eq!(args.criteria.keep_days, 30, "flag overrides policy");
                assert_eq!(args.criteria.keep_per_day, 1, "policy value survives");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_policy_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("policies.json"), b"{}").unwrap();
        let cli = parse(&["coffre", "prune", "--policy", "ghost"]);
        assert!(build_subcommand(&cli, dir.path()).is_err());
    }

    #[test]
    fn test_store_config_carries_passphrase() {
        let cli = parse(&[
            "coffre",
            "--store",
            "fs:///srv/kloset",
            "--passphrase",
            "pw",
            "maintenance",
        ]);
        let config = build_store_config(&cli);
        assert_eq!(config["location"], "fs:///srv/kloset");
        assert_eq!(config["passphrase"], "pw");
    }

    #[test]
    fn test_sync_direction_validation() {
        let cli = parse(&["coffre", "sync", "fs:///peer", "--direction", "sideways"]);
        assert!(build_subcommand(&cli, std::path::Path::new("/nonexistent")).is_err());
    }
}
