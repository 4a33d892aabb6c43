//! Scheduler worker loops.
//!
//! Each worker sleeps its interval on the cancellation token, then drives
//! its subcommand through the agent RPC path. Failures are logged and the
//! loop retries on the next tick.

use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info};

use coffre_storage::backend::StoreConfig;
use coffre_storage::CancelToken;

use crate::client;
use crate::context::ExecContext;
use crate::subcommand::{
    BackupArgs, CheckArgs, RestoreArgs, RmArgs, Subcommand, SyncArgs,
};

use super::{BackupTask, CheckTask, MaintenanceTask, RestoreTask, SyncTask, TaskSet};

fn run_through_agent(
    token: &CancelToken,
    cache_dir: &PathBuf,
    subcommand: &Subcommand,
    store_config: &StoreConfig,
) -> Result<i32, crate::error::AgentError> {
    let mut ctx = ExecContext::local(token.clone(), store_config.clone());
    ctx.cache_dir = cache_dir.clone();
    client::execute_rpc(&mut ctx, subcommand, store_config)
}

fn retention_rm(name: &str, retention_secs: u64) -> Subcommand {
    Subcommand::Rm(RmArgs {
        before: Some(Utc::now() - chrono::Duration::seconds(retention_secs as i64)),
        name: if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        },
        apply: true,
        ..Default::default()
    })
}

fn worker_loop(
    token: CancelToken,
    interval_secs: u64,
    mut tick: impl FnMut(&CancelToken) + Send + 'static,
) -> JoinHandle<()> {
    std::thread::spawn(move || loop {
        if token.wait_timeout(Duration::from_secs(interval_secs)) {
            return;
        }
        tick(&token);
    })
}

/// Maintenance loop: `maintenance`, then retention `rm` when configured.
pub fn spawn_maintenance(
    token: CancelToken,
    cache_dir: PathBuf,
    task: MaintenanceTask,
) -> JoinHandle<()> {
    let interval = task.interval_secs;
    worker_loop(token, interval, move |token| {
        match run_through_agent(token, &cache_dir, &Subcommand::Maintenance, &task.repository) {
            Ok(0) => info!(
                repository = task.repository.get("location").map(String::as_str),
                "maintenance succeeded"
            ),
            Ok(status) => error!(status, "maintenance exited non-zero"),
            Err(e) => {
                error!(error = %e, "maintenance failed");
                return;
            }
        }
        if let Some(retention) = task.retention_secs {
            let rm = retention_rm("maintenance", retention);
            match run_through_agent(token, &cache_dir, &rm, &task.repository) {
                Ok(0) => info!("retention purge succeeded"),
                Ok(status) => error!(status, "retention purge exited non-zero"),
                Err(e) => error!(error = %e, "retention purge failed"),
            }
        }
    })
}

/// Backup loop: `backup`, then retention `rm` when configured.
pub fn spawn_backup(
    token: CancelToken,
    cache_dir: PathBuf,
    set: TaskSet,
    task: BackupTask,
) -> JoinHandle<()> {
    let interval = task.interval_secs;
    worker_loop(token, interval, move |token| {
        let backup = Subcommand::Backup(BackupArgs {
            path: task.path.clone(),
            name: set.name.clone(),
            tags: Vec::new(),
            ignore: task.ignore.clone(),
            check: task.check,
        });
        match run_through_agent(token, &cache_dir, &backup, &set.repository) {
            Ok(0) => info!(job = %set.name, "backup succeeded"),
            Ok(status) => {
                error!(job = %set.name, status, "backup exited non-zero");
                return;
            }
            Err(e) => {
                error!(job = %set.name, error = %e, "backup failed");
                return;
            }
        }
        if let Some(retention) = task.retention_secs {
            let rm = retention_rm(&set.name, retention);
            match run_through_agent(token, &cache_dir, &rm, &set.repository) {
                Ok(0) => info!(job = %set.name, "retention purge succeeded"),
                Ok(status) => error!(job = %set.name, status, "retention purge exited non-zero"),
                Err(e) => error!(job = %set.name, error = %e, "retention purge failed"),
            }
        }
    })
}

/// Check loop.
pub fn spawn_check(
    token: CancelToken,
    cache_dir: PathBuf,
    set: TaskSet,
    task: CheckTask,
) -> JoinHandle<()> {
    let interval = task.interval_secs;
    worker_loop(token, interval, move |token| {
        let check = Subcommand::Check(CheckArgs {
            snapshots: if task.path.is_empty() {
                Vec::new()
            } else {
                vec![task.path.clone()]
            },
            latest: task.latest,
        });
        match run_through_agent(token, &cache_dir, &check, &set.repository) {
            Ok(0) => info!(job = %set.name, "check succeeded"),
            Ok(status) => error!(job = %set.name, status, "check exited non-zero"),
            Err(e) => error!(job = %set.name, error = %e, "check failed"),
        }
    })
}

/// Restore loop.
pub fn spawn_restore(
    token: CancelToken,
    cache_dir: PathBuf,
    set: TaskSet,
    task: RestoreTask,
) -> JoinHandle<()> {
    let interval = task.interval_secs;
    worker_loop(token, interval, move |token| {
        let restore = Subcommand::Restore(RestoreArgs {
            snapshot: if task.path.is_empty() {
                None
            } else {
                Some(task.path.clone())
            },
            target: task.target.clone(),
        });
        match run_through_agent(token, &cache_dir, &restore, &set.repository) {
            Ok(0) => info!(job = %set.name, "restore succeeded"),
            Ok(status) => error!(job = %set.name, status, "restore exited non-zero"),
            Err(e) => error!(job = %set.name, error = %e, "restore failed"),
        }
    })
}

/// Sync loop.
pub fn spawn_sync(
    token: CancelToken,
    cache_dir: PathBuf,
    set: TaskSet,
    task: SyncTask,
) -> JoinHandle<()> {
    let interval = task.interval_secs;
    worker_loop(token, interval, move |token| {
        let sync = Subcommand::Sync(SyncArgs {
            peer: task.peer.clone(),
            peer_passphrase: None,
            direction: task.direction,
        });
        match run_through_agent(token, &cache_dir, &sync, &set.repository) {
            Ok(0) => info!(job = %set.name, "synchronization succeeded"),
            Ok(status) => error!(job = %set.name, status, "sync exited non-zero"),
            Err(e) => error!(job = %set.name, error = %e, "sync failed"),
        }
    })
}
