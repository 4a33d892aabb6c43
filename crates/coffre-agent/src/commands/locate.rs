//! Snapshot selection shared by rm, check, restore and prune.

use chrono::{DateTime, Utc};

use coffre_repository::snapshot::{self, SnapshotHeader};
use coffre_repository::Repository;
use coffre_storage::{CancelToken, Mac};

use crate::error::AgentResult;
use crate::subcommand::RmArgs;

/// A located snapshot: address plus decoded header.
pub struct Located {
    /// Snapshot address.
    pub mac: Mac,
    /// Decoded header.
    pub header: SnapshotHeader,
}

/// Loads every live snapshot header, newest first. Unreadable records are
/// skipped rather than failing the whole selection.
pub fn all_snapshots(token: &CancelToken, repo: &Repository) -> AgentResult<Vec<Located>> {
    let mut out = Vec::new();
    for mac in repo.list_snapshots() {
        token.check()?;
        match snapshot::load(token, repo, mac) {
            Ok(header) => out.push(Located { mac, header }),
            Err(e) => {
                tracing::warn!(snapshot = %mac.short(), error = %e, "skipping unreadable snapshot");
            }
        }
    }
    out.sort_by(|a, b| {
        b.header
            .timestamp
            .cmp(&a.header.timestamp)
            .then_with(|| a.mac.cmp(&b.mac))
    });
    Ok(out)
}

/// Applies rm-style filters to the live snapshots.
pub fn select(
    token: &CancelToken,
    repo: &Repository,
    ids: &[String],
    latest: bool,
    before: Option<DateTime<Utc>>,
    name: Option<&str>,
) -> AgentResult<Vec<Located>> {
    let mut snapshots = all_snapshots(token, repo)?;

    if !ids.is_empty() {
        snapshots.retain(|s| {
            let hex = s.mac.to_hex();
            ids.iter().any(|id| hex.starts_with(id.as_str()))
        });
    }
    if let Some(before) = before {
        snapshots.retain(|s| s.header.timestamp < before);
    }
    if let Some(name) = name {
        snapshots.retain(|s| s.header.name == name);
    }
    if latest {
        snapshots.truncate(1);
    }
    Ok(snapshots)
}

/// Applies an [`RmArgs`] filter set.
pub fn select_for(
    token: &CancelToken,
    repo: &Repository,
    args: &RmArgs,
) -> AgentResult<Vec<Located>> {
    select(
        token,
        repo,
        &args.ids,
        args.latest,
        args.before,
        args.name.as_deref(),
    )
}
