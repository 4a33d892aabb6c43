//! `prune`: retention-policy-driven removal with per-item justifications.

use std::io::Write;

use tracing::{error, info};

use coffre_policy::{Action, Item, Policy};
use coffre_repository::Repository;
use coffre_storage::Mac;

use crate::commands::locate;
use crate::context::ExecContext;
use crate::error::{AgentError, AgentResult};
use crate::subcommand::PruneArgs;

pub(crate) fn run(ctx: &mut ExecContext, repo: &Repository, args: &PruneArgs) -> AgentResult<i32> {
    if args.criteria.is_empty() {
        return Err(AgentError::Usage(
            "no retention criteria specified, not going to prune everything".into(),
        ));
    }

    let snapshots = locate::all_snapshots(&ctx.token, repo)?;
    let items: Vec<Item> = snapshots
        .iter()
        .map(|located| Item {
            item_id: located.mac.to_hex(),
            timestamp: located.header.timestamp,
        })
        .collect();

    let policy = Policy::with_wall_clock(args.criteria);
    let (keep, reasons) = policy.select(&items);

    let mut to_delete: Vec<Mac> = Vec::new();
    for located in &snapshots {
        if !keep.contains(&located.mac.to_hex()) {
            to_delete.push(located.mac);
        }
    }

    if !args.apply {
        writeln!(
            ctx.stdout,
            "prune: would keep {} and delete {} snapshot(s), run with -apply to proceed",
            keep.len(),
            to_delete.len()
        )?;
        for located in &snapshots {
            let reason = &reasons[&located.mac.to_hex()];
            let action = match reason.action {
                Action::Keep => "keep",
                Action::Delete => "delete",
            };
            match reason.rule {
                Some(rule) => writeln!(
                    ctx.stdout,
                    "{:<8} {} {}  match={}:{} rank={} cap={}",
                    action,
                    located.header.timestamp.to_rfc3339(),
                    located.mac.short(),
                    rule,
                    reason.bucket,
                    reason.rank,
                    reason.cap
                )?,
                None => writeln!(
                    ctx.stdout,
                    "{:<8} {} {}  reason={}",
                    action,
                    located.header.timestamp.to_rfc3339(),
                    located.mac.short(),
                    reason.note
                )?,
            }
        }
        return Ok(0);
    }

    if to_delete.is_empty() {
        return Ok(0);
    }

    let mut errors = 0usize;
    for mac in to_delete {
        match repo.delete_snapshot(&ctx.token, mac) {
            Ok(()) => info!(snapshot = %mac.short(), "prune: removal completed successfully"),
            Err(e) => {
                error!(snapshot = %mac.short(), error = %e, "prune: removal failed");
                errors += 1;
            }
        }
    }

    if errors != 0 {
        writeln!(ctx.stderr, "prune: failed to remove {errors} snapshot(s)")?;
        return Ok(1);
    }
    Ok(0)
}
