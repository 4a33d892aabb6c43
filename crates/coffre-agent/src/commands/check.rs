//! `check`: verify that snapshots read back intact.

use std::io::Write;

use coffre_repository::snapshot;
use coffre_repository::Repository;

use crate::commands::locate;
use crate::context::ExecContext;
use crate::error::AgentResult;
use crate::subcommand::CheckArgs;

pub(crate) fn run(ctx: &mut ExecContext, repo: &Repository, args: &CheckArgs) -> AgentResult<i32> {
    let selected = locate::select(
        &ctx.token,
        repo,
        &args.snapshots,
        args.latest,
        None,
        None,
    )?;

    if selected.is_empty() {
        writeln!(ctx.stdout, "check: no snapshots to verify")?;
        return Ok(0);
    }

    let mut errors = 0usize;
    for located in &selected {
        let stats = snapshot::check(&ctx.token, repo, located.mac)?;
        writeln!(
            ctx.stdout,
            "check: {} {} files, {} chunks, {} error(s)",
            located.mac.short(),
            stats.files,
            stats.chunks,
            stats.errors
        )?;
        errors += stats.errors;
    }

    Ok(if errors == 0 { 0 } else { 1 })
}
