//! `maintenance`: garbage-collect unreachable packfiles, compact states.

use std::io::Write;

use coffre_repository::Repository;

use crate::context::ExecContext;
use crate::error::AgentResult;

pub(crate) fn run(ctx: &mut ExecContext, repo: &Repository) -> AgentResult<i32> {
    let stats = repo.maintenance(&ctx.token)?;
    writeln!(
        ctx.stdout,
        "maintenance: deleted {} packfile(s), compacted {} state(s)",
        stats.packfiles_deleted, stats.states_compacted
    )?;
    Ok(0)
}
