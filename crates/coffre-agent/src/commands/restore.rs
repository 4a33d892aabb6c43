//! `restore`: write a snapshot's files back out.

use std::io::Write;
use std::path::Path;

use coffre_repository::snapshot;
use coffre_repository::Repository;

use crate::commands::locate;
use crate::context::ExecContext;
use crate::error::{AgentError, AgentResult};
use crate::subcommand::RestoreArgs;

pub(crate) fn run(
    ctx: &mut ExecContext,
    repo: &Repository,
    args: &RestoreArgs,
) -> AgentResult<i32> {
    if args.target.is_empty() {
        return Err(AgentError::Usage("restore: no target specified".into()));
    }

    let ids = match &args.snapshot {
        Some(id) => vec![id.clone()],
        None => Vec::new(),
    };
    let selected = locate::select(&ctx.token, repo, &ids, args.snapshot.is_none(), None, None)?;
    let located = selected
        .first()
        .ok_or_else(|| AgentError::Usage("restore: no matching snapshot".into()))?;

    let stats = snapshot::restore(&ctx.token, repo, located.mac, Path::new(&args.target))?;
    writeln!(
        ctx.stdout,
        "restore: {} restored {} files, {} bytes into {}",
        located.mac.short(),
        stats.files,
        stats.bytes,
        args.target
    )?;
    Ok(0)
}
