//! `backup`: capture a source tree into a new snapshot.

use std::io::Write;
use std::path::Path;

use coffre_repository::snapshot::{self, BackupOptions};
use coffre_repository::Repository;

use crate::context::ExecContext;
use crate::error::{AgentError, AgentResult};
use crate::subcommand::BackupArgs;

pub(crate) fn run(ctx: &mut ExecContext, repo: &Repository, args: &BackupArgs) -> AgentResult<i32> {
    if args.path.is_empty() {
        return Err(AgentError::Usage("backup: no source path specified".into()));
    }

    let options = BackupOptions {
        name: args.name.clone(),
        tags: args.tags.clone(),
        ignore: args.ignore.clone(),
    };
    let (snapshot_mac, stats) =
        snapshot::backup(&ctx.token, repo, Path::new(&args.path), &options)?;
    writeln!(
        ctx.stdout,
        "backup: created {} ({} files, {} bytes, {} new chunks)",
        snapshot_mac.short(),
        stats.files,
        stats.bytes,
        stats.chunks_written
    )?;

    if args.check {
        let check = snapshot::check(&ctx.token, repo, snapshot_mac)?;
        if check.errors != 0 {
            writeln!(
                ctx.stderr,
                "backup: post-backup check found {} error(s)",
                check.errors
            )?;
            return Ok(1);
        }
    }
    Ok(0)
}
