//! `rm`: filtered snapshot removal, plan by default, `-apply` to act.

use std::io::Write;

use tracing::{error, info};

use coffre_repository::Repository;

use crate::commands::locate;
use crate::context::ExecContext;
use crate::error::{AgentError, AgentResult};
use crate::subcommand::RmArgs;

pub(crate) fn run(ctx: &mut ExecContext, repo: &Repository, args: &RmArgs) -> AgentResult<i32> {
    if args.is_empty() {
        return Err(AgentError::Usage(
            "no filter specified, not going to remove everything".into(),
        ));
    }

    let matches = locate::select_for(&ctx.token, repo, args)?;
    if matches.is_empty() {
        info!("rm: no snapshots matched the selection");
        return Ok(0);
    }

    if !args.apply {
        writeln!(
            ctx.stdout,
            "rm: would remove these {} snapshot(s), run with -apply to proceed",
            matches.len()
        )?;
        for located in &matches {
            writeln!(
                ctx.stdout,
                "{} {} {:>10} {}",
                located.header.timestamp.to_rfc3339(),
                located.mac.short(),
                located.header.bytes,
                located.header.source
            )?;
        }
        return Ok(0);
    }

    let mut errors = 0usize;
    std::thread::scope(|scope| {
        let handles: Vec<_> = matches
            .iter()
            .map(|located| {
                let token = ctx.token.clone();
                let mac = located.mac;
                scope.spawn(move || match repo.delete_snapshot(&token, mac) {
                    Ok(()) => {
                        info!(snapshot = %mac.short(), "rm: removal completed successfully");
                        true
                    }
                    Err(e) => {
                        error!(snapshot = %mac.short(), error = %e, "rm: removal failed");
                        false
                    }
                })
            })
            .collect();
        for handle in handles {
            if !handle.join().unwrap_or(false) {
                errors += 1;
            }
        }
    });

    if errors != 0 {
        writeln!(ctx.stderr, "rm: failed to remove {errors} snapshot(s)")?;
        return Ok(1);
    }
    Ok(0)
}
