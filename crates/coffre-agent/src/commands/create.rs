//! `create`: initialize a repository at the configured location.

use std::io::Write;

use coffre_repository::{CreateOptions, Repository};

use crate::context::ExecContext;
use crate::error::{AgentError, AgentResult};
use crate::subcommand::CreateArgs;

pub(crate) fn run(ctx: &mut ExecContext, args: &CreateArgs) -> AgentResult<i32> {
    if !ctx.store_config.contains_key("location") {
        return Err(AgentError::Usage("create: no store location specified".into()));
    }

    let options = CreateOptions {
        passphrase: args
            .passphrase
            .clone()
            .or_else(|| ctx.store_config.get("passphrase").cloned()),
        compression: if args.no_compression {
            None
        } else {
            Some(Default::default())
        },
        ..Default::default()
    };
    let encrypted = options.passphrase.is_some();

    let repo = Repository::create(&ctx.token, &ctx.store_config, options)?;
    writeln!(
        ctx.stdout,
        "create: repository {} at {}{}",
        repo.config().repository_id.short(),
        repo.location(),
        if encrypted { " (encrypted)" } else { "" }
    )?;
    repo.close()?;
    Ok(0)
}
