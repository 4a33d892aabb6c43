//! `agent start` / `agent stop`.

use std::io::Write;
use std::time::Duration;

use tracing::info;

use crate::context::ExecContext;
use crate::error::{AgentError, AgentResult};
use crate::server::AgentServer;
use crate::subcommand::AgentStartArgs;

pub(crate) fn start(ctx: &mut ExecContext, args: &AgentStartArgs) -> AgentResult<i32> {
    if std::env::var_os("COFFRE_AGENTLESS").is_some() {
        return Err(AgentError::Usage(
            "agent can not be started when COFFRE_AGENTLESS is set".into(),
        ));
    }

    std::fs::create_dir_all(&ctx.cache_dir)?;
    let server = AgentServer {
        socket_path: ctx.agent_socket(),
        teardown: Duration::from_secs(args.teardown_secs),
        cache_dir: ctx.cache_dir.clone(),
        config_dir: ctx.config_dir.clone(),
    };
    server.listen_and_serve(&ctx.token)?;
    info!("agent gracefully stopped");
    Ok(0)
}

pub(crate) fn stop(ctx: &mut ExecContext) -> AgentResult<i32> {
    match &ctx.shutdown {
        Some(shutdown) => {
            writeln!(ctx.stdout, "agent: stopping")?;
            shutdown.cancel();
            Ok(0)
        }
        // reached only when executing agentless; nothing to stop then
        None => Err(AgentError::Usage(
            "agent stop only makes sense through a running agent".into(),
        )),
    }
}
