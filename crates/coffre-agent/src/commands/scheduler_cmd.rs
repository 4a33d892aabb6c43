//! `scheduler start` / `scheduler stop`.

use std::io::Write;

use tracing::info;

use crate::context::ExecContext;
use crate::error::{AgentError, AgentResult};
use crate::scheduler::{client::SchedulerClient, server as scheduler_server, SchedulerConfig};
use crate::subcommand::SchedulerStartArgs;

pub(crate) fn start(ctx: &mut ExecContext, args: &SchedulerStartArgs) -> AgentResult<i32> {
    if args.tasks.is_empty() {
        return Err(AgentError::Usage(
            "scheduler start: no tasks configuration file provided".into(),
        ));
    }
    let bytes = std::fs::read(&args.tasks)?;
    let config = SchedulerConfig::parse(&bytes)?;

    std::fs::create_dir_all(&ctx.cache_dir)?;
    let socket = ctx.scheduler_socket();

    // tasks run on their own child token so a control-socket stop drains
    // them without touching the caller's context
    let (tasks_token, tasks_handle) = ctx.token.child();
    let scheduler = crate::scheduler::Scheduler::new(config, ctx.cache_dir.clone());
    let workers = scheduler.spawn(&tasks_token);

    info!(tasks = workers.len(), "scheduler up");
    scheduler_server::listen_and_serve(&ctx.token, &socket, tasks_handle)?;

    for worker in workers {
        let _ = worker.join();
    }
    info!("scheduler gracefully stopped");
    Ok(0)
}

pub(crate) fn stop(ctx: &mut ExecContext) -> AgentResult<i32> {
    let mut client = SchedulerClient::connect(&ctx.scheduler_socket(), false)?;
    let (exit_code, err) = client.stop()?;
    if let Some(err) = err {
        writeln!(ctx.stderr, "scheduler: {err}")?;
    }
    Ok(exit_code)
}
