//! `sync`: synchronize snapshots with a peer repository.

use std::io::Write;

use coffre_repository::snapshot;
use coffre_repository::{Repository, Secret};
use coffre_storage::backend::StoreConfig;

use crate::context::ExecContext;
use crate::error::{AgentError, AgentResult};
use crate::subcommand::{SyncArgs, SyncDirection};

fn open_peer(ctx: &ExecContext, args: &SyncArgs) -> AgentResult<Repository> {
    if args.peer.is_empty() {
        return Err(AgentError::Usage("sync: no peer specified".into()));
    }
    let mut config = StoreConfig::new();
    config.insert("location".into(), args.peer.clone());
    let secret = match &args.peer_passphrase {
        Some(passphrase) => Secret::Passphrase(passphrase.clone()),
        None => Secret::None,
    };
    Ok(Repository::open(&ctx.token, &config, secret)?)
}

pub(crate) fn run(ctx: &mut ExecContext, repo: &Repository, args: &SyncArgs) -> AgentResult<i32> {
    let peer = open_peer(ctx, args)?;

    let (pushed, pulled) = match args.direction {
        SyncDirection::To => (snapshot::sync(&ctx.token, repo, &peer)?, None),
        SyncDirection::From => (snapshot::sync(&ctx.token, &peer, repo)?, None),
        SyncDirection::With => {
            let to = snapshot::sync(&ctx.token, repo, &peer)?;
            let from = snapshot::sync(&ctx.token, &peer, repo)?;
            (to, Some(from))
        }
    };

    match pulled {
        Some(pulled) => writeln!(
            ctx.stdout,
            "sync: {} pushed, {} pulled, {} already in sync",
            pushed.snapshots,
            pulled.snapshots,
            pushed.skipped + pulled.skipped
        )?,
        None => writeln!(
            ctx.stdout,
            "sync: {} copied, {} already in sync",
            pushed.snapshots, pushed.skipped
        )?,
    }

    peer.close()?;
    Ok(0)
}
