//! Subcommand implementations.

pub mod agent;
pub mod backup;
pub mod check;
pub mod create;
pub mod locate;
pub mod maintenance;
pub mod prune;
pub mod restore;
pub mod rm;
pub mod scheduler_cmd;
pub mod sync_cmd;

use coffre_repository::{Repository, Secret};
use coffre_storage::backend::StoreConfig;
use coffre_storage::CancelToken;

use crate::error::AgentResult;

/// Opens the repository named by a store configuration, deriving the
/// secret from its `passphrase` key when present.
pub fn open_repository(
    token: &CancelToken,
    store_config: &StoreConfig,
) -> AgentResult<Repository> {
    let secret = match store_config.get("passphrase") {
        Some(passphrase) => Secret::Passphrase(passphrase.clone()),
        None => Secret::None,
    };
    Ok(Repository::open(token, store_config, secret)?)
}
