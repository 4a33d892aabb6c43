//! The explicit execution context threaded through every command.
//!
//! Carries cancellation, the command's standard streams (real descriptors
//! locally, packet-backed proxies under the daemon), the store
//! configuration the request targets, and the user directories. Passed by
//! reference everywhere; nothing hides in thread-locals.

use std::io::{Read, Write};
use std::path::PathBuf;

use coffre_storage::backend::StoreConfig;
use coffre_storage::{CancelHandle, CancelToken};

/// Execution context for one command run.
pub struct ExecContext {
    /// Cancellation for this run; derived from the daemon's root token
    /// when executing remotely.
    pub token: CancelToken,
    /// Backend configuration of the targeted repository.
    pub store_config: StoreConfig,
    /// Cache directory holding the agent and scheduler sockets.
    pub cache_dir: PathBuf,
    /// Configuration directory holding the policies file.
    pub config_dir: PathBuf,
    /// Command input.
    pub stdin: Box<dyn Read + Send>,
    /// Command output.
    pub stdout: Box<dyn Write + Send>,
    /// Command diagnostics.
    pub stderr: Box<dyn Write + Send>,
    /// Handle cancelling the owning daemon, when running under one.
    pub shutdown: Option<CancelHandle>,
}

fn home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

/// Default cache directory: `$COFFRE_CACHE_DIR` or `~/.cache/coffre`.
pub fn default_cache_dir() -> PathBuf {
    std::env::var_os("COFFRE_CACHE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| home().join(".cache").join("coffre"))
}

/// Default config directory: `$COFFRE_CONFIG_DIR` or `~/.config/coffre`.
pub fn default_config_dir() -> PathBuf {
    std::env::var_os("COFFRE_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| home().join(".config").join("coffre"))
}

impl ExecContext {
    /// A context wired to the process's own standard streams.
    pub fn local(token: CancelToken, store_config: StoreConfig) -> Self {
        ExecContext {
            token,
            store_config,
            cache_dir: default_cache_dir(),
            config_dir: default_config_dir(),
            stdin: Box::new(std::io::stdin()),
            stdout: Box::new(std::io::stdout()),
            stderr: Box::new(std::io::stderr()),
            shutdown: None,
        }
    }

    /// Path of the agent socket under this context's cache directory.
    pub fn agent_socket(&self) -> PathBuf {
        self.cache_dir.join("agent.sock")
    }

    /// Path of the scheduler control socket.
    pub fn scheduler_socket(&self) -> PathBuf {
        self.cache_dir.join("scheduler.sock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_paths_derive_from_cache_dir() {
        let mut ctx = ExecContext::local(CancelToken::never(), StoreConfig::new());
        ctx.cache_dir = PathBuf::from("/var/cache/coffre");
        assert_eq!(
            ctx.agent_socket(),
            PathBuf::from("/var/cache/coffre/agent.sock")
        );
        assert_eq!(
            ctx.scheduler_socket(),
            PathBuf::from("/var/cache/coffre/scheduler.sock")
        );
    }
}
