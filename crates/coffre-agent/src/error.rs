//! Error types for the agent layer.

use thiserror::Error;

use coffre_repository::RepositoryError;
use coffre_storage::StorageError;

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Error variants for the daemon, client and command layers.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage-layer failure.
    #[error(transparent)]
    Storage(StorageError),

    /// Repository-layer failure.
    #[error(transparent)]
    Repository(RepositoryError),

    /// msgpack encode/decode failure on the wire.
    #[error("wire format error: {0}")]
    Wire(String),

    /// The daemon speaks a different version and the command did not opt
    /// out of the check.
    #[error("agent is running a different version ({theirs})")]
    WrongVersion {
        /// Version string the daemon reported.
        theirs: String,
    },

    /// The daemon cannot be dialed and could not be spawned.
    #[error("failed to run the agent")]
    AgentUnavailable,

    /// Another daemon already holds the socket.
    #[error("agent already running")]
    AlreadyRunning,

    /// The scheduler control socket cannot be dialed.
    #[error("failed to connect to scheduler: {0}")]
    SchedulerUnavailable(String),

    /// The request named a subcommand this build does not know.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// The subcommand cannot be executed through the agent.
    #[error("command {0} doesn't support execution through the agent")]
    NoAgentSupport(String),

    /// A command precondition failed.
    #[error("{0}")]
    Usage(String),

    /// The operation's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<StorageError> for AgentError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Cancelled => AgentError::Cancelled,
            other => AgentError::Storage(other),
        }
    }
}

impl From<RepositoryError> for AgentError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Cancelled => AgentError::Cancelled,
            other => AgentError::Repository(other),
        }
    }
}

impl AgentError {
    /// Whether this error is a disconnect-style wire failure.
    pub fn is_disconnect(&self) -> bool {
        match self {
            AgentError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
            ),
            AgentError::Wire(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_detection() {
        let eof = AgentError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "eof",
        ));
        assert!(eof.is_disconnect());
        assert!(!AgentError::AlreadyRunning.is_disconnect());
    }

    #[test]
    fn test_repository_errors_pass_through() {
        let err: AgentError = RepositoryError::BadPassphrase.into();
        assert_eq!(err.to_string(), "invalid passphrase");
    }

    #[test]
    fn test_cancellation_maps_to_one_variant() {
        assert!(matches!(
            AgentError::from(StorageError::Cancelled),
            AgentError::Cancelled
        ));
        assert!(matches!(
            AgentError::from(RepositoryError::Cancelled),
            AgentError::Cancelled
        ));
    }
}
