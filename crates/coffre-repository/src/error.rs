//! Error types for the repository layer.

use thiserror::Error;

use coffre_storage::{Mac, StorageError};

/// Result type alias for repository operations.
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Error variants for repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// A typed blob is absent from the location index.
    #[error("blob {mac} not found")]
    NotFound {
        /// The missing blob's address.
        mac: Mac,
    },

    /// A packfile named by the location index is gone from the backend.
    #[error("packfile {mac} not found")]
    PackfileNotFound {
        /// The missing packfile's address.
        mac: Mac,
    },

    /// Canary verification failed: the derived key is wrong.
    #[error("invalid passphrase")]
    BadPassphrase,

    /// The repository is encrypted and no secret was supplied.
    #[error("repository is encrypted and no passphrase was provided")]
    PassphraseRequired,

    /// The CONFIG schema version is not one this build understands.
    #[error("incompatible repository version {found} (supported: {supported})")]
    IncompatibleVersion {
        /// Version found in CONFIG.
        found: u32,
        /// Version this build supports.
        supported: u32,
    },

    /// The backend cannot be reached or is unusable.
    #[error("store unavailable: {0}")]
    BackendUnavailable(String),

    /// The operation's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// A blob or state failed to decode or decrypt.
    #[error("corrupt repository data: {0}")]
    Corrupt(String),

    /// Any other backend failure.
    #[error("store error: {0}")]
    Storage(StorageError),

    /// Wraps standard I/O errors from the snapshot paths.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for RepositoryError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Cancelled => RepositoryError::Cancelled,
            StorageError::NotFound { mac } => RepositoryError::NotFound { mac },
            StorageError::PackfileNotFound { mac } => RepositoryError::PackfileNotFound { mac },
            other => RepositoryError::Storage(other),
        }
    }
}
