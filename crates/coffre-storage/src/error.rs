//! Error types for the storage subsystem.

use thiserror::Error;

use crate::mac::Mac;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store root holds no repository (missing CONFIG).
    #[error("store is not configured")]
    NotConfigured,

    /// A repository already exists at the target location.
    #[error("store already exists at {location}")]
    AlreadyExists {
        /// The occupied location.
        location: String,
    },

    /// The requested blob does not exist.
    #[error("blob {mac} not found")]
    NotFound {
        /// The missing blob's address.
        mac: Mac,
    },

    /// The requested packfile does not exist.
    #[error("packfile {mac} not found")]
    PackfileNotFound {
        /// The missing packfile's address.
        mac: Mac,
    },

    /// No backend is registered for the location's protocol.
    #[error("unknown store protocol: {proto}")]
    UnknownProtocol {
        /// The unrecognized protocol.
        proto: String,
    },

    /// A string did not parse as a 64-hex-character MAC.
    #[error("invalid blob address: {value}")]
    InvalidMac {
        /// The rejected string.
        value: String,
    },

    /// The operation's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The store does not accept writes.
    #[error("store is read-only")]
    ReadOnly,

    /// The peer side of an RPC store reported a failure.
    #[error("remote store error: {0}")]
    Remote(String),

    /// An archive or wire payload failed to decode.
    #[error("malformed store data: {0}")]
    Malformed(String),
}

impl StorageError {
    /// Maps an I/O `NotFound` onto a typed blob-missing error, leaving
    /// other errors untouched.
    pub fn or_not_found(err: std::io::Error, mac: Mac) -> StorageError {
        if err.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound { mac }
        } else {
            StorageError::Io(err)
        }
    }

    /// Maps an I/O `NotFound` onto [`StorageError::PackfileNotFound`].
    pub fn or_packfile_not_found(err: std::io::Error, mac: Mac) -> StorageError {
        if err.kind() == std::io::ErrorKind::NotFound {
            StorageError::PackfileNotFound { mac }
        } else {
            StorageError::Io(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_mapping() {
        let mac = Mac([7u8; 32]);
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        match StorageError::or_not_found(io, mac) {
            StorageError::NotFound { mac: m } => assert_eq!(m, mac),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_other_io_errors_pass_through() {
        let mac = Mac([7u8; 32]);
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        match StorageError::or_packfile_not_found(io, mac) {
            StorageError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::PermissionDenied),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_display_mentions_mac() {
        let mac = Mac([0xabu8; 32]);
        let err = StorageError::PackfileNotFound { mac };
        assert!(err.to_string().contains(&mac.to_hex()));
    }
}
