//! Repository configuration blob.
//!
//! A small msgpack document stored at the backend's well-known `CONFIG`
//! name, written exactly once at create time and read on every open. It
//! carries the schema version, the repository identity, and the
//! encryption/compression/packing descriptors everything else derives
//! its behavior from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coffre_storage::Mac;

use crate::encryption::{EncryptionAlgorithm, KdfParams};
use crate::error::{RepositoryError, RepositoryResult};

/// Schema version this build reads and writes.
pub const VERSION: u32 = 1;

/// Compression codec selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompressionAlgorithm {
    /// zlib (RFC 1950) streams.
    #[default]
    Zlib,
}

/// Compression descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Codec applied to every blob before encryption.
    pub algorithm: CompressionAlgorithm,
    /// Codec-specific level.
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            algorithm: CompressionAlgorithm::Zlib,
            level: 6,
        }
    }
}

/// Encryption descriptor: cipher, KDF parameters and the sealed canary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// AEAD cipher for every blob.
    pub algorithm: EncryptionAlgorithm,
    /// Passphrase stretching parameters.
    pub kdf: KdfParams,
    /// AEAD encryption of the known canary plaintext.
    pub canary: Vec<u8>,
}

/// Chunking and packing parameters for the write path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackingConfig {
    /// Content-defined chunking minimum chunk size.
    pub chunk_min: u32,
    /// Content-defined chunking target chunk size.
    pub chunk_avg: u32,
    /// Content-defined chunking maximum chunk size.
    pub chunk_max: u32,
    /// A packfile seals once its payload reaches this size.
    pub max_packfile_size: u64,
}

impl Default for PackingConfig {
    fn default() -> Self {
        PackingConfig {
            chunk_min: 64 * 1024,
            chunk_avg: 256 * 1024,
            chunk_max: 1024 * 1024,
            max_packfile_size: 16 * 1024 * 1024,
        }
    }
}

/// The CONFIG document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Schema version.
    pub version: u32,
    /// Random repository identity, also the MAC key of plaintext stores.
    pub repository_id: Mac,
    /// Creation instant.
    pub created: DateTime<Utc>,
    /// Encryption descriptor; absent for plaintext repositories.
    pub encryption: Option<EncryptionConfig>,
    /// Compression descriptor; absent for incompressible stores.
    pub compression: Option<CompressionConfig>,
    /// Chunking and packing parameters.
    #[serde(default)]
    pub packing: PackingConfig,
}

impl RepositoryConfig {
    /// Serializes to the CONFIG wire form.
    pub fn to_bytes(&self) -> RepositoryResult<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| RepositoryError::Corrupt(e.to_string()))
    }

    /// Parses the CONFIG wire form, rejecting unknown schema versions.
    pub fn from_bytes(bytes: &[u8]) -> RepositoryResult<Self> {
        let config: RepositoryConfig =
            rmp_serde::from_slice(bytes).map_err(|e| RepositoryError::Corrupt(e.to_string()))?;
        if config.version != VERSION {
            return Err(RepositoryError::IncompatibleVersion {
                found: config.version,
                supported: VERSION,
            });
        }
        Ok(config)
    }
}
