//! Two-level hex sharding for large flat namespaces.
//!
//! Packfiles and states can number in the millions. Each namespace is
//! sharded by the first byte of the MAC so no single directory grows
//! unbounded:
//!
//! ```text
//! <root>/<hex-byte>/<hex-full-mac>
//! ```
//!
//! The locks namespace is deliberately flat and does not use this type.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::atomic::{mkdir_private, write_file_atomic};
use crate::cancel::CancelToken;
use crate::error::{StorageError, StorageResult};
use crate::mac::Mac;

/// One sharded namespace rooted at a directory.
#[derive(Debug, Clone)]
pub struct Buckets {
    root: PathBuf,
}

impl Buckets {
    /// Wraps a namespace root. No filesystem access happens here.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Buckets { root: root.into() }
    }

    /// Pre-creates the 256 single-byte-prefix subdirectories.
    pub fn create(&self) -> StorageResult<()> {
        mkdir_private(&self.root)?;
        for b in 0u16..=255 {
            mkdir_private(&self.root.join(format!("{b:02x}")))?;
        }
        debug!(root = %self.root.display(), "created bucket tree");
        Ok(())
    }

    /// Path a blob lives at, derived from the first hex byte of its MAC.
    pub fn path_of(&self, mac: Mac) -> PathBuf {
        self.root
            .join(format!("{:02x}", mac.0[0]))
            .join(mac.to_hex())
    }

    /// Concatenates the entries of all shards, decoding hex names back
    /// into MACs. Entries that are not 64-hex-character files are
    /// silently skipped.
    pub fn list(&self, token: &CancelToken) -> StorageResult<Vec<Mac>> {
        let mut out = Vec::new();
        for b in 0u16..=255 {
            token.check()?;
            let shard = self.root.join(format!("{b:02x}"));
            let entries = match fs::read_dir(&shard) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let name = entry.file_name();
                if let Some(mac) = name.to_str().and_then(Mac::from_hex) {
                    out.push(mac);
                }
            }
        }
        Ok(out)
    }

    /// Opens a blob for reading.
    pub fn get(&self, mac: Mac) -> StorageResult<File> {
        File::open(self.path_of(mac)).map_err(|e| StorageError::or_not_found(e, mac))
    }

    /// Opens a blob and positions a reader over `[offset, offset+length)`.
    /// A `length` of zero reads to EOF.
    pub fn get_blob(
        &self,
        mac: Mac,
        offset: u64,
        length: u32,
    ) -> StorageResult<Box<dyn Read + Send>> {
        let mut file = self.get(mac)?;
        file.seek(SeekFrom::Start(offset))?;
        if length == 0 {
            Ok(Box::new(file))
        } else {
            Ok(Box::new(file.take(u64::from(length))))
        }
    }

    /// Installs a blob atomically. Idempotent for identical content: a
    /// concurrent writer of the same MAC loses nothing but the rename race.
    pub fn put(&self, mac: Mac, rd: &mut dyn Read) -> StorageResult<u64> {
        write_file_atomic(&self.path_of(mac), rd)
    }

    /// Removes a blob.
    pub fn remove(&self, mac: Mac) -> StorageResult<()> {
        fs::remove_file(self.path_of(mac)).map_err(|e| StorageError::or_not_found(e, mac))
    }

    /// Whether a blob is present.
    pub fn contains(&self, mac: Mac) -> bool {
        self.path_of(mac).is_file()
    }

    /// The namespace root.
    pub fn root(&self) -> &Path {
        &self.root
    }
}
