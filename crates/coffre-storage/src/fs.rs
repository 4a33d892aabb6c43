//! Local filesystem backend.
//!
//! On-disk layout:
//!
//! ```text
//! <root>/
//!   CONFIG                        serialized configuration blob
//!   packfiles/<hex-byte>/<hex64>  packfile blob
//!   states/<hex-byte>/<hex64>    state blob
//!   locks/<hex64>                lock blob (flat, not sharded)
//! ```
//!
//! Files are mode 0600, directories 0700. Lock temp files are staged in
//! the root so a half-written lock never shows up in a `locks/` listing.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::atomic::{mkdir_private, write_file_atomic, write_file_atomic_in};
use crate::backend::{split_location, Backend, Mode, StoreConfig};
use crate::buckets::Buckets;
use crate::cancel::CancelToken;
use crate::error::{StorageError, StorageResult};
use crate::mac::Mac;

/// Filesystem-backed store.
pub struct FsStore {
    location: String,
    root: PathBuf,
    packfiles: Buckets,
    states: Buckets,
}

/// Backend factory for the `fs` protocol.
pub fn new_store(config: &StoreConfig) -> StorageResult<Box<dyn Backend>> {
    let location = config.get("location").cloned().unwrap_or_default();
    let (_, path) = split_location(&location);
    let root = PathBuf::from(path);
    Ok(Box::new(FsStore {
        location,
        packfiles: Buckets::new(root.join("packfiles")),
        states: Buckets::new(root.join("states")),
        root,
    }))
}

impl FsStore {
    fn config_path(&self) -> PathBuf {
        self.root.join("CONFIG")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn lock_path(&self, mac: Mac) -> PathBuf {
        self.locks_dir().join(mac.to_hex())
    }

    fn walk_size(dir: &Path, token: &CancelToken) -> StorageResult<u64> {
        let mut total = 0u64;
        for entry in fs::read_dir(dir)? {
            token.check()?;
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_symlink() {
                continue;
            }
            if file_type.is_dir() {
                total += Self::walk_size(&entry.path(), token)?;
            } else {
                total += entry.metadata()?.len();
            }
        }
        Ok(total)
    }
}

impl Backend for FsStore {
    fn create(&self, token: &CancelToken, config: &[u8]) -> StorageResult<()> {
        token.check()?;
        match fs::read_dir(&self.root) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    return Err(StorageError::AlreadyExists {
                        location: self.location.clone(),
                    });
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                mkdir_private(&self.root)?;
            }
            Err(e) => return Err(e.into()),
        }

        self.packfiles.create()?;
        self.states.create()?;
        mkdir_private(&self.locks_dir())?;

        write_file_atomic(&self.config_path(), &mut &config[..])?;
        debug!(root = %self.root.display(), "created repository");
        Ok(())
    }

    fn open(&self, token: &CancelToken) -> StorageResult<Vec<u8>> {
        token.check()?;
        match fs::read(self.config_path()) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotConfigured)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn location(&self) -> String {
        self.location.clone()
    }

    fn mode(&self) -> Mode {
        Mode::ReadWrite
    }

    fn size(&self, token: &CancelToken) -> StorageResult<Option<u64>> {
        Ok(Some(Self::walk_size(&self.root, token)?))
    }

    fn list_packfiles(&self, token: &CancelToken) -> StorageResult<Vec<Mac>> {
        self.packfiles.list(token)
    }

    fn get_packfile(&self, token: &CancelToken, mac: Mac) -> StorageResult<Box<dyn Read + Send>> {
        token.check()?;
        match self.packfiles.get(mac) {
            Ok(file) => Ok(Box::new(file)),
            Err(StorageError::NotFound { mac }) => Err(StorageError::PackfileNotFound { mac }),
            Err(e) => Err(e),
        }
    }

    fn get_packfile_blob(
        &self,
        token: &CancelToken,
        mac: Mac,
        offset: u64,
        length: u32,
    ) -> StorageResult<Box<dyn Read + Send>> {
        token.check()?;
        match self.packfiles.get_blob(mac, offset, length) {
            Err(StorageError::NotFound { mac }) => Err(StorageError::PackfileNotFound { mac }),
            other => other,
        }
    }

    fn put_packfile(
        &self,
        token: &CancelToken,
        mac: Mac,
        rd: &mut dyn Read,
    ) -> StorageResult<u64> {
        token.check()?;
        self.packfiles.put(mac, rd)
    }

    fn delete_packfile(&self, token: &CancelToken, mac: Mac) -> StorageResult<()> {
        token.check()?;
        self.packfiles.remove(mac)
    }

    fn list_states(&self, token: &CancelToken) -> StorageResult<Vec<Mac>> {
        self.states.list(token)
    }

    fn get_state(&self, token: &CancelToken, mac: Mac) -> StorageResult<Box<dyn Read + Send>> {
        token.check()?;
        Ok(Box::new(self.states.get(mac)?))
    }

    fn put_state(&self, token: &CancelToken, mac: Mac, rd: &mut dyn Read) -> StorageResult<u64> {
        token.check()?;
        self.states.put(mac, rd)
    }

    fn delete_state(&self, token: &CancelToken, mac: Mac) -> StorageResult<()> {
        token.check()?;
        self.states.remove(mac)
    }

    fn list_locks(&self, token: &CancelToken) -> StorageResult<Vec<Mac>> {
        token.check()?;
        let mut out = Vec::new();
        for entry in fs::read_dir(self.locks_dir())? {
            token.check()?;
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            match entry.file_name().to_str().and_then(Mac::from_hex) {
                Some(mac) => out.push(mac),
                None => warn!(name = ?entry.file_name(), "skipping foreign file in locks"),
            }
        }
        Ok(out)
    }

    fn get_lock(&self, token: &CancelToken, mac: Mac) -> StorageResult<Box<dyn Read + Send>> {
        token.check()?;
        let file =
            fs::File::open(self.lock_path(mac)).map_err(|e| StorageError::or_not_found(e, mac))?;
        Ok(Box::new(file))
    }

    fn put_lock(&self, token: &CancelToken, mac: Mac, rd: &mut dyn Read) -> StorageResult<u64> {
        token.check()?;
        // Temp files staged in the root, not in locks/: list_locks scans
        // that directory wholesale.
        write_file_atomic_in(&self.lock_path(mac), rd, &self.root)
    }

    fn delete_lock(&self, token: &CancelToken, mac: Mac) -> StorageResult<()> {
        token.check()?;
        fs::remove_file(self.lock_path(mac)).map_err(|e| StorageError::or_not_found(e, mac))
    }
}
