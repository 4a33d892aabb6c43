//! The pluggable backend contract.
//!
//! A backend is a durable byte-blob store with three namespaces: packfiles,
//! states and locks. It is instantiated from a string-keyed configuration
//! map whose `location` key names the physical root; the location's scheme
//! prefix selects the protocol (`fs://`, `null://`, `ptar://`, `rpc://`,
//! `sftp://`; a bare path means `fs`).
//!
//! Backends register themselves in a process-wide table at startup; the
//! table is read-only afterwards.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::{OnceLock, RwLock};

use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{StorageError, StorageResult};
use crate::mac::Mac;

/// String-keyed backend configuration. The `location` key is mandatory.
pub type StoreConfig = BTreeMap<String, String>;

/// The three disjoint blob namespaces of a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Namespace {
    /// Packfile namespace.
    Packfile,
    /// State namespace.
    State,
    /// Lock namespace.
    Lock,
}

/// Capability flag reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The store only serves reads.
    Read,
    /// The store serves reads and writes.
    ReadWrite,
}

impl Mode {
    /// Whether writes are accepted.
    pub fn can_write(self) -> bool {
        matches!(self, Mode::ReadWrite)
    }
}

/// A durable byte-blob store.
///
/// Every operation takes a cancellation token and must abort in-flight
/// work with `StorageError::Cancelled` once it fires. `put_*` operations
/// appear atomic: a reader either misses the blob entirely or reads the
/// complete bytes the writer wrote (invariant I1). Packfiles and states
/// are immutable once visible; deletion is the only legal removal.
pub trait Backend: Send + Sync {
    /// Initializes an empty repository holding `config` at its well-known
    /// name. Fails with `AlreadyExists` when the root is occupied. Must be
    /// atomic across a crash.
    fn create(&self, token: &CancelToken, config: &[u8]) -> StorageResult<()>;

    /// Reads back the configuration blob without mutating anything. Fails
    /// with `NotConfigured` when no repository lives here.
    fn open(&self, token: &CancelToken) -> StorageResult<Vec<u8>>;

    /// The location string this backend was instantiated from.
    fn location(&self) -> String;

    /// Capability flag.
    fn mode(&self) -> Mode;

    /// Best-effort total size in bytes; `None` when unknown.
    fn size(&self, token: &CancelToken) -> StorageResult<Option<u64>>;

    /// Lists all packfile MACs. Order unspecified, duplicates forbidden.
    fn list_packfiles(&self, token: &CancelToken) -> StorageResult<Vec<Mac>>;
    /// Opens a whole packfile for reading.
    fn get_packfile(&self, token: &CancelToken, mac: Mac) -> StorageResult<Box<dyn Read + Send>>;
    /// Opens a range of a packfile. `length == 0` means "to EOF".
    fn get_packfile_blob(
        &self,
        token: &CancelToken,
        mac: Mac,
        offset: u64,
        length: u32,
    ) -> StorageResult<Box<dyn Read + Send>>;
    /// Installs a packfile atomically, returning the bytes written.
    fn put_packfile(
        &self,
        token: &CancelToken,
        mac: Mac,
        rd: &mut dyn Read,
    ) -> StorageResult<u64>;
    /// Deletes a packfile.
    fn delete_packfile(&self, token: &CancelToken, mac: Mac) -> StorageResult<()>;

    /// Lists all state MACs.
    fn list_states(&self, token: &CancelToken) -> StorageResult<Vec<Mac>>;
    /// Opens a state for reading.
    fn get_state(&self, token: &CancelToken, mac: Mac) -> StorageResult<Box<dyn Read + Send>>;
    /// Installs a state atomically.
    fn put_state(&self, token: &CancelToken, mac: Mac, rd: &mut dyn Read) -> StorageResult<u64>;
    /// Deletes a state.
    fn delete_state(&self, token: &CancelToken, mac: Mac) -> StorageResult<()>;

    /// Lists all lock identifiers.
    fn list_locks(&self, token: &CancelToken) -> StorageResult<Vec<Mac>>;
    /// Opens a lock blob for reading.
    fn get_lock(&self, token: &CancelToken, mac: Mac) -> StorageResult<Box<dyn Read + Send>>;
    /// Installs a lock blob atomically.
    fn put_lock(&self, token: &CancelToken, mac: Mac, rd: &mut dyn Read) -> StorageResult<u64>;
    /// Deletes a lock blob.
    fn delete_lock(&self, token: &CancelToken, mac: Mac) -> StorageResult<()>;

    /// Best-effort resource release.
    fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Constructor signature for backend factories.
pub type Factory = fn(&StoreConfig) -> StorageResult<Box<dyn Backend>>;

fn registry() -> &'static RwLock<BTreeMap<String, Factory>> {
    static REGISTRY: OnceLock<RwLock<BTreeMap<String, Factory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: BTreeMap<String, Factory> = BTreeMap::new();
        map.insert("fs".into(), crate::fs::new_store as Factory);
        map.insert("null".into(), crate::null::new_store as Factory);
        map.insert("ptar".into(), crate::ptar::new_store as Factory);
        map.insert("rpc".into(), crate::rpc::new_store as Factory);
        #[cfg(feature = "sftp")]
        map.insert("sftp".into(), crate::sftp::new_store as Factory);
        RwLock::new(map)
    })
}

/// Registers an additional backend protocol. Meant to run at process
/// start, before any store is opened.
pub fn register(proto: &str, factory: Factory) {
    registry()
        .write()
        .unwrap()
        .insert(proto.to_string(), factory);
}

/// Splits a location into `(protocol, rest)`. A location without a scheme
/// is a local filesystem path.
pub fn split_location(location: &str) -> (&str, &str) {
    match location.split_once("://") {
        Some((proto, rest)) => (proto, rest),
        None => ("fs", location),
    }
}

/// Instantiates the backend selected by the configuration's `location`.
pub fn new_store(config: &StoreConfig) -> StorageResult<Box<dyn Backend>> {
    let location = config.get("location").map(String::as_str).unwrap_or("");
    let (proto, _) = split_location(location);
    let factory = {
        let reg = registry().read().unwrap();
        reg.get(proto).copied()
    };
    match factory {
        Some(factory) => factory(config),
        None => Err(StorageError::UnknownProtocol {
            proto: proto.to_string(),
        }),
    }
}

/// Instantiates and opens a store, returning it with the raw
/// configuration blob.
pub fn open_store(
    token: &CancelToken,
    config: &StoreConfig,
) -> StorageResult<(Box<dyn Backend>, Vec<u8>)> {
    let store = new_store(config)?;
    let config_bytes = store.open(token)?;
    debug!(location = %store.location(), "opened store");
    Ok((store, config_bytes))
}

/// Instantiates a store and creates a repository inside it.
pub fn create_store(
    token: &CancelToken,
    config: &StoreConfig,
    config_bytes: &[u8],
) -> StorageResult<Box<dyn Backend>> {
    let store = new_store(config)?;
    store.create(token, config_bytes)?;
    debug!(location = %store.location(), "created store");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_location() {
        assert_eq!(split_location("fs:///tmp/repo"), ("fs", "/tmp/repo"));
        assert_eq!(split_location("/tmp/repo"), ("fs", "/tmp/repo"));
        assert_eq!(split_location("null://"), ("null", ""));
        assert_eq!(
            split_location("rpc://127.0.0.1:9876"),
            ("rpc", "127.0.0.1:9876")
        );
    }

    #[test]
    fn test_unknown_protocol() {
        let mut config = StoreConfig::new();
        config.insert("location".into(), "carrier-pigeon://coop".into());
        assert!(matches!(
            new_store(&config),
            Err(StorageError::UnknownProtocol { .. })
        ));
    }

    #[test]
    fn test_builtin_protocols_resolve() {
        for location in ["null://", "fs:///tmp/somewhere", "ptar:///tmp/a.ptar"] {
            let mut config = StoreConfig::new();
            config.insert("location".into(), location.into());
            assert!(new_store(&config).is_ok(), "factory missing for {location}");
        }
    }

    #[test]
    fn test_register_extends_table() {
        fn factory(config: &StoreConfig) -> StorageResult<Box<dyn Backend>> {
            crate::null::new_store(config)
        }
        register("teleport", factory);
        let mut config = StoreConfig::new();
        config.insert("location".into(), "teleport://pad".into());
        assert!(new_store(&config).is_ok());
    }

    #[test]
    fn test_mode_flags() {
        assert!(Mode::ReadWrite.can_write());
        assert!(!Mode::Read.can_write());
    }
}
