//! The repository: typed, indexed blob storage over a backend.

use std::collections::BTreeSet;
use std::io::Read;
use std::sync::RwLock;

use chrono::Utc;
use tracing::{debug, info, warn};

use coffre_storage::backend::{create_store, open_store, Backend, StoreConfig};
use coffre_storage::{CancelToken, Mac};

use crate::config::{
    CompressionConfig, EncryptionConfig, PackingConfig, RepositoryConfig, VERSION,
};
use crate::encryption::{
    self, derive_key, derive_subkey, EncryptionAlgorithm, EncryptionKey, KdfParams,
};
use crate::error::{RepositoryError, RepositoryResult};
use crate::packer::{BlobCodec, PackfileBuilder};
use crate::state::{LocationIndex, ResourceType, State, StateEntry};

/// How the repository key is obtained on open.
pub enum Secret {
    /// The repository is expected to be plaintext.
    None,
    /// Derive the key from a passphrase using the stored KDF parameters.
    Passphrase(String),
    /// A pre-derived key, e.g. relayed by the daemon.
    Key([u8; 32]),
}

/// Options for creating a repository.
pub struct CreateOptions {
    /// Encrypt with this passphrase; `None` creates a plaintext store.
    pub passphrase: Option<String>,
    /// AEAD cipher when encrypting.
    pub algorithm: EncryptionAlgorithm,
    /// Compression descriptor; `None` stores blobs uncompressed.
    pub compression: Option<CompressionConfig>,
    /// Chunking and packing parameters.
    pub packing: PackingConfig,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            passphrase: None,
            algorithm: EncryptionAlgorithm::default(),
            compression: Some(CompressionConfig::default()),
            packing: PackingConfig::default(),
        }
    }
}

/// Outcome of a maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceStats {
    /// Packfiles that became unreachable and were deleted.
    pub packfiles_deleted: usize,
    /// Old states replaced by the compacted one.
    pub states_compacted: usize,
}

/// An opened repository.
///
/// Owns the backend, the decoded configuration, the key material derived
/// at open time, and the location index merged from all live states.
pub struct Repository {
    backend: Box<dyn Backend>,
    config: RepositoryConfig,
    codec: BlobCodec,
    mac_key: [u8; 32],
    index: RwLock<LocationIndex>,
}

impl Repository {
    /// Creates a repository at the location named by `store_config`.
    pub fn create(
        token: &CancelToken,
        store_config: &StoreConfig,
        options: CreateOptions,
    ) -> RepositoryResult<Repository> {
        let repository_id = Mac::random();
        let encryption = match &options.passphrase {
            Some(passphrase) => {
                let kdf = KdfParams::generate();
                let key = derive_key(&kdf, passphrase.as_bytes());
                let canary = encryption::seal_canary(&key, options.algorithm)?;
                Some(EncryptionConfig {
                    algorithm: options.algorithm,
                    kdf,
                    canary,
                })
            }
            None => None,
        };

        let config = RepositoryConfig {
            version: VERSION,
            repository_id,
            created: Utc::now(),
            encryption,
            compression: options.compression.clone(),
            packing: options.packing.clone(),
        };

        let backend = create_store(token, store_config, &config.to_bytes()?)?;
        info!(location = %backend.location(), "created repository");

        let secret = match options.passphrase {
            Some(passphrase) => Secret::Passphrase(passphrase),
            None => Secret::None,
        };
        Self::assemble(backend, config, secret, LocationIndex::new())
    }

    /// Opens the repository at the location named by `store_config`.
    ///
    /// Follows the open sequence: read CONFIG, check the schema version,
    /// derive and verify the key when encryption is configured, then merge
    /// every live state into the location index.
    pub fn open(
        token: &CancelToken,
        store_config: &StoreConfig,
        secret: Secret,
    ) -> RepositoryResult<Repository> {
        let (backend, config_bytes) = open_store(token, store_config)?;
        let config = RepositoryConfig::from_bytes(&config_bytes)?;

        let repo = Self::assemble(backend, config, secret, LocationIndex::new())?;
        repo.rebuild_index(token)?;
        debug!(
            location = %repo.backend.location(),
            blobs = repo.index.read().unwrap().len(),
            "opened repository"
        );
        Ok(repo)
    }

    fn assemble(
        backend: Box<dyn Backend>,
        config: RepositoryConfig,
        secret: Secret,
        index: LocationIndex,
    ) -> RepositoryResult<Repository> {
        let key = match (&config.encryption, secret) {
            (None, _) => None,
            (Some(_), Secret::None) => return Err(RepositoryError::PassphraseRequired),
            (Some(enc), Secret::Passphrase(passphrase)) => {
                let key = derive_key(&enc.kdf, passphrase.as_bytes());
                if !encryption::verify_canary(&enc.canary, &key, enc.algorithm) {
                    return Err(RepositoryError::BadPassphrase);
                }
                Some(key)
            }
            (Some(enc), Secret::Key(raw)) => {
                let key = EncryptionKey(raw);
                if !encryption::verify_canary(&enc.canary, &key, enc.algorithm) {
                    return Err(RepositoryError::BadPassphrase);
                }
                Some(key)
            }
        };

        let mac_key = match &key {
            Some(key) => derive_subkey(key, b"coffre-mac-key"),
            None => *config.repository_id.as_bytes(),
        };
        let codec = BlobCodec {
            compression: config.compression.clone(),
            encryption: key
                .as_ref()
                .map(|k| (config.encryption.as_ref().expect("checked above").algorithm, k.clone())),
        };

        Ok(Repository {
            backend,
            config,
            codec,
            mac_key,
            index: RwLock::new(index),
        })
    }

    fn rebuild_index(&self, token: &CancelToken) -> RepositoryResult<()> {
        let mut states = Vec::new();
        for mac in self.backend.list_states(token)? {
            token.check()?;
            let mut encoded = Vec::new();
            self.backend
                .get_state(token, mac)?
                .read_to_end(&mut encoded)?;
            let decoded = self.codec.decode(&encoded)?;
            states.push(State::from_bytes(&decoded)?);
        }
        *self.index.write().unwrap() = LocationIndex::merge(states);
        Ok(())
    }

    /// The decoded configuration.
    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// The backend location string.
    pub fn location(&self) -> String {
        self.backend.location()
    }

    /// Direct backend access for blob-level tooling.
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Computes the repository-keyed MAC of a plaintext blob.
    pub fn compute_mac(&self, data: &[u8]) -> Mac {
        Mac::compute(&self.mac_key, data)
    }

    /// A fresh builder sized by the packing configuration.
    pub fn builder(&self) -> PackfileBuilder {
        PackfileBuilder::new(self.config.packing.max_packfile_size)
    }

    /// Whether a typed blob is reachable, either already indexed or
    /// pending in `builder`.
    pub fn has_blob(&self, resource: ResourceType, mac: Mac) -> bool {
        self.index.read().unwrap().contains(resource, mac)
    }

    /// Encodes a plaintext blob and appends it to `builder`.
    pub fn put_blob(
        &self,
        builder: &mut PackfileBuilder,
        resource: ResourceType,
        mac: Mac,
        data: &[u8],
    ) -> RepositoryResult<()> {
        let encoded = self.codec.encode(data)?;
        builder.add(resource, mac, &encoded);
        Ok(())
    }

    /// Reads and decodes a typed blob through the location index.
    pub fn get_blob(
        &self,
        token: &CancelToken,
        resource: ResourceType,
        mac: Mac,
    ) -> RepositoryResult<Vec<u8>> {
        let location = self
            .index
            .read()
            .unwrap()
            .get(resource, mac)
            .ok_or(RepositoryError::NotFound { mac })?;

        let mut encoded = Vec::new();
        self.backend
            .get_packfile_blob(token, location.packfile, location.offset, location.length)?
            .read_to_end(&mut encoded)?;
        if encoded.len() != location.length as usize {
            return Err(RepositoryError::Corrupt(format!(
                "short read of blob {mac}: {} of {} bytes",
                encoded.len(),
                location.length
            )));
        }
        self.codec.decode(&encoded)
    }

    /// Seals `builder` into a packfile and an incremental state, installs
    /// both, and folds the new entries into the live index. Returns the
    /// `(packfile, state)` addresses.
    pub fn commit(
        &self,
        token: &CancelToken,
        builder: PackfileBuilder,
    ) -> RepositoryResult<(Mac, Mac)> {
        self.commit_with_tombstones(token, builder, Vec::new())
    }

    fn commit_with_tombstones(
        &self,
        token: &CancelToken,
        builder: PackfileBuilder,
        tombstones: Vec<(ResourceType, Mac)>,
    ) -> RepositoryResult<(Mac, Mac)> {
        // the packfile MAC covers the stored payload bytes; entries are
        // sealed against a placeholder and patched once it is known
        let (payload, sealed, stats) = builder.seal(Mac::default());
        let packfile_mac = self.compute_mac(&payload);
        let entries: Vec<StateEntry> = sealed
            .into_iter()
            .map(|mut e| {
                e.packfile = packfile_mac;
                e
            })
            .collect();

        let mut state = State::new(Utc::now());
        state.entries = entries;
        state.tombstones = tombstones;

        if !payload.is_empty() {
            self.backend
                .put_packfile(token, packfile_mac, &mut &payload[..])?;
        }

        let encoded_state = self.codec.encode(&state.to_bytes()?)?;
        let state_mac = self.compute_mac(&encoded_state);
        self.backend
            .put_state(token, state_mac, &mut &encoded_state[..])?;

        self.index.write().unwrap().apply(&state);
        debug!(
            packfile = %packfile_mac.short(),
            blobs = stats.blobs,
            bytes = stats.bytes,
            "committed packfile"
        );
        Ok((packfile_mac, state_mac))
    }

    /// All live snapshot addresses.
    pub fn list_snapshots(&self) -> Vec<Mac> {
        self.index.read().unwrap().macs_of(ResourceType::Snapshot)
    }

    /// Publishes a state removing `mac` from the snapshot namespace. The
    /// snapshot's data stays until a maintenance pass collects what became
    /// unreachable.
    pub fn delete_snapshot(&self, token: &CancelToken, mac: Mac) -> RepositoryResult<()> {
        if !self.has_blob(ResourceType::Snapshot, mac) {
            return Err(RepositoryError::NotFound { mac });
        }
        let builder = PackfileBuilder::new(0);
        self.commit_with_tombstones(token, builder, vec![(ResourceType::Snapshot, mac)])?;
        info!(snapshot = %mac.short(), "deleted snapshot");
        Ok(())
    }

    /// Garbage-collects packfiles unreachable from any live snapshot and
    /// compacts all states into one.
    pub fn maintenance(&self, token: &CancelToken) -> RepositoryResult<MaintenanceStats> {
        let mut stats = MaintenanceStats::default();

        // mark: packfiles reachable from live snapshot records
        let mut reachable: BTreeSet<Mac> = BTreeSet::new();
        let snapshots = self.list_snapshots();
        for snapshot_mac in &snapshots {
            token.check()?;
            if let Some(loc) = self
                .index
                .read()
                .unwrap()
                .get(ResourceType::Snapshot, *snapshot_mac)
            {
                reachable.insert(loc.packfile);
            }
            let header = crate::snapshot::load(token, self, *snapshot_mac)?;
            let index = self.index.read().unwrap();
            for file in &header.files {
                for chunk in &file.chunks {
                    if let Some(loc) = index.get(ResourceType::Chunk, *chunk) {
                        reachable.insert(loc.packfile);
                    }
                }
            }
        }

        // sweep: delete what no live snapshot references
        let old_states = self.backend.list_states(token)?;
        for packfile in self.backend.list_packfiles(token)? {
            token.check()?;
            if !reachable.contains(&packfile) {
                match self.backend.delete_packfile(token, packfile) {
                    Ok(()) => stats.packfiles_deleted += 1,
                    Err(e) => warn!(packfile = %packfile.short(), error = %e, "sweep failed"),
                }
            }
        }

        // compact: one merged state holding only entries in reachable
        // packfiles, then drop the superseded states
        let mut compacted = State::new(Utc::now());
        {
            let index = self.index.read().unwrap();
            for (resource, mac, location) in index.entries() {
                if reachable.contains(&location.packfile) {
                    compacted.entries.push(StateEntry {
                        resource,
                        mac,
                        packfile: location.packfile,
                        offset: location.offset,
                        length: location.length,
                    });
                }
            }
        }
        let encoded = self.codec.encode(&compacted.to_bytes()?)?;
        let state_mac = self.compute_mac(&encoded);
        self.backend.put_state(token, state_mac, &mut &encoded[..])?;

        for old in old_states {
            if old != state_mac {
                self.backend.delete_state(token, old)?;
                stats.states_compacted += 1;
            }
        }

        *self.index.write().unwrap() = {
            let mut index = LocationIndex::new();
            index.apply(&compacted);
            index
        };

        info!(
            deleted = stats.packfiles_deleted,
            compacted = stats.states_compacted,
            "maintenance complete"
        );
        Ok(stats)
    }

    /// Releases backend resources.
    pub fn close(&self) -> RepositoryResult<()> {
        self.backend.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_config(dir: &std::path::Path) -> StoreConfig {
        let mut config = StoreConfig::new();
        config.insert(
            "location".into(),
            format!("fs://{}", dir.join("repo").display()),
        );
        config
    }

    #[test]
    fn test_create_then_open_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancelToken::never();
        let config = fs_config(dir.path());

        let repo = Repository::create(&token, &config, CreateOptions::default()).unwrap();
        let id = repo.config().repository_id;
        drop(repo);

        let reopened = Repository::open(&token, &config, Secret::None).unwrap();
        assert_eq!(reopened.config().repository_id, id);
        assert!(reopened.list_snapshots().is_empty());
    }

    #[test]
    fn test_encrypted_open_requires_secret() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancelToken::never();
        let config = fs_config(dir.path());

        Repository::create(
            &token,
            &config,
            CreateOptions {
                passphrase: Some("correct horse".into()),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(matches!(
            Repository::open(&token, &config, Secret::None),
            Err(RepositoryError::PassphraseRequired)
        ));
        assert!(matches!(
            Repository::open(&token, &config, Secret::Passphrase("wrong".into())),
            Err(RepositoryError::BadPassphrase)
        ));
        assert!(Repository::open(
            &token,
            &config,
            Secret::Passphrase("correct horse".into())
        )
        .is_ok());
    }

    #[test]
    fn test_blob_round_trip_through_commit() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancelToken::never();
        let config = fs_config(dir.path());
        let repo = Repository::create(&token, &config, CreateOptions::default()).unwrap();

        let data = b"chunk contents".to_vec();
        let mac = repo.compute_mac(&data);
        let mut builder = repo.builder();
        repo.put_blob(&mut builder, ResourceType::Chunk, mac, &data)
            .unwrap();
        repo.commit(&token, builder).unwrap();

        assert!(repo.has_blob(ResourceType::Chunk, mac));
        assert_eq!(repo.get_blob(&token, ResourceType::Chunk, mac).unwrap(), data);

        // visible to a fresh opener as well
        drop(repo);
        let reopened = Repository::open(&token, &config, Secret::None).unwrap();
        assert_eq!(
            reopened.get_blob(&token, ResourceType::Chunk, mac).unwrap(),
            data
        );
    }

    #[test]
    fn test_missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancelToken::never();
        let repo =
            Repository::create(&token, &fs_config(dir.path()), CreateOptions::default()).unwrap();
        assert!(matches!(
            repo.get_blob(&token, ResourceType::Chunk, Mac::random()),
            Err(RepositoryError::NotFound { .. })
        ));
    }

    #[test]
    fn test_encrypted_blobs_are_opaque_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancelToken::never();
        let config = fs_config(dir.path());
        let repo = Repository::create(
            &token,
            &config,
            CreateOptions {
                passphrase: Some("pw".into()),
                compression: None,
                ..Default::default()
            },
        )
        .unwrap();

        let data = b"finding this on disk would be bad".to_vec();
        let mac = repo.compute_mac(&data);
        let mut builder = repo.builder();
        repo.put_blob(&mut builder, ResourceType::Chunk, mac, &data)
            .unwrap();
        let (packfile, _) = repo.commit(&token, builder).unwrap();

        let mut stored = Vec::new();
        repo.backend()
            .get_packfile(&token, packfile)
            .unwrap()
            .read_to_end(&mut stored)
            .unwrap();
        assert!(!stored
            .windows(data.len())
            .any(|window| window == &data[..]));
    }
}
