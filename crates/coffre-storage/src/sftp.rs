//! Remote directory over SSH.
//!
//! Same layout as the `fs` backend, reached through an SFTP session.
//! Atomic installation uses a remote temp name plus rename, mirroring the
//! local write-rename discipline. Enabled by the `sftp` cargo feature.
//!
//! Location: `sftp://[user@]host[:port]/absolute/path`. Authentication
//! order: `password` config key, `identity` config key (private key
//! file), then the running ssh-agent.

use std::io::Read;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ssh2::{RenameFlags, Session, Sftp};
use tracing::debug;

use crate::backend::{split_location, Backend, Mode, StoreConfig};
use crate::cancel::CancelToken;
use crate::error::{StorageError, StorageResult};
use crate::mac::Mac;

fn sftp_err(e: ssh2::Error) -> StorageError {
    StorageError::Remote(e.to_string())
}

struct Target {
    user: String,
    host_port: String,
    root: PathBuf,
}

fn parse_target(location: &str) -> StorageResult<Target> {
    let (_, rest) = split_location(location);
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => {
            return Err(StorageError::Remote(format!(
                "sftp location {location} has no path"
            )))
        }
    };
    let (user, host) = match authority.split_once('@') {
        Some((user, host)) => (user.to_string(), host),
        None => (whoami(), authority),
    };
    let host_port = if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:22")
    };
    Ok(Target {
        user,
        host_port,
        root: PathBuf::from(path),
    })
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "root".to_string())
}

/// SFTP-backed store.
pub struct SftpStore {
    location: String,
    config: StoreConfig,
    session: Mutex<Option<(Session, Sftp)>>,
}

/// Backend factory for the `sftp` protocol.
pub fn new_store(config: &StoreConfig) -> StorageResult<Box<dyn Backend>> {
    Ok(Box::new(SftpStore {
        location: config.get("location").cloned().unwrap_or_default(),
        config: config.clone(),
        session: Mutex::new(None),
    }))
}

impl SftpStore {
    fn connect(&self) -> StorageResult<(Session, Sftp)> {
        let target = parse_target(&self.location)?;
        let tcp = TcpStream::connect(&target.host_port)?;
        let mut session = Session::new().map_err(sftp_err)?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(sftp_err)?;

        if let Some(password) = self.config.get("password") {
            session
                .userauth_password(&target.user, password)
                .map_err(sftp_err)?;
        } else if let Some(identity) = self.config.get("identity") {
            session
                .userauth_pubkey_file(&target.user, None, Path::new(identity), None)
                .map_err(sftp_err)?;
        } else {
            session.userauth_agent(&target.user).map_err(sftp_err)?;
        }

        let sftp = session.sftp().map_err(sftp_err)?;
        debug!(host = %target.host_port, "sftp session established");
        Ok((session, sftp))
    }

    fn with_sftp<T>(&self, f: impl FnOnce(&Sftp, &Path) -> StorageResult<T>) -> StorageResult<T> {
        let target = parse_target(&self.location)?;
        let mut guard = self.session.lock().unwrap();
        if guard.is_none() {
            *guard = Some(self.connect()?);
        }
        let (_, sftp) = guard.as_ref().expect("session just connected");
        f(sftp, &target.root)
    }

    fn mkdir_all(sftp: &Sftp, dir: &Path) -> StorageResult<()> {
        if sftp.stat(dir).is_ok() {
            return Ok(());
        }
        if let Some(parent) = dir.parent() {
            if parent != Path::new("") && parent != Path::new("/") {
                Self::mkdir_all(sftp, parent)?;
            }
        }
        match sftp.mkdir(dir, 0o700) {
            Ok(()) => Ok(()),
            // another writer may have raced us
            Err(_) if sftp.stat(dir).is_ok() => Ok(()),
            Err(e) => Err(sftp_err(e)),
        }
    }

    fn install(sftp: &Sftp, path: &Path, rd: &mut dyn Read) -> StorageResult<u64> {
        let tmp = path.with_file_name(format!(
            ".coffre-tmp-{}",
            Mac::random().short()
        ));
        let mut remote = sftp.create(&tmp).map_err(sftp_err)?;
        let written = match std::io::copy(rd, &mut remote) {
            Ok(n) => n,
            Err(e) => {
                drop(remote);
                let _ = sftp.unlink(&tmp);
                return Err(e.into());
            }
        };
        drop(remote);
        if let Err(e) = sftp.rename(&tmp, path, Some(RenameFlags::OVERWRITE)) {
            let _ = sftp.unlink(&tmp);
            return Err(sftp_err(e));
        }
        Ok(written)
    }

    fn read_all(sftp: &Sftp, path: &Path, mac: Mac) -> StorageResult<Vec<u8>> {
        let mut file = sftp
            .open(path)
            .map_err(|_| StorageError::NotFound { mac })?;
        let mut out = Vec::new();
        file.read_to_end(&mut out)?;
        Ok(out)
    }

    fn bucket_path(root: &Path, namespace: &str, mac: Mac) -> PathBuf {
        root.join(namespace)
            .join(format!("{:02x}", mac.0[0]))
            .join(mac.to_hex())
    }

    fn list_bucketed(
        sftp: &Sftp,
        root: &Path,
        namespace: &str,
        token: &CancelToken,
    ) -> StorageResult<Vec<Mac>> {
        let mut out = Vec::new();
        for b in 0u16..=255 {
            token.check()?;
            let shard = root.join(namespace).join(format!("{b:02x}"));
            let entries = match sftp.readdir(&shard) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for (path, stat) in entries {
                if !stat.is_file() {
                    continue;
                }
                if let Some(mac) = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(Mac::from_hex)
                {
                    out.push(mac);
                }
            }
        }
        Ok(out)
    }
}

impl Backend for SftpStore {
    fn create(&self, token: &CancelToken, config: &[u8]) -> StorageResult<()> {
        token.check()?;
        self.with_sftp(|sftp, root| {
            if let Ok(entries) = sftp.readdir(root) {
                if !entries.is_empty() {
                    return Err(StorageError::AlreadyExists {
                        location: self.location.clone(),
                    });
                }
            } else {
                Self::mkdir_all(sftp, root)?;
            }
            for namespace in ["packfiles", "states"] {
                for b in 0u16..=255 {
                    Self::mkdir_all(sftp, &root.join(namespace).join(format!("{b:02x}")))?;
                }
            }
            Self::mkdir_all(sftp, &root.join("locks"))?;
            Self::install(sftp, &root.join("CONFIG"), &mut &config[..])?;
            Ok(())
        })
    }

    fn open(&self, token: &CancelToken) -> StorageResult<Vec<u8>> {
        token.check()?;
        self.with_sftp(|sftp, root| {
            let path = root.join("CONFIG");
            match sftp.open(&path) {
                Ok(mut file) => {
                    let mut out = Vec::new();
                    file.read_to_end(&mut out)?;
                    Ok(out)
                }
                Err(_) => Err(StorageError::NotConfigured),
            }
        })
    }

    fn location(&self) -> String {
        self.location.clone()
    }

    fn mode(&self) -> Mode {
        Mode::ReadWrite
    }

    fn size(&self, token: &CancelToken) -> StorageResult<Option<u64>> {
        token.check()?;
        // walking a quarter million remote entries is not best-effort
        Ok(None)
    }

    fn list_packfiles(&self, token: &CancelToken) -> StorageResult<Vec<Mac>> {
        token.check()?;
        self.with_sftp(|sftp, root| Self::list_bucketed(sftp, root, "packfiles", token))
    }

    fn get_packfile(&self, token: &CancelToken, mac: Mac) -> StorageResult<Box<dyn Read + Send>> {
        token.check()?;
        let bytes = self.with_sftp(|sftp, root| {
            Self::read_all(sftp, &Self::bucket_path(root, "packfiles", mac), mac)
        });
        match bytes {
            Ok(bytes) => Ok(Box::new(std::io::Cursor::new(bytes))),
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
        use std::io::{Seek, SeekFrom};
        let bytes = self.with_sftp(|sftp, root| {
            let path = Self::bucket_path(root, "packfiles", mac);
            let mut file = sftp
                .open(&path)
                .map_err(|_| StorageError::PackfileNotFound { mac })?;
            file.seek(SeekFrom::Start(offset))?;
            let mut out = Vec::new();
            if length == 0 {
                file.read_to_end(&mut out)?;
            } else {
                file.take(u64::from(length)).read_to_end(&mut out)?;
            }
            Ok(out)
        })?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    fn put_packfile(
        &self,
        token: &CancelToken,
        mac: Mac,
        rd: &mut dyn Read,
    ) -> StorageResult<u64> {
        token.check()?;
        self.with_sftp(|sftp, root| {
            Self::install(sftp, &Self::bucket_path(root, "packfiles", mac), rd)
        })
    }

    fn delete_packfile(&self, token: &CancelToken, mac: Mac) -> StorageResult<()> {
        token.check()?;
        self.with_sftp(|sftp, root| {
            sftp.unlink(&Self::bucket_path(root, "packfiles", mac))
                .map_err(|_| StorageError::PackfileNotFound { mac })
        })
    }

    fn list_states(&self, token: &CancelToken) -> StorageResult<Vec<Mac>> {
        token.check()?;
        self.with_sftp(|sftp, root| Self::list_bucketed(sftp, root, "states", token))
    }

    fn get_state(&self, token: &CancelToken, mac: Mac) -> StorageResult<Box<dyn Read + Send>> {
        token.check()?;
        let bytes = self.with_sftp(|sftp, root| {
            Self::read_all(sftp, &Self::bucket_path(root, "states", mac), mac)
        })?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    fn put_state(&self, token: &CancelToken, mac: Mac, rd: &mut dyn Read) -> StorageResult<u64> {
        token.check()?;
        self.with_sftp(|sftp, root| {
            Self::install(sftp, &Self::bucket_path(root, "states", mac), rd)
        })
    }

    fn delete_state(&self, token: &CancelToken, mac: Mac) -> StorageResult<()> {
        token.check()?;
        self.with_sftp(|sftp, root| {
            sftp.unlink(&Self::bucket_path(root, "states", mac))
                .map_err(|_| StorageError::NotFound { mac })
        })
    }

    fn list_locks(&self, token: &CancelToken) -> StorageResult<Vec<Mac>> {
        token.check()?;
        self.with_sftp(|sftp, root| {
            let entries = sftp.readdir(&root.join("locks")).map_err(sftp_err)?;
            Ok(entries
                .into_iter()
                .filter(|(_, stat)| stat.is_file())
                .filter_map(|(path, _)| {
                    path.file_name()
                        .and_then(|n| n.to_str())
                        .and_then(Mac::from_hex)
                })
                .collect())
        })
    }

    fn get_lock(&self, token: &CancelToken, mac: Mac) -> StorageResult<Box<dyn Read + Send>> {
        token.check()?;
        let bytes = self.with_sftp(|sftp, root| {
            Self::read_all(sftp, &root.join("locks").join(mac.to_hex()), mac)
        })?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    fn put_lock(&self, token: &CancelToken, mac: Mac, rd: &mut dyn Read) -> StorageResult<u64> {
        token.check()?;
        self.with_sftp(|sftp, root| Self::install(sftp, &root.join("locks").join(mac.to_hex()), rd))
    }

    fn delete_lock(&self, token: &CancelToken, mac: Mac) -> StorageResult<()> {
        token.check()?;
        self.with_sftp(|sftp, root| {
            sftp.unlink(&root.join("locks").join(mac.to_hex()))
                .map_err(|_| StorageError::NotFound { mac })
        })
    }

    fn close(&self) -> StorageResult<()> {
        let mut guard = self.session.lock().unwrap();
        if let Some((session, _)) = guard.take() {
            let _ = session.disconnect(None, "bye", None);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target_full() {
        let t = parse_target("sftp://backup@vault.example.com:2222/srv/coffre").unwrap();
        assert_eq!(t.user, "backup");
        assert_eq!(t.host_port, "vault.example.com:2222");
        assert_eq!(t.root, PathBuf::from("/srv/coffre"));
    }

    #[test]
    fn test_parse_target_defaults_port() {
        let t = parse_target("sftp://backup@vault/srv/coffre").unwrap();
        assert_eq!(t.host_port, "vault:22");
    }

    #[test]
    fn test_parse_target_requires_path() {
        assert!(parse_target("sftp://vault.example.com").is_err());
    }
}
