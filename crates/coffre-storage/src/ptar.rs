//! Single-file archive backend.
//!
//! All three namespaces packed into one seekable archive. The file starts
//! with an 8-byte magic, followed by raw blob bytes appended back to back.
//! The entry index (msgpack) sits in a footer: `index bytes, index length
//! as u64-LE, footer magic`. Writes happen inside a transactional session:
//! appended blobs only become visible to the next opener once `close`
//! publishes a fresh footer, so a crashed session leaves the previous
//! archive state intact.

use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::atomic::write_file_atomic;
use crate::backend::{split_location, Backend, Mode, Namespace, StoreConfig};
use crate::cancel::CancelToken;
use crate::error::{StorageError, StorageResult};
use crate::mac::Mac;

const MAGIC: &[u8; 8] = b"CFPTAR01";
const FOOTER_MAGIC: &[u8; 8] = b"CFPTIDX1";
const TRAILER_LEN: u64 = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    ns: Namespace,
    mac: Mac,
    offset: u64,
    length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArchiveIndex {
    version: u32,
    config: Vec<u8>,
    data_end: u64,
    entries: Vec<IndexEntry>,
}

struct Session {
    file: File,
    index: ArchiveIndex,
    dirty: bool,
    /// Whether the on-disk footer has been superseded by in-session writes.
    footer_stripped: bool,
}

/// Archive-file store.
pub struct PtarStore {
    location: String,
    path: PathBuf,
    session: Mutex<Option<Session>>,
}

/// Backend factory for the `ptar` protocol.
pub fn new_store(config: &StoreConfig) -> StorageResult<Box<dyn Backend>> {
    let location = config.get("location").cloned().unwrap_or_default();
    let (_, path) = split_location(&location);
    let path = PathBuf::from(path);
    Ok(Box::new(PtarStore {
        location,
        path,
        session: Mutex::new(None),
    }))
}

fn encode_index(index: &ArchiveIndex) -> StorageResult<Vec<u8>> {
    rmp_serde::to_vec(index).map_err(|e| StorageError::Malformed(e.to_string()))
}

fn decode_index(bytes: &[u8]) -> StorageResult<ArchiveIndex> {
    rmp_serde::from_slice(bytes).map_err(|e| StorageError::Malformed(e.to_string()))
}

impl PtarStore {
    fn load_session(&self) -> StorageResult<Session> {
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let total = file.seek(SeekFrom::End(0))?;
        if total < MAGIC.len() as u64 + TRAILER_LEN {
            return Err(StorageError::Malformed("archive too short".into()));
        }

        let mut head = [0u8; 8];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut head)?;
        if &head != MAGIC {
            return Err(StorageError::Malformed("bad archive magic".into()));
        }

        let mut trailer = [0u8; 16];
        file.seek(SeekFrom::Start(total - TRAILER_LEN))?;
        file.read_exact(&mut trailer)?;
        if &trailer[8..] != FOOTER_MAGIC {
            return Err(StorageError::Malformed("missing archive footer".into()));
        }
        let index_len = u64::from_le_bytes(trailer[..8].try_into().expect("8 bytes"));
        if index_len > total - TRAILER_LEN {
            return Err(StorageError::Malformed("footer length out of range".into()));
        }

        let mut index_bytes = vec![0u8; index_len as usize];
        file.seek(SeekFrom::Start(total - TRAILER_LEN - index_len))?;
        file.read_exact(&mut index_bytes)?;
        let index = decode_index(&index_bytes)?;

        Ok(Session {
            file,
            index,
            dirty: false,
            footer_stripped: false,
        })
    }

    fn with_session<T>(
        &self,
        f: impl FnOnce(&mut Session) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut guard = self.session.lock().unwrap();
        if guard.is_none() {
            *guard = Some(self.load_session()?);
        }
        f(guard.as_mut().expect("session just loaded"))
    }

    fn commit(session: &mut Session) -> StorageResult<()> {
        if !session.dirty {
            return Ok(());
        }
        let index_bytes = encode_index(&session.index)?;
        session.file.seek(SeekFrom::Start(session.index.data_end))?;
        session.file.write_all(&index_bytes)?;
        session
            .file
            .write_all(&(index_bytes.len() as u64).to_le_bytes())?;
        session.file.write_all(FOOTER_MAGIC)?;
        let end = session.file.stream_position()?;
        session.file.set_len(end)?;
        session.file.sync_all()?;
        session.dirty = false;
        session.footer_stripped = false;
        trace!(entries = session.index.entries.len(), "published archive footer");
        Ok(())
    }

    fn append_blob(
        session: &mut Session,
        ns: Namespace,
        mac: Mac,
        rd: &mut dyn Read,
    ) -> StorageResult<u64> {
        if !session.footer_stripped {
            // drop the stale footer; it gets rewritten at close
            session.file.set_len(session.index.data_end)?;
            session.footer_stripped = true;
        }
        let offset = session.index.data_end;
        session.file.seek(SeekFrom::Start(offset))?;
        let written = io::copy(rd, &mut session.file)?;
        session.index.data_end = offset + written;
        session
            .index
            .entries
            .retain(|e| !(e.ns == ns && e.mac == mac));
        session.index.entries.push(IndexEntry {
            ns,
            mac,
            offset,
            length: written,
        });
        session.dirty = true;
        Ok(written)
    }

    fn read_blob(
        session: &mut Session,
        ns: Namespace,
        mac: Mac,
        offset: u64,
        length: u32,
    ) -> StorageResult<Vec<u8>> {
        let entry = session
            .index
            .entries
            .iter()
            .find(|e| e.ns == ns && e.mac == mac)
            .cloned()
            .ok_or(match ns {
                Namespace::Packfile => StorageError::PackfileNotFound { mac },
                _ => StorageError::NotFound { mac },
            })?;

        let start = entry.offset + offset.min(entry.length);
        let avail = entry.length.saturating_sub(offset);
        let want = if length == 0 {
            avail
        } else {
            avail.min(u64::from(length))
        };

        let mut buf = vec![0u8; want as usize];
        session.file.seek(SeekFrom::Start(start))?;
        session.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn list_ns(&self, token: &CancelToken, ns: Namespace) -> StorageResult<Vec<Mac>> {
        token.check()?;
        self.with_session(|s| {
            Ok(s.index
                .entries
                .iter()
                .filter(|e| e.ns == ns)
                .map(|e| e.mac)
                .collect())
        })
    }

    fn get_ns(
        &self,
        token: &CancelToken,
        ns: Namespace,
        mac: Mac,
    ) -> StorageResult<Box<dyn Read + Send>> {
        token.check()?;
        let bytes = self.with_session(|s| Self::read_blob(s, ns, mac, 0, 0))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn put_ns(
        &self,
        token: &CancelToken,
        ns: Namespace,
        mac: Mac,
        rd: &mut dyn Read,
    ) -> StorageResult<u64> {
        token.check()?;
        self.with_session(|s| Self::append_blob(s, ns, mac, rd))
    }

    fn delete_ns(&self, token: &CancelToken, ns: Namespace, mac: Mac) -> StorageResult<()> {
        token.check()?;
        self.with_session(|s| {
            let before = s.index.entries.len();
            s.index.entries.retain(|e| !(e.ns == ns && e.mac == mac));
            if s.index.entries.len() == before {
                return Err(match ns {
                    Namespace::Packfile => StorageError::PackfileNotFound { mac },
                    _ => StorageError::NotFound { mac },
                });
            }
            s.dirty = true;
            Ok(())
        })
    }
}

impl Backend for PtarStore {
    fn create(&self, token: &CancelToken, config: &[u8]) -> StorageResult<()> {
        token.check()?;
        if self.path.exists() {
            return Err(StorageError::AlreadyExists {
                location: self.location.clone(),
            });
        }

        // Compose the complete empty archive and install it atomically, so
        // a crash mid-create never leaves a half-written file behind.
        let index = ArchiveIndex {
            version: 1,
            config: config.to_vec(),
            data_end: MAGIC.len() as u64,
            entries: Vec::new(),
        };
        let index_bytes = encode_index(&index)?;
        let mut archive = Vec::with_capacity(MAGIC.len() + index_bytes.len() + 16);
        archive.extend_from_slice(MAGIC);
        archive.extend_from_slice(&index_bytes);
        archive.extend_from_slice(&(index_bytes.len() as u64).to_le_bytes());
        archive.extend_from_slice(FOOTER_MAGIC);

        write_file_atomic(&self.path, &mut &archive[..])?;
        debug!(path = %self.path.display(), "created archive store");
        Ok(())
    }

    fn open(&self, token: &CancelToken) -> StorageResult<Vec<u8>> {
        token.check()?;
        if !self.path.exists() {
            return Err(StorageError::NotConfigured);
        }
        self.with_session(|s| Ok(s.index.config.clone()))
    }

    fn location(&self) -> String {
        self.location.clone()
    }

    fn mode(&self) -> Mode {
        Mode::ReadWrite
    }

    fn size(&self, token: &CancelToken) -> StorageResult<Option<u64>> {
        token.check()?;
        match std::fs::metadata(&self.path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list_packfiles(&self, token: &CancelToken) -> StorageResult<Vec<Mac>> {
        self.list_ns(token, Namespace::Packfile)
    }

    fn get_packfile(&self, token: &CancelToken, mac: Mac) -> StorageResult<Box<dyn Read + Send>> {
        self.get_ns(token, Namespace::Packfile, mac)
    }

    fn get_packfile_blob(
        &self,
        token: &CancelToken,
        mac: Mac,
        offset: u64,
        length: u32,
    ) -> StorageResult<Box<dyn Read + Send>> {
        token.check()?;
        let bytes =
            self.with_session(|s| Self::read_blob(s, Namespace::Packfile, mac, offset, length))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn put_packfile(
        &self,
        token: &CancelToken,
        mac: Mac,
        rd: &mut dyn Read,
    ) -> StorageResult<u64> {
        self.put_ns(token, Namespace::Packfile, mac, rd)
    }

    fn delete_packfile(&self, token: &CancelToken, mac: Mac) -> StorageResult<()> {
        self.delete_ns(token, Namespace::Packfile, mac)
    }

    fn list_states(&self, token: &CancelToken) -> StorageResult<Vec<Mac>> {
        self.list_ns(token, Namespace::State)
    }

    fn get_state(&self, token: &CancelToken, mac: Mac) -> StorageResult<Box<dyn Read + Send>> {
        self.get_ns(token, Namespace::State, mac)
    }

    fn put_state(&self, token: &CancelToken, mac: Mac, rd: &mut dyn Read) -> StorageResult<u64> {
        self.put_ns(token, Namespace::State, mac, rd)
    }

    fn delete_state(&self, token: &CancelToken, mac: Mac) -> StorageResult<()> {
        self.delete_ns(token, Namespace::State, mac)
    }

    fn list_locks(&self, token: &CancelToken) -> StorageResult<Vec<Mac>> {
        self.list_ns(token, Namespace::Lock)
    }

    fn get_lock(&self, token: &CancelToken, mac: Mac) -> StorageResult<Box<dyn Read + Send>> {
        self.get_ns(token, Namespace::Lock, mac)
    }

    fn put_lock(&self, token: &CancelToken, mac: Mac, rd: &mut dyn Read) -> StorageResult<u64> {
        self.put_ns(token, Namespace::Lock, mac, rd)
    }

    fn delete_lock(&self, token: &CancelToken, mac: Mac) -> StorageResult<()> {
        self.delete_ns(token, Namespace::Lock, mac)
    }

    fn close(&self) -> StorageResult<()> {
        let mut guard = self.session.lock().unwrap();
        if let Some(session) = guard.as_mut() {
            Self::commit(session)?;
        }
        *guard = None;
        Ok(())
    }
}

impl Drop for PtarStore {
    fn drop(&mut self) {
        // Best effort: a dropped-but-unclosed write session still publishes.
        let _ = self.close();
    }
}
