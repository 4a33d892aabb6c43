//! Discard-everything backend for tests and benchmarks.
//!
//! Writes are counted and dropped, reads come back empty, listings are
//! empty. The configuration blob is the only thing retained, in memory,
//! so a create/open cycle behaves like a real store within one process.

use std::io::{self, Cursor, Read};
use std::sync::Mutex;

use crate::backend::{Backend, Mode, StoreConfig};
use crate::cancel::CancelToken;
use crate::error::{StorageError, StorageResult};
use crate::mac::Mac;

/// In-memory no-op store.
pub struct NullStore {
    location: String,
    config: Mutex<Option<Vec<u8>>>,
}

/// Backend factory for the `null` protocol.
pub fn new_store(config: &StoreConfig) -> StorageResult<Box<dyn Backend>> {
    Ok(Box::new(NullStore {
        location: config.get("location").cloned().unwrap_or_default(),
        config: Mutex::new(None),
    }))
}

impl Backend for NullStore {
    fn create(&self, token: &CancelToken, config: &[u8]) -> StorageResult<()> {
        token.check()?;
        let mut slot = self.config.lock().unwrap();
        if slot.is_some() {
            return Err(StorageError::AlreadyExists {
                location: self.location.clone(),
            });
        }
        *slot = Some(config.to_vec());
        Ok(())
    }

    fn open(&self, token: &CancelToken) -> StorageResult<Vec<u8>> {
        token.check()?;
        self.config
            .lock()
            .unwrap()
            .clone()
            .ok_or(StorageError::NotConfigured)
    }

    fn location(&self) -> String {
        self.location.clone()
    }

    fn mode(&self) -> Mode {
        Mode::ReadWrite
    }

    fn size(&self, _token: &CancelToken) -> StorageResult<Option<u64>> {
        Ok(None)
    }

    fn list_packfiles(&self, token: &CancelToken) -> StorageResult<Vec<Mac>> {
        token.check()?;
        Ok(Vec::new())
    }

    fn get_packfile(&self, token: &CancelToken, _mac: Mac) -> StorageResult<Box<dyn Read + Send>> {
        token.check()?;
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    fn get_packfile_blob(
        &self,
        token: &CancelToken,
        _mac: Mac,
        _offset: u64,
        _length: u32,
    ) -> StorageResult<Box<dyn Read + Send>> {
        token.check()?;
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    fn put_packfile(
        &self,
        token: &CancelToken,
        _mac: Mac,
        rd: &mut dyn Read,
    ) -> StorageResult<u64> {
        token.check()?;
        Ok(io::copy(rd, &mut io::sink())?)
    }

    fn delete_packfile(&self, token: &CancelToken, _mac: Mac) -> StorageResult<()> {
        token.check()
    }

    fn list_states(&self, token: &CancelToken) -> StorageResult<Vec<Mac>> {
        token.check()?;
        Ok(Vec::new())
    }

    fn get_state(&self, token: &CancelToken, _mac: Mac) -> StorageResult<Box<dyn Read + Send>> {
        token.check()?;
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    fn put_state(&self, token: &CancelToken, _mac: Mac, rd: &mut dyn Read) -> StorageResult<u64> {
        token.check()?;
        Ok(io::copy(rd, &mut io::sink())?)
    }

    fn delete_state(&self, token: &CancelToken, _mac: Mac) -> StorageResult<()> {
        token.check()
    }

    fn list_locks(&self, token: &CancelToken) -> StorageResult<Vec<Mac>> {
        token.check()?;
        Ok(Vec::new())
    }

    fn get_lock(&self, token: &CancelToken, _mac: Mac) -> StorageResult<Box<dyn Read + Send>> {
        token.check()?;
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    fn put_lock(&self, token: &CancelToken, _mac: Mac, rd: &mut dyn Read) -> StorageResult<u64> {
        token.check()?;
        Ok(io::copy(rd, &mut io::sink())?)
    }

    fn delete_lock(&self, token: &CancelToken, _mac: Mac) -> StorageResult<()> {
        token.check()
    }
}
