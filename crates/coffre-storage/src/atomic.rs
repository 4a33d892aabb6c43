//! Atomic file installation.
//!
//! Blob files become visible through a write-to-temp-then-rename sequence,
//! so a reader either finds no file at all or the complete final bytes. A
//! process killed between the data write and the rename leaves only a temp
//! file that never becomes visible as a blob.

use std::fs;
use std::io::{self, Read};
use std::path::Path;

use tracing::trace;

use crate::error::{StorageError, StorageResult};

/// Streams `rd` into a temp file in `path`'s own directory, then renames it
/// onto `path`. Returns the number of bytes written. The temp file is
/// removed on any failure. Mode 0600.
pub fn write_file_atomic(path: &Path, rd: &mut dyn Read) -> StorageResult<u64> {
    let dir = path
        .parent()
        .ok_or_else(|| StorageError::Io(io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")))?;
    write_file_atomic_in(path, rd, dir)
}

/// As [`write_file_atomic`], but places the temp file in `temp_dir`. Used
/// when the target's directory cannot hold temp files because of its own
/// naming scheme (the flat locks namespace). `temp_dir` must live on the
/// same filesystem as `path` for the rename to stay atomic.
pub fn write_file_atomic_in(path: &Path, rd: &mut dyn Read, temp_dir: &Path) -> StorageResult<u64> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".coffre-tmp-")
        .tempfile_in(temp_dir)?;

    let written = io::copy(rd, tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;

    // NamedTempFile deletes itself on drop, so an error anywhere above (or
    // in persist itself) leaves no visible residue.
    tmp.persist(path)
        .map_err(|e| StorageError::Io(e.error))?;

    trace!(path = %path.display(), bytes = written, "installed blob");
    Ok(written)
}

/// Creates `dir` (and missing parents) with mode 0700.
pub fn mkdir_private(dir: &Path) -> StorageResult<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let payload = b"hello atomic world".to_vec();

        let n = write_file_atomic(&path, &mut Cursor::new(payload.clone())).unwrap();
        assert_eq!(n, payload.len() as u64);
        assert_eq!(fs::read(&path).unwrap(), payload);
    }

    #[test]
    fn test_overwrite_is_atomic_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        write_file_atomic(&path, &mut Cursor::new(b"first".to_vec())).unwrap();
        write_file_atomic(&path, &mut Cursor::new(b"second".to_vec())).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn test_no_temp_residue_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        write_file_atomic(&path, &mut Cursor::new(b"data".to_vec())).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["blob".to_string()]);
    }

    #[test]
    fn test_failing_reader_leaves_nothing() {
        struct Failing;
        impl Read for Failing {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "source broke"))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        assert!(write_file_atomic(&path, &mut Failing).is_err());
        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_temp_dir_variant_writes_target() {
        let root = tempfile::tempdir().unwrap();
        let locks = root.path().join("locks");
        mkdir_private(&locks).unwrap();
        let path = locks.join("deadbeef");

        write_file_atomic_in(&path, &mut Cursor::new(b"lock".to_vec()), root.path()).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"lock");
        // the temp file never appeared inside locks/
        assert_eq!(fs::read_dir(&locks).unwrap().count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_mode_is_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        write_file_atomic(&path, &mut Cursor::new(b"data".to_vec())).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_mkdir_private_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("a").join("b");
        mkdir_private(&sub).unwrap();
        let mode = fs::metadata(&sub).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }
}
