//! Snapshot records and the backup, restore, check and sync paths.
//!
//! A snapshot record names a point-in-time capture of a source tree: a
//! header plus one entry per regular file carrying the list of chunk
//! addresses that reconstruct its contents. Chunking is content-defined
//! so unchanged file regions deduplicate across snapshots.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fastcdc::v2020::FastCDC;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use coffre_storage::{CancelToken, Mac};

use crate::error::{RepositoryError, RepositoryResult};
use crate::repository::Repository;
use crate::state::ResourceType;

/// One captured regular file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the snapshot source.
    pub path: String,
    /// Content size in bytes.
    pub size: u64,
    /// Unix permission bits.
    pub mode: u32,
    /// Chunk addresses reconstructing the contents, in order.
    pub chunks: Vec<Mac>,
}

/// The snapshot record stored under [`ResourceType::Snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    /// Capture instant.
    pub timestamp: DateTime<Utc>,
    /// Source the capture was taken from.
    pub source: String,
    /// Job name, set by scheduled backups.
    pub name: String,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Captured files.
    pub files: Vec<FileEntry>,
    /// Total captured bytes.
    pub bytes: u64,
}

/// Knobs for a backup run.
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Job name recorded in the header.
    pub name: String,
    /// Tags recorded in the header.
    pub tags: Vec<String>,
    /// Path substrings to skip.
    pub ignore: Vec<String>,
}

/// Counters reported by a backup run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupStats {
    /// Files captured.
    pub files: usize,
    /// Chunks newly written (as opposed to deduplicated).
    pub chunks_written: usize,
    /// Chunks found already present.
    pub chunks_deduped: usize,
    /// Source bytes captured.
    pub bytes: u64,
}

/// Counters reported by restore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreStats {
    /// Files written.
    pub files: usize,
    /// Bytes written.
    pub bytes: u64,
}

/// Counters reported by check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckStats {
    /// Files verified.
    pub files: usize,
    /// Chunks verified.
    pub chunks: usize,
    /// Chunks that failed to resolve or verify.
    pub errors: usize,
}

/// Counters reported by sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Snapshots copied.
    pub snapshots: usize,
    /// Snapshots already present on the receiving side.
    pub skipped: usize,
}

fn walk(
    root: &Path,
    dir: &Path,
    ignore: &[String],
    out: &mut Vec<PathBuf>,
) -> RepositoryResult<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .to_string();
        if ignore.iter().any(|pat| relative.contains(pat.as_str())) {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            walk(root, &path, ignore, out)?;
        } else if file_type.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

fn file_mode(metadata: &fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o7777
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        0o644
    }
}

/// Captures `source` into a new snapshot. Returns the snapshot address
/// and the run counters.
pub fn backup(
    token: &CancelToken,
    repo: &Repository,
    source: &Path,
    options: &BackupOptions,
) -> RepositoryResult<(Mac, BackupStats)> {
    let mut stats = BackupStats::default();
    let mut files = Vec::new();
    walk(source, source, &options.ignore, &mut files)?;

    let packing = repo.config().packing.clone();
    let mut builder = repo.builder();
    let mut header = SnapshotHeader {
        timestamp: Utc::now(),
        source: source.to_string_lossy().to_string(),
        name: options.name.clone(),
        tags: options.tags.clone(),
        files: Vec::with_capacity(files.len()),
        bytes: 0,
    };

    for path in files {
        token.check()?;
        let data = fs::read(&path)?;
        let metadata = fs::metadata(&path)?;
        let mut chunks = Vec::new();

        for chunk in FastCDC::new(
            &data,
            packing.chunk_min,
            packing.chunk_avg,
            packing.chunk_max,
        ) {
            let slice = &data[chunk.offset..chunk.offset + chunk.length];
            let mac = repo.compute_mac(slice);
            if repo.has_blob(ResourceType::Chunk, mac)
                || builder.contains(ResourceType::Chunk, mac)
            {
                stats.chunks_deduped += 1;
            } else {
                repo.put_blob(&mut builder, ResourceType::Chunk, mac, slice)?;
                stats.chunks_written += 1;
                if builder.is_full() {
                    repo.commit(token, std::mem::replace(&mut builder, repo.builder()))?;
                }
            }
            chunks.push(mac);
        }

        let relative = path
            .strip_prefix(source)
            .unwrap_or(&path)
            .to_string_lossy()
            .to_string();
        stats.files += 1;
        stats.bytes += data.len() as u64;
        header.bytes += data.len() as u64;
        header.files.push(FileEntry {
            path: relative,
            size: data.len() as u64,
            mode: file_mode(&metadata),
            chunks,
        });
    }

    let record =
        rmp_serde::to_vec(&header).map_err(|e| RepositoryError::Corrupt(e.to_string()))?;
    let snapshot_mac = repo.compute_mac(&record);
    repo.put_blob(&mut builder, ResourceType::Snapshot, snapshot_mac, &record)?;
    repo.commit(token, builder)?;

    info!(
        snapshot = %snapshot_mac.short(),
        files = stats.files,
        bytes = stats.bytes,
        "backup complete"
    );
    Ok((snapshot_mac, stats))
}

/// Loads a snapshot record.
pub fn load(
    token: &CancelToken,
    repo: &Repository,
    snapshot: Mac,
) -> RepositoryResult<SnapshotHeader> {
    let record = repo.get_blob(token, ResourceType::Snapshot, snapshot)?;
    rmp_serde::from_slice(&record).map_err(|e| RepositoryError::Corrupt(e.to_string()))
}

/// Writes a snapshot's files back out under `target`.
pub fn restore(
    token: &CancelToken,
    repo: &Repository,
    snapshot: Mac,
    target: &Path,
) -> RepositoryResult<RestoreStats> {
    let header = load(token, repo, snapshot)?;
    let mut stats = RestoreStats::default();

    for file in &header.files {
        token.check()?;
        let path = target.join(&file.path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut contents = Vec::with_capacity(file.size as usize);
        for chunk in &file.chunks {
            contents.extend_from_slice(&repo.get_blob(token, ResourceType::Chunk, *chunk)?);
        }
        fs::write(&path, &contents)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(file.mode))?;
        }

        stats.files += 1;
        stats.bytes += contents.len() as u64;
    }

    info!(snapshot = %snapshot.short(), files = stats.files, "restore complete");
    Ok(stats)
}

/// Verifies that every chunk of a snapshot resolves, reads back, and
/// matches its address.
pub fn check(
    token: &CancelToken,
    repo: &Repository,
    snapshot: Mac,
) -> RepositoryResult<CheckStats> {
    let header = load(token, repo, snapshot)?;
    let mut stats = CheckStats::default();

    for file in &header.files {
        token.check()?;
        stats.files += 1;
        for chunk in &file.chunks {
            stats.chunks += 1;
            match repo.get_blob(token, ResourceType::Chunk, *chunk) {
                Ok(data) if repo.compute_mac(&data) == *chunk => {}
                Ok(_) => {
                    warn!(chunk = %chunk.short(), "chunk does not match its address");
                    stats.errors += 1;
                }
                Err(RepositoryError::Cancelled) => return Err(RepositoryError::Cancelled),
                Err(e) => {
                    warn!(chunk = %chunk.short(), error = %e, "chunk unreadable");
                    stats.errors += 1;
                }
            }
        }
    }
    debug!(snapshot = %snapshot.short(), errors = stats.errors, "check complete");
    Ok(stats)
}

/// Copies snapshots present in `src` and absent from `dst`. Chunks are
/// decoded on the source side and re-addressed under the destination's
/// key, so differently-keyed repositories synchronize correctly.
pub fn sync(
    token: &CancelToken,
    src: &Repository,
    dst: &Repository,
) -> RepositoryResult<SyncStats> {
    let mut stats = SyncStats::default();

    // identity across repositories is (source, timestamp, name)
    let existing: BTreeSet<(String, DateTime<Utc>, String)> = dst
        .list_snapshots()
        .iter()
        .filter_map(|mac| load(token, dst, *mac).ok())
        .map(|h| (h.source.clone(), h.timestamp, h.name.clone()))
        .collect();

    for snapshot in src.list_snapshots() {
        token.check()?;
        let header = load(token, src, snapshot)?;
        if existing.contains(&(header.source.clone(), header.timestamp, header.name.clone())) {
            stats.skipped += 1;
            continue;
        }

        let mut builder = dst.builder();
        let mut rewritten = header.clone();
        for file in rewritten.files.iter_mut() {
            for chunk in file.chunks.iter_mut() {
                let data = src.get_blob(token, ResourceType::Chunk, *chunk)?;
                let dst_mac = dst.compute_mac(&data);
                if !dst.has_blob(ResourceType::Chunk, dst_mac)
                    && !builder.contains(ResourceType::Chunk, dst_mac)
                {
                    dst.put_blob(&mut builder, ResourceType::Chunk, dst_mac, &data)?;
                    if builder.is_full() {
                        dst.commit(token, std::mem::replace(&mut builder, dst.builder()))?;
                    }
                }
                *chunk = dst_mac;
            }
        }

        let record =
            rmp_serde::to_vec(&rewritten).map_err(|e| RepositoryError::Corrupt(e.to_string()))?;
        let dst_snapshot = dst.compute_mac(&record);
        dst.put_blob(&mut builder, ResourceType::Snapshot, dst_snapshot, &record)?;
        dst.commit(token, builder)?;
        stats.snapshots += 1;
    }

    info!(
        copied = stats.snapshots,
        skipped = stats.skipped,
        "sync complete"
    );
    Ok(stats)
}
