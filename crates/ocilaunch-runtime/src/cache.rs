//! On-disk image cache.
//!
//! The cache records which layout blobs have already had their sha256
//! digest verified, so repeated launches of the same image skip re-hashing.
//! A record is keyed by blake3 over the blob's canonical path and digest
//! and stores the blob's size and mtime; a blob that changed on disk is
//! verified again.

use crate::RuntimeError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;

pub const CACHE_DIR_ENV: &str = "OCILAUNCH_CACHEDIR";

/// Exclusive lock over the cache directory, released on drop.
pub struct CacheLock {
    file: File,
}

impl CacheLock {
    fn acquire(path: &Path) -> Result<Self, RuntimeError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[derive(Debug, Clone)]
pub struct ImageCache {
    root: PathBuf,
}

impl ImageCache {
    /// Parent directory for the cache: `$OCILAUNCH_CACHEDIR`, else
    /// `$HOME/.cache`, else the system temp dir.
    pub fn parent_dir() -> PathBuf {
        if let Some(dir) = std::env::var_os(CACHE_DIR_ENV).filter(|d| !d.is_empty()) {
            return PathBuf::from(dir);
        }
        match std::env::var_os("HOME").filter(|h| !h.is_empty()) {
            Some(home) => PathBuf::from(home).join(".cache"),
            None => std::env::temp_dir(),
        }
    }

    /// Open the cache at its default location.
    pub fn open_default() -> Result<Self, RuntimeError> {
        Self::open(&Self::parent_dir())
    }

    /// Open (creating if needed) the cache under `parent`.
    pub fn open(parent: &Path) -> Result<Self, RuntimeError> {
        let root = parent.join("ocilaunch");
        fs::create_dir_all(root.join("verified"))?;
        debug!("image cache at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock(&self) -> Result<CacheLock, RuntimeError> {
        CacheLock::acquire(&self.root.join("cache.lock"))
    }

    fn record_path(&self, blob: &Path, digest: &str) -> Result<PathBuf, RuntimeError> {
        let canonical = fs::canonicalize(blob)?;
        let mut hasher = blake3::Hasher::new();
        hasher.update(canonical.as_os_str().as_encoded_bytes());
        hasher.update(b"\0");
        hasher.update(digest.as_bytes());
        Ok(self.root.join("verified").join(hasher.finalize().to_hex().as_str()))
    }

    fn fingerprint(blob: &Path) -> Result<String, RuntimeError> {
        let meta = fs::metadata(blob)?;
        let mtime = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Ok(format!("{} {mtime}", meta.len()))
    }

    /// Whether `blob` was previously verified against `digest` and has not
    /// changed since.
    pub fn is_verified(&self, blob: &Path, digest: &str) -> bool {
        let (Ok(record), Ok(current)) = (self.record_path(blob, digest), Self::fingerprint(blob))
        else {
            return false;
        };
        fs::read_to_string(record).is_ok_and(|stored| stored == current)
    }

    pub fn mark_verified(&self, blob: &Path, digest: &str) -> Result<(), RuntimeError> {
        let record = self.record_path(blob, digest)?;
        let tmp = record.with_extension("tmp");
        fs::write(&tmp, Self::fingerprint(blob)?)?;
        fs::rename(&tmp, &record)?;
        Ok(())
    }
}
