//! Disk cache for module archives.
//!
//! Archives are immutable once published, so a cached `(path, version)`
//! never needs to be fetched again. Version resolution is always delegated:
//! symbolic references such as `latest` move.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use super::client::{escape_path, escape_version, ArchiveReader, Client};
use super::error::{CacheError, ResolutionError, Result};
use super::traits::ModuleVersion;

/// [`Client`] wrapper that keeps downloaded archives on disk.
pub struct CachedClient<C> {
    root: PathBuf,
    inner: C,
}

impl<C: Client> CachedClient<C> {
    /// Wrap `inner`, caching archives below `cache_root`.
    ///
    /// The cache root must already exist.
    pub fn new(inner: C, cache_root: impl Into<PathBuf>) -> Result<Self> {
        let root = cache_root.into();
        if !root.is_dir() {
            return Err(CacheError::MissingRoot(root).into());
        }
        Ok(Self { root, inner })
    }

    /// Cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the cached archive for `module`.
    pub fn entry_path(&self, module: &ModuleVersion) -> Result<PathBuf, ResolutionError> {
        let path = escape_path(&module.path)?;
        let version = escape_version(&module.version)?;
        Ok(self.root.join(path).join(format!("{version}.zip")))
    }
}

/// Returns `true` if `path` holds a complete, readable archive.
fn is_valid_entry(path: &Path) -> bool {
    let Ok(file) = std::fs::File::open(path) else {
        return false;
    };
    zip::ZipArchive::new(file).is_ok()
}

/// Write `data` next to `dest` and publish it with a no-clobber rename.
fn publish(dest: &Path, data: &[u8]) -> Result<(), CacheError> {
    let write_err = |source| CacheError::Write {
        path: dest.to_path_buf(),
        source,
    };

    let dir = dest.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir).map_err(write_err)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".download-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(write_err)?;
    tmp.write_all(data).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;

    match tmp.persist_noclobber(dest) {
        Ok(_) => Ok(()),
        // Another writer published the same entry first; archives are immutable.
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
            tracing::debug!(path = %dest.display(), "Cache entry published concurrently");
            Ok(())
        }
        Err(e) => Err(write_err(e.error)),
    }
}

#[async_trait]
impl<C: Client> Client for CachedClient<C> {
    async fn version(&self, path: &str, version: &str) -> Result<ModuleVersion> {
        self.inner.version(path, version).await
    }

    async fn download(&self, module: &ModuleVersion) -> Result<ArchiveReader> {
        let path = self.entry_path(module)?;

        let candidate = path.clone();
        let cached =
            tokio::task::spawn_blocking(move || candidate.exists().then(|| is_valid_entry(&candidate)))
                .await
                .map_err(|e| CacheError::Read {
                    path: path.clone(),
                    source: std::io::Error::other(e),
                })?;
        match cached {
            Some(true) => {
                if let Ok(file) = tokio::fs::File::open(&path).await {
                    tracing::debug!(module = %module, path = %path.display(), "Using cached module archive");
                    return Ok(Box::new(file));
                }
            }
            Some(false) => {
                tracing::warn!(module = %module, path = %path.display(), "Discarding unreadable cache entry");
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|source| CacheError::Write {
                        path: path.clone(),
                        source,
                    })?;
            }
            None => {}
        }

        let mut reader = self.inner.download(module).await?;
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .await
            .map_err(|source| ResolutionError::Body {
                path: module.path.clone(),
                version: module.version.clone(),
                source,
            })?;
        drop(reader);

        let dest = path.clone();
        tokio::task::spawn_blocking(move || publish(&dest, &data))
            .await
            .map_err(|e| CacheError::Write {
                path: path.clone(),
                source: std::io::Error::other(e),
            })??;
        tracing::debug!(module = %module, path = %path.display(), "Cached module archive");

        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|source| CacheError::Read {
                path: path.clone(),
                source,
            })?;
        Ok(Box::new(file))
    }
}

impl<C> std::fmt::Debug for CachedClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedClient")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}
