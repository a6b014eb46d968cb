use std::io;
use std::path::{Path, PathBuf};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{CacheKey, RemoteStore};

/// Configuration for reading shards from the local file system.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FilesystemStoreConfig {
    /// Directory mirroring the remote key hierarchy.
    pub path: PathBuf,
}

/// A [`RemoteStore`] backed by a directory, usually a network mount.
///
/// The file for key `a/b/c` is read from `<path>/a/b/c`.
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    path: PathBuf,
}

impl FilesystemStore {
    /// Creates a new store reading below `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the path from which to fetch `key`.
    pub fn source_path(&self, key: &CacheKey) -> PathBuf {
        self.path.join(key.relative_path())
    }
}

impl RemoteStore for FilesystemStore {
    fn download<'a>(
        &'a self,
        key: &'a CacheKey,
        destination: &'a Path,
    ) -> BoxFuture<'a, io::Result<u64>> {
        async move {
            let source = self.source_path(key);
            tracing::debug!("Fetching {} from {}", key, source.display());
            tokio::fs::copy(&source, destination).await
        }
        .boxed()
    }
}
