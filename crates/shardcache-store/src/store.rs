use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{CacheKey, FilesystemStore, FilesystemStoreConfig};

/// The remote side of the cache.
///
/// Implementations download the file named by a [`CacheKey`] into `destination`, which already
/// exists as an empty file, and return the number of bytes written. Failures are reported as
/// [`io::Error`]s and are not interpreted by the cache, so any retry or timeout policy belongs
/// to the implementation.
pub trait RemoteStore: Send + Sync + fmt::Debug + 'static {
    /// Downloads the file for `key` to `destination`.
    fn download<'a>(&'a self, key: &'a CacheKey, destination: &'a Path)
    -> BoxFuture<'a, io::Result<u64>>;
}

/// Configuration for a remote store.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// A directory on a locally mounted file system.
    Filesystem(FilesystemStoreConfig),
}

impl StoreConfig {
    /// Creates the store described by this configuration.
    pub fn build(&self) -> Arc<dyn RemoteStore> {
        match self {
            Self::Filesystem(config) => Arc::new(FilesystemStore::new(config.path.clone())),
        }
    }
}
