use std::io;

use thiserror::Error;

use shardcache_store::CacheKey;

/// An error that happens while materializing a remote file in the cache.
///
/// This is the only error the cache surfaces to callers. It is [`Clone`] so that a single failed
/// download can be handed to every caller that was waiting for it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The remote store or the local file system failed while downloading and publishing a file.
    ///
    /// Failures are never cached. The next request for the same key retries the download.
    #[error("download of `{key}` failed: {message}")]
    DownloadFailed {
        /// The key that was being downloaded.
        key: CacheKey,
        /// The kind of the underlying I/O error.
        kind: io::ErrorKind,
        /// The rendered underlying error.
        message: String,
    },
}

impl CacheError {
    /// Creates a [`DownloadFailed`](Self::DownloadFailed) error from an I/O error.
    #[track_caller]
    pub fn download_failed(key: &CacheKey, err: io::Error) -> Self {
        let dynerr: &dyn std::error::Error = &err; // tracing expects a `&dyn Error`
        tracing::warn!(error = dynerr, "Failed to download {}", key);
        Self::DownloadFailed {
            key: key.clone(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Returns the kind of the underlying I/O error.
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            Self::DownloadFailed { kind, .. } => *kind,
        }
    }
}

