use std::io;
use std::path::Path;

use tempfile::NamedTempFile;

/// Name of the directory below the cache root that holds in-progress downloads.
///
/// It starts with a `.`, which no [`CacheKey`](shardcache_store::CacheKey) segment may, so it can
/// never collide with a cached file.
pub const TMP_DIR_NAME: &str = ".tmp";

/// How often directory creation is retried before giving up.
///
/// Eviction and recovery may remove directories concurrently with a download creating them.
const MAX_RETRIES: usize = 2;

/// Creates a new temporary file in `tmp_dir`, creating the directory if needed.
pub(crate) fn tempfile_in(tmp_dir: &Path) -> io::Result<NamedTempFile> {
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = std::fs::create_dir_all(tmp_dir) {
            sentry::with_scope(
                |scope| scope.set_extra("path", tmp_dir.display().to_string().into()),
                || tracing::error!("Failed to create temp directory: {:?}", e),
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match tempfile::Builder::new().prefix("tmp").tempfile_in(tmp_dir) {
            Ok(temp_file) => return Ok(temp_file),
            Err(e) => {
                sentry::with_scope(
                    |scope| scope.set_extra("path", tmp_dir.display().to_string().into()),
                    || tracing::error!("Failed to create temp file: {:?}", e),
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
            }
        }
    }
}

/// Atomically moves a fully written temporary file to its final location in the cache.
///
/// Parent directories are created as needed. Readers either see no file at `cache_path`, or
/// the complete file.
pub(crate) async fn persist_tempfile(
    mut temp_file: NamedTempFile,
    cache_path: &Path,
) -> io::Result<()> {
    let parent = cache_path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "no parent directory to persist item",
        )
    })?;

    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            sentry::with_scope(
                |scope| scope.set_extra("path", parent.display().to_string().into()),
                || tracing::error!("Failed to create cache directory: {:?}", e),
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(_) => return Ok(()),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                sentry::with_scope(
                    |scope| scope.set_extra("path", cache_path.display().to_string().into()),
                    || tracing::error!("Failed to create cache file: {:?}", err),
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
            }
        }
    }
}

/// Removes the parent directories of `path` that are empty, stopping below `root`.
///
/// Stops at the first directory that still has entries, or that can not be removed.
pub(crate) fn remove_empty_parents(path: &Path, root: &Path) {
    for dir in path.ancestors().skip(1) {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        if std::fs::remove_dir(dir).is_err() {
            break;
        }
        tracing::trace!("Removed empty cache directory {}", dir.display());
    }
}

/// Runs `f`, mapping a [`NotFound`](io::ErrorKind::NotFound) error to `Ok(None)`.
pub(crate) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
