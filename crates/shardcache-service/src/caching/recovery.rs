use std::fs::{read_dir, remove_dir, remove_file};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use shardcache_store::CacheKey;

use super::entry_table::EntryTable;
use super::fs::{TMP_DIR_NAME, catch_not_found};

/// The result of reconciling a cache root with a fresh entry table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Files that were admitted as cache entries.
    pub recovered_entries: u64,
    /// Total size of the admitted files.
    pub recovered_bytes: u64,
    /// Files that could not be mapped to a key and were deleted.
    pub discarded_files: u64,
    /// Directories that were left empty and removed.
    pub removed_dirs: u64,
}

/// A file found below the cache root that maps to a valid key.
#[derive(Debug)]
struct Recovered {
    key: CacheKey,
    local_path: PathBuf,
    size_bytes: u64,
    modified: SystemTime,
}

/// Walks the cache root and admits every file that maps back to a valid key.
///
/// Files that can not have been published by the cache, like partial downloads of a crashed
/// process, are deleted. Directories left empty are removed, except for the root itself. Recovered
/// entries are unpinned, and their recency follows file modification times, oldest first.
///
/// This must run before any concurrent cache access, and expects an empty table.
pub(crate) fn recover(root: &Path, table: &mut EntryTable) -> io::Result<RecoveryReport> {
    tracing::info!("Recovering cache at `{}`", root.display());

    let mut scan = Scan {
        root,
        report: RecoveryReport::default(),
        recovered: Vec::new(),
    };
    std::fs::create_dir_all(root)?;
    scan.scan_directory(root)?;

    let Scan {
        mut report,
        mut recovered,
        ..
    } = scan;

    recovered.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.key.cmp(&b.key)));
    for file in recovered {
        match table.admit(file.key, file.local_path, file.size_bytes) {
            Ok(_) => {
                report.recovered_entries += 1;
                report.recovered_bytes += file.size_bytes;
            }
            Err(e) => {
                let dynerr: &dyn std::error::Error = &e;
                tracing::error!(error = dynerr, "Recovered a file twice");
            }
        }
    }

    std::fs::create_dir_all(root.join(TMP_DIR_NAME))?;

    tracing::info!(
        "Recovered {} files totaling {} bytes, discarded {} files and {} directories",
        report.recovered_entries,
        report.recovered_bytes,
        report.discarded_files,
        report.removed_dirs,
    );
    metric!(counter("caches.recovery.discarded") += report.discarded_files as i64);

    Ok(report)
}

struct Scan<'a> {
    root: &'a Path,
    report: RecoveryReport,
    recovered: Vec<Recovered>,
}

impl Scan<'_> {
    /// Scans the directory recursively, returning `true` if the directory is left empty.
    fn scan_directory(&mut self, directory: &Path) -> io::Result<bool> {
        let entries = match catch_not_found(|| read_dir(directory))? {
            Some(x) => x,
            None => {
                tracing::warn!("Directory not found: `{}`", directory.display());
                return Ok(true);
            }
        };
        tracing::debug!("Scanning directory `{}`", directory.display());

        let mut is_empty = true;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                let mut dir_is_empty = self.scan_directory(&path)?;
                if dir_is_empty {
                    tracing::debug!("Removing directory `{}`", path.display());
                    if let Err(e) = remove_dir(&path) {
                        sentry::with_scope(
                            |scope| scope.set_extra("path", path.display().to_string().into()),
                            || tracing::error!("Failed to remove cache directory: {:?}", e),
                        );
                        dir_is_empty = false;
                    } else {
                        self.report.removed_dirs += 1;
                    }
                }
                is_empty &= dir_is_empty;
            } else if self.scan_file(&path, file_type.is_file())? {
                is_empty = false;
            }
        }

        Ok(is_empty)
    }

    /// Admits or discards a single file, returning `true` if it was kept.
    fn scan_file(&mut self, path: &Path, is_file: bool) -> io::Result<bool> {
        let relative = path.strip_prefix(self.root).unwrap_or(path);
        let key = match CacheKey::from_relative_path(relative) {
            Ok(key) if is_file => key,
            Ok(_) => {
                tracing::warn!("Discarding non-regular file `{}`", path.display());
                return self.discard(path);
            }
            Err(e) => {
                let dynerr: &dyn std::error::Error = &e;
                tracing::warn!(error = dynerr, "Discarding `{}`", path.display());
                return self.discard(path);
            }
        };

        let metadata = std::fs::metadata(path)?;
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        tracing::trace!("Recovered {} ({} bytes)", key, metadata.len());

        self.recovered.push(Recovered {
            key,
            local_path: path.to_owned(),
            size_bytes: metadata.len(),
            modified,
        });
        Ok(true)
    }

    fn discard(&mut self, path: &Path) -> io::Result<bool> {
        match catch_not_found(|| remove_file(path)) {
            Ok(_) => {
                self.report.discarded_files += 1;
                Ok(false)
            }
            Err(e) => {
                sentry::with_scope(
                    |scope| scope.set_extra("path", path.display().to_string().into()),
                    || tracing::error!("Failed to discard cache file: {:?}", e),
                );
                Ok(true)
            }
        }
    }
}
