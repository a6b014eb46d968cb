use std::io;
use std::path::Path;

use super::entry_table::EntryTable;
use super::fs::{catch_not_found, remove_empty_parents};

/// What a single eviction pass reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionOutcome {
    /// Number of entries removed from the cache.
    pub evicted_entries: u64,
    /// Sum of the sizes of the removed entries.
    pub evicted_bytes: u64,
}

/// Evicts least recently used, unpinned entries until `total_bytes <= capacity_bytes`.
///
/// Stops early when only pinned entries are left, in which case the cache stays over capacity
/// until some of them are released. Files are deleted while the caller holds the table lock, so
/// a concurrent download of the same key can not publish its file before the old one is gone.
/// Directories below `root` that are left empty are removed as well.
pub(crate) fn evict(table: &mut EntryTable, root: &Path, capacity_bytes: u64) -> EvictionOutcome {
    let mut outcome = EvictionOutcome::default();

    while table.total_bytes() > capacity_bytes {
        let Some(key) = table.least_recently_used().cloned() else {
            tracing::debug!(
                total_bytes = table.total_bytes(),
                pinned_bytes = table.pinned_bytes(),
                capacity_bytes,
                "Cache over capacity with only pinned entries left",
            );
            break;
        };
        let Some(entry) = table.remove(&key) else {
            break;
        };

        tracing::debug!("Evicting {} ({} bytes)", entry.key, entry.size_bytes);
        if let Err(e) = remove_file(&entry.local_path) {
            // The entry is gone from the table either way. A file we failed to delete is picked
            // up as an untracked file by the next recovery.
            let dynerr: &dyn std::error::Error = &e;
            tracing::error!(
                error = dynerr,
                path = %entry.local_path.display(),
                "Failed to delete evicted cache file",
            );
        } else {
            remove_empty_parents(&entry.local_path, root);
        }

        outcome.evicted_entries += 1;
        outcome.evicted_bytes += entry.size_bytes;
    }

    if outcome.evicted_entries > 0 {
        metric!(counter("caches.evictions") += outcome.evicted_entries as i64);
        metric!(counter("caches.evictions.bytes") += outcome.evicted_bytes as i64);
    }
    metric!(gauge("caches.size.bytes") = table.total_bytes());
    metric!(gauge("caches.size.files") = table.len() as u64);

    outcome
}

fn remove_file(path: &Path) -> io::Result<()> {
    catch_not_found(|| std::fs::remove_file(path)).map(|_| ())
}

#[cfg(test)]
mod tests {
    use shardcache_store::CacheKey;

    use super::*;

    fn admit_file(table: &mut EntryTable, root: &Path, name: &str, size_bytes: usize) -> CacheKey {
        let key = CacheKey::parse(name).unwrap();
        let local_path = root.join(key.relative_path());
        std::fs::write(&local_path, vec![b'x'; size_bytes]).unwrap();
        table
            .admit(key.clone(), local_path, size_bytes as u64)
            .unwrap();
        key
    }

    #[test]
    fn test_evicts_least_recently_used_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = EntryTable::new();
        let a = admit_file(&mut table, dir.path(), "a", 10);
        let b = admit_file(&mut table, dir.path(), "b", 10);
        let c = admit_file(&mut table, dir.path(), "c", 10);
        table.acquire(&a, false);

        let outcome = evict(&mut table, dir.path(), 20);

        assert_eq!(
            outcome,
            EvictionOutcome {
                evicted_entries: 1,
                evicted_bytes: 10
            }
        );
        assert!(table.lookup(&b).is_none());
        assert!(!dir.path().join("b").exists());
        assert!(table.lookup(&a).is_some());
        assert!(table.lookup(&c).is_some());
        assert_eq!(table.total_bytes(), 20);
    }

    #[test]
    fn test_skips_pinned_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = EntryTable::new();
        let a = admit_file(&mut table, dir.path(), "a", 10);
        let b = admit_file(&mut table, dir.path(), "b", 10);
        table.acquire(&a, true);
        table.acquire(&b, true);

        let outcome = evict(&mut table, dir.path(), 5);

        assert_eq!(outcome, EvictionOutcome::default());
        assert_eq!(table.total_bytes(), 20);
        assert!(dir.path().join("a").exists());
        assert!(dir.path().join("b").exists());

        table.release(&b);
        let outcome = evict(&mut table, dir.path(), 5);

        assert_eq!(outcome.evicted_entries, 1);
        assert!(table.lookup(&a).is_some());
        assert!(!dir.path().join("b").exists());
        assert_eq!(table.total_bytes(), 10);
    }

    #[test]
    fn test_missing_file_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = EntryTable::new();
        let a = admit_file(&mut table, dir.path(), "a", 10);
        std::fs::remove_file(dir.path().join("a")).unwrap();

        let outcome = evict(&mut table, dir.path(), 0);

        assert_eq!(outcome.evicted_bytes, 10);
        assert!(table.lookup(&a).is_none());
        assert_eq!(table.total_bytes(), 0);
    }

    #[test]
    fn test_within_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = EntryTable::new();
        admit_file(&mut table, dir.path(), "a", 10);

        assert_eq!(evict(&mut table, dir.path(), 10), EvictionOutcome::default());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_removes_emptied_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("dataset/shard.1")).unwrap();
        std::fs::create_dir_all(dir.path().join("dataset/shard.2")).unwrap();
        let mut table = EntryTable::new();
        admit_file(&mut table, dir.path(), "dataset/shard.1/a", 10);
        admit_file(&mut table, dir.path(), "dataset/shard.2/b", 10);

        evict(&mut table, dir.path(), 10);

        assert!(!dir.path().join("dataset/shard.1").exists());
        assert!(dir.path().join("dataset/shard.2/b").exists());

        evict(&mut table, dir.path(), 0);

        assert!(!dir.path().join("dataset").exists());
        assert!(dir.path().is_dir());
    }
}
