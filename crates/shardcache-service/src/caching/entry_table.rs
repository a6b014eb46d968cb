use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use thiserror::Error;

use shardcache_store::CacheKey;

/// A file that is resident in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// The key of the remote file.
    pub key: CacheKey,
    /// Where the file lives below the cache root.
    pub local_path: PathBuf,
    /// Size of the file when it was admitted.
    pub size_bytes: u64,
    /// Number of open scoped handles. The entry can only be evicted when this is `0`.
    pub pin_count: u32,
    /// Sequence number of the last access.
    pub recency: u64,
}

impl CacheEntry {
    /// Whether an open handle protects this entry from eviction.
    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }
}

/// An entry for the key was admitted twice.
///
/// All admissions go through the single-flight loader, so this indicates a bug.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cache entry for `{0}` already exists")]
pub struct DuplicateKey(pub CacheKey);

/// The authoritative record of what is cached and how big it is.
///
/// The table is a plain data structure. The cache wraps it in a single mutex, so that admission,
/// recency updates, pinning and eviction never interleave. Unpinned entries are additionally
/// indexed by recency, which makes finding the next eviction candidate cheap.
#[derive(Debug, Default)]
pub(crate) struct EntryTable {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Unpinned entries by ascending recency.
    evictable: BTreeMap<u64, CacheKey>,
    total_bytes: u64,
    pinned_bytes: u64,
    pinned_entries: usize,
    next_recency: u64,
}

impl EntryTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump_recency(&mut self) -> u64 {
        let recency = self.next_recency;
        self.next_recency += 1;
        recency
    }

    /// Looks up an entry without counting it as an access.
    pub fn lookup(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Adds a freshly materialized file as the most recently used, unpinned entry.
    pub fn admit(
        &mut self,
        key: CacheKey,
        local_path: PathBuf,
        size_bytes: u64,
    ) -> Result<CacheEntry, DuplicateKey> {
        if self.entries.contains_key(&key) {
            return Err(DuplicateKey(key));
        }

        let recency = self.bump_recency();
        let entry = CacheEntry {
            key: key.clone(),
            local_path,
            size_bytes,
            pin_count: 0,
            recency,
        };

        self.evictable.insert(recency, key.clone());
        self.total_bytes += size_bytes;
        self.entries.insert(key, entry.clone());

        Ok(entry)
    }

    /// Removes an unpinned entry.
    ///
    /// Returns `None` if there is no entry for `key`, or if the entry is pinned. The caller is
    /// responsible for deleting the file.
    pub fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        if self.entries.get(key)?.is_pinned() {
            return None;
        }

        let entry = self.entries.remove(key)?;
        self.evictable.remove(&entry.recency);
        self.total_bytes -= entry.size_bytes;
        Some(entry)
    }

    /// Records an access to `key`, optionally pinning it in the same step.
    ///
    /// Returns a snapshot of the entry after the access, or `None` if it is not resident.
    pub fn acquire(&mut self, key: &CacheKey, pin: bool) -> Option<CacheEntry> {
        let recency = self.bump_recency();
        let entry = self.entries.get_mut(key)?;

        let was_evictable = !entry.is_pinned();
        if was_evictable {
            self.evictable.remove(&entry.recency);
        }

        entry.recency = recency;
        if pin {
            entry.pin_count += 1;
        }

        if !entry.is_pinned() {
            self.evictable.insert(recency, key.clone());
        } else if was_evictable {
            self.pinned_entries += 1;
            self.pinned_bytes += entry.size_bytes;
        }

        Some(entry.clone())
    }

    /// Drops one pin from `key`.
    ///
    /// Returns the remaining pin count, or `None` if the entry is gone or was not pinned.
    /// Releasing does not count as an access.
    pub fn release(&mut self, key: &CacheKey) -> Option<u32> {
        let entry = self.entries.get_mut(key)?;
        entry.pin_count = entry.pin_count.checked_sub(1)?;

        if !entry.is_pinned() {
            self.evictable.insert(entry.recency, key.clone());
            self.pinned_entries -= 1;
            self.pinned_bytes -= entry.size_bytes;
        }

        Some(entry.pin_count)
    }

    /// The least recently used entry that is not pinned.
    pub fn least_recently_used(&self) -> Option<&CacheKey> {
        self.evictable.values().next()
    }

    /// The sum of the sizes of all entries.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// The sum of the sizes of all pinned entries.
    pub fn pinned_bytes(&self) -> u64 {
        self.pinned_bytes
    }

    pub fn pinned_entries(&self) -> usize {
        self.pinned_entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> CacheKey {
        CacheKey::parse(path).unwrap()
    }

    fn admit(table: &mut EntryTable, path: &str, size_bytes: u64) -> CacheEntry {
        let key = key(path);
        let local_path = PathBuf::from("/cache").join(key.relative_path());
        table.admit(key, local_path, size_bytes).unwrap()
    }

    #[test]
    fn test_admit_tracks_total_bytes() {
        let mut table = EntryTable::new();
        assert!(table.is_empty());

        let entry = admit(&mut table, "dataset/shard.1/a", 100);
        admit(&mut table, "dataset/shard.1/b", 28);

        assert_eq!(entry.local_path, PathBuf::from("/cache/dataset/shard.1/a"));
        assert_eq!(entry.pin_count, 0);
        assert_eq!(table.len(), 2);
        assert_eq!(table.total_bytes(), 128);
        assert_eq!(table.lookup(&key("dataset/shard.1/a")), Some(&entry));
    }

    #[test]
    fn test_admit_duplicate() {
        let mut table = EntryTable::new();
        admit(&mut table, "dataset/a", 100);

        let err = table
            .admit(key("dataset/a"), PathBuf::from("/elsewhere"), 1)
            .unwrap_err();
        assert_eq!(err, DuplicateKey(key("dataset/a")));
        assert_eq!(err.to_string(), "cache entry for `/dataset/a` already exists");
        assert_eq!(table.total_bytes(), 100);
    }

    #[test]
    fn test_lookup_does_not_touch() {
        let mut table = EntryTable::new();
        admit(&mut table, "a", 1);
        admit(&mut table, "b", 1);

        table.lookup(&key("a"));
        assert_eq!(table.least_recently_used(), Some(&key("a")));

        table.acquire(&key("a"), false);
        assert_eq!(table.least_recently_used(), Some(&key("b")));
    }

    #[test]
    fn test_pinned_entries_are_not_removed() {
        let mut table = EntryTable::new();
        admit(&mut table, "a", 10);
        admit(&mut table, "b", 20);

        let entry = table.acquire(&key("a"), true).unwrap();
        assert_eq!(entry.pin_count, 1);
        assert_eq!(table.pinned_entries(), 1);
        assert_eq!(table.pinned_bytes(), 10);

        assert_eq!(table.remove(&key("a")), None);
        assert_eq!(table.least_recently_used(), Some(&key("b")));
        assert_eq!(table.remove(&key("b")).map(|e| e.size_bytes), Some(20));
        assert_eq!(table.least_recently_used(), None);
        assert_eq!(table.total_bytes(), 10);

        assert_eq!(table.release(&key("a")), Some(0));
        assert_eq!(table.pinned_entries(), 0);
        assert_eq!(table.pinned_bytes(), 0);
        assert_eq!(table.least_recently_used(), Some(&key("a")));
        assert!(table.remove(&key("a")).is_some());
        assert_eq!(table.total_bytes(), 0);
    }

    #[test]
    fn test_multiple_pins() {
        let mut table = EntryTable::new();
        admit(&mut table, "a", 10);

        table.acquire(&key("a"), true);
        table.acquire(&key("a"), true);
        assert_eq!(table.pinned_entries(), 1);

        assert_eq!(table.release(&key("a")), Some(1));
        assert_eq!(table.remove(&key("a")), None);
        assert_eq!(table.release(&key("a")), Some(0));
        assert_eq!(table.release(&key("a")), None);
        assert_eq!(table.pinned_entries(), 0);
    }

    #[test]
    fn test_release_keeps_recency() {
        let mut table = EntryTable::new();
        admit(&mut table, "a", 1);
        admit(&mut table, "b", 1);

        table.acquire(&key("a"), true);
        table.acquire(&key("b"), false);
        table.release(&key("a"));

        // `a` was accessed before `b`, releasing it later does not make it more recent.
        assert_eq!(table.least_recently_used(), Some(&key("a")));
    }

    #[test]
    fn test_missing_keys() {
        let mut table = EntryTable::new();
        assert_eq!(table.acquire(&key("a"), true), None);
        assert_eq!(table.release(&key("a")), None);
        assert_eq!(table.remove(&key("a")), None);
        assert_eq!(table.pinned_entries(), 0);
    }
}
