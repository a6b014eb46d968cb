use std::path::Path;
use std::sync::Weak;

use shardcache_store::CacheKey;

use super::{CacheEntry, CacheInner};

/// A pinned cache entry.
///
/// While the handle is alive, its file is protected from eviction. Release it with
/// [`close`](Self::close) or by dropping it. Once the last handle of an entry is released, the
/// entry becomes evictable again, but stays on disk until an eviction pass picks it.
///
/// Releasing never fails. If the cache the handle came from is gone, or no longer tracks the
/// entry, releasing does nothing.
#[derive(Debug)]
pub struct ScopedHandle {
    cache: Weak<CacheInner>,
    entry: CacheEntry,
    released: bool,
}

impl ScopedHandle {
    pub(super) fn new(cache: Weak<CacheInner>, entry: CacheEntry) -> Self {
        Self {
            cache,
            entry,
            released: false,
        }
    }

    /// The key of the pinned file.
    pub fn key(&self) -> &CacheKey {
        &self.entry.key
    }

    /// Where the pinned file lives on disk.
    pub fn local_path(&self) -> &Path {
        &self.entry.local_path
    }

    /// The size of the pinned file.
    pub fn size_bytes(&self) -> u64 {
        self.entry.size_bytes
    }

    /// Releases the pin.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        if let Some(cache) = self.cache.upgrade() {
            cache.release(&self.entry.key);
        }
    }
}

impl Drop for ScopedHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// The pin a download holds on the entry it admitted.
///
/// It keeps the fresh entry from being evicted by the admission's own eviction pass, until every
/// caller waiting for the download had a chance to pin it for itself. Dropping the last clone
/// releases the pin and runs the eviction pass that the pin held back.
#[derive(Debug)]
pub(crate) struct AdmissionPin {
    cache: Weak<CacheInner>,
    key: CacheKey,
}

impl AdmissionPin {
    pub(super) fn new(cache: Weak<CacheInner>, key: CacheKey) -> Self {
        Self { cache, key }
    }
}

impl Drop for AdmissionPin {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.upgrade() {
            cache.unpin(&self.key, true);
        }
    }
}
