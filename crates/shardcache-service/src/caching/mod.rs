//! # Shard Cache
//!
//! The shard cache keeps local copies of remote shard files in a directory it owns exclusively,
//! the cache root. The root mirrors the remote key hierarchy: the file for `dataset/shard.1/index`
//! lives at `<root>/dataset/shard.1/index`. There is no separate index file. The directory tree
//! itself is the durable state, and is reconciled with a fresh in-memory table on every startup.
//!
//! ## Components
//!
//! - The entry table tracks every resident file with its size, recency and pin count, and the
//!   total size of all entries. It lives behind a single lock, so admission, recency updates,
//!   pinning and eviction never interleave.
//! - The single-flight loader makes sure that only one download per key runs at a time. Every
//!   concurrent caller for that key waits for the same result, including failures. Failures are
//!   not cached.
//! - Eviction removes least recently used, unpinned entries until the total size fits the
//!   configured capacity. It runs after every admission and after recovery.
//! - Recovery walks an existing cache root at startup, admits every file that maps back to a key,
//!   and deletes everything else, such as partial downloads of a crashed process.
//!
//! ## Access modes
//!
//! [`ShardCache::open_scoped`] returns a [`ScopedHandle`] which pins the entry. The pin is taken
//! under the same lock that resolves the entry, so there is no window in which the file could be
//! evicted before the caller sees it. Pinned entries may push the cache over capacity.
//!
//! [`ShardCache::materialize_transient`] returns only a path and takes no pin. The file may be
//! evicted at any point after the call returns, so callers must be prepared for the path to
//! vanish.
//!
//! Releasing a handle does not evict by default. The released file stays on disk until the next
//! admission runs an eviction pass, favoring re-opens of recently closed files. With
//! [`CacheConfig::evict_on_release`], releasing the last pin of an entry runs an eviction pass
//! right away.
//!
//! ## Metrics
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by a resident entry.
//! - `caches.file.miss`: Accesses that started a download.
//! - `caches.download.coalesced`: Accesses that joined a running download.
//! - `caches.download`: Finished downloads, tagged with their `status`.
//! - `caches.evictions`, `caches.evictions.bytes`: Evicted entries and their size.
//! - `caches.size.bytes`, `caches.size.files`: Gauges of the resident set after each eviction
//!   pass.
//!
//! The same information is available in-process through [`ShardCache::stats`].

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use shardcache_store::{CacheKey, RemoteStore};

mod cache_error;
mod entry_table;
mod eviction;
mod fs;
mod handle;
mod recovery;
mod single_flight;

#[cfg(test)]
mod tests;

pub use cache_error::CacheError;
pub use entry_table::{CacheEntry, DuplicateKey};
pub use eviction::EvictionOutcome;
pub use fs::TMP_DIR_NAME;
pub use handle::ScopedHandle;
pub use recovery::RecoveryReport;

use entry_table::EntryTable;
use handle::AdmissionPin;
use single_flight::{Flight, SingleFlight};

/// Configuration of a [`ShardCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// The directory the cache owns. Nothing else may write to it.
    pub root: PathBuf,
    /// The target for the total size of all unpinned entries.
    pub capacity_bytes: u64,
    /// Run an eviction pass as soon as the last handle of an entry is released.
    pub evict_on_release: bool,
}

impl CacheConfig {
    /// Creates a configuration that evicts only on admission.
    pub fn new(root: impl Into<PathBuf>, capacity_bytes: u64) -> Self {
        Self {
            root: root.into(),
            capacity_bytes,
            evict_on_release: false,
        }
    }
}

/// A snapshot of the cache's accounting.
///
/// Gauges describe the state at the time of the snapshot, counters accumulate since
/// [`ShardCache::initialize`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub capacity_bytes: u64,
    pub total_bytes: u64,
    pub entries: u64,
    pub pinned_entries: u64,
    pub pinned_bytes: u64,
    pub in_flight_downloads: u64,

    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub downloads: u64,
    pub download_failures: u64,
    pub evictions: u64,
    pub evicted_bytes: u64,
    pub recovered_entries: u64,
    pub discarded_files: u64,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    downloads: AtomicU64,
    download_failures: AtomicU64,
    evictions: AtomicU64,
    evicted_bytes: AtomicU64,
    recovered_entries: AtomicU64,
    discarded_files: AtomicU64,
}

fn bump(counter: &AtomicU64, value: u64) {
    counter.fetch_add(value, Ordering::Relaxed);
}

/// A size-bounded local cache of remote shard files.
///
/// The cache is cheap to clone, all clones share the same state.
#[derive(Clone)]
pub struct ShardCache {
    inner: Arc<CacheInner>,
}

pub(crate) struct CacheInner {
    config: CacheConfig,
    tmp_dir: PathBuf,
    store: Arc<dyn RemoteStore>,
    /// Lock order: `flights` before `table`.
    table: Mutex<EntryTable>,
    flights: SingleFlight<Arc<AdmissionPin>>,
    counters: CacheCounters,
}

impl fmt::Debug for CacheInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheInner")
            .field("config", &self.config)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for ShardCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardCache")
            .field("root", &self.inner.config.root)
            .field("capacity_bytes", &self.inner.config.capacity_bytes)
            .finish_non_exhaustive()
    }
}

impl ShardCache {
    /// Creates the cache and reconciles it with the existing contents of the cache root.
    ///
    /// Recovery runs to completion, followed by one eviction pass, before the cache is returned.
    /// Files that do not map to a key are deleted. Errors reading the root are returned, errors
    /// for individual files are logged.
    pub fn initialize(config: CacheConfig, store: Arc<dyn RemoteStore>) -> io::Result<Self> {
        let mut table = EntryTable::new();
        let report = recovery::recover(&config.root, &mut table)?;
        let outcome = eviction::evict(&mut table, &config.root, config.capacity_bytes);
        if outcome.evicted_entries > 0 {
            tracing::info!(
                "Evicted {} recovered files totaling {} bytes",
                outcome.evicted_entries,
                outcome.evicted_bytes,
            );
        }

        let counters = CacheCounters::default();
        bump(&counters.recovered_entries, report.recovered_entries);
        bump(&counters.discarded_files, report.discarded_files);

        let inner = CacheInner {
            tmp_dir: config.root.join(TMP_DIR_NAME),
            config,
            store,
            table: Mutex::new(table),
            flights: SingleFlight::default(),
            counters,
        };
        inner.record_eviction(outcome);

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// The configuration this cache was created with.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Makes sure the file for `key` is resident and returns its path, without pinning it.
    ///
    /// The file may be evicted as soon as this returns. Use [`open_scoped`](Self::open_scoped)
    /// to protect it for the duration of a read.
    ///
    /// If the file can not fit next to the pinned entries, or is larger than the whole capacity on
    /// its own, it is evicted again before this returns. The returned path then no longer exists,
    /// and the download is repeated on the next access.
    pub async fn materialize_transient(&self, key: &CacheKey) -> Result<PathBuf, CacheError> {
        let entry = self.resolve(key, false).await?;
        Ok(entry.local_path)
    }

    /// Makes sure the file for `key` is resident and pins it until the handle is released.
    pub async fn open_scoped(&self, key: &CacheKey) -> Result<ScopedHandle, CacheError> {
        let entry = self.resolve(key, true).await?;
        Ok(ScopedHandle::new(Arc::downgrade(&self.inner), entry))
    }

    /// Whether `key` is currently resident.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.table.lock().lookup(key).is_some()
    }

    /// The path at which the file for `key` lives when it is resident.
    pub fn local_path(&self, key: &CacheKey) -> PathBuf {
        self.inner.config.root.join(key.relative_path())
    }

    /// The directory the cache owns.
    pub fn root(&self) -> &Path {
        &self.inner.config.root
    }

    /// Runs one eviction pass.
    pub fn enforce_capacity(&self) -> EvictionOutcome {
        self.inner.enforce_capacity()
    }

    /// Returns a snapshot of the cache's accounting.
    pub fn stats(&self) -> CacheStats {
        let inner = &self.inner;
        let in_flight_downloads = inner.flights.len() as u64;

        let mut stats = {
            let table = inner.table.lock();
            CacheStats {
                capacity_bytes: inner.config.capacity_bytes,
                total_bytes: table.total_bytes(),
                entries: table.len() as u64,
                pinned_entries: table.pinned_entries() as u64,
                pinned_bytes: table.pinned_bytes(),
                in_flight_downloads,
                ..Default::default()
            }
        };

        let counters = &inner.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        stats.hits = load(&counters.hits);
        stats.misses = load(&counters.misses);
        stats.coalesced = load(&counters.coalesced);
        stats.downloads = load(&counters.downloads);
        stats.download_failures = load(&counters.download_failures);
        stats.evictions = load(&counters.evictions);
        stats.evicted_bytes = load(&counters.evicted_bytes);
        stats.recovered_entries = load(&counters.recovered_entries);
        stats.discarded_files = load(&counters.discarded_files);

        stats
    }

    /// Resolves `key` to a resident entry, downloading it if needed.
    ///
    /// A pin is taken in the same critical section that finds the entry. After a download, the
    /// entry is held by the [`AdmissionPin`] of its flight until this caller has pinned it, so a
    /// freshly opened file can not evict itself.
    async fn resolve(&self, key: &CacheKey, pin: bool) -> Result<CacheEntry, CacheError> {
        let inner = &self.inner;
        metric!(counter("caches.access") += 1);

        loop {
            let flight = inner.flights.join_or_start(
                key,
                || inner.table.lock().acquire(key, pin),
                || inner.clone().load(key.clone()),
            );

            let channel = match flight {
                Flight::Resident(entry) => {
                    tracing::trace!("Cache hit for {}", key);
                    metric!(counter("caches.memory.hit") += 1);
                    bump(&inner.counters.hits, 1);
                    return Ok(entry);
                }
                Flight::Joined(channel) => {
                    tracing::trace!("Joining download of {}", key);
                    metric!(counter("caches.download.coalesced") += 1);
                    bump(&inner.counters.coalesced, 1);
                    channel
                }
                Flight::Started(channel) => {
                    tracing::trace!("Cache miss for {}", key);
                    metric!(counter("caches.file.miss") += 1);
                    bump(&inner.counters.misses, 1);
                    channel
                }
            };

            // Released at the end of this iteration, after the table lock.
            let _admission = SingleFlight::wait(key, channel).await?;

            let acquired = inner.table.lock().acquire(key, pin);
            match acquired {
                Some(entry) => return Ok(entry),
                None => {
                    tracing::debug!("{} was evicted before it could be used, retrying", key);
                }
            }
        }
    }
}

impl CacheInner {
    /// Downloads `key` and admits it into the table.
    ///
    /// The admission and its eviction pass happen in one critical section, whether or not anyone
    /// still waits for the result. The new entry is pinned by the returned [`AdmissionPin`].
    async fn load(self: Arc<Self>, key: CacheKey) -> Result<Arc<AdmissionPin>, CacheError> {
        let local_path = self.config.root.join(key.relative_path());

        let size_bytes = match self.download(&key, &local_path).await {
            Ok(size_bytes) => size_bytes,
            Err(err) => {
                metric!(counter("caches.download") += 1, "status" => "error");
                bump(&self.counters.download_failures, 1);
                return Err(err);
            }
        };

        metric!(counter("caches.download") += 1, "status" => "ok");
        metric!(time_raw("caches.download.size") = size_bytes);
        bump(&self.counters.downloads, 1);

        let outcome = {
            let mut table = self.table.lock();
            match table.admit(key.clone(), local_path, size_bytes) {
                Ok(entry) => {
                    tracing::debug!("Admitted {} ({} bytes)", entry.key, entry.size_bytes)
                }
                Err(e) => {
                    let dynerr: &dyn std::error::Error = &e;
                    tracing::error!(error = dynerr, "Admitted a download outside of its flight");
                }
            }
            table.acquire(&key, true);
            eviction::evict(&mut table, &self.config.root, self.config.capacity_bytes)
        };
        self.record_eviction(outcome);

        Ok(Arc::new(AdmissionPin::new(Arc::downgrade(&self), key)))
    }

    /// Downloads `key` into a temporary file and publishes it at `local_path`.
    async fn download(&self, key: &CacheKey, local_path: &Path) -> Result<u64, CacheError> {
        let temp_file =
            fs::tempfile_in(&self.tmp_dir).map_err(|e| CacheError::download_failed(key, e))?;

        let written = self
            .store
            .download(key, temp_file.path())
            .await
            .map_err(|e| CacheError::download_failed(key, e))?;

        let size_bytes = std::fs::metadata(temp_file.path())
            .map_err(|e| CacheError::download_failed(key, e))?
            .len();
        if written != size_bytes {
            tracing::warn!(
                "Store reported {} bytes for {}, but {} bytes are on disk",
                written,
                key,
                size_bytes,
            );
        }

        fs::persist_tempfile(temp_file, local_path)
            .await
            .map_err(|e| CacheError::download_failed(key, e))?;

        Ok(size_bytes)
    }

    /// Drops one pin of a [`ScopedHandle`].
    pub(crate) fn release(&self, key: &CacheKey) {
        self.unpin(key, self.config.evict_on_release);
    }

    /// Drops one pin of `key`, running an eviction pass if it was the last one and `evict` is set.
    pub(crate) fn unpin(&self, key: &CacheKey, evict: bool) {
        let outcome = {
            let mut table = self.table.lock();
            match table.release(key) {
                Some(0) if evict => Some(eviction::evict(
                    &mut table,
                    &self.config.root,
                    self.config.capacity_bytes,
                )),
                Some(_) => None,
                None => {
                    tracing::debug!("Released {} which is no longer pinned", key);
                    None
                }
            }
        };

        if let Some(outcome) = outcome {
            self.record_eviction(outcome);
        }
    }

    fn enforce_capacity(&self) -> EvictionOutcome {
        let outcome = eviction::evict(
            &mut self.table.lock(),
            &self.config.root,
            self.config.capacity_bytes,
        );
        self.record_eviction(outcome);
        outcome
    }

    fn record_eviction(&self, outcome: EvictionOutcome) {
        bump(&self.counters.evictions, outcome.evicted_entries);
        bump(&self.counters.evicted_bytes, outcome.evicted_bytes);
    }
}
