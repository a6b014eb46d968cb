use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use shardcache_test::{self as test, GeneratedStore, disk_usage, list_files};

use super::*;

const FILE_SIZE: u64 = 128;
const CAPACITY: u64 = 8 * FILE_SIZE;

fn shard_key(i: usize) -> CacheKey {
    CacheKey::parse(&format!("/dataset/shard.{}/file.{i}", i % 4)).unwrap()
}

fn init(root: &Path, capacity_bytes: u64, store: &Arc<GeneratedStore>) -> ShardCache {
    ShardCache::initialize(CacheConfig::new(root, capacity_bytes), store.clone()).unwrap()
}

/// Waits until `condition` holds, failing the test after a few seconds.
async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition was not met in time");
}

#[tokio::test]
async fn test_initialize_creates_root() {
    test::setup();
    let basedir = test::tempdir();
    let root = basedir.path().join("cache");
    let store = GeneratedStore::new(FILE_SIZE).shared();

    let cache = init(&root, CAPACITY, &store);

    assert!(root.join(TMP_DIR_NAME).is_dir());
    assert_eq!(cache.root(), root);
    assert_eq!(cache.stats().entries, 0);
}

#[tokio::test]
async fn test_transient_accesses_stay_within_capacity() {
    test::setup();
    let cache_dir = test::tempdir();
    let store = GeneratedStore::new(FILE_SIZE).shared();
    let cache = init(cache_dir.path(), CAPACITY, &store);

    for i in 0..80 {
        let key = shard_key(i % 16);
        let path = cache.materialize_transient(&key).await.unwrap();

        assert_eq!(path, cache.local_path(&key));
        assert!(disk_usage(cache_dir.path()) <= CAPACITY);
        assert!(cache.stats().total_bytes <= CAPACITY);
    }

    // Cycling over twice as many keys as fit into the cache misses every single time.
    assert_eq!(store.total_downloads(), 80);
    assert_eq!(cache.stats().evictions, 72);
}

#[tokio::test]
async fn test_pinned_entries_exceed_capacity() {
    test::setup();
    let cache_dir = test::tempdir();
    let store = GeneratedStore::new(FILE_SIZE).shared();
    let config = CacheConfig {
        evict_on_release: true,
        ..CacheConfig::new(cache_dir.path(), CAPACITY)
    };
    let cache = ShardCache::initialize(config, store.clone()).unwrap();

    for i in 0..8 {
        cache.materialize_transient(&shard_key(i)).await.unwrap();
    }
    assert_eq!(disk_usage(cache_dir.path()), CAPACITY);

    let mut handles = Vec::new();
    for i in 16..32 {
        handles.push(cache.open_scoped(&shard_key(i)).await.unwrap());
    }

    assert_eq!(disk_usage(cache_dir.path()), 16 * FILE_SIZE);
    let stats = cache.stats();
    assert_eq!(stats.pinned_entries, 16);
    assert_eq!(stats.pinned_bytes, 16 * FILE_SIZE);
    for i in 0..8 {
        assert!(!cache.contains(&shard_key(i)));
    }

    for handle in handles {
        assert!(handle.local_path().exists());
        handle.close();
    }

    assert!(disk_usage(cache_dir.path()) <= CAPACITY);
    assert_eq!(cache.stats().pinned_entries, 0);
}

#[tokio::test]
async fn test_release_is_lazy() {
    test::setup();
    let cache_dir = test::tempdir();
    let store = GeneratedStore::new(FILE_SIZE).shared();
    let cache = init(cache_dir.path(), CAPACITY, &store);

    let mut handles = Vec::new();
    for i in 0..16 {
        handles.push(cache.open_scoped(&shard_key(i)).await.unwrap());
    }
    drop(handles);

    // Released files stay on disk until the next download runs an eviction pass.
    assert_eq!(disk_usage(cache_dir.path()), 16 * FILE_SIZE);
    assert_eq!(cache.stats().pinned_entries, 0);

    cache.materialize_transient(&shard_key(16)).await.unwrap();

    assert!(disk_usage(cache_dir.path()) <= CAPACITY);
    assert!(cache.contains(&shard_key(16)));
}

#[tokio::test]
async fn test_enforce_capacity() {
    test::setup();
    let cache_dir = test::tempdir();
    let store = GeneratedStore::new(FILE_SIZE).shared();
    let cache = init(cache_dir.path(), 2 * FILE_SIZE, &store);

    let cache_ref = &cache;
    let handles =
        join_all((0..4).map(|i| async move { cache_ref.open_scoped(&shard_key(i)).await })).await;
    assert_eq!(cache.enforce_capacity(), EvictionOutcome::default());
    drop(handles);

    let outcome = cache.enforce_capacity();

    assert_eq!(outcome.evicted_entries, 2);
    assert_eq!(outcome.evicted_bytes, 2 * FILE_SIZE);
    assert_eq!(disk_usage(cache_dir.path()), 2 * FILE_SIZE);
}

#[tokio::test]
async fn test_pinned_entry_survives_pressure() {
    test::setup();
    let cache_dir = test::tempdir();
    let store = GeneratedStore::new(FILE_SIZE).shared();
    let cache = init(cache_dir.path(), CAPACITY, &store);

    let pinned_key = shard_key(100);
    let handle = cache.open_scoped(&pinned_key).await.unwrap();

    for i in 0..20 {
        cache.materialize_transient(&shard_key(i)).await.unwrap();
    }

    assert!(cache.contains(&pinned_key));
    assert_eq!(
        std::fs::read(handle.local_path()).unwrap(),
        store.contents(&pinned_key)
    );
    assert_eq!(disk_usage(cache_dir.path()), CAPACITY);

    handle.close();
    assert!(cache.contains(&pinned_key));

    // The released entry is the least recently used one now.
    cache.materialize_transient(&shard_key(20)).await.unwrap();
    assert!(!cache.contains(&pinned_key));
    assert!(!cache.local_path(&pinned_key).exists());
}

#[tokio::test]
async fn test_multiple_handles_for_one_key() {
    test::setup();
    let cache_dir = test::tempdir();
    let store = GeneratedStore::new(FILE_SIZE).shared();
    let cache = init(cache_dir.path(), 0, &store);

    let key = shard_key(0);
    let first = cache.open_scoped(&key).await.unwrap();
    let second = cache.open_scoped(&key).await.unwrap();

    assert_eq!(first.local_path(), second.local_path());
    assert_eq!(first.size_bytes(), FILE_SIZE);
    assert_eq!(store.downloads(&key), 1);
    assert_eq!(cache.stats().pinned_entries, 1);

    first.close();
    assert_eq!(cache.enforce_capacity(), EvictionOutcome::default());
    assert!(second.local_path().exists());

    drop(second);
    assert_eq!(cache.enforce_capacity().evicted_entries, 1);
    assert!(!cache.contains(&key));
}

#[tokio::test]
async fn test_restart_with_open_handles() {
    test::setup();
    let cache_dir = test::tempdir();
    let store = GeneratedStore::new(FILE_SIZE).shared();

    let cache = init(cache_dir.path(), CAPACITY, &store);
    let mut handles = Vec::new();
    for i in 0..16 {
        handles.push(cache.open_scoped(&shard_key(i)).await.unwrap());
    }
    assert_eq!(disk_usage(cache_dir.path()), 16 * FILE_SIZE);
    drop(cache);

    let cache = init(cache_dir.path(), CAPACITY, &store);

    assert!(disk_usage(cache_dir.path()) <= CAPACITY);
    let stats = cache.stats();
    assert_eq!(stats.recovered_entries, 16);
    assert_eq!(stats.evictions, 8);
    assert_eq!(stats.pinned_entries, 0);

    // Handles of the previous cache release nothing in the new one.
    for handle in handles {
        handle.close();
    }
    assert_eq!(cache.stats().total_bytes, CAPACITY);

    // The restarted cache protects the files it hands out again.
    let mut handles = Vec::new();
    for i in 0..16 {
        let key = shard_key(i);
        let handle = cache.open_scoped(&key).await.unwrap();
        assert_eq!(std::fs::read(handle.local_path()).unwrap(), store.contents(&key));
        handles.push(handle);
    }
    for i in 0..80 {
        cache.materialize_transient(&shard_key(100 + i % 16)).await.unwrap();
    }

    for handle in &handles {
        assert!(handle.local_path().exists());
    }
    assert_eq!(disk_usage(cache_dir.path()), 16 * FILE_SIZE);

    for handle in handles {
        handle.close();
    }
    cache.materialize_transient(&shard_key(200)).await.unwrap();
    assert!(disk_usage(cache_dir.path()) <= CAPACITY);
}

#[tokio::test]
async fn test_abandoned_download_still_evicts() {
    test::setup();
    let cache_dir = test::tempdir();
    let store = GeneratedStore::new(FILE_SIZE)
        .with_delay(Duration::from_millis(50))
        .shared();
    let cache = init(cache_dir.path(), 2 * FILE_SIZE, &store);
    cache.materialize_transient(&shard_key(0)).await.unwrap();
    cache.materialize_transient(&shard_key(1)).await.unwrap();

    let key = shard_key(2);
    let abandoned =
        tokio::time::timeout(Duration::from_millis(5), cache.materialize_transient(&key)).await;
    assert!(abandoned.is_err());

    // The download finishes without anyone waiting for it.
    wait_until(|| cache.contains(&key)).await;
    wait_until(|| cache.stats().pinned_entries == 0).await;

    let stats = cache.stats();
    assert_eq!(stats.total_bytes, 2 * FILE_SIZE);
    assert_eq!(stats.evictions, 1);
    assert!(!cache.contains(&shard_key(0)));
    assert_eq!(disk_usage(cache_dir.path()), 2 * FILE_SIZE);
}

#[tokio::test]
async fn test_transient_larger_than_capacity() {
    test::setup();
    let cache_dir = test::tempdir();
    let store = GeneratedStore::new(FILE_SIZE).shared();
    let cache = init(cache_dir.path(), FILE_SIZE / 2, &store);
    let key = shard_key(0);

    // Nothing else can make room, so the file is evicted again before the call returns.
    let path = cache.materialize_transient(&key).await.unwrap();

    assert_eq!(path, cache.local_path(&key));
    assert!(!path.exists());
    assert!(!cache.contains(&key));
    assert_eq!(cache.stats().total_bytes, 0);

    let handle = cache.open_scoped(&key).await.unwrap();

    assert_eq!(
        std::fs::read(handle.local_path()).unwrap(),
        store.contents(&key)
    );
    assert_eq!(store.downloads(&key), 2);
    assert_eq!(cache.stats().total_bytes, FILE_SIZE);
}

#[tokio::test]
async fn test_recovered_entries_are_hits() {
    test::setup();
    let cache_dir = test::tempdir();
    let store = GeneratedStore::new(FILE_SIZE).shared();

    let key = shard_key(3);
    let path = cache_dir.path().join(key.relative_path());
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, store.contents(&key)).unwrap();

    std::fs::create_dir_all(cache_dir.path().join(TMP_DIR_NAME)).unwrap();
    std::fs::write(cache_dir.path().join(".tmp/tmpAbC123"), b"partial").unwrap();
    std::fs::write(cache_dir.path().join("dataset/.leftover"), b"stray").unwrap();
    std::fs::create_dir_all(cache_dir.path().join("empty/nested")).unwrap();

    let cache = init(cache_dir.path(), CAPACITY, &store);

    let stats = cache.stats();
    assert_eq!(stats.recovered_entries, 1);
    assert_eq!(stats.discarded_files, 2);
    assert_eq!(list_files(cache_dir.path()), ["dataset/shard.3/file.3"]);
    assert!(!cache_dir.path().join("empty").exists());

    let resolved = cache.materialize_transient(&key).await.unwrap();

    assert_eq!(resolved, path);
    assert_eq!(store.total_downloads(), 0);
    assert_eq!(cache.stats().hits, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_flight() {
    test::setup();
    let cache_dir = test::tempdir();
    let store = GeneratedStore::new(FILE_SIZE)
        .with_delay(Duration::from_millis(50))
        .shared();
    let cache = init(cache_dir.path(), CAPACITY, &store);
    let key = shard_key(0);

    let tasks = (0..16).map(|_| {
        let cache = cache.clone();
        let key = key.clone();
        tokio::spawn(async move { cache.materialize_transient(&key).await })
    });
    let paths = join_all(tasks).await;

    for path in paths {
        assert_eq!(path.unwrap().unwrap(), cache.local_path(&key));
    }
    assert_eq!(store.downloads(&key), 1);

    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits + stats.coalesced, 15);
    assert_eq!(stats.in_flight_downloads, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_distinct_keys_download_in_parallel() {
    test::setup();
    let cache_dir = test::tempdir();
    let (store, gate) = GeneratedStore::new(FILE_SIZE).gated();
    let store = store.shared();
    let cache = init(cache_dir.path(), CAPACITY, &store);

    let tasks: Vec<_> = [shard_key(0), shard_key(1)]
        .into_iter()
        .map(|key| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.open_scoped(&key).await })
        })
        .collect();

    // Both downloads are running at the same time, neither waits for the other.
    wait_until(|| store.started() == 2).await;
    assert_eq!(cache.stats().in_flight_downloads, 2);

    gate.open();
    for task in join_all(tasks).await {
        let handle = task.unwrap().unwrap();
        assert!(handle.local_path().exists());
    }
    assert_eq!(cache.stats().in_flight_downloads, 0);
}

#[tokio::test]
async fn test_failed_download_is_not_cached() {
    test::setup();
    let cache_dir = test::tempdir();
    let store = GeneratedStore::new(FILE_SIZE).shared();
    let cache = init(cache_dir.path(), CAPACITY, &store);
    let key = shard_key(0);

    store.fail(&key);
    let err = cache.materialize_transient(&key).await.unwrap_err();

    assert!(matches!(
        &err,
        CacheError::DownloadFailed { key: failed, kind: io::ErrorKind::ConnectionReset, .. }
            if *failed == key
    ));
    assert_eq!(
        err.to_string(),
        "download of `/dataset/shard.0/file.0` failed: remote refused /dataset/shard.0/file.0"
    );
    assert!(!cache.contains(&key));
    assert!(list_files(cache_dir.path()).is_empty());

    store.heal(&key);
    let path = cache.materialize_transient(&key).await.unwrap();

    assert_eq!(std::fs::read(path).unwrap(), store.contents(&key));
    assert_eq!(store.downloads(&key), 2);
    let stats = cache.stats();
    assert_eq!(stats.download_failures, 1);
    assert_eq!(stats.downloads, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failure_is_shared_by_waiters() {
    test::setup();
    let cache_dir = test::tempdir();
    let (store, gate) = GeneratedStore::new(FILE_SIZE).gated();
    let store = store.shared();
    let cache = init(cache_dir.path(), CAPACITY, &store);
    let key = shard_key(0);
    store.fail(&key);

    let waiters = join_all((0..4).map(|_| cache.open_scoped(&key)));
    let opener = async {
        wait_until(|| store.started() == 1).await;
        gate.open();
    };
    let (results, ()) = tokio::join!(waiters, opener);

    for result in results {
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionReset);
    }
    assert_eq!(store.downloads(&key), 1);
    assert_eq!(cache.stats().coalesced, 3);
    assert!(!cache.contains(&key));
}

#[tokio::test]
async fn test_idempotent_content() {
    test::setup();
    let cache_dir = test::tempdir();
    let store = GeneratedStore::new(FILE_SIZE).shared();
    let cache = init(cache_dir.path(), CAPACITY, &store);
    let key = shard_key(5);

    let first = std::fs::read(cache.materialize_transient(&key).await.unwrap()).unwrap();
    let handle = cache.open_scoped(&key).await.unwrap();
    let second = std::fs::read(handle.local_path()).unwrap();

    assert_eq!(first, second);
    assert_eq!(first, store.contents(&key));
    assert_eq!(store.downloads(&key), 1);
}

#[tokio::test]
async fn test_handle_outlives_cache() {
    test::setup();
    let cache_dir = test::tempdir();
    let store = GeneratedStore::new(FILE_SIZE).shared();
    let cache = init(cache_dir.path(), CAPACITY, &store);

    let handle = cache.open_scoped(&shard_key(0)).await.unwrap();
    drop(cache);

    assert!(handle.local_path().exists());
    handle.close();
}

#[tokio::test]
async fn test_stats() {
    test::setup();
    let cache_dir = test::tempdir();
    let store = GeneratedStore::new(FILE_SIZE).shared();
    let cache = init(cache_dir.path(), 4 * FILE_SIZE, &store);

    cache.materialize_transient(&shard_key(0)).await.unwrap();
    cache.materialize_transient(&shard_key(1)).await.unwrap();
    cache.materialize_transient(&shard_key(0)).await.unwrap();
    let _handle = cache.open_scoped(&shard_key(2)).await.unwrap();
    cache.materialize_transient(&shard_key(3)).await.unwrap();
    cache.materialize_transient(&shard_key(4)).await.unwrap();

    assert!(!cache.contains(&shard_key(1)));
    insta::assert_debug_snapshot!(cache.stats(), @r###"
    CacheStats {
        capacity_bytes: 512,
        total_bytes: 512,
        entries: 4,
        pinned_entries: 1,
        pinned_bytes: 128,
        in_flight_downloads: 0,
        hits: 1,
        misses: 5,
        coalesced: 0,
        downloads: 5,
        download_failures: 0,
        evictions: 1,
        evicted_bytes: 128,
        recovered_entries: 0,
        discarded_files: 0,
    }
    "###);
}
