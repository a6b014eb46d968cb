//! Helpers for testing the shard cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Dropping it deletes the cache root, and the cache will happily
//!    recreate parts of it on the next download. Assign it to a variable in the test function
//!    (e.g. `let cache_dir = test::tempdir()`).
//!
//!  - [`GeneratedStore`] serves synthetic files and counts how often each key was downloaded.
//!    Keep an `Arc` of it around to make assertions after handing a clone to the cache.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use shardcache_store::{CacheKey, RemoteStore};

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the shardcache crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new(
            "shardcache_service=trace,shardcache_store=trace",
        ))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Sums up the sizes of all regular files below `path`.
///
/// # Panics
///
/// Panics if the directory tree can not be read.
pub fn disk_usage(path: impl AsRef<Path>) -> u64 {
    let mut total = 0;
    for entry in std::fs::read_dir(path).unwrap() {
        let entry = entry.unwrap();
        let file_type = entry.file_type().unwrap();
        if file_type.is_dir() {
            total += disk_usage(entry.path());
        } else if file_type.is_file() {
            total += entry.metadata().unwrap().len();
        }
    }
    total
}

/// Lists all regular files below `path`, relative to it and with `/` separators.
pub fn list_files(path: impl AsRef<Path>) -> Vec<String> {
    fn walk(root: &Path, dir: &Path, files: &mut Vec<String>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            if entry.file_type().unwrap().is_dir() {
                walk(root, &path, files);
            } else {
                let relative = path.strip_prefix(root).unwrap();
                let segments: Vec<_> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                files.push(segments.join("/"));
            }
        }
    }

    let root = path.as_ref();
    let mut files = Vec::new();
    walk(root, root, &mut files);
    files.sort();
    files
}

/// Deterministic contents of a generated file.
///
/// The file is the hex digest of the key, repeated until it reaches `size` bytes.
pub fn generated_contents(key: &CacheKey, size: u64) -> Vec<u8> {
    let digest = format!("{:x}", Sha256::digest(key.as_str().as_bytes()));
    digest.bytes().cycle().take(size as usize).collect()
}

/// Opens the gate of a [`GeneratedStore`] created with [`GeneratedStore::gated`].
#[derive(Debug)]
pub struct Gate(watch::Sender<bool>);

impl Gate {
    /// Lets all waiting and future downloads proceed.
    pub fn open(&self) {
        self.0.send_replace(true);
    }
}

/// A [`RemoteStore`] that generates file contents instead of fetching them.
///
/// Every file has the same size. Downloads can be slowed down with a fixed delay, held back until
/// a [`Gate`] opens, or made to fail for selected keys.
#[derive(Debug)]
pub struct GeneratedStore {
    file_size: u64,
    delay: Option<Duration>,
    gate: Option<watch::Receiver<bool>>,
    failing: Mutex<BTreeSet<CacheKey>>,
    downloads: Mutex<BTreeMap<CacheKey, usize>>,
    started: AtomicUsize,
}

impl GeneratedStore {
    /// Creates a store that serves files of `file_size` bytes.
    pub fn new(file_size: u64) -> Self {
        Self {
            file_size,
            delay: None,
            gate: None,
            failing: Default::default(),
            downloads: Default::default(),
            started: AtomicUsize::new(0),
        }
    }

    /// Delays every download by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Holds every download back until the returned [`Gate`] is opened.
    pub fn gated(mut self) -> (Self, Gate) {
        let (sender, receiver) = watch::channel(false);
        self.gate = Some(receiver);
        (self, Gate(sender))
    }

    /// Wraps the store into an `Arc`.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// The size of every generated file.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// The contents served for `key`.
    pub fn contents(&self, key: &CacheKey) -> Vec<u8> {
        generated_contents(key, self.file_size)
    }

    /// Makes downloads of `key` fail until [`heal`](Self::heal) is called.
    pub fn fail(&self, key: &CacheKey) {
        self.failing.lock().insert(key.clone());
    }

    /// Makes downloads of `key` succeed again.
    pub fn heal(&self, key: &CacheKey) {
        self.failing.lock().remove(key);
    }

    /// How often a download of `key` was attempted.
    pub fn downloads(&self, key: &CacheKey) -> usize {
        self.downloads.lock().get(key).copied().unwrap_or_default()
    }

    /// How many downloads were attempted in total.
    pub fn total_downloads(&self) -> usize {
        self.downloads.lock().values().sum()
    }

    /// How many downloads have started, including those still waiting for the gate.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    async fn generate(&self, key: &CacheKey, destination: &Path) -> io::Result<u64> {
        self.started.fetch_add(1, Ordering::SeqCst);
        *self.downloads.lock().entry(key.clone()).or_default() += 1;

        if let Some(gate) = &self.gate {
            let mut gate = gate.clone();
            gate.wait_for(|open| *open)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "gate dropped"))?;
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.lock().contains(key) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                format!("remote refused {key}"),
            ));
        }

        let contents = self.contents(key);
        tokio::fs::write(destination, &contents).await?;
        Ok(contents.len() as u64)
    }
}

impl RemoteStore for GeneratedStore {
    fn download<'a>(
        &'a self,
        key: &'a CacheKey,
        destination: &'a Path,
    ) -> BoxFuture<'a, io::Result<u64>> {
        self.generate(key, destination).boxed()
    }
}
