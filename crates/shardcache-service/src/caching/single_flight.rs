use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::sync::Arc;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::Shared;
use parking_lot::Mutex;

use shardcache_store::CacheKey;

use crate::utils::defer;

use super::CacheError;

type LoadChannel<V> = Shared<oneshot::Receiver<Result<V, CacheError>>>;
type LoadMap<V> = Arc<Mutex<BTreeMap<CacheKey, LoadChannel<V>>>>;

/// Where a caller stands after asking for a key.
pub(crate) enum Flight<T, V> {
    /// The key was resident, no download needed.
    Resident(T),
    /// Another caller is already downloading the key.
    Joined(LoadChannel<V>),
    /// This caller started the download.
    Started(LoadChannel<V>),
}

/// Deduplicates concurrent downloads of the same key.
///
/// The map of in-flight downloads is guarded by one lock, which is only held to look up or install
/// a channel. Downloads run as independent tasks, so keys never wait on each other.
///
/// Every waiter receives a clone of the value `V` produced by the download. The last clone is
/// dropped once all waiters are done with it, or right away if nobody is waiting anymore.
pub(crate) struct SingleFlight<V> {
    in_flight: LoadMap<V>,
}

impl<V> Default for SingleFlight<V> {
    fn default() -> Self {
        Self {
            in_flight: Default::default(),
        }
    }
}

impl<V> SingleFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Joins the download of `key`, or starts it.
    ///
    /// `lookup` is called while holding the in-flight lock, so it either observes the admitted
    /// entry of a finished download, or a download that is still registered. It must not call back
    /// into this [`SingleFlight`].
    ///
    /// NOTE: This function is *not* `async`, because it eagerly spawns the download, even if the
    /// returned channel is never awaited.
    pub fn join_or_start<T, L, F, Fut>(&self, key: &CacheKey, lookup: L, load: F) -> Flight<T, V>
    where
        L: FnOnce() -> Option<T>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, CacheError>> + Send + 'static,
    {
        let (sender, channel) = {
            let mut in_flight = self.in_flight.lock();
            if let Some(channel) = in_flight.get(key) {
                return Flight::Joined(channel.clone());
            }
            if let Some(resident) = lookup() {
                return Flight::Resident(resident);
            }

            let (sender, receiver) = oneshot::channel();
            let channel = receiver.shared();
            let evicted = in_flight.insert(key.clone(), channel.clone());
            debug_assert!(evicted.is_none());
            (sender, channel)
        };

        let in_flight = self.in_flight.clone();
        let flight_key = key.clone();
        let remove_flight_token = defer(move || {
            in_flight.lock().remove(&flight_key);
        });

        let load = load();
        tokio::spawn(async move {
            let result = load.await;
            // Drop the token first to remove the flight from the map. This ensures that callers
            // either get a channel that will receive data, or find the admitted entry.
            drop(remove_flight_token);
            // Fails if every waiter went away, which drops the result right here.
            sender.send(result).ok();
        });

        Flight::Started(channel)
    }

    /// Waits for a download to finish.
    pub async fn wait(key: &CacheKey, channel: LoadChannel<V>) -> Result<V, CacheError> {
        channel.await.unwrap_or_else(|_canceled| {
            Err(CacheError::download_failed(
                key,
                io::Error::new(io::ErrorKind::Interrupted, "download task dropped"),
            ))
        })
    }

    /// Number of downloads currently running.
    pub fn len(&self) -> usize {
        self.in_flight.lock().len()
    }
}
