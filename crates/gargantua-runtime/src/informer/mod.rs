//! Shared informers
//!
//! One [`Informer`] per kind owns the only watch on that kind. It keeps a
//! label-indexed [`Cache`] current and fans every change out to subscribers,
//! which turn events into work queue keys. A periodic resync replays the
//! whole cache as updates so that every object is reconciled at least once
//! per period even without changes.

mod cache;
mod cached_store;

pub use cache::Cache;
pub use cached_store::CachedStore;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use gargantua_common::labels::LabelSelector;
use gargantua_common::store::{ObjectStore, StoreObject, WatchEvent};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// First delay before re-establishing a failed watch
const MIN_REWATCH_DELAY: Duration = Duration::from_millis(100);
/// Longest delay before re-establishing a failed watch
const MAX_REWATCH_DELAY: Duration = Duration::from_secs(30);

/// A change to one cached object
#[derive(Debug)]
pub enum InformerEvent<K> {
    /// First sighting
    Added(Arc<K>),
    /// Changed, or replayed by a resync with `old` and `new` the same object
    Updated {
        /// Previously cached copy
        old: Arc<K>,
        /// Current copy
        new: Arc<K>,
    },
    /// Gone from the store
    Deleted(Arc<K>),
}

impl<K> Clone for InformerEvent<K> {
    fn clone(&self) -> Self {
        match self {
            Self::Added(o) => Self::Added(o.clone()),
            Self::Updated { old, new } => Self::Updated {
                old: old.clone(),
                new: new.clone(),
            },
            Self::Deleted(o) => Self::Deleted(o.clone()),
        }
    }
}

impl<K> InformerEvent<K> {
    /// The current object, or the last known copy for deletions
    pub fn object(&self) -> &Arc<K> {
        match self {
            Self::Added(o) | Self::Deleted(o) => o,
            Self::Updated { new, .. } => new,
        }
    }

    /// The copy cached before this event, if any
    pub fn previous(&self) -> Option<&Arc<K>> {
        match self {
            Self::Added(_) => None,
            Self::Updated { old, .. } => Some(old),
            Self::Deleted(o) => Some(o),
        }
    }
}

/// Watch-driven cache and event source for kind `K`
pub struct Informer<K: StoreObject> {
    namespace: String,
    store: Arc<dyn ObjectStore<K>>,
    resync_period: Option<Duration>,
    cache: Cache<K>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<InformerEvent<K>>>>,
    synced: watch::Sender<bool>,
}

impl<K: StoreObject> Informer<K> {
    /// Informer over every object of `store`
    ///
    /// `resync_period` of `None` disables resync.
    pub fn new(
        namespace: impl Into<String>,
        store: Arc<dyn ObjectStore<K>>,
        resync_period: Option<Duration>,
    ) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            namespace: namespace.into(),
            store,
            resync_period,
            cache: Cache::new(),
            subscribers: Mutex::new(Vec::new()),
            synced,
        }
    }

    /// The shared cache
    pub fn cache(&self) -> Cache<K> {
        self.cache.clone()
    }

    /// Store view that reads from the cache and writes to the backend
    pub fn cached_store(&self) -> CachedStore<K> {
        CachedStore::new(self.namespace.clone(), self.cache(), self.store.clone())
    }

    /// Receive every future event
    ///
    /// A late subscriber first gets the current contents as additions.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<InformerEvent<K>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock();
        for obj in self.cache.list() {
            let _ = tx.send(InformerEvent::Added(obj));
        }
        subscribers.push(tx);
        rx
    }

    /// True once the first snapshot has been cached
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until the first snapshot has been cached
    pub async fn wait_for_sync(&self) {
        let mut rx = self.synced.subscribe();
        // The sender lives in self, so this only fails if self is gone
        let _ = rx.wait_for(|synced| *synced).await;
    }

    /// Watch until `shutdown` fires, re-establishing the watch on errors
    ///
    /// Subscriber channels are closed on return.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let kind = K::kind(&());
        let mut resync = self
            .resync_period
            .filter(|p| !p.is_zero())
            .map(|p| tokio::time::interval_at(Instant::now() + p, p));
        let mut delay = MIN_REWATCH_DELAY;

        info!(kind = %kind, "starting informer");
        loop {
            let mut events = self.store.watch(&LabelSelector::everything());
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        self.close();
                        return;
                    }
                    _ = tick(&mut resync) => self.resync(),
                    next = events.next() => match next {
                        Some(Ok(event)) => {
                            delay = MIN_REWATCH_DELAY;
                            self.apply(event);
                        }
                        Some(Err(e)) => {
                            warn!(kind = %kind, error = %e, "watch failed, re-listing");
                            break;
                        }
                        None => {
                            debug!(kind = %kind, "watch ended, re-listing");
                            break;
                        }
                    },
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.close();
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(MAX_REWATCH_DELAY);
        }
    }

    fn apply(&self, event: WatchEvent<K>) {
        let mut subscribers = self.subscribers.lock();
        let events = match event {
            WatchEvent::Applied(obj) => vec![self.cache.insert(obj)],
            WatchEvent::Deleted(obj) => self.cache.remove(&obj).into_iter().collect(),
            WatchEvent::Restarted(objs) => {
                let events = self.cache.replace(objs);
                self.synced.send_replace(true);
                events
            }
        };
        for event in events {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn resync(&self) {
        let mut subscribers = self.subscribers.lock();
        let objects = self.cache.list();
        debug!(kind = %K::kind(&()), count = objects.len(), "resync");
        for obj in objects {
            let event = InformerEvent::Updated {
                old: obj.clone(),
                new: obj,
            };
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn close(&self) {
        self.subscribers.lock().clear();
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gargantua_common::crd::{Environment, EnvironmentSpec};
    use gargantua_common::store::{MemoryStore, StoreProvider};
    use kube::ResourceExt;

    fn environment(name: &str) -> Environment {
        Environment::new(name, EnvironmentSpec::default())
    }

    async fn next_name(rx: &mut mpsc::UnboundedReceiver<InformerEvent<Environment>>) -> String {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        event.object().name_any()
    }

    /// Story: an informer syncs the existing objects, then follows creates
    /// and deletes made through the backend
    #[tokio::test]
    async fn story_informer_follows_store() {
        let store = MemoryStore::new("hobbyfarm");
        let api = store.store::<Environment>();
        api.create(&environment("env-a")).await.unwrap();

        let informer = Arc::new(Informer::new("hobbyfarm", api.clone(), None));
        let mut rx = informer.subscribe();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(informer.clone().run(shutdown.clone()));

        informer.wait_for_sync().await;
        assert!(informer.has_synced());
        assert_eq!(next_name(&mut rx).await, "env-a");

        api.create(&environment("env-b")).await.unwrap();
        assert_eq!(next_name(&mut rx).await, "env-b");
        assert!(informer.cache().get("hobbyfarm", "env-b").is_some());

        api.delete("env-a", &Default::default()).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, InformerEvent::Deleted(_)));
        assert!(informer.cache().get("hobbyfarm", "env-a").is_none());

        shutdown.cancel();
        task.await.unwrap();
        assert!(rx.recv().await.is_none(), "channels close on shutdown");
    }

    /// Story: with nothing changing, a resync still replays every object
    #[tokio::test(start_paused = true)]
    async fn story_resync_replays_cache() {
        let store = MemoryStore::new("hobbyfarm");
        let api = store.store::<Environment>();
        api.create(&environment("env-a")).await.unwrap();

        let informer = Arc::new(Informer::new(
            "hobbyfarm",
            api,
            Some(Duration::from_secs(60)),
        ));
        let mut rx = informer.subscribe();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(informer.clone().run(shutdown.clone()));

        let added = rx.recv().await.unwrap();
        assert!(matches!(added, InformerEvent::Added(_)));

        tokio::time::advance(Duration::from_secs(61)).await;
        let replayed = rx.recv().await.unwrap();
        match replayed {
            InformerEvent::Updated { old, new } => assert!(Arc::ptr_eq(&old, &new)),
            other => panic!("expected resync update, got {other:?}"),
        }

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_snapshot() {
        let store = MemoryStore::new("hobbyfarm");
        let api = store.store::<Environment>();
        api.create(&environment("env-a")).await.unwrap();

        let informer = Arc::new(Informer::new("hobbyfarm", api, None));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(informer.clone().run(shutdown.clone()));
        informer.wait_for_sync().await;

        let mut rx = informer.subscribe();
        assert_eq!(next_name(&mut rx).await, "env-a");

        shutdown.cancel();
        task.await.unwrap();
    }
}
