//! Children cache: a local mirror of the direct children of one path.
//!
//! The cache installs a children watch, seeds itself with a full read of the
//! existing children (that baseline is never reported), then reports every
//! later change as a [`ChildEvent`] on a backend-owned task. If the watch
//! breaks, the cache re-installs it with backoff and reports whatever changed
//! while it was gone. With a resync interval the cache also re-reads its
//! children periodically, which is the only way to notice nodes a store drops
//! without emitting a watch event.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::path;
use crate::retry::RetryPolicy;
use crate::store::{CoordinationStore, StoreEvent, WatchStream};

/// A child node as seen by the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildData {
    /// Full path of the child.
    pub path: String,
    /// Payload of the child.
    pub data: Bytes,
}

/// A change reported by a [`ChildrenCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent {
    /// A child appeared.
    Added(ChildData),
    /// A child's payload changed.
    Updated(ChildData),
    /// A child disappeared; carries the last payload seen.
    Removed(ChildData),
}

/// Callback invoked for every [`ChildEvent`].
pub type ChildHandler = Arc<dyn Fn(ChildEvent) + Send + Sync>;

/// Watched mirror of the children of one path.
pub struct ChildrenCache {
    path: String,
    current: Arc<RwLock<BTreeMap<String, Bytes>>>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ChildrenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildrenCache")
            .field("path", &self.path)
            .field("children", &self.current.read().len())
            .field("closed", &self.token.is_cancelled())
            .finish()
    }
}

impl ChildrenCache {
    pub(crate) async fn start(
        store: Arc<dyn CoordinationStore>,
        path: String,
        policy: RetryPolicy,
        resync_interval: Option<Duration>,
        handler: ChildHandler,
    ) -> StoreResult<Self> {
        // watch first so nothing created between the read and the watch is lost
        let stream = store.watch_children(&path).await?;
        let initial = read_children(&*store, &path).await?;
        debug!(path, children = initial.len(), "children cache initialized");

        let current = Arc::new(RwLock::new(initial));
        let token = CancellationToken::new();
        let watcher = Watcher {
            store,
            path: path.clone(),
            policy,
            resync_interval,
            handler,
            current: Arc::clone(&current),
            token: token.clone(),
        };
        let task = tokio::spawn(watcher.run(stream));
        Ok(Self {
            path,
            current,
            token,
            task: Mutex::new(Some(task)),
        })
    }

    /// Full path being watched.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current children, ordered by path.
    pub fn current_data(&self) -> Vec<ChildData> {
        self.current
            .read()
            .iter()
            .map(|(path, data)| ChildData {
                path: path.clone(),
                data: data.clone(),
            })
            .collect()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop watching and wait for the watch task to finish. Fails if the
    /// task died abnormally (e.g. a handler panicked).
    pub async fn close(&self) -> StoreResult<()> {
        self.token.cancel();
        let task = self.task.lock().take();
        match task {
            Some(task) => task.await.map_err(|e| {
                StoreError::Closed(format!("children cache for '{}' failed: {e}", self.path))
            }),
            None => Ok(()),
        }
    }
}

impl Drop for ChildrenCache {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Watcher {
    store: Arc<dyn CoordinationStore>,
    path: String,
    policy: RetryPolicy,
    resync_interval: Option<Duration>,
    handler: ChildHandler,
    current: Arc<RwLock<BTreeMap<String, Bytes>>>,
    token: CancellationToken,
}

impl Watcher {
    async fn run(self, mut stream: WatchStream) {
        let mut resync = self
            .resync_interval
            .filter(|period| !period.is_zero())
            .map(|period| {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });
        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => {
                    debug!(path = %self.path, "children cache closed");
                    return;
                }
                _ = next_resync(&mut resync) => {
                    if !self.refresh().await {
                        return;
                    }
                    continue;
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(event)) => self.apply(event),
                Some(Err(err)) => {
                    warn!(path = %self.path, error = %err, "children watch failed, resyncing");
                    match self.resync().await {
                        Some(fresh) => stream = fresh,
                        None => return,
                    }
                }
                None => {
                    warn!(path = %self.path, "children watch ended, resyncing");
                    match self.resync().await {
                        Some(fresh) => stream = fresh,
                        None => return,
                    }
                }
            }
        }
    }

    fn apply(&self, event: StoreEvent) {
        let change = match event {
            StoreEvent::Put { path, data } => {
                let previous = self.current.write().insert(path.clone(), data.clone());
                match previous {
                    None => ChildEvent::Added(ChildData { path, data }),
                    Some(old) if old != data => ChildEvent::Updated(ChildData { path, data }),
                    Some(_) => return,
                }
            }
            StoreEvent::Delete { path } => {
                let Some(data) = self.current.write().remove(&path) else {
                    return;
                };
                ChildEvent::Removed(ChildData { path, data })
            }
        };
        (self.handler)(change);
    }

    /// Re-read the children and report what the watch missed. `false` once
    /// the session is gone.
    async fn refresh(&self) -> bool {
        match read_children(&*self.store, &self.path).await {
            Ok(fresh) => {
                self.reconcile(fresh);
                true
            }
            Err(StoreError::Closed(reason)) => {
                warn!(path = %self.path, reason, "session closed, children cache stopping");
                false
            }
            Err(err) => {
                warn!(path = %self.path, error = %err, "periodic children resync failed");
                true
            }
        }
    }

    /// Re-install the watch, backing off between attempts. `None` once the
    /// cache is closed or the session is gone.
    async fn resync(&self) -> Option<WatchStream> {
        let mut attempt = 0u32;
        loop {
            let delay = self.policy.backoff(attempt);
            tokio::select! {
                _ = self.token.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.reopen().await {
                Ok((stream, fresh)) => {
                    self.reconcile(fresh);
                    info!(path = %self.path, attempt, "children watch re-established");
                    return Some(stream);
                }
                Err(StoreError::Closed(reason)) => {
                    warn!(path = %self.path, reason, "session closed, children cache stopping");
                    return None;
                }
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    warn!(path = %self.path, attempt, error = %err, "failed to re-establish children watch");
                }
            }
        }
    }

    async fn reopen(&self) -> StoreResult<(WatchStream, BTreeMap<String, Bytes>)> {
        let stream = self.store.watch_children(&self.path).await?;
        let fresh = read_children(&*self.store, &self.path).await?;
        Ok((stream, fresh))
    }

    fn reconcile(&self, fresh: BTreeMap<String, Bytes>) {
        let changes = {
            let mut current = self.current.write();
            let mut changes = Vec::new();
            for (path, data) in current.iter() {
                if !fresh.contains_key(path) {
                    changes.push(ChildEvent::Removed(ChildData {
                        path: path.clone(),
                        data: data.clone(),
                    }));
                }
            }
            for (path, data) in &fresh {
                let child = ChildData {
                    path: path.clone(),
                    data: data.clone(),
                };
                match current.get(path) {
                    None => changes.push(ChildEvent::Added(child)),
                    Some(old) if old != data => changes.push(ChildEvent::Updated(child)),
                    Some(_) => {}
                }
            }
            *current = fresh;
            changes
        };
        if !changes.is_empty() {
            debug!(path = %self.path, changes = changes.len(), "children cache reconciled");
        }
        for change in changes {
            (self.handler)(change);
        }
    }
}

async fn next_resync(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn read_children(
    store: &dyn CoordinationStore,
    path: &str,
) -> StoreResult<BTreeMap<String, Bytes>> {
    let mut children = BTreeMap::new();
    for name in store.children(path).await? {
        let child = path::join(path, &name);
        // gone between listing and reading
        if let Some(data) = store.get_data(&child).await? {
            children.insert(child, data);
        }
    }
    Ok(children)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tracing_test::traced_test;

    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::CreateMode;

    fn collector() -> (ChildHandler, mpsc::UnboundedReceiver<ChildEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: ChildHandler = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn test_baseline_is_not_reported() {
        let store = MemoryStore::new();
        let session: Arc<dyn CoordinationStore> = Arc::new(store.session());
        session
            .create("/svc/a", Bytes::from_static(b"a"), CreateMode::Ephemeral)
            .await
            .unwrap();

        let (handler, mut rx) = collector();
        let cache = ChildrenCache::start(
            Arc::clone(&session),
            "/svc".into(),
            RetryPolicy::default(),
            None,
            handler,
        )
        .await
        .unwrap();
        assert_eq!(cache.current_data().len(), 1);

        session
            .create("/svc/b", Bytes::from_static(b"b"), CreateMode::Ephemeral)
            .await
            .unwrap();
        session.delete("/svc/a").await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            ChildEvent::Added(ChildData {
                path: "/svc/b".into(),
                data: Bytes::from_static(b"b"),
            })
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ChildEvent::Removed(ChildData {
                path: "/svc/a".into(),
                data: Bytes::from_static(b"a"),
            })
        );
        cache.close().await.unwrap();
        assert!(cache.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_delivery() {
        let store = MemoryStore::new();
        let session: Arc<dyn CoordinationStore> = Arc::new(store.session());
        let (handler, mut rx) = collector();
        let cache = ChildrenCache::start(
            Arc::clone(&session),
            "/svc".into(),
            RetryPolicy::default(),
            None,
            handler,
        )
        .await
        .unwrap();
        cache.close().await.unwrap();

        session
            .create("/svc/late", Bytes::new(), CreateMode::Ephemeral)
            .await
            .unwrap();
        // the handler (and its sender) was dropped with the task
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_reconcile_reports_missed_changes() {
        let store = MemoryStore::new();
        let session: Arc<dyn CoordinationStore> = Arc::new(store.session());
        session
            .create("/svc/old", Bytes::from_static(b"o"), CreateMode::Persistent)
            .await
            .unwrap();
        let (handler, mut rx) = collector();
        let watcher = Watcher {
            store: Arc::clone(&session),
            path: "/svc".into(),
            policy: RetryPolicy::exponential(Duration::from_millis(10), 3),
            resync_interval: None,
            handler,
            current: Arc::new(RwLock::new(read_children(&*session, "/svc").await.unwrap())),
            token: CancellationToken::new(),
        };

        session.delete("/svc/old").await.unwrap();
        session
            .create("/svc/new", Bytes::from_static(b"n"), CreateMode::Persistent)
            .await
            .unwrap();

        assert!(watcher.resync().await.is_some());
        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort_by_key(|e| matches!(e, ChildEvent::Added(_)));
        assert!(matches!(&seen[0], ChildEvent::Removed(c) if c.path == "/svc/old"));
        assert!(matches!(&seen[1], ChildEvent::Added(c) if c.path == "/svc/new"));
        assert!(logs_contain("children watch re-established"));
        assert!(logs_contain("children cache reconciled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_resync_reports_silent_expiry() {
        let store = MemoryStore::new();
        store.set_silent_expiry(true);
        let peer = store.session();
        peer.create("/svc/peer", Bytes::from_static(b"p"), CreateMode::Ephemeral)
            .await
            .unwrap();

        let (handler, mut rx) = collector();
        let cache = ChildrenCache::start(
            Arc::new(store.session()),
            "/svc".into(),
            RetryPolicy::default(),
            Some(Duration::from_secs(5)),
            handler,
        )
        .await
        .unwrap();

        peer.expire();
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            ChildEvent::Removed(ChildData {
                path: "/svc/peer".into(),
                data: Bytes::from_static(b"p"),
            })
        );
        assert!(cache.current_data().is_empty());
        cache.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_expiry_goes_unnoticed_without_resync() {
        let store = MemoryStore::new();
        store.set_silent_expiry(true);
        let peer = store.session();
        peer.create("/svc/peer", Bytes::new(), CreateMode::Ephemeral)
            .await
            .unwrap();
        let (handler, mut rx) = collector();
        let cache = ChildrenCache::start(
            Arc::new(store.session()),
            "/svc".into(),
            RetryPolicy::default(),
            None,
            handler,
        )
        .await
        .unwrap();

        peer.expire();
        assert!(
            tokio::time::timeout(Duration::from_secs(60), rx.recv())
                .await
                .is_err()
        );
        assert_eq!(cache.current_data().len(), 1);
        cache.close().await.unwrap();
    }
}
