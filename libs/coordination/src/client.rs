//! Namespaced client handle over a [`CoordinationStore`].
//!
//! Every path handed to the client is relative to its namespace, every
//! request goes through the connection-level [`RetryPolicy`], and deletes can
//! be made "guaranteed": a delete that fails on a retryable error keeps being
//! retried in the background until the store acknowledges it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{ChildEvent, ChildrenCache};
use crate::error::{StoreError, StoreResult};
use crate::path;
use crate::retry::RetryPolicy;
use crate::store::{CoordinationStore, CreateMode};

/// Coordination client handle.
#[derive(Debug, Clone)]
pub struct Client {
    store: Arc<dyn CoordinationStore>,
    namespace: String,
    policy: RetryPolicy,
    resync_interval: Option<Duration>,
    closed: CancellationToken,
}

impl Client {
    /// Create a client rooted at `namespace` (`"brpc"` and `"/brpc"` are
    /// equivalent; empty means the store root).
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        namespace: &str,
        policy: RetryPolicy,
    ) -> StoreResult<Self> {
        let trimmed = namespace.trim_matches('/');
        let namespace = if trimmed.is_empty() {
            path::ROOT.to_owned()
        } else {
            format!("/{trimmed}")
        };
        path::validate(&namespace)?;
        Ok(Self {
            store,
            namespace,
            policy,
            resync_interval: None,
            closed: CancellationToken::new(),
        })
    }

    /// Make every [`ChildrenCache`] opened through this client re-read its
    /// children every `interval`, for stores whose ephemeral nodes can
    /// vanish without a watch event.
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = Some(interval);
        self
    }

    /// Namespace every path is resolved under.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Connection-level retry policy.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn resolve(&self, path: &str) -> StoreResult<String> {
        if self.is_closed() {
            return Err(StoreError::Closed("coordination client is closed".into()));
        }
        path::validate(path)?;
        Ok(match (self.namespace.as_str(), path) {
            (ns, path::ROOT) => ns.to_owned(),
            (path::ROOT, p) => p.to_owned(),
            (ns, p) => format!("{ns}{p}"),
        })
    }

    /// Whether a node exists.
    pub async fn exists(&self, path: &str) -> StoreResult<bool> {
        let full = self.resolve(path)?;
        let (store, target) = (&*self.store, full.as_str());
        self.policy
            .run("exists", move || store.exists(target))
            .await
    }

    /// Create a node.
    pub async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> StoreResult<()> {
        let full = self.resolve(path)?;
        let (store, target) = (&*self.store, full.as_str());
        self.policy
            .run("create", move || store.create(target, data.clone(), mode))
            .await
    }

    /// Delete a node.
    pub async fn delete(&self, path: &str) -> StoreResult<()> {
        let full = self.resolve(path)?;
        let (store, target) = (&*self.store, full.as_str());
        self.policy.run("delete", move || store.delete(target)).await
    }

    /// Delete a node; on a retryable failure keep retrying in the background
    /// until the delete is acknowledged, the node is gone, or the client is
    /// closed. The failure is still reported to the caller.
    pub async fn delete_guaranteed(&self, path: &str) -> StoreResult<()> {
        let full = self.resolve(path)?;
        let (store, target) = (&*self.store, full.as_str());
        match self.policy.run("delete", move || store.delete(target)).await {
            Err(err) if err.is_retryable() => {
                warn!(path = %full, error = %err, "delete failed, retrying in background");
                self.spawn_background_delete(full);
                Err(err)
            }
            other => other,
        }
    }

    fn spawn_background_delete(&self, full: String) {
        let store = Arc::clone(&self.store);
        let policy = self.policy;
        let closed = self.closed.clone();
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                tokio::select! {
                    _ = closed.cancelled() => {
                        debug!(path = %full, "client closed, abandoning guaranteed delete");
                        return;
                    }
                    _ = tokio::time::sleep(policy.backoff(attempt)) => {}
                }
                match store.delete(&full).await {
                    Ok(()) => {
                        info!(path = %full, "guaranteed delete acknowledged");
                        return;
                    }
                    Err(err) if err.is_no_node() => {
                        debug!(path = %full, "node already gone");
                        return;
                    }
                    Err(err) if err.is_retryable() => {
                        attempt = attempt.saturating_add(1);
                        debug!(path = %full, attempt, error = %err, "guaranteed delete still failing");
                    }
                    Err(err) => {
                        warn!(path = %full, error = %err, "guaranteed delete abandoned");
                        return;
                    }
                }
            }
        });
    }

    /// Whether the node is an ephemeral created by this client's session.
    pub async fn owns(&self, path: &str) -> StoreResult<bool> {
        let full = self.resolve(path)?;
        let (store, target) = (&*self.store, full.as_str());
        self.policy.run("owns", move || store.owns(target)).await
    }

    /// Payload of a node, `None` if absent.
    pub async fn get_data(&self, path: &str) -> StoreResult<Option<Bytes>> {
        let full = self.resolve(path)?;
        let (store, target) = (&*self.store, full.as_str());
        self.policy
            .run("get_data", move || store.get_data(target))
            .await
    }

    /// Names of the direct children of a node.
    pub async fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        let full = self.resolve(path)?;
        let (store, target) = (&*self.store, full.as_str());
        self.policy
            .run("children", move || store.children(target))
            .await
    }

    /// Start a [`ChildrenCache`] on `path`. Paths in the reported events are
    /// full store paths, namespace included.
    pub async fn children_cache<H>(&self, path: &str, handler: H) -> StoreResult<ChildrenCache>
    where
        H: Fn(ChildEvent) + Send + Sync + 'static,
    {
        let full = self.resolve(path)?;
        ChildrenCache::start(
            Arc::clone(&self.store),
            full,
            self.policy,
            self.resync_interval,
            Arc::new(handler),
        )
        .await
    }

    /// Close the client and its session. Ephemeral nodes created through it
    /// are removed; later requests fail with `Closed`.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.store.close().await;
        info!(namespace = %self.namespace, "coordination client closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::memory::MemoryStore;

    fn client(store: &MemoryStore, policy: RetryPolicy) -> Client {
        Client::new(Arc::new(store.session()), "brpc", policy).unwrap()
    }

    #[tokio::test]
    async fn test_paths_are_namespaced() {
        let store = MemoryStore::new();
        let client = client(&store, RetryPolicy::never());
        assert_eq!(client.namespace(), "/brpc");
        client
            .create("/g:s:1", Bytes::new(), CreateMode::Persistent)
            .await
            .unwrap();
        assert!(store.node("/brpc/g:s:1").is_some());
        assert_eq!(client.children("/").await.unwrap(), vec!["g:s:1"]);
    }

    #[tokio::test]
    async fn test_root_namespace() {
        let store = MemoryStore::new();
        let client = Client::new(Arc::new(store.session()), "", RetryPolicy::never()).unwrap();
        client
            .create("/a", Bytes::new(), CreateMode::Persistent)
            .await
            .unwrap();
        assert!(store.node("/a").is_some());
    }

    #[tokio::test]
    async fn test_invalid_path_rejected() {
        let store = MemoryStore::new();
        let client = client(&store, RetryPolicy::never());
        let err = client.exists("relative").await.unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guaranteed_delete_completes_in_background() {
        let store = MemoryStore::new();
        let client = client(&store, RetryPolicy::exponential(Duration::from_millis(50), 1));
        client
            .create("/x", Bytes::new(), CreateMode::Ephemeral)
            .await
            .unwrap();

        store.set_reachable(false);
        let err = client.delete_guaranteed("/x").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.node("/brpc/x").is_some());

        store.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(store.node("/brpc/x").is_none());
    }

    #[tokio::test]
    async fn test_close_removes_ephemerals() {
        let store = MemoryStore::new();
        let client = client(&store, RetryPolicy::never());
        client
            .create("/e", Bytes::new(), CreateMode::Ephemeral)
            .await
            .unwrap();
        client.close().await;
        assert!(client.is_closed());
        assert!(store.node("/brpc/e").is_none());
        assert!(matches!(
            client.exists("/e").await,
            Err(StoreError::Closed(_))
        ));
    }
}
