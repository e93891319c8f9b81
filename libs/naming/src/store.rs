//! Naming service backed by a hierarchical coordination store.
//!
//! Every instance is an ephemeral node
//! `{namespace}/{group}:{service}:{version}/{host}:{port}` holding the JSON
//! endpoint, under a persistent service node. Ephemeral nodes vanish with
//! the session that created them, so a crashed process drops out of the
//! membership once its session times out.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use coordination::{
    ChildEvent, ChildrenCache, Client, CoordinationStore, CreateMode, NatsStore, StoreError,
    StoreResult,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};

use crate::config::StoreSettings;
use crate::error::{DiscoveryError, DiscoveryResult, Operation};
use crate::metrics;
use crate::model::{Endpoint, RegisterInfo, SubscribeInfo};
use crate::retry::{RetryDriver, RetryLedger, Retryable};
use crate::service::{Listener, NamingService};
use crate::url::NamingUrl;

/// Naming service over a [`CoordinationStore`] session.
#[derive(Debug)]
pub struct StoreNamingService {
    backend: String,
    client: Client,
    ledger: RetryLedger,
    subscriptions: DashMap<SubscribeInfo, ChildrenCache>,
    driver: RetryDriver,
}

impl StoreNamingService {
    /// Connect to the NATS servers named by `url` and start the retry
    /// driver.
    pub async fn connect(url: &NamingUrl) -> DiscoveryResult<Arc<Self>> {
        let backend = url.to_string();
        let settings = StoreSettings::from_url(url)?;
        let store = NatsStore::connect(settings.nats_config())
            .await
            .map_err(|e| DiscoveryError::connect(&backend, e))?;
        info!(%backend, namespace = %settings.namespace, "connected to coordination store");
        Self::from_store(backend, Arc::new(store), &settings)
    }

    /// Build a service over an existing store session.
    pub fn from_store(
        backend: String,
        store: Arc<dyn CoordinationStore>,
        settings: &StoreSettings,
    ) -> DiscoveryResult<Arc<Self>> {
        // ephemeral nodes that time out may vanish without a watch event
        let client = Client::new(store, &settings.namespace, settings.retry_policy())
            .map_err(|e| DiscoveryError::Config(e.to_string()))?
            .with_resync_interval(settings.session_timeout);
        Ok(Self::with_client(backend, client, settings.retry_interval))
    }

    /// Build a service over `client`, retrying deferred requests every
    /// `retry_interval`. Must be called within a tokio runtime.
    pub fn with_client(backend: String, client: Client, retry_interval: Duration) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            backend,
            client,
            ledger: RetryLedger::new(),
            subscriptions: DashMap::new(),
            driver: RetryDriver::spawn(weak.clone(), retry_interval),
        })
    }

    /// Underlying coordination client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Whether a watch is installed for `info`.
    pub fn is_subscribed(&self, info: &SubscribeInfo) -> bool {
        self.subscriptions.contains_key(info)
    }

    /// Installed watches.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Map a store failure per the request's policy: returned when
    /// `ignore` is false, otherwise parked with `defer` and swallowed. A
    /// closed client is always reported.
    fn settle(
        &self,
        op: Operation,
        path: &str,
        err: StoreError,
        ignore: bool,
        defer: impl FnOnce() -> bool,
    ) -> DiscoveryResult<()> {
        metrics::NAMING_FAILURES
            .with_label_values(&[op.as_str()])
            .inc();
        let closed = matches!(err, StoreError::Closed(_));
        let err = DiscoveryError::operation(&self.backend, op, err);
        if !ignore || closed {
            return Err(err);
        }
        if defer() {
            metrics::NAMING_DEFERRED
                .with_label_values(&[op.as_str()])
                .inc();
        }
        warn!(%op, path, error = %err, "request failed, retrying in background");
        Ok(())
    }

    async fn create_instance(&self, info: &RegisterInfo) -> StoreResult<()> {
        let parent = info.parent_path();
        match self
            .client
            .create(&parent, Bytes::new(), CreateMode::Persistent)
            .await
        {
            Ok(()) => debug!(path = %parent, "created service node"),
            Err(err) if err.is_node_exists() => {}
            Err(err) => return Err(err),
        }
        let path = info.path();
        let payload = Bytes::from(info.endpoint().encode());
        match self
            .client
            .create(&path, payload, CreateMode::Ephemeral)
            .await
        {
            // a node left by a previous session has to expire before this
            // one can own it
            Err(err) if err.is_node_exists() => {
                if self.client.owns(&path).await? {
                    debug!(%path, "instance already registered");
                    return Ok(());
                }
                Err(err)
            }
            other => other,
        }
    }

    async fn delete_instance(&self, info: &RegisterInfo) -> StoreResult<()> {
        match self.client.delete_guaranteed(&info.path()).await {
            Err(err) if err.is_no_node() => Ok(()),
            other => other,
        }
    }

    async fn read_endpoints(&self, path: &str) -> StoreResult<Vec<Endpoint>> {
        let names = self.client.children(path).await?;
        let mut endpoints = Vec::with_capacity(names.len());
        for name in names {
            let child = format!("{path}/{name}");
            // removed between listing and reading
            let Some(data) = self.client.get_data(&child).await? else {
                continue;
            };
            match Endpoint::decode(&data) {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(err) => {
                    metrics::NAMING_DECODE_FAILURES.inc();
                    warn!(path = %child, error = %err, "skipping undecodable instance");
                }
            }
        }
        Ok(endpoints)
    }
}

/// Translate cache events into listener notifications. Payload updates
/// keep the instance's identity and are not reported.
fn dispatcher(listener: Listener) -> impl Fn(ChildEvent) + Send + Sync + 'static {
    move |event| {
        let (child, added) = match event {
            ChildEvent::Added(child) => (child, true),
            ChildEvent::Removed(child) => (child, false),
            ChildEvent::Updated(child) => {
                debug!(path = %child.path, "instance payload updated");
                return;
            }
        };
        let endpoint = match Endpoint::decode(&child.data) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                metrics::NAMING_DECODE_FAILURES.inc();
                warn!(path = %child.path, error = %err, "skipping undecodable instance");
                return;
            }
        };
        let changed = [endpoint];
        let notify = || {
            if added {
                listener.notify(&changed, &[]);
            } else {
                listener.notify(&[], &changed);
            }
        };
        if std::panic::catch_unwind(AssertUnwindSafe(notify)).is_err() {
            warn!(path = %child.path, "listener panicked");
            return;
        }
        metrics::NAMING_NOTIFICATIONS.inc();
    }
}

#[async_trait]
impl NamingService for StoreNamingService {
    async fn lookup(&self, info: &SubscribeInfo) -> DiscoveryResult<Vec<Endpoint>> {
        let path = info.path();
        let err = match self.read_endpoints(&path).await {
            Ok(endpoints) => return Ok(endpoints),
            Err(err) => err,
        };
        metrics::NAMING_FAILURES
            .with_label_values(&[Operation::Lookup.as_str()])
            .inc();
        let err = DiscoveryError::operation(&self.backend, Operation::Lookup, err);
        if info.ignore_failure_policy {
            warn!(%path, error = %err, "lookup failed, reporting no endpoints");
            return Ok(Vec::new());
        }
        Err(err)
    }

    async fn subscribe(&self, info: &SubscribeInfo, listener: Listener) -> DiscoveryResult<()> {
        let path = info.path();
        if self.subscriptions.contains_key(info) {
            self.ledger.clear_subscribe(info);
            debug!(%path, "already subscribed");
            return Ok(());
        }
        let cache = match self
            .client
            .children_cache(&path, dispatcher(Arc::clone(&listener)))
            .await
        {
            Ok(cache) => cache,
            Err(err) => {
                return self.settle(Operation::Subscribe, &path, err, info.ignore_failure_policy, || {
                    self.ledger.defer_subscribe(info.clone(), listener)
                });
            }
        };
        // lost a race with a concurrent subscribe for the same target
        let duplicate = match self.subscriptions.entry(info.clone()) {
            Entry::Occupied(_) => Some(cache),
            Entry::Vacant(slot) => {
                slot.insert(cache);
                None
            }
        };
        if let Some(cache) = duplicate {
            debug!(%path, "concurrent subscribe won, closing duplicate watch");
            if let Err(err) = cache.close().await {
                warn!(%path, error = %err, "failed to close duplicate watch");
            }
        }
        self.ledger.clear_subscribe(info);
        self.ledger.clear_unsubscribe(info);
        info!(%path, "subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, info: &SubscribeInfo) -> DiscoveryResult<()> {
        let path = info.path();
        self.ledger.clear_subscribe(info);
        let Some((_, cache)) = self.subscriptions.remove(info) else {
            self.ledger.clear_unsubscribe(info);
            debug!(%path, "not subscribed");
            return Ok(());
        };
        match cache.close().await {
            Ok(()) => {
                self.ledger.clear_unsubscribe(info);
                info!(%path, "unsubscribed");
                Ok(())
            }
            Err(err) => {
                self.settle(Operation::Unsubscribe, &path, err, info.ignore_failure_policy, || {
                    self.ledger.defer_unsubscribe(info.clone())
                })
            }
        }
    }

    async fn register(&self, info: &RegisterInfo) -> DiscoveryResult<()> {
        let path = info.path();
        match self.create_instance(info).await {
            Ok(()) => {
                self.ledger.clear_register(info);
                self.ledger.clear_unregister(info);
                info!(%path, "registered");
                Ok(())
            }
            Err(err) => self.settle(Operation::Register, &path, err, info.ignore_failure_policy, || {
                self.ledger.defer_register(info.clone())
            }),
        }
    }

    async fn unregister(&self, info: &RegisterInfo) -> DiscoveryResult<()> {
        let path = info.path();
        match self.delete_instance(info).await {
            Ok(()) => {
                self.ledger.clear_unregister(info);
                self.ledger.clear_register(info);
                info!(%path, "unregistered");
                Ok(())
            }
            Err(err) => {
                self.settle(Operation::Unregister, &path, err, info.ignore_failure_policy, || {
                    self.ledger.defer_unregister(info.clone())
                })
            }
        }
    }

    async fn close(&self) {
        self.driver.stop().await;
        let targets: Vec<SubscribeInfo> = self
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for info in targets {
            if let Some((_, cache)) = self.subscriptions.remove(&info) {
                if let Err(err) = cache.close().await {
                    warn!(path = %info.path(), error = %err, "failed to close watch");
                }
            }
        }
        self.ledger.clear();
        self.client.close().await;
        info!(backend = %self.backend, "naming service closed");
    }

    fn backend(&self) -> &str {
        &self.backend
    }
}

impl Retryable for StoreNamingService {
    fn ledger(&self) -> &RetryLedger {
        &self.ledger
    }
}
