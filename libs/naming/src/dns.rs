//! Naming service observing membership through DNS.
//!
//! Every address the configured name resolves to is one endpoint on the
//! configured port. Nothing can be announced: register and unregister do
//! nothing. A backend watches a single name, so it supports one
//! subscription at a time.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use discovery::{DnsServiceDiscovery, HostResolver};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DnsSettings;
use crate::error::{DiscoveryError, DiscoveryResult, Operation};
use crate::metrics;
use crate::model::{Endpoint, RegisterInfo, SubscribeInfo};
use crate::service::{Listener, NamingService};
use crate::url::NamingUrl;

/// Naming service whose members are the addresses a host name resolves to.
///
/// Registration is a no-op. A single subscription re-resolves the name every
/// interval and reports the difference with the previous result.
#[derive(Debug)]
pub struct DnsNamingService {
    backend: String,
    interval: Duration,
    target: Arc<Target>,
    subscription: Mutex<Option<Subscription>>,
}

/// Name being watched and the last endpoints reported for it.
#[derive(Debug)]
struct Target {
    backend: String,
    host: String,
    port: u16,
    resolver: Arc<dyn HostResolver>,
    previous: RwLock<Vec<Endpoint>>,
}

#[derive(Debug)]
struct Subscription {
    info: SubscribeInfo,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl DnsNamingService {
    /// Build a service resolving through the system DNS configuration.
    pub fn from_url(url: &NamingUrl) -> DiscoveryResult<Self> {
        let backend = url.to_string();
        let settings = DnsSettings::from_url(url)?;
        let resolver =
            DnsServiceDiscovery::new().map_err(|e| DiscoveryError::connect(&backend, e))?;
        Ok(Self::with_resolver(backend, settings, Arc::new(resolver)))
    }

    /// Build a service over an explicit resolver.
    pub fn with_resolver(
        backend: String,
        settings: DnsSettings,
        resolver: Arc<dyn HostResolver>,
    ) -> Self {
        debug!(%backend, host = %settings.host, port = settings.port, "dns naming service created");
        Self {
            interval: settings.interval,
            target: Arc::new(Target {
                backend: backend.clone(),
                host: settings.host,
                port: settings.port,
                resolver,
                previous: RwLock::new(Vec::new()),
            }),
            backend,
            subscription: Mutex::new(None),
        }
    }

    /// `host:port` being resolved.
    pub fn host_port(&self) -> String {
        Endpoint::new(self.target.host.clone(), self.target.port).to_string()
    }

    /// Endpoints as of the latest successful refresh.
    pub fn last_endpoints(&self) -> Vec<Endpoint> {
        self.target.previous.read().clone()
    }

    /// Whether the refresh task is running.
    pub fn is_subscribed(&self) -> bool {
        self.subscription.lock().is_some()
    }

    async fn stop(&self) {
        let current = self.subscription.lock().take();
        if let Some(sub) = current {
            sub.token.cancel();
            if let Err(err) = sub.task.await {
                warn!(error = %err, "dns refresh task failed");
            }
            info!(path = %sub.info.path(), "dns subscription stopped");
        }
    }
}

impl Target {
    async fn resolve(&self) -> DiscoveryResult<Vec<Endpoint>> {
        let addrs = self.resolver.resolve(&self.host).await.map_err(|err| {
            metrics::NAMING_FAILURES
                .with_label_values(&[Operation::Lookup.as_str()])
                .inc();
            DiscoveryError::operation(&self.backend, Operation::Lookup, err)
        })?;
        let mut seen = HashSet::with_capacity(addrs.len());
        Ok(addrs
            .into_iter()
            .filter(|addr| seen.insert(*addr))
            .map(|addr| Endpoint::new(addr.to_string(), self.port))
            .collect())
    }

    /// Re-resolve and report the change since the previous refresh. A
    /// failed resolution reports nothing and keeps the previous snapshot.
    async fn refresh(&self, listener: &Listener) {
        let current = match self.resolve().await {
            Ok(current) => current,
            Err(err) => {
                warn!(host = %self.host, error = %err, "dns refresh failed");
                return;
            }
        };
        let (added, removed) = {
            let mut previous = self.previous.write();
            let changes = diff(&previous, &current);
            *previous = current;
            changes
        };
        if !added.is_empty() || !removed.is_empty() {
            debug!(host = %self.host, added = added.len(), removed = removed.len(), "dns membership changed");
        }
        let notify = || listener.notify(&added, &removed);
        if std::panic::catch_unwind(AssertUnwindSafe(notify)).is_err() {
            warn!(host = %self.host, "listener panicked");
            return;
        }
        metrics::NAMING_NOTIFICATIONS.inc();
    }
}

/// `(current - previous, previous - current)`, each in its source order.
pub fn diff(previous: &[Endpoint], current: &[Endpoint]) -> (Vec<Endpoint>, Vec<Endpoint>) {
    let before: HashSet<&Endpoint> = previous.iter().collect();
    let after: HashSet<&Endpoint> = current.iter().collect();
    let added = current
        .iter()
        .filter(|ep| !before.contains(ep))
        .cloned()
        .collect();
    let removed = previous
        .iter()
        .filter(|ep| !after.contains(ep))
        .cloned()
        .collect();
    (added, removed)
}

async fn run_refresh(
    target: Arc<Target>,
    listener: Listener,
    interval: Duration,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = target.refresh(&listener) => {}
        }
    }
    debug!(host = %target.host, "dns refresh stopped");
}

#[async_trait]
impl NamingService for DnsNamingService {
    /// Resolution failures are always returned.
    async fn lookup(&self, _info: &SubscribeInfo) -> DiscoveryResult<Vec<Endpoint>> {
        self.target.resolve().await
    }

    async fn subscribe(&self, info: &SubscribeInfo, listener: Listener) -> DiscoveryResult<()> {
        let mut current = self.subscription.lock();
        if let Some(existing) = current.as_ref() {
            if existing.info == *info {
                debug!(path = %info.path(), "already subscribed");
                return Ok(());
            }
            return Err(DiscoveryError::Config(format!(
                "{} already watches {}; one subscription per dns backend",
                self.backend,
                existing.info.path()
            )));
        }
        let token = CancellationToken::new();
        let task = tokio::spawn(run_refresh(
            Arc::clone(&self.target),
            listener,
            self.interval,
            token.clone(),
        ));
        *current = Some(Subscription {
            info: info.clone(),
            token,
            task,
        });
        info!(path = %info.path(), host = %self.target.host, interval = ?self.interval, "dns subscription started");
        Ok(())
    }

    async fn unsubscribe(&self, info: &SubscribeInfo) -> DiscoveryResult<()> {
        let matches = self
            .subscription
            .lock()
            .as_ref()
            .is_some_and(|sub| sub.info == *info);
        if matches {
            self.stop().await;
        } else {
            debug!(path = %info.path(), "not subscribed");
        }
        Ok(())
    }

    async fn register(&self, info: &RegisterInfo) -> DiscoveryResult<()> {
        debug!(path = %info.path(), "dns backend cannot register");
        Ok(())
    }

    async fn unregister(&self, info: &RegisterInfo) -> DiscoveryResult<()> {
        debug!(path = %info.path(), "dns backend cannot unregister");
        Ok(())
    }

    async fn close(&self) {
        self.stop().await;
        info!(backend = %self.backend, "naming service closed");
    }

    fn backend(&self) -> &str {
        &self.backend
    }
}

impl Drop for DnsNamingService {
    fn drop(&mut self) {
        if let Some(sub) = self.subscription.get_mut().take() {
            sub.token.cancel();
        }
    }
}
