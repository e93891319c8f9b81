//! The naming service contract shared by every backend.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DiscoveryResult;
use crate::model::{Endpoint, RegisterInfo, SubscribeInfo};

/// Receives membership changes for a subscribed service.
///
/// Called from backend tasks; implementations should return quickly.
pub trait NotifyListener: Send + Sync + 'static {
    /// Report instances that joined and left. The two sets are disjoint.
    fn notify(&self, added: &[Endpoint], removed: &[Endpoint]);
}

impl<F> NotifyListener for F
where
    F: Fn(&[Endpoint], &[Endpoint]) + Send + Sync + 'static,
{
    fn notify(&self, added: &[Endpoint], removed: &[Endpoint]) {
        self(added, removed)
    }
}

impl fmt::Debug for dyn NotifyListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NotifyListener")
    }
}

/// Shared listener handle.
pub type Listener = Arc<dyn NotifyListener>;

/// Register, discover and watch service instances.
///
/// Failures of `register`, `unregister`, `subscribe` and `unsubscribe` honor
/// the request's `ignore_failure_policy`: when false the error is returned,
/// when true the call returns `Ok` and the request is retried in the
/// background until it succeeds or is superseded.
#[async_trait]
pub trait NamingService: Send + Sync + fmt::Debug + 'static {
    /// Current endpoints of a service. A service with no registered
    /// instances yields an empty list.
    async fn lookup(&self, info: &SubscribeInfo) -> DiscoveryResult<Vec<Endpoint>>;

    /// Start watching a service. A second subscribe for the same target is
    /// a no-op.
    async fn subscribe(&self, info: &SubscribeInfo, listener: Listener) -> DiscoveryResult<()>;

    /// Stop watching a service.
    async fn unsubscribe(&self, info: &SubscribeInfo) -> DiscoveryResult<()>;

    /// Announce an instance.
    async fn register(&self, info: &RegisterInfo) -> DiscoveryResult<()>;

    /// Withdraw an instance.
    async fn unregister(&self, info: &RegisterInfo) -> DiscoveryResult<()>;

    /// Stop background work and release the backend. Idempotent.
    async fn close(&self);

    /// Backend URL, for logs and errors.
    fn backend(&self) -> &str;
}
