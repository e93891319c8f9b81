//! # naming
//!
//! Service registration and discovery for RPC clients and servers.
//!
//! Servers announce instances with [`NamingService::register`]; clients find
//! them with [`NamingService::lookup`] or watch them with
//! [`NamingService::subscribe`]. Two backends are provided, selected by the
//! scheme of a [`NamingUrl`]:
//!
//! - `nats://`: [`StoreNamingService`], instances are ephemeral nodes in a
//!   coordination store.
//! - `dns://`: [`DnsNamingService`], instances are the addresses a name
//!   resolves to.
//!
//! Requests flagged `ignore_failure_policy` never fail: failures are parked
//! in a [`RetryLedger`] and replayed by a [`RetryDriver`].
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::sync::Arc;

use tracing::info;

pub mod config;
pub mod dns;
pub mod error;
pub mod metrics;
pub mod model;
pub mod retry;
pub mod service;
pub mod store;
pub mod url;

pub use config::{DnsSettings, StoreSettings};
pub use dns::DnsNamingService;
pub use error::{DiscoveryError, DiscoveryResult, Operation};
pub use model::{DEFAULT_GROUP, DEFAULT_VERSION, Endpoint, RegisterInfo, SubscribeInfo};
pub use retry::{LedgerSizes, RetryDriver, RetryLedger, RetryStats, Retryable, retry_pending};
pub use service::{Listener, NamingService, NotifyListener};
pub use store::StoreNamingService;
pub use url::{NamingUrl, Scheme};

/// Create the naming service selected by `url`'s scheme.
///
/// ```no_run
/// # async fn run() -> naming::DiscoveryResult<()> {
/// let url = "nats://127.0.0.1:4222/brpc?interval=1000".parse()?;
/// let naming = naming::connect(&url).await?;
/// naming
///     .register(&naming::RegisterInfo::new("echo", "10.0.0.1", 8080))
///     .await?;
/// # Ok(())
/// # }
/// ```
pub async fn connect(url: &NamingUrl) -> DiscoveryResult<Arc<dyn NamingService>> {
    let service: Arc<dyn NamingService> = match url.scheme() {
        Scheme::Nats => StoreNamingService::connect(url).await?,
        Scheme::Dns => Arc::new(DnsNamingService::from_url(url)?),
    };
    info!(backend = %url, "naming service ready");
    Ok(service)
}
