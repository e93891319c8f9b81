//! # discovery
//!
//! Hostname resolution for naming backends that observe membership through
//! DNS instead of announcing it.
#![warn(
    missing_debug_implementations,
    missing_docs,
    missing_copy_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
use std::net::IpAddr;

use async_trait::async_trait;
use hickory_resolver::config::ResolverOpts;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{Resolver, TokioResolver};
use thiserror::Error;
use tracing::debug;

/// Resolution failures
#[derive(Debug, Error)]
pub enum ResolveError {
    /// the system resolver configuration could not be loaded
    #[error("failed to create resolver: {0}")]
    Setup(#[source] hickory_resolver::ResolveError),
    /// the lookup itself failed
    #[error("failed to resolve {host}: {source}")]
    Lookup {
        /// host being resolved
        host: String,
        /// resolver error
        #[source]
        source: hickory_resolver::ResolveError,
    },
    /// the lookup succeeded but returned nothing
    #[error("no addresses found for {0}")]
    NoRecords(String),
}

/// Resolves a hostname to every address associated with it.
#[async_trait]
pub trait HostResolver: Send + Sync + std::fmt::Debug + 'static {
    /// Return all addresses for `host`, in resolver order. An IP literal
    /// resolves to itself.
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// DNS service discovery
#[derive(Debug)]
pub struct DnsServiceDiscovery {
    resolver: TokioResolver,
}

impl DnsServiceDiscovery {
    /// Create a new service from the system resolver configuration
    pub fn new() -> Result<Self, ResolveError> {
        Ok(Self {
            resolver: Resolver::builder(TokioConnectionProvider::default())
                .map_err(ResolveError::Setup)?
                .with_options(ResolverOpts::default())
                .build(),
        })
    }
}

#[async_trait]
impl HostResolver for DnsServiceDiscovery {
    /// do a DNS lookup (A and AAAA), returning every address
    /// ex.
    ///     resolve("foobar.internal") -> [1.2.3.4, 1.2.3.5]
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|source| ResolveError::Lookup {
                host: host.to_owned(),
                source,
            })?;
        let addrs: Vec<IpAddr> = lookup.iter().collect();
        debug!(host, count = addrs.len(), "resolved host");
        if addrs.is_empty() {
            return Err(ResolveError::NoRecords(host.to_owned()));
        }
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ip_literal_resolves_to_itself() {
        let dns = DnsServiceDiscovery::new().unwrap();
        let addrs = dns.resolve("127.0.0.1").await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
        let addrs = dns.resolve("::1").await.unwrap();
        assert_eq!(addrs, vec!["::1".parse::<IpAddr>().unwrap()]);
    }
}
