//! Backend settings derived from a [`NamingUrl`].

use std::time::Duration;

use coordination::{NatsStoreConfig, RetryPolicy};

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::model::split_host_port;
use crate::url::*;

/// Settings of the coordination-store backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    /// `nats://host:port` server URLs.
    pub servers: Vec<String>,
    /// Namespace every path is rooted under.
    pub namespace: String,
    /// Key-value bucket holding persistent nodes.
    pub bucket: String,
    /// Timeout of a single connection attempt.
    pub connect_timeout: Duration,
    /// Lifetime of an instance whose process stopped refreshing it. Also the
    /// period at which watches re-read their children.
    pub session_timeout: Duration,
    /// Base delay of the connection retry policy.
    pub sleep_time: Duration,
    /// Attempts of the connection retry policy.
    pub max_try_times: u32,
    /// Period of the background retry driver.
    pub retry_interval: Duration,
}

impl StoreSettings {
    /// Read the settings of a `nats://` URL, filling in defaults.
    pub fn from_url(url: &NamingUrl) -> DiscoveryResult<Self> {
        if url.scheme() != Scheme::Nats {
            return Err(DiscoveryError::Config(format!(
                "'{url}' is not a coordination store url"
            )));
        }
        let servers: Vec<String> = url.hosts().map(|h| format!("nats://{h}")).collect();
        if servers.is_empty() {
            return Err(DiscoveryError::Config(format!("'{url}' names no servers")));
        }
        let namespace = match url.path().trim_matches('/') {
            "" => url.param(PATH_PREFIX).unwrap_or(DEFAULT_PATH_PREFIX).to_owned(),
            path => path.to_owned(),
        };
        Ok(Self {
            servers,
            namespace,
            bucket: url.param(BUCKET).unwrap_or(DEFAULT_BUCKET).to_owned(),
            connect_timeout: url
                .param_nonzero_millis(CONNECT_TIMEOUT_MS, DEFAULT_CONNECT_TIMEOUT_MS)?,
            session_timeout: url
                .param_nonzero_millis(SESSION_TIMEOUT_MS, DEFAULT_SESSION_TIMEOUT_MS)?,
            sleep_time: url.param_nonzero_millis(SLEEP_TIME_MS, DEFAULT_SLEEP_TIME_MS)?,
            max_try_times: url.param_u32(MAX_TRY_TIMES, DEFAULT_MAX_TRY_TIMES)?,
            retry_interval: url.param_nonzero_millis(INTERVAL, DEFAULT_INTERVAL_MS)?,
        })
    }

    /// Connection-level retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.sleep_time, self.max_try_times)
    }

    /// Connection settings of the NATS store.
    pub fn nats_config(&self) -> NatsStoreConfig {
        NatsStoreConfig {
            servers: self.servers.clone(),
            bucket: self.bucket.clone(),
            connect_timeout: self.connect_timeout,
            session_timeout: self.session_timeout,
            connect_retry: self.retry_policy(),
        }
    }
}

/// Settings of the DNS backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsSettings {
    /// Name to resolve.
    pub host: String,
    /// Port attached to every resolved address.
    pub port: u16,
    /// Refresh period of subscriptions.
    pub interval: Duration,
}

impl DnsSettings {
    /// Read the settings of a `dns://` URL. Exactly one host is allowed.
    pub fn from_url(url: &NamingUrl) -> DiscoveryResult<Self> {
        if url.scheme() != Scheme::Dns {
            return Err(DiscoveryError::Config(format!("'{url}' is not a dns url")));
        }
        let mut hosts = url.hosts();
        let (Some(authority), None) = (hosts.next(), hosts.next()) else {
            return Err(DiscoveryError::Config(format!(
                "'{url}' must name exactly one host"
            )));
        };
        let (host, port) = split_host_port(authority)?;
        Ok(Self {
            host: host.to_owned(),
            port: port.unwrap_or(DEFAULT_DNS_PORT),
            interval: url.param_nonzero_millis(INTERVAL, DEFAULT_INTERVAL_MS)?,
        })
    }
}
