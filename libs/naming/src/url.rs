//! Naming URLs: `scheme://host[:port][,host[:port]...][/path][?k=v&...]`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DiscoveryError, DiscoveryResult};

/// Interval in milliseconds between background retry ticks, or between DNS
/// refreshes.
pub const INTERVAL: &str = "interval";
/// Default of [`INTERVAL`].
pub const DEFAULT_INTERVAL_MS: u64 = 5000;

/// Base delay in milliseconds of the store's connection retry policy.
pub const SLEEP_TIME_MS: &str = "sleepTimeMs";
/// Default of [`SLEEP_TIME_MS`].
pub const DEFAULT_SLEEP_TIME_MS: u64 = 1000;

/// Retry attempts of the store's connection retry policy.
pub const MAX_TRY_TIMES: &str = "maxTryTimes";
/// Default of [`MAX_TRY_TIMES`].
pub const DEFAULT_MAX_TRY_TIMES: u32 = 3;

/// Session timeout in milliseconds; ephemeral nodes outlive a dead client
/// by at most this long.
pub const SESSION_TIMEOUT_MS: &str = "sessionTimeoutMs";
/// Default of [`SESSION_TIMEOUT_MS`].
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 60_000;

/// Connect timeout in milliseconds.
pub const CONNECT_TIMEOUT_MS: &str = "connectTimeoutMs";
/// Default of [`CONNECT_TIMEOUT_MS`].
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1000;

/// Namespace every store path lives under, when the URL has no path.
pub const PATH_PREFIX: &str = "pathPrefix";
/// Default of [`PATH_PREFIX`].
pub const DEFAULT_PATH_PREFIX: &str = "brpc";

/// Key-value bucket backing the store.
pub const BUCKET: &str = "bucket";
/// Default of [`BUCKET`].
pub const DEFAULT_BUCKET: &str = "naming";

/// Port used for DNS results when the URL names none.
pub const DEFAULT_DNS_PORT: u16 = 80;

/// Naming backend selected by the URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Coordination store over NATS key-value.
    Nats,
    /// Periodic DNS resolution.
    Dns,
}

impl Scheme {
    /// Scheme as written in URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Nats => "nats",
            Scheme::Dns => "dns",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nats" => Ok(Scheme::Nats),
            "dns" => Ok(Scheme::Dns),
            other => Err(DiscoveryError::Config(format!(
                "unsupported naming scheme '{other}'"
            ))),
        }
    }
}

/// Parsed naming URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingUrl {
    scheme: Scheme,
    host_ports: String,
    path: String,
    params: BTreeMap<String, String>,
}

impl NamingUrl {
    /// Backend selected by the URL.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Authority part, e.g. `"a:4222,b:4222"`.
    pub fn host_ports(&self) -> &str {
        &self.host_ports
    }

    /// Individual `host[:port]` entries of the authority.
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.host_ports
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
    }

    /// Path, empty or starting with `/`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query parameter.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Numeric parameter, `default` when absent.
    pub fn param_u64(&self, key: &str, default: u64) -> DiscoveryResult<u64> {
        match self.param(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e| {
                DiscoveryError::Config(format!("invalid value '{raw}' for '{key}': {e}"))
            }),
        }
    }

    /// Numeric parameter, `default` when absent.
    pub fn param_u32(&self, key: &str, default: u32) -> DiscoveryResult<u32> {
        match self.param(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e| {
                DiscoveryError::Config(format!("invalid value '{raw}' for '{key}': {e}"))
            }),
        }
    }

    /// Millisecond parameter as a duration.
    pub fn param_millis(&self, key: &str, default: u64) -> DiscoveryResult<Duration> {
        self.param_u64(key, default).map(Duration::from_millis)
    }

    /// Millisecond parameter that must not be zero.
    pub fn param_nonzero_millis(&self, key: &str, default: u64) -> DiscoveryResult<Duration> {
        let value = self.param_millis(key, default)?;
        if value.is_zero() {
            return Err(DiscoveryError::Config(format!(
                "'{key}' must be greater than zero"
            )));
        }
        Ok(value)
    }
}

impl FromStr for NamingUrl {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| DiscoveryError::Config(format!("naming url '{s}' has no scheme")))?;
        let scheme = scheme.parse()?;
        let (rest, query) = rest.split_once('?').unwrap_or((rest, ""));
        let (host_ports, path) = match rest.find('/') {
            Some(i) => rest.split_at(i),
            None => (rest, ""),
        };
        if host_ports.is_empty() {
            return Err(DiscoveryError::Config(format!(
                "naming url '{s}' has no host"
            )));
        }
        let params = query
            .split('&')
            .filter(|kv| !kv.is_empty())
            .map(|kv| {
                let (k, v) = kv.split_once('=').unwrap_or((kv, ""));
                (k.to_owned(), v.to_owned())
            })
            .collect();
        Ok(Self {
            scheme,
            host_ports: host_ports.to_owned(),
            path: path.trim_end_matches('/').to_owned(),
            params,
        })
    }
}

impl fmt::Display for NamingUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.host_ports, self.path)?;
        for (i, (k, v)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{k}={v}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nats_url() {
        let url: NamingUrl = "nats://a:4222,b:4222/services?interval=100&maxTryTimes=5"
            .parse()
            .unwrap();
        assert_eq!(url.scheme(), Scheme::Nats);
        assert_eq!(url.hosts().collect::<Vec<_>>(), vec!["a:4222", "b:4222"]);
        assert_eq!(url.path(), "/services");
        assert_eq!(url.param_millis(INTERVAL, DEFAULT_INTERVAL_MS).unwrap(), Duration::from_millis(100));
        assert_eq!(url.param_u32(MAX_TRY_TIMES, DEFAULT_MAX_TRY_TIMES).unwrap(), 5);
        assert_eq!(url.param_u64(SLEEP_TIME_MS, DEFAULT_SLEEP_TIME_MS).unwrap(), 1000);
    }

    #[test]
    fn test_parse_dns_url() {
        let url: NamingUrl = "DNS://example.com:8080".parse().unwrap();
        assert_eq!(url.scheme(), Scheme::Dns);
        assert_eq!(url.host_ports(), "example.com:8080");
        assert_eq!(url.path(), "");
        assert_eq!(url.to_string(), "dns://example.com:8080");
    }

    #[test]
    fn test_rejects_bad_urls() {
        assert!("example.com".parse::<NamingUrl>().is_err());
        assert!("zk://a:2181".parse::<NamingUrl>().is_err());
        assert!("nats:///path".parse::<NamingUrl>().is_err());
        let url: NamingUrl = "nats://a?interval=soon".parse().unwrap();
        assert!(url.param_u64(INTERVAL, DEFAULT_INTERVAL_MS).is_err());
    }

    #[test]
    fn test_display_round_trips() {
        let raw = "nats://a:4222/brpc?bucket=b&interval=10";
        let url: NamingUrl = raw.parse().unwrap();
        assert_eq!(url.to_string(), raw);
        assert_eq!(url.to_string().parse::<NamingUrl>().unwrap(), url);
    }
}
