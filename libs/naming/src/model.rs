//! Value types identifying service instances and subscription targets.
//!
//! A service is identified by `(group, service, version)`. Its instances
//! live under `/{group}:{service}:{version}`, one child per `{host}:{port}`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DiscoveryError;

/// Default service group.
pub const DEFAULT_GROUP: &str = "normal";

/// Default service version.
pub const DEFAULT_VERSION: &str = "1.0.0";

/// Network address of one service instance.
///
/// The JSON form `{"host":"10.0.0.1","port":8080}` is the payload stored for
/// every registered instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create an endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// JSON payload for this endpoint.
    pub fn encode(&self) -> Vec<u8> {
        // a struct of a string and an integer always serializes
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parse a JSON payload.
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = split_host_port(s)?;
        let port = port.ok_or_else(|| {
            DiscoveryError::Config(format!("endpoint '{s}' is missing a port"))
        })?;
        Ok(Self::new(host, port))
    }
}

/// Split `host[:port]`, accepting bracketed IPv6 literals.
pub(crate) fn split_host_port(s: &str) -> Result<(&str, Option<u16>), DiscoveryError> {
    let parse_port = |p: &str| {
        p.parse::<u16>()
            .map_err(|e| DiscoveryError::Config(format!("invalid port in '{s}': {e}")))
    };
    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| DiscoveryError::Config(format!("unterminated '[' in '{s}'")))?;
        match tail.strip_prefix(':') {
            Some(port) => (host, Some(parse_port(port)?)),
            None if tail.is_empty() => (host, None),
            None => return Err(DiscoveryError::Config(format!("invalid address '{s}'"))),
        }
    } else {
        match s.split_once(':') {
            Some((host, port)) => (host, Some(parse_port(port)?)),
            None => (s, None),
        }
    };
    if host.is_empty() {
        return Err(DiscoveryError::Config(format!("empty host in '{s}'")));
    }
    Ok((host, port))
}

fn service_path(group: &str, service: &str, version: &str) -> String {
    format!("/{group}:{service}:{version}")
}

/// One registrable service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegisterInfo {
    /// Service group.
    pub group: String,
    /// Service name.
    pub service: String,
    /// Service version.
    pub version: String,
    /// Instance host.
    pub host: String,
    /// Instance port.
    pub port: u16,
    /// Defer failures to the retry ledger instead of returning them.
    pub ignore_failure_policy: bool,
}

impl RegisterInfo {
    /// Instance of `service` in the default group and version.
    pub fn new(service: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            group: DEFAULT_GROUP.to_owned(),
            service: service.into(),
            version: DEFAULT_VERSION.to_owned(),
            host: host.into(),
            port,
            ignore_failure_policy: false,
        }
    }

    /// Set the group.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Set the version.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the failure policy.
    pub fn ignore_failure(mut self, ignore: bool) -> Self {
        self.ignore_failure_policy = ignore;
        self
    }

    /// Path of the service group node, `/{group}:{service}:{version}`.
    pub fn parent_path(&self) -> String {
        service_path(&self.group, &self.service, &self.version)
    }

    /// Path of the instance node, `/{group}:{service}:{version}/{host}:{port}`.
    pub fn path(&self) -> String {
        format!("{}/{}:{}", self.parent_path(), self.host, self.port)
    }

    /// Endpoint announced for this instance.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    /// Subscription target matching this instance's service.
    pub fn subscribe_info(&self) -> SubscribeInfo {
        SubscribeInfo {
            group: self.group.clone(),
            service: self.service.clone(),
            version: self.version.clone(),
            ignore_failure_policy: self.ignore_failure_policy,
        }
    }
}

/// One subscription target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscribeInfo {
    /// Service group.
    pub group: String,
    /// Service name.
    pub service: String,
    /// Service version.
    pub version: String,
    /// Defer failures to the retry ledger instead of returning them.
    pub ignore_failure_policy: bool,
}

impl SubscribeInfo {
    /// Target `service` in the default group and version.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            group: DEFAULT_GROUP.to_owned(),
            service: service.into(),
            version: DEFAULT_VERSION.to_owned(),
            ignore_failure_policy: false,
        }
    }

    /// Set the group.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Set the version.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the failure policy.
    pub fn ignore_failure(mut self, ignore: bool) -> Self {
        self.ignore_failure_policy = ignore;
        self
    }

    /// Path of the watched service group node.
    pub fn path(&self) -> String {
        service_path(&self.group, &self.service, &self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_paths() {
        let info = RegisterInfo::new("s", "h", 8080).group("g").version("1");
        assert_eq!(info.parent_path(), "/g:s:1");
        assert_eq!(info.path(), "/g:s:1/h:8080");
        assert_eq!(info.subscribe_info().path(), "/g:s:1");
    }

    #[test]
    fn test_endpoint_json() {
        let ep = Endpoint::new("h", 8080);
        assert_eq!(ep.encode(), br#"{"host":"h","port":8080}"#.to_vec());
        assert_eq!(Endpoint::decode(br#"{"port":81,"host":"x"}"#).unwrap(), Endpoint::new("x", 81));
        assert!(Endpoint::decode(b"not json").is_err());
        assert!(Endpoint::decode(br#"{"host":"x","port":70000}"#).is_err());
    }

    #[test]
    fn test_endpoint_parse_and_display() {
        let ep: Endpoint = "10.0.0.1:80".parse().unwrap();
        assert_eq!(ep, Endpoint::new("10.0.0.1", 80));
        let ep: Endpoint = "[::1]:8080".parse().unwrap();
        assert_eq!(ep.host(), "::1");
        assert_eq!(ep.to_string(), "[::1]:8080");
        assert!("host".parse::<Endpoint>().is_err());
        assert!("host:nope".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("a.b").unwrap(), ("a.b", None));
        assert_eq!(split_host_port("a.b:53").unwrap(), ("a.b", Some(53)));
        assert_eq!(split_host_port("[fe80::1]").unwrap(), ("fe80::1", None));
        assert!(split_host_port(":80").is_err());
    }
}
