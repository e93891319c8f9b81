//! Coordination store backed by NATS JetStream KV.
//!
//! Node paths map onto KV keys one token per path segment, each segment
//! base64url-encoded so that `:` and other characters KV keys reject survive
//! the trip. Persistent nodes live in the configured bucket. Ephemeral nodes
//! live in a sibling `<bucket>-ephemeral` bucket whose `max_age` equals the
//! session timeout; the session keeps its own ephemerals alive by
//! re-publishing them, and deletes them on close.

use std::sync::Arc;
use std::time::Duration;

use async_nats::ConnectOptions;
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::path;
use crate::retry::RetryPolicy;
use crate::store::{CoordinationStore, CreateMode, StoreEvent, WatchStream};

/// Default connection timeout if not configured.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default session timeout if not configured.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Default KV bucket for persistent nodes.
pub const DEFAULT_BUCKET: &str = "naming";

/// Connection settings for [`NatsStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatsStoreConfig {
    /// Server URLs, e.g. `nats://127.0.0.1:4222`.
    pub servers: Vec<String>,
    /// Bucket holding persistent nodes.
    pub bucket: String,
    /// Timeout for a single connection attempt.
    pub connect_timeout: Duration,
    /// Lifetime of ephemeral nodes not refreshed by their session.
    pub session_timeout: Duration,
    /// Backoff applied to the initial connection.
    pub connect_retry: RetryPolicy,
}

impl NatsStoreConfig {
    /// Config with default timeouts for the given servers.
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers,
            bucket: DEFAULT_BUCKET.to_owned(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            connect_retry: RetryPolicy::default(),
        }
    }

    fn ephemeral_bucket(&self) -> String {
        format!("{}-ephemeral", self.bucket)
    }
}

/// A NATS client session acting as a coordination store.
pub struct NatsStore {
    nodes: kv::Store,
    ephemeral: kv::Store,
    owned: Arc<DashMap<String, Bytes>>,
    session: CancellationToken,
    servers: Vec<String>,
}

impl std::fmt::Debug for NatsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsStore")
            .field("servers", &self.servers)
            .field("owned_ephemerals", &self.owned.len())
            .finish_non_exhaustive()
    }
}

impl NatsStore {
    /// Connect, open (or create) both buckets and start the session
    /// keepalive. Initial connection attempts back off exponentially and give
    /// up after `connect_retry.max_retries` retries.
    pub async fn connect(config: NatsStoreConfig) -> StoreResult<Self> {
        if config.servers.is_empty() {
            return Err(StoreError::Config("no NATS servers configured".into()));
        }
        if config.session_timeout.is_zero() {
            return Err(StoreError::Config("session timeout must not be zero".into()));
        }
        info!(
            servers = ?config.servers,
            bucket = %config.bucket,
            max_retries = config.connect_retry.max_retries,
            "connecting to NATS coordination store"
        );

        let total_attempts = config.connect_retry.max_retries.saturating_add(1);
        let mut attempt = 0u32;
        let client = loop {
            let opts = ConnectOptions::new().connection_timeout(config.connect_timeout);
            match opts.connect(config.servers.clone()).await {
                Ok(client) => break client,
                Err(err) => {
                    attempt += 1;
                    if attempt >= total_attempts {
                        error!(
                            attempts = total_attempts,
                            error = %err,
                            "NATS connection failed after all retry attempts"
                        );
                        return Err(StoreError::Transport(format!(
                            "NATS connection failed after {total_attempts} attempt(s): {err}"
                        )));
                    }
                    let delay = config.connect_retry.backoff(attempt - 1);
                    warn!(
                        attempt,
                        total_attempts,
                        retry_in_ms = delay.as_millis(),
                        error = %err,
                        "NATS connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };
        info!(attempt = attempt + 1, "NATS connection established");

        let js = jetstream::new(client);
        let nodes = get_or_create_bucket(
            &js,
            kv::Config {
                bucket: config.bucket.clone(),
                history: 1,
                ..Default::default()
            },
        )
        .await?;
        let ephemeral = get_or_create_bucket(
            &js,
            kv::Config {
                bucket: config.ephemeral_bucket(),
                history: 1,
                max_age: config.session_timeout,
                ..Default::default()
            },
        )
        .await?;

        let store = Self {
            nodes,
            ephemeral,
            owned: Arc::new(DashMap::new()),
            session: CancellationToken::new(),
            servers: config.servers,
        };
        store.spawn_keepalive(config.session_timeout / 3);
        Ok(store)
    }

    fn spawn_keepalive(&self, period: Duration) {
        let store = self.ephemeral.clone();
        let owned = Arc::clone(&self.owned);
        let token = self.session.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("NATS session keepalive stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        let entries: Vec<(String, Bytes)> = owned
                            .iter()
                            .map(|e| (e.key().clone(), e.value().clone()))
                            .collect();
                        for (key, data) in entries {
                            if let Err(err) = store.put(&key, data).await {
                                warn!(key, error = %err, "failed to refresh ephemeral node");
                                continue;
                            }
                            // deleted while we were refreshing it
                            if !owned.contains_key(&key) {
                                if let Err(err) = store.delete(&key).await {
                                    warn!(
                                        key,
                                        error = %err,
                                        "failed to delete released ephemeral node"
                                    );
                                }
                            }
                        }
                    }
                }
            }
        });
    }

    fn check(&self) -> StoreResult<()> {
        if self.session.is_cancelled() {
            return Err(StoreError::Closed("NATS session is closed".into()));
        }
        Ok(())
    }

    async fn read(store: &kv::Store, key: &str) -> StoreResult<Option<Bytes>> {
        store
            .get(key.to_string())
            .await
            .map_err(|e| StoreError::Transport(format!("KV read failed for key '{key}': {e}")))
    }

    async fn child_keys(store: &kv::Store, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys = store
            .keys()
            .await
            .map_err(|e| StoreError::Transport(format!("failed to list KV keys: {e}")))?;
        let mut children = Vec::new();
        while let Some(key) = keys
            .try_next()
            .await
            .map_err(|e| StoreError::Transport(format!("failed reading KV keys: {e}")))?
        {
            if let Some(token) = direct_child(prefix, &key) {
                children.push(decode_segment(token)?);
            }
        }
        Ok(children)
    }

    async fn watch_bucket(store: &kv::Store, pattern: &str) -> StoreResult<WatchStream> {
        let watch = store.watch(pattern).await.map_err(|e| {
            StoreError::Transport(format!("failed to watch KV keys '{pattern}': {e}"))
        })?;
        let events = watch.map(|entry| -> StoreResult<StoreEvent> {
            let entry = entry
                .map_err(|e| StoreError::Transport(format!("KV watch failed: {e}")))?;
            let path = decode_key(&entry.key)?;
            Ok(match entry.operation {
                kv::Operation::Put => StoreEvent::Put {
                    path,
                    data: entry.value,
                },
                kv::Operation::Delete | kv::Operation::Purge => StoreEvent::Delete { path },
            })
        });
        Ok(Box::pin(events))
    }
}

#[async_trait]
impl CoordinationStore for NatsStore {
    async fn exists(&self, path: &str) -> StoreResult<bool> {
        Ok(self.get_data(path).await?.is_some())
    }

    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> StoreResult<()> {
        self.check()?;
        let key = encode_key(path)?;
        let store = match mode {
            CreateMode::Persistent => &self.nodes,
            CreateMode::Ephemeral => &self.ephemeral,
        };
        if let Err(err) = store.create(&key, data.clone()).await {
            if self.exists(path).await? {
                return Err(StoreError::NodeExists(path.to_owned()));
            }
            return Err(StoreError::Transport(format!(
                "KV create failed for key '{key}': {err}"
            )));
        }
        if mode == CreateMode::Ephemeral {
            self.owned.insert(key, data);
        }
        debug!(path, %mode, "created node");
        Ok(())
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        self.check()?;
        let key = encode_key(path)?;
        let store = if Self::read(&self.nodes, &key).await?.is_some() {
            &self.nodes
        } else if Self::read(&self.ephemeral, &key).await?.is_some() {
            self.owned.remove(&key);
            &self.ephemeral
        } else {
            return Err(StoreError::NoNode(path.to_owned()));
        };
        store
            .delete(&key)
            .await
            .map_err(|e| StoreError::Transport(format!("KV delete failed for key '{key}': {e}")))
    }

    async fn owns(&self, path: &str) -> StoreResult<bool> {
        self.check()?;
        Ok(self.owned.contains_key(&encode_key(path)?))
    }

    async fn get_data(&self, path: &str) -> StoreResult<Option<Bytes>> {
        self.check()?;
        let key = encode_key(path)?;
        match Self::read(&self.nodes, &key).await? {
            Some(data) => Ok(Some(data)),
            None => Self::read(&self.ephemeral, &key).await,
        }
    }

    async fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        self.check()?;
        let prefix = child_prefix(path)?;
        let mut children = Self::child_keys(&self.nodes, &prefix).await?;
        for child in Self::child_keys(&self.ephemeral, &prefix).await? {
            if !children.contains(&child) {
                children.push(child);
            }
        }
        Ok(children)
    }

    async fn watch_children(&self, path: &str) -> StoreResult<WatchStream> {
        self.check()?;
        let pattern = format!("{}*", child_prefix(path)?);
        let persistent = Self::watch_bucket(&self.nodes, &pattern).await?;
        let ephemeral = Self::watch_bucket(&self.ephemeral, &pattern).await?;
        Ok(Box::pin(futures::stream::select(persistent, ephemeral)))
    }

    async fn close(&self) {
        if self.session.is_cancelled() {
            return;
        }
        self.session.cancel();
        let keys: Vec<String> = self.owned.iter().map(|e| e.key().clone()).collect();
        self.owned.clear();
        for key in keys {
            if let Err(err) = self.ephemeral.delete(&key).await {
                warn!(key, error = %err, "failed to delete ephemeral node on close");
            }
        }
        info!(servers = ?self.servers, "NATS session closed");
    }
}

/// Get an existing KV bucket or create it if missing.
async fn get_or_create_bucket(
    js: &jetstream::Context,
    config: kv::Config,
) -> StoreResult<kv::Store> {
    let bucket = config.bucket.clone();
    match js.get_key_value(bucket.clone()).await {
        Ok(store) => Ok(store),
        Err(get_err) => {
            debug!(bucket, error = %get_err, "creating missing JetStream KV bucket");
            js.create_key_value(config).await.map_err(|create_err| {
                StoreError::Transport(format!(
                    "failed to create JetStream KV bucket '{bucket}': {create_err} (get error: {get_err})"
                ))
            })
        }
    }
}

fn encode_segment(segment: &str) -> String {
    URL_SAFE_NO_PAD.encode(segment)
}

fn decode_segment(token: &str) -> StoreResult<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|e| StoreError::Codec(format!("invalid key token '{token}': {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| StoreError::Codec(format!("key token '{token}' is not UTF-8: {e}")))
}

/// KV key for a node path.
fn encode_key(path: &str) -> StoreResult<String> {
    path::validate(path)?;
    let tokens: Vec<String> = path::segments(path).map(encode_segment).collect();
    if tokens.is_empty() {
        return Err(StoreError::Config("the root node cannot be stored".into()));
    }
    Ok(tokens.join("."))
}

/// Node path for a KV key.
fn decode_key(key: &str) -> StoreResult<String> {
    let mut path = String::new();
    for token in key.split('.') {
        path.push('/');
        path.push_str(&decode_segment(token)?);
    }
    Ok(path)
}

/// Key prefix shared by the direct children of `path`.
fn child_prefix(path: &str) -> StoreResult<String> {
    if path == path::ROOT {
        return Ok(String::new());
    }
    Ok(format!("{}.", encode_key(path)?))
}

fn direct_child<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?;
    (!rest.is_empty() && !rest.contains('.')).then_some(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_round_trip_keeps_colons() {
        let key = encode_key("/brpc/g:s:1/10.0.0.1:8080").unwrap();
        assert_eq!(key.split('.').count(), 3);
        assert!(
            key.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        );
        assert_eq!(decode_key(&key).unwrap(), "/brpc/g:s:1/10.0.0.1:8080");
    }

    #[test]
    fn test_root_is_not_a_key() {
        assert!(encode_key("/").is_err());
        assert_eq!(child_prefix("/").unwrap(), "");
    }

    #[test]
    fn test_direct_child_filter() {
        let prefix = child_prefix("/brpc/g:s:1").unwrap();
        let child = encode_key("/brpc/g:s:1/h:80").unwrap();
        let grandchild = encode_key("/brpc/g:s:1/h:80/x").unwrap();
        let sibling = encode_key("/brpc/g:s:2").unwrap();

        let token = direct_child(&prefix, &child).unwrap();
        assert_eq!(decode_segment(token).unwrap(), "h:80");
        assert!(direct_child(&prefix, &grandchild).is_none());
        assert!(direct_child(&prefix, &sibling).is_none());
    }

    #[test]
    fn test_config_defaults() {
        let config = NatsStoreConfig::new(vec!["nats://127.0.0.1:4222".into()]);
        assert_eq!(config.bucket, DEFAULT_BUCKET);
        assert_eq!(config.ephemeral_bucket(), "naming-ephemeral");
        assert_eq!(config.session_timeout, DEFAULT_SESSION_TIMEOUT);
    }

    #[tokio::test]
    async fn test_connect_without_servers_fails() {
        let err = NatsStore::connect(NatsStoreConfig::new(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[tokio::test]
    async fn test_connect_with_zero_session_timeout_fails() {
        let mut config = NatsStoreConfig::new(vec!["nats://127.0.0.1:4222".into()]);
        config.session_timeout = Duration::ZERO;
        let err = NatsStore::connect(config).await.unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }
}
