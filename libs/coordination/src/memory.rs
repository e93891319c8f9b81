//! In-process coordination store.
//!
//! [`MemoryStore`] holds one shared node tree; every [`MemorySession`]
//! handed out by [`MemoryStore::session`] behaves like an independent client
//! session against it, so ephemeral ownership, session expiry and watches
//! between "processes" can be exercised without a server.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::path;
use crate::store::{CoordinationStore, CreateMode, StoreEvent, WatchStream};

/// Capacity of the change feed shared by all watches.
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Node {
    data: Bytes,
    owner: Option<u64>,
}

#[derive(Debug)]
struct Shared {
    nodes: Mutex<BTreeMap<String, Node>>,
    events: broadcast::Sender<StoreEvent>,
    reachable: AtomicBool,
    silent_expiry: AtomicBool,
    next_session: AtomicU64,
}

/// Snapshot of a stored node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node payload.
    pub data: Bytes,
    /// Whether the node is owned by a session.
    pub ephemeral: bool,
}

/// Shared in-memory node tree.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                nodes: Mutex::new(BTreeMap::new()),
                events,
                reachable: AtomicBool::new(true),
                silent_expiry: AtomicBool::new(false),
                next_session: AtomicU64::new(1),
            }),
        }
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client session against this store.
    pub fn session(&self) -> MemorySession {
        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, "opened memory store session");
        MemorySession {
            shared: Arc::clone(&self.shared),
            id,
            open: AtomicBool::new(true),
        }
    }

    /// Simulate a partition: while unreachable every request from every
    /// session fails with a transport error. Watches already installed keep
    /// delivering.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    /// When set, expired sessions drop their ephemeral nodes without
    /// notifying watches, the way a KV bucket ages entries out. Watchers only
    /// learn about the removal by re-reading.
    pub fn set_silent_expiry(&self, silent: bool) {
        self.shared.silent_expiry.store(silent, Ordering::SeqCst);
    }

    /// Inspect the node at `path`.
    pub fn node(&self, path: &str) -> Option<NodeInfo> {
        self.shared.nodes.lock().get(path).map(|node| NodeInfo {
            data: node.data.clone(),
            ephemeral: node.owner.is_some(),
        })
    }

    /// All node paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.shared.nodes.lock().keys().cloned().collect()
    }
}

/// One client session against a [`MemoryStore`].
#[derive(Debug)]
pub struct MemorySession {
    shared: Arc<Shared>,
    id: u64,
    open: AtomicBool,
}

impl MemorySession {
    /// Session identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the session is still usable.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Expire the session as the server would after a missed heartbeat:
    /// every ephemeral node it owns is deleted and later requests fail.
    pub fn expire(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut nodes = self.shared.nodes.lock();
        let owned: Vec<String> = nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(self.id))
            .map(|(path, _)| path.clone())
            .collect();
        let silent = self.shared.silent_expiry.load(Ordering::SeqCst);
        for path in owned {
            nodes.remove(&path);
            if !silent {
                let _ = self.shared.events.send(StoreEvent::Delete { path });
            }
        }
        debug!(session = self.id, "memory store session expired");
    }

    fn check(&self) -> StoreResult<()> {
        if !self.is_open() {
            return Err(StoreError::Closed(format!("session {} is closed", self.id)));
        }
        if !self.shared.reachable.load(Ordering::SeqCst) {
            return Err(StoreError::Transport("memory store unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for MemorySession {
    async fn exists(&self, path: &str) -> StoreResult<bool> {
        self.check()?;
        Ok(self.shared.nodes.lock().contains_key(path))
    }

    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> StoreResult<()> {
        self.check()?;
        path::validate(path)?;
        let mut nodes = self.shared.nodes.lock();
        if nodes.contains_key(path) {
            return Err(StoreError::NodeExists(path.to_owned()));
        }
        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(self.id),
        };
        nodes.insert(
            path.to_owned(),
            Node {
                data: data.clone(),
                owner,
            },
        );
        let _ = self.shared.events.send(StoreEvent::Put {
            path: path.to_owned(),
            data,
        });
        Ok(())
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        self.check()?;
        let mut nodes = self.shared.nodes.lock();
        if nodes.remove(path).is_none() {
            return Err(StoreError::NoNode(path.to_owned()));
        }
        let _ = self.shared.events.send(StoreEvent::Delete {
            path: path.to_owned(),
        });
        Ok(())
    }

    async fn owns(&self, path: &str) -> StoreResult<bool> {
        self.check()?;
        Ok(self
            .shared
            .nodes
            .lock()
            .get(path)
            .is_some_and(|node| node.owner == Some(self.id)))
    }

    async fn get_data(&self, path: &str) -> StoreResult<Option<Bytes>> {
        self.check()?;
        Ok(self.shared.nodes.lock().get(path).map(|n| n.data.clone()))
    }

    async fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        self.check()?;
        let nodes = self.shared.nodes.lock();
        Ok(nodes
            .keys()
            .filter(|key| path::parent(key) == Some(path))
            .map(|key| path::name(key).to_owned())
            .collect())
    }

    async fn watch_children(&self, path: &str) -> StoreResult<WatchStream> {
        self.check()?;
        let rx = self.shared.events.subscribe();
        let parent = path.to_owned();
        let stream = futures::stream::unfold(Some(rx), move |rx| {
            let parent = parent.clone();
            async move {
                let mut rx = rx?;
                loop {
                    match rx.recv().await {
                        Ok(event) if path::parent(event.path()) == Some(parent.as_str()) => {
                            return Some((Ok(event), Some(rx)));
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(missed)) => {
                            let err = StoreError::Transport(format!(
                                "watch on '{parent}' lagged by {missed} events"
                            ));
                            return Some((Err(err), None));
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn close(&self) {
        self.expire();
    }
}
