//! Abstract coordination-store interface.
//!
//! A store is a tree of nodes addressed by absolute paths. Nodes are either
//! persistent or ephemeral; ephemeral nodes belong to the session that
//! created them and disappear when that session ends. Watches report
//! changes to the direct children of a path.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::StoreResult;

/// Lifetime of a created node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreateMode {
    /// Outlives the creating session.
    Persistent,
    /// Removed when the creating session closes or expires.
    Ephemeral,
}

impl fmt::Display for CreateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreateMode::Persistent => write!(f, "persistent"),
            CreateMode::Ephemeral => write!(f, "ephemeral"),
        }
    }
}

/// A change to a direct child of a watched path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A child was created or its payload replaced.
    Put {
        /// Full path of the child.
        path: String,
        /// Current payload.
        data: Bytes,
    },
    /// A child was deleted.
    Delete {
        /// Full path of the child.
        path: String,
    },
}

impl StoreEvent {
    /// Full path of the child this event refers to.
    pub fn path(&self) -> &str {
        match self {
            StoreEvent::Put { path, .. } | StoreEvent::Delete { path } => path,
        }
    }
}

/// Stream of child events. An `Err` item or the end of the stream means the
/// watch is broken and has to be re-established.
pub type WatchStream = BoxStream<'static, StoreResult<StoreEvent>>;

/// Coordination store bound to one client session.
///
/// Implemented by [`crate::nats::NatsStore`] and
/// [`crate::memory::MemorySession`]. Paths passed in are absolute and already
/// namespaced; see [`crate::Client`] for the namespacing handle.
#[async_trait]
pub trait CoordinationStore: Send + Sync + fmt::Debug + 'static {
    /// Whether a node exists at `path`.
    async fn exists(&self, path: &str) -> StoreResult<bool>;

    /// Create a node. Fails with `NodeExists` if one is already present.
    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> StoreResult<()>;

    /// Delete a node. Fails with `NoNode` if it is absent.
    async fn delete(&self, path: &str) -> StoreResult<()>;

    /// Whether `path` is an ephemeral node created by this session.
    async fn owns(&self, path: &str) -> StoreResult<bool>;

    /// Payload of the node at `path`, `None` if absent.
    async fn get_data(&self, path: &str) -> StoreResult<Option<Bytes>>;

    /// Names of the direct children of `path`. A missing path has no children.
    async fn children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Watch the direct children of `path`. Only changes made after the
    /// watch is installed are reported.
    async fn watch_children(&self, path: &str) -> StoreResult<WatchStream>;

    /// End the session, removing every ephemeral node it owns.
    async fn close(&self);
}
