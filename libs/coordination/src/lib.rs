//! # coordination
//!
//! Client handle for a consistent coordination store: a tree of persistent
//! and session-bound (ephemeral) nodes with children watches.
//!
//! This library provides:
//! - **[`CoordinationStore`]**, the session-level store interface.
//! - **[`NatsStore`]**, a store backed by NATS JetStream KV.
//! - **[`MemoryStore`]**, an in-process store whose sessions can be expired
//!   and partitioned at will.
//! - **[`Client`]**, the namespaced handle with connection-level retries and
//!   guaranteed deletes.
//! - **[`ChildrenCache`]**, a watched mirror of a node's children.
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod cache;
pub mod client;
pub mod error;
pub mod memory;
pub mod nats;
pub mod path;
pub mod retry;
pub mod store;

pub use cache::{ChildData, ChildEvent, ChildHandler, ChildrenCache};
pub use client::Client;
pub use error::{StoreError, StoreResult};
pub use memory::{MemorySession, MemoryStore, NodeInfo};
pub use nats::{NatsStore, NatsStoreConfig};
pub use retry::RetryPolicy;
pub use store::{CoordinationStore, CreateMode, StoreEvent, WatchStream};
