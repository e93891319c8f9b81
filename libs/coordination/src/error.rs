//! Error types for coordination-store operations.
//!
//! Variants mirror the failure classes a store client has to tell apart:
//! connection-level trouble that is worth retrying, and node-level answers
//! (missing, already present) that are not.

use thiserror::Error;

/// Top-level error type for the coordination crate.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection or transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation timed out waiting for the store.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The node addressed by the operation does not exist.
    #[error("no node: {0}")]
    NoNode(String),

    /// A node already exists at the path being created.
    #[error("node exists: {0}")]
    NodeExists(String),

    /// The client is not connected or its session was lost.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// Key or payload could not be encoded/decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Configuration error (e.g. invalid path or namespace).
    #[error("configuration error: {0}")]
    Config(String),

    /// The client, session or watch has been closed.
    #[error("closed: {0}")]
    Closed(String),
}

impl StoreError {
    /// Returns true if this error indicates a transient failure that may
    /// succeed on retry (transport, timeout, or lost connection).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Transport(_) | StoreError::Timeout(_) | StoreError::NotConnected(_)
        )
    }

    /// Returns true if the addressed node does not exist.
    pub fn is_no_node(&self) -> bool {
        matches!(self, StoreError::NoNode(_))
    }

    /// Returns true if the node being created already exists.
    pub fn is_node_exists(&self) -> bool {
        matches!(self, StoreError::NodeExists(_))
    }
}

/// Shorthand result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(StoreError::Transport("conn reset".into()).is_retryable());
        assert!(StoreError::Timeout("deadline exceeded".into()).is_retryable());
        assert!(StoreError::NotConnected("no session".into()).is_retryable());

        let missing = StoreError::NoNode("/a".into());
        assert!(!missing.is_retryable());
        assert!(missing.is_no_node());

        let exists = StoreError::NodeExists("/a".into());
        assert!(!exists.is_retryable());
        assert!(exists.is_node_exists());

        assert!(!StoreError::Codec("bad key".into()).is_retryable());
        assert!(!StoreError::Config("empty namespace".into()).is_retryable());
        assert!(!StoreError::Closed("client".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::NodeExists("/g:s:1/h:80".into());
        assert_eq!(format!("{err}"), "node exists: /g:s:1/h:80");
    }
}
