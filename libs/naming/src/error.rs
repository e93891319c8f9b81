//! Errors reported by naming services.

use std::fmt;

use thiserror::Error;

/// Boxed backend error carried as the source of a [`DiscoveryError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Naming operation that can fail against a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// One-shot query of a service's instances.
    Lookup,
    /// Announce an instance.
    Register,
    /// Withdraw an instance.
    Unregister,
    /// Start watching a service.
    Subscribe,
    /// Stop watching a service.
    Unsubscribe,
}

impl Operation {
    /// Name used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Lookup => "lookup",
            Operation::Register => "register",
            Operation::Unregister => "unregister",
            Operation::Subscribe => "subscribe",
            Operation::Unsubscribe => "unsubscribe",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by naming services.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The backend could not be reached while constructing the service.
    #[error("failed to connect to {backend}: {source}")]
    Connect {
        /// Backend URL.
        backend: String,
        /// Underlying failure.
        #[source]
        source: BoxError,
    },

    /// A naming operation failed against the backend.
    #[error("failed to {operation} on {backend}: {source}")]
    Operation {
        /// Backend URL.
        backend: String,
        /// Operation that failed.
        operation: Operation,
        /// Underlying failure.
        #[source]
        source: BoxError,
    },

    /// A stored instance payload is not a valid endpoint.
    #[error("invalid endpoint payload at {path}: {source}")]
    Decode {
        /// Where the payload was read from.
        path: String,
        /// Parse failure.
        #[source]
        source: serde_json::Error,
    },

    /// Invalid naming URL or an unsupported request.
    #[error("configuration error: {0}")]
    Config(String),
}

impl DiscoveryError {
    /// A [`DiscoveryError::Connect`] for `backend`.
    pub fn connect(backend: &str, source: impl Into<BoxError>) -> Self {
        DiscoveryError::Connect {
            backend: backend.to_owned(),
            source: source.into(),
        }
    }

    /// A [`DiscoveryError::Operation`] for `backend`.
    pub fn operation(backend: &str, operation: Operation, source: impl Into<BoxError>) -> Self {
        DiscoveryError::Operation {
            backend: backend.to_owned(),
            operation,
            source: source.into(),
        }
    }

    /// Backend URL the error refers to, if any.
    pub fn backend(&self) -> Option<&str> {
        match self {
            DiscoveryError::Connect { backend, .. } | DiscoveryError::Operation { backend, .. } => {
                Some(backend)
            }
            _ => None,
        }
    }

    /// Failed operation, if the error came from one.
    pub fn failed_operation(&self) -> Option<Operation> {
        match self {
            DiscoveryError::Operation { operation, .. } => Some(*operation),
            _ => None,
        }
    }
}

/// Result type of naming operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
