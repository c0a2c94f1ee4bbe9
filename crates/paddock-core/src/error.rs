//! Error types for paddock-core.

use paddock_pve::PveError;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for paddock-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while pooling, provisioning or tearing down.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Acquire or release against a pool that was never initialized
    #[error("pool '{pool_id}' not found; known pools: [{}]", available.join(", "))]
    PoolNotFound {
        /// Requested pool
        pool_id: String,
        /// Pools that do exist
        available: Vec<String>,
    },

    /// The pool was cleared while the caller was waiting
    #[error("pool '{0}' was closed")]
    PoolClosed(String),

    /// Error from the control plane, verbatim
    #[error("control plane error: {0}")]
    Remote(#[from] PveError),

    /// A bounded wait ran past its deadline
    #[error("timed out after {after:?} waiting for {operation}")]
    Timeout {
        /// What was being waited on
        operation: String,
        /// The deadline that elapsed
        after: Duration,
    },

    /// Rejected network configuration
    #[error("invalid network configuration: {0}")]
    InvalidNetwork(String),

    /// Requested ranges overlap each other or an existing subnet
    #[error("Duplicate IP ranges found: {0}")]
    DuplicateRanges(String),

    /// Rejected VM specification
    #[error("invalid VM specification: {0}")]
    InvalidVm(String),

    /// No free namespace prefix could be found
    #[error("no free namespace for hint '{hint}' after {attempts} attempts")]
    NamespaceExhausted {
        /// Sanitised hint the candidates were derived from
        hint: String,
        /// Candidates tried
        attempts: usize,
    },

    /// A background task finished with a non-OK status
    #[error("task {upid} failed: {status}")]
    TaskFailed {
        /// Task identifier
        upid: String,
        /// Final status reported by the control plane
        status: String,
    },

    /// A polled operation reported a terminal failure
    #[error("{operation} failed: {message}")]
    Failed {
        /// What was being waited on
        operation: String,
        /// Why it failed
        message: String,
    },

    /// Teardown did not complete
    #[error("cleanup failed: {0}")]
    Cleanup(String),

    /// Bad or missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation exists but is deliberately unsupported
    #[error("{0} not implemented")]
    NotImplemented(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
