// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication node.
//!
//! Errors are categorized by their failure domain and carry enough context
//! to debug a misbehaving mesh without crashing it.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Store` | Yes | Underlying durable store failed a read/write |
//! | `Transport` | Yes | Peer unreachable, send failed |
//! | `Config` | No | Configuration invalid at construction |
//! | `Shutdown` | No | Operation attempted after close started |
//! | `Decrypt` | No | Envelope failed verification (wrong key or tampering) |
//! | `Resolver` | No | Custom conflict resolver failed |
//! | `Protocol` | No | Malformed or missing fields in a wire message |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Isolation Policy
//!
//! No inbound peer message may crash the node. Every inbound handler is
//! wrapped to log and drop on error. Local API errors propagate to the
//! caller unchanged; sync paths log `Store` errors and continue so one bad
//! record never halts anti-entropy.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur in the replication node.
///
/// Use [`is_retryable()`](Self::is_retryable) to check if the operation
/// should be retried.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Invalid or missing configuration.
    ///
    /// Occurs during node construction if config is malformed.
    /// Not retryable - fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shutdown in progress.
    ///
    /// Returned when operations are attempted during shutdown.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Envelope failed decryption or verification.
    ///
    /// Wrong master key, tampered ciphertext, tag, salt or iv, or missing
    /// envelope fields. The message is dropped; the node keeps running.
    #[error("Decrypt error: {0}")]
    Decrypt(String),

    /// Durable store failure.
    ///
    /// Propagated to API callers. Anti-entropy paths log and continue.
    #[error("Store error ({operation}): {message}")]
    Store { operation: String, message: String },

    /// A custom conflict resolver failed.
    ///
    /// The write pipeline falls back to vector-dominance resolution.
    #[error("Resolver error at {path}: {message}")]
    Resolver { path: String, message: String },

    /// Malformed or missing required fields in a wire message.
    ///
    /// The message is logged and dropped.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transport send failure.
    ///
    /// Delivery is best-effort; callers may retry or rely on anti-entropy.
    #[error("Transport error ({peer_id}): {message}")]
    Transport { peer_id: String, message: String },

    /// Unexpected internal error.
    ///
    /// Catch-all for errors that shouldn't happen.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a store error with operation context.
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a transport error for a peer.
    pub fn transport(peer_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            peer_id: peer_id.into(),
            message: message.into(),
        }
    }

    /// Create a resolver error for a path.
    pub fn resolver(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Resolver {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    ///
    /// Retryable errors indicate transient store or network issues.
    /// Non-retryable errors indicate bugs, bad configuration, or a peer
    /// holding the wrong key.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store { .. } => true,
            Self::Transport { .. } => true,
            Self::Config(_) => false,
            Self::Shutdown => false,
            Self::Decrypt(_) => false,
            Self::Resolver { .. } => false,
            Self::Protocol(_) => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(format!("JSON: {}", e))
    }
}

impl From<sqlx::Error> for ReplicationError {
    fn from(e: sqlx::Error) -> Self {
        Self::store("sqlite", e.to_string())
    }
}
