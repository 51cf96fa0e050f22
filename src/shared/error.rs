//! Shared Error Types
//!
//! This module defines the error taxonomy used by every layer of the offline
//! data layer: the local store, the sync queue, the flush engine, the resource
//! coordinator and the remote adapters.
//!
//! # Error Categories
//!
//! - `TransientNetwork` - the remote was unreachable or overloaded; retry via the queue
//! - `RemoteRejected` - validation or permission failure; surfaced, never retried
//! - `ResourceUploadFailed` - a single pending resource failed to upload
//! - `QueueExhausted` - a queued item ran out of attempts and needs a human decision
//! - `LocalStore` - the persistent local store itself failed
//!
//! # Usage
//!
//! ```rust
//! use stockpile::shared::error::SyncError;
//!
//! let error = SyncError::transient("connection reset");
//! assert!(error.is_retryable());
//! ```
use thiserror::Error;

use crate::shared::config::ConfigError;

/// Errors produced by the offline data layer
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The remote store or resource host could not be reached
    #[error("Transient network error: {message}")]
    TransientNetwork {
        /// Human-readable error message
        message: String,
    },

    /// The remote store refused the write (validation, permissions)
    #[error("Remote rejected the request: {message}")]
    RemoteRejected {
        /// Human-readable error message
        message: String,
    },

    /// A pending resource could not be uploaded
    #[error("Upload of resource {resource_id} failed: {message}")]
    ResourceUploadFailed {
        /// Resource that failed
        resource_id: String,
        /// Human-readable error message
        message: String,
    },

    /// A queued mutation exceeded its attempt budget
    #[error("Queue item {sequence} exhausted after {attempts} attempts")]
    QueueExhausted {
        /// Sequence number of the stuck item
        sequence: u64,
        /// Attempts made before giving up
        attempts: u32,
    },

    /// The persistent local store failed
    #[error("Local store error: {message}")]
    LocalStore {
        /// Human-readable error message
        message: String,
    },

    /// JSON serialization or deserialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Human-readable error message
        message: String,
    },

    /// Entity, resource or queue item does not exist
    #[error("Not found: {what}")]
    NotFound {
        /// Description of the missing thing
        what: String,
    },

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Config {
        /// Human-readable error message
        message: String,
    },
}

impl SyncError {
    /// Create a new transient network error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientNetwork {
            message: message.into(),
        }
    }

    /// Create a new remote rejection
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::RemoteRejected {
            message: message.into(),
        }
    }

    /// Create a new resource upload failure
    pub fn upload(resource_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceUploadFailed {
            resource_id: resource_id.into(),
            message: message.into(),
        }
    }

    /// Create a new local store error
    pub fn local_store(message: impl Into<String>) -> Self {
        Self::LocalStore {
            message: message.into(),
        }
    }

    /// Create a new not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Whether retrying the same request later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork { .. } | Self::ResourceUploadFailed { .. }
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: format!("JSON error: {}", err),
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        Self::local_store(err.to_string())
    }
}

impl From<ConfigError> for SyncError {
    fn from(err: ConfigError) -> Self {
        Self::Config {
            message: err.to_string(),
        }
    }
}

/// Result alias used across the crate
pub type SyncResult<T> = Result<T, SyncError>;
