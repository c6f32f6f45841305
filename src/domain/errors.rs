//! Error taxonomy for the synchronization engine
//!
//! Engine-level failures are [`SyncError`]; per-item failures inside a batch are
//! plain values ([`ItemError`]) so that one bad record never aborts its batch.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::infrastructure::remote_platform::RemoteError;

/// Errors surfaced by the staging, apply and rollback services
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid status transition for change {change_id}: {from} -> {to}")]
    InvalidTransition {
        change_id: String,
        from: String,
        to: String,
    },

    #[error("Change {change_id} has unresolved conflicts on [{}] and no reviewer", fields.join(", "))]
    UnreviewedConflict {
        change_id: String,
        fields: Vec<String>,
    },

    #[error("Missing version for {entity_type}/{entity_id}: {detail}")]
    MissingVersion {
        entity_type: String,
        entity_id: String,
        detail: String,
    },

    #[error("Rollback {rollback_id} failed: {message} (manual intervention required)")]
    RollbackFailed { rollback_id: String, message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Remote platform error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Batch error: {0}")]
    Batch(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<anyhow::Error> for SyncError {
    fn from(error: anyhow::Error) -> Self {
        Self::Storage(format!("{error:#}"))
    }
}

impl SyncError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Map an engine error onto the per-item taxonomy used by the batch engine
    pub fn to_item_error(&self) -> ItemError {
        match self {
            Self::Remote(remote) => remote.to_item_error(),
            other => ItemError::permanent(other.to_string()),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Per-item failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorKind {
    /// Timeouts, 5xx, dropped connections
    Transient,
    /// Remote throttling; retried with backoff honouring `retry_after`
    RateLimited,
    /// Schema or validation failures; never retried
    Permanent,
    /// Batch deadline expired before the item was attempted
    Timeout,
    /// Batch was cancelled while the item was waiting for a retry
    Cancelled,
}

impl ItemErrorKind {
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::Permanent => "permanent",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A failure attributed to a single batch item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub kind: ItemErrorKind,
    pub message: String,
    /// Remote hint for rate limited calls, in milliseconds
    pub retry_after_ms: Option<u64>,
}

impl ItemError {
    pub fn new(kind: ItemErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ItemErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ItemErrorKind::Permanent, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        Self {
            kind: ItemErrorKind::RateLimited,
            message: message.into(),
            retry_after_ms,
        }
    }
}

impl std::fmt::Display for ItemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind.as_str(), self.message)
    }
}

/// Returned when a stored enum label cannot be parsed back
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
