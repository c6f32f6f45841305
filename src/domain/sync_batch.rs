//! Sync batch records
//!
//! A batch aggregates one execution run. It owns the counts, not the changes:
//! staged changes keep their `batch_id` for audit after the batch is evicted
//! from memory.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{ItemErrorKind, ParseEnumError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    /// Every item succeeded or was skipped
    Completed,
    /// Every item was processed but some failed
    CompletedWithErrors,
    /// Aborted (deadline expired or engine error)
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::CompletedWithErrors,
        Self::Failed,
        Self::Cancelled,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Cancellation is only accepted before the batch settles
    pub const fn is_cancellable(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "completed_with_errors" => Ok(Self::CompletedWithErrors),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseEnumError::new("batch_status", other)),
        }
    }
}

/// Failure attributed to one item of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemError {
    /// Position in the submitted item list
    pub index: usize,
    pub item_id: String,
    pub kind: ItemErrorKind,
    pub message: String,
    pub attempts: u32,
}

/// Durable record of one batch run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBatch {
    pub batch_id: String,
    /// Free-form label ("apply_staged_changes", "validate_records", ...)
    pub operation: String,
    pub status: BatchStatus,
    pub total_items: usize,
    pub processed_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,
    pub skipped_items: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Items per second over the whole run
    pub processing_rate: f64,
    pub api_calls_made: u64,
    pub rate_limit_hits: u64,
    pub retry_attempts: u64,
    /// Capped list of item failures
    pub error_summary: Vec<BatchItemError>,
    pub error_message: Option<String>,
}

impl SyncBatch {
    /// Fresh pending record with a generated id
    pub fn new(operation: impl Into<String>, total_items: usize) -> Self {
        Self {
            batch_id: uuid::Uuid::new_v4().to_string(),
            operation: operation.into(),
            status: BatchStatus::Pending,
            total_items,
            processed_items: 0,
            successful_items: 0,
            failed_items: 0,
            skipped_items: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            processing_rate: 0.0,
            api_calls_made: 0,
            rate_limit_hits: 0,
            retry_attempts: 0,
            error_summary: Vec::new(),
            error_message: None,
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.processed_items == 0 {
            0.0
        } else {
            self.failed_items as f64 / self.processed_items as f64
        }
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        Some((completed - started).num_milliseconds() as f64 / 1000.0)
    }
}
