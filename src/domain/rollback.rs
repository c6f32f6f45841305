//! Rollback records

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{EntitySnapshot, EntityType};
use super::errors::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Pending,
    Completed,
    /// Terminal; needs an operator
    Failed,
}

impl RollbackStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RollbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RollbackStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError::new("rollback_status", other)),
        }
    }
}

/// Compensating action for one applied change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRollback {
    pub rollback_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub staged_change_id: String,
    /// Version that preceded the applied change; `None` only for creates
    pub previous_version_id: Option<i64>,
    /// Payload that was (or will be) replayed
    pub rollback_data: Option<EntitySnapshot>,
    pub status: RollbackStatus,
    pub executed_by: String,
    pub reason: Option<String>,
    pub error_message: Option<String>,
    /// Version written for the reverted state
    pub restored_version_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncRollback {
    pub fn pending(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        staged_change_id: impl Into<String>,
        previous_version_id: Option<i64>,
        executed_by: impl Into<String>,
        reason: Option<String>,
    ) -> Self {
        Self {
            rollback_id: uuid::Uuid::new_v4().to_string(),
            entity_type,
            entity_id: entity_id.into(),
            staged_change_id: staged_change_id.into(),
            previous_version_id,
            rollback_data: None,
            status: RollbackStatus::Pending,
            executed_by: executed_by.into(),
            reason,
            error_message: None,
            restored_version_id: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn complete(&mut self, restored_version_id: i64) {
        self.status = RollbackStatus::Completed;
        self.restored_version_id = Some(restored_version_id);
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = RollbackStatus::Failed;
        self.error_message = Some(message.into());
        self.completed_at = Some(Utc::now());
    }
}
