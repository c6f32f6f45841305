//! Staged changes and their review/application lifecycle
//!
//! Status machine:
//! `pending -> {approved, rejected}`, `approved -> applied`,
//! `applied -> rolled_back`. Nothing leaves `rejected` or `rolled_back`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::conflict::{ConflictResolution, ConflictSeverity};
use super::entity::{EntitySnapshot, EntityType, FieldMap};
use super::errors::{ParseEnumError, SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
    Restore,
    Merge,
}

impl ChangeType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Restore => "restore",
            Self::Merge => "merge",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "restore" => Ok(Self::Restore),
            "merge" => Ok(Self::Merge),
            other => Err(ParseEnumError::new("change_type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    LocalToRemote,
    RemoteToLocal,
    Bidirectional,
}

impl SyncDirection {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalToRemote => "local_to_remote",
            Self::RemoteToLocal => "remote_to_local",
            Self::Bidirectional => "bidirectional",
        }
    }
}

impl FromStr for SyncDirection {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local_to_remote" => Ok(Self::LocalToRemote),
            "remote_to_local" => Ok(Self::RemoteToLocal),
            "bidirectional" => Ok(Self::Bidirectional),
            other => Err(ParseEnumError::new("sync_direction", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Pending,
    Approved,
    Rejected,
    Applied,
    RolledBack,
}

impl ChangeStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Applied => "applied",
            Self::RolledBack => "rolled_back",
        }
    }

    /// Allowed edges of the lifecycle state machine
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Approved | Self::Rejected)
                | (Self::Approved, Self::Applied)
                | (Self::Applied, Self::RolledBack)
        )
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::RolledBack)
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "applied" => Ok(Self::Applied),
            "rolled_back" => Ok(Self::RolledBack),
            other => Err(ParseEnumError::new("change_status", other)),
        }
    }
}

/// Difference of one field between current and proposed data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

impl FieldChange {
    /// Numeric delta when both sides are numbers
    pub fn numeric_delta(&self) -> Option<(f64, f64)> {
        let old = self.old_value.as_ref()?.as_f64()?;
        let new = self.new_value.as_ref()?.as_f64()?;
        Some((old, new))
    }
}

/// Field-by-field diff of two field maps, in field-name order
pub fn diff_fields(current: Option<&FieldMap>, proposed: Option<&FieldMap>) -> Vec<FieldChange> {
    let empty = FieldMap::new();
    let current = current.unwrap_or(&empty);
    let proposed = proposed.unwrap_or(&empty);

    let fields: BTreeSet<&String> = current.keys().chain(proposed.keys()).collect();
    fields
        .into_iter()
        .filter_map(|field| {
            let old_value = current.get(field);
            let new_value = proposed.get(field);
            if old_value == new_value {
                return None;
            }
            Some(FieldChange {
                field: field.clone(),
                old_value: old_value.cloned(),
                new_value: new_value.cloned(),
            })
        })
        .collect()
}

/// Outcome of pushing a change to the remote platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationResult {
    pub success: bool,
    pub remote_id: Option<String>,
    pub version_id: Option<i64>,
    pub version_number: Option<i64>,
    pub message: Option<String>,
}

/// Proposed mutation of one product or category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedChange {
    pub change_id: String,
    pub entity_type: EntityType,
    /// `None` until a create has been applied
    pub entity_id: Option<String>,
    pub remote_id: Option<String>,
    pub change_type: ChangeType,
    pub sync_direction: SyncDirection,
    pub current_data: Option<EntitySnapshot>,
    pub proposed_data: Option<EntitySnapshot>,
    pub field_changes: Vec<FieldChange>,
    pub has_conflicts: bool,
    pub conflict_fields: Vec<String>,
    pub conflict_severity: Option<ConflictSeverity>,
    pub conflict_resolution: Option<ConflictResolution>,
    pub status: ChangeStatus,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub review_notes: Option<String>,
    pub auto_approved: bool,
    pub approval_rule_id: Option<i64>,
    pub applied_at: Option<DateTime<Utc>>,
    pub applied_by: Option<String>,
    pub application_result: Option<ApplicationResult>,
    /// Pre-change snapshot kept for reversal
    pub rollback_data: Option<EntitySnapshot>,
    /// Version that was current right before the change was applied
    pub previous_version_id: Option<i64>,
    pub batch_id: Option<String>,
    /// Lower runs first
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StagedChange {
    pub fn new(
        entity_type: EntityType,
        entity_id: Option<String>,
        change_type: ChangeType,
        sync_direction: SyncDirection,
        current_data: Option<EntitySnapshot>,
        proposed_data: Option<EntitySnapshot>,
    ) -> Self {
        let field_changes = diff_fields(
            current_data.as_ref().map(EntitySnapshot::to_fields).as_ref(),
            proposed_data.as_ref().map(EntitySnapshot::to_fields).as_ref(),
        );
        let now = Utc::now();

        Self {
            change_id: uuid::Uuid::new_v4().to_string(),
            entity_type,
            entity_id,
            remote_id: None,
            change_type,
            sync_direction,
            current_data,
            proposed_data,
            field_changes,
            has_conflicts: false,
            conflict_fields: Vec::new(),
            conflict_severity: None,
            conflict_resolution: None,
            status: ChangeStatus::Pending,
            reviewed_by: None,
            reviewed_at: None,
            review_notes: None,
            auto_approved: false,
            approval_rule_id: None,
            applied_at: None,
            applied_by: None,
            application_result: None,
            rollback_data: None,
            previous_version_id: None,
            batch_id: None,
            priority: 100,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, next: ChangeStatus) -> SyncResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(SyncError::InvalidTransition {
                change_id: self.change_id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Human approval
    pub fn approve(&mut self, reviewer: &str, notes: Option<String>) -> SyncResult<()> {
        self.transition(ChangeStatus::Approved)?;
        self.reviewed_by = Some(reviewer.to_string());
        self.reviewed_at = Some(Utc::now());
        self.review_notes = notes;
        Ok(())
    }

    /// Approval by a rule that tolerated this change
    pub fn auto_approve(&mut self, rule_id: Option<i64>) -> SyncResult<()> {
        self.transition(ChangeStatus::Approved)?;
        self.auto_approved = true;
        self.approval_rule_id = rule_id;
        Ok(())
    }

    pub fn reject(&mut self, reviewer: &str, notes: Option<String>) -> SyncResult<()> {
        self.transition(ChangeStatus::Rejected)?;
        self.reviewed_by = Some(reviewer.to_string());
        self.reviewed_at = Some(Utc::now());
        self.review_notes = notes;
        Ok(())
    }

    /// Conflicting changes need either a tolerant auto-approval or a reviewer
    pub fn ensure_conflicts_cleared(&self) -> SyncResult<()> {
        if self.has_conflicts && !self.auto_approved && self.reviewed_by.is_none() {
            return Err(SyncError::UnreviewedConflict {
                change_id: self.change_id.clone(),
                fields: self.conflict_fields.clone(),
            });
        }
        Ok(())
    }

    pub fn is_ready_to_apply(&self) -> bool {
        self.status == ChangeStatus::Approved && self.ensure_conflicts_cleared().is_ok()
    }

    /// Record a successful application
    pub fn mark_applied(
        &mut self,
        applied_by: &str,
        result: ApplicationResult,
        rollback_data: Option<EntitySnapshot>,
        previous_version_id: Option<i64>,
    ) -> SyncResult<()> {
        self.ensure_conflicts_cleared()?;
        self.transition(ChangeStatus::Applied)?;
        if let Some(remote_id) = &result.remote_id {
            self.remote_id = Some(remote_id.clone());
        }
        self.applied_at = Some(Utc::now());
        self.applied_by = Some(applied_by.to_string());
        self.application_result = Some(result);
        self.rollback_data = rollback_data;
        self.previous_version_id = previous_version_id;
        Ok(())
    }

    /// Remember a failed attempt without leaving `approved`
    pub fn record_failed_attempt(&mut self, message: String) {
        self.application_result = Some(ApplicationResult {
            success: false,
            remote_id: self.remote_id.clone(),
            version_id: None,
            version_number: None,
            message: Some(message),
        });
        self.updated_at = Utc::now();
    }

    pub fn mark_rolled_back(&mut self) -> SyncResult<()> {
        self.transition(ChangeStatus::RolledBack)
    }
}
