//! Field-level conflict model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entity::FieldMap;
use super::errors::ParseEnumError;

/// How two values of the same field disagree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    ValueMismatch,
    TypeMismatch,
    MissingInTarget,
    MissingInSource,
    /// One side holds an explicit null, the other a value
    NullMismatch,
}

/// Ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ConflictSeverity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// One level up, saturating at critical
    #[must_use]
    pub const fn escalate(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

impl fmt::Display for ConflictSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictSeverity {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(ParseEnumError::new("conflict_severity", other)),
        }
    }
}

/// Deterministic rule for picking a value when two sides disagree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    PreferSource,
    PreferTarget,
    /// Side whose record carries the later `updated_at`
    PreferMostRecent,
    PreferNonNull,
    PreferLarger,
    PreferSmaller,
    /// Union of two JSON arrays, source order first
    UnionLists,
    Manual,
}

impl ResolutionStrategy {
    /// Confidence attached to a successful mechanical resolution
    pub const fn confidence(self) -> f64 {
        match self {
            Self::PreferNonNull => 0.95,
            Self::UnionLists => 0.9,
            Self::PreferMostRecent => 0.8,
            Self::PreferLarger | Self::PreferSmaller => 0.7,
            Self::PreferSource | Self::PreferTarget => 0.6,
            Self::Manual => 0.0,
        }
    }
}

/// Discrepancy on a single field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: String,
    pub conflict_type: ConflictType,
    pub source_value: Option<Value>,
    pub target_value: Option<Value>,
    pub severity: ConflictSeverity,
    pub auto_resolvable: bool,
    pub suggested_strategy: ResolutionStrategy,
    /// 0.0 ..= 1.0
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Open,
    Resolved,
}

/// How a conflict was settled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    /// `None` for manual resolutions that supply values directly
    pub strategy: Option<ResolutionStrategy>,
    /// Final value per conflicting field (absent key = field removed)
    pub resolved_values: FieldMap,
    pub notes: Option<String>,
}

/// Aggregate of all field conflicts between two snapshots of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_id: String,
    /// Value of the key field used to pair the two records
    pub record_key: String,
    pub change_id: Option<String>,
    pub field_conflicts: Vec<FieldConflict>,
    pub severity: ConflictSeverity,
    pub is_auto_resolvable: bool,
    pub status: ConflictStatus,
    pub resolution: Option<ConflictResolution>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub detected_at: DateTime<Utc>,
}

impl Conflict {
    /// Build the aggregate; severity and resolvability derive from the fields
    pub fn from_fields(record_key: String, field_conflicts: Vec<FieldConflict>) -> Self {
        let severity = field_conflicts
            .iter()
            .map(|c| c.severity)
            .max()
            .unwrap_or(ConflictSeverity::Low);
        let is_auto_resolvable = is_auto_resolvable(&field_conflicts);

        Self {
            conflict_id: uuid::Uuid::new_v4().to_string(),
            record_key,
            change_id: None,
            field_conflicts,
            severity,
            is_auto_resolvable,
            status: ConflictStatus::Open,
            resolution: None,
            resolved_by: None,
            resolved_at: None,
            detected_at: Utc::now(),
        }
    }

    pub fn conflicting_fields(&self) -> Vec<String> {
        self.field_conflicts.iter().map(|c| c.field.clone()).collect()
    }

    pub fn is_resolved(&self) -> bool {
        self.status == ConflictStatus::Resolved
    }
}

/// True iff every field conflict is individually auto-resolvable
pub fn is_auto_resolvable(field_conflicts: &[FieldConflict]) -> bool {
    field_conflicts.iter().all(|c| c.auto_resolvable)
}
