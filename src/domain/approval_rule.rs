//! Declarative approval rules
//!
//! 규칙은 `priority` 오름차순(동률이면 id 순)으로 평가되며,
//! 처음으로 매칭되는 활성 규칙이 자동 승인 여부를 결정합니다.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::conflict::ConflictSeverity;
use super::entity::EntityType;
use super::errors::{ParseEnumError, SyncError};
use super::staged_change::{ChangeType, FieldChange, SyncDirection};

/// Who has to sign off when a rule demands review
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalLevel {
    None,
    Editor,
    Manager,
    Admin,
}

impl ApprovalLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Editor => "editor",
            Self::Manager => "manager",
            Self::Admin => "admin",
        }
    }
}

impl FromStr for ApprovalLevel {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "editor" => Ok(Self::Editor),
            "manager" => Ok(Self::Manager),
            "admin" => Ok(Self::Admin),
            other => Err(ParseEnumError::new("approval_level", other)),
        }
    }
}

impl fmt::Display for ApprovalLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compiled field-name globs (`inventory_*`, `*_price`, `*`)
///
/// `first_match` reports positions in the order the patterns were given,
/// so ordered rule lists keep "first match wins".
#[derive(Debug, Clone)]
pub struct FieldPatterns {
    set: GlobSet,
    /// Position in the caller's list for every compiled glob
    positions: Vec<usize>,
}

impl FieldPatterns {
    /// Every pattern must be a valid glob
    pub fn new<I, S>(patterns: I) -> Result<Self, SyncError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        let mut positions = Vec::new();
        for (position, pattern) in patterns.into_iter().enumerate() {
            let pattern = pattern.as_ref();
            let glob = Glob::new(pattern).map_err(|e| {
                SyncError::Validation(format!("invalid field pattern '{pattern}': {e}"))
            })?;
            builder.add(glob);
            positions.push(position);
        }
        let set = builder
            .build()
            .map_err(|e| SyncError::Validation(format!("invalid field patterns: {e}")))?;
        Ok(Self { set, positions })
    }

    /// Invalid patterns are logged and never match
    pub fn lenient<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        let mut positions = Vec::new();
        for (position, pattern) in patterns.into_iter().enumerate() {
            match Glob::new(pattern.as_ref()) {
                Ok(glob) => {
                    builder.add(glob);
                    positions.push(position);
                }
                Err(e) => warn!("Ignoring invalid field pattern '{}': {}", pattern.as_ref(), e),
            }
        }
        match builder.build() {
            Ok(set) => Self { set, positions },
            Err(e) => {
                warn!("Field patterns failed to compile: {}", e);
                Self {
                    set: GlobSet::empty(),
                    positions: Vec::new(),
                }
            }
        }
    }

    pub fn is_match(&self, field: &str) -> bool {
        self.set.is_match(field)
    }

    /// Position of the earliest pattern matching `field`
    pub fn first_match(&self, field: &str) -> Option<usize> {
        self.set
            .matches(field)
            .into_iter()
            .filter_map(|index| self.positions.get(index).copied())
            .min()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// One-off glob check; invalid patterns never match
pub fn field_matches(pattern: &str, field: &str) -> bool {
    Glob::new(pattern).is_ok_and(|glob| glob.compile_matcher().is_match(field))
}

/// Numeric guard on one field; trips when a change exceeds either limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueThreshold {
    /// Field name or glob (`price`, `inventory_*`)
    pub field: String,
    #[serde(default)]
    pub max_abs_change: Option<f64>,
    /// Percent of the old value (10.0 = 10%)
    #[serde(default)]
    pub max_pct_change: Option<f64>,
}

impl ValueThreshold {
    /// True when the change is larger than this threshold allows
    pub fn is_exceeded_by(&self, change: &FieldChange) -> bool {
        let Some((old, new)) = change.numeric_delta() else {
            // Non-numeric or added/removed values count as unbounded
            return change.old_value.is_some() || change.new_value.is_some();
        };

        let delta = (new - old).abs();
        if self.max_abs_change.is_some_and(|max| delta > max) {
            return true;
        }
        match self.max_pct_change {
            Some(_) if old == 0.0 => delta > 0.0,
            Some(max_pct) => delta / old.abs() * 100.0 > max_pct,
            None => false,
        }
    }
}

/// Conditions under which a matched rule lets a change skip review
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoApproveConditions {
    /// Highest conflict severity tolerated; `None` tolerates no conflicts
    #[serde(default)]
    pub max_conflict_severity: Option<ConflictSeverity>,
    #[serde(default)]
    pub max_field_changes: Option<usize>,
    /// Empty = any direction
    #[serde(default)]
    pub allowed_directions: Vec<SyncDirection>,
}

/// Persisted approval rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncApprovalRule {
    pub id: i64,
    pub name: String,
    /// `None` matches every entity type
    pub entity_type: Option<EntityType>,
    /// `None` matches every change type
    pub change_type: Option<ChangeType>,
    /// Globs over field names; empty matches any change
    pub field_patterns: Vec<String>,
    /// When non-empty the rule matches only if one threshold trips
    pub value_thresholds: Vec<ValueThreshold>,
    pub requires_approval: bool,
    pub auto_approve_conditions: AutoApproveConditions,
    pub approval_level: ApprovalLevel,
    pub priority: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewApprovalRule {
    pub name: String,
    #[serde(default)]
    pub entity_type: Option<EntityType>,
    #[serde(default)]
    pub change_type: Option<ChangeType>,
    #[serde(default)]
    pub field_patterns: Vec<String>,
    #[serde(default)]
    pub value_thresholds: Vec<ValueThreshold>,
    pub requires_approval: bool,
    #[serde(default)]
    pub auto_approve_conditions: AutoApproveConditions,
    pub approval_level: ApprovalLevel,
    pub priority: i32,
}

impl NewApprovalRule {
    pub fn new(name: impl Into<String>, requires_approval: bool, priority: i32) -> Self {
        Self {
            name: name.into(),
            entity_type: None,
            change_type: None,
            field_patterns: Vec::new(),
            value_thresholds: Vec::new(),
            requires_approval,
            auto_approve_conditions: AutoApproveConditions::default(),
            approval_level: if requires_approval {
                ApprovalLevel::Editor
            } else {
                ApprovalLevel::None
            },
            priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("price", "price", true)]
    #[case("price", "compare_at_price", false)]
    #[case("*_price", "compare_at_price", true)]
    #[case("inventory_*", "inventory_quantity", true)]
    #[case("inventory_*", "inventory", false)]
    #[case("*", "anything", true)]
    #[case("a*b*c", "aXXbYYc", true)]
    #[case("a*b*c", "aXXbYY", false)]
    fn test_field_matches(#[case] pattern: &str, #[case] field: &str, #[case] expected: bool) {
        assert_eq!(field_matches(pattern, field), expected);
    }

    #[test]
    fn test_first_match_follows_given_order() {
        let patterns = FieldPatterns::new(["*_price", "compare_*", "*"]).unwrap();
        assert_eq!(patterns.first_match("compare_at_price"), Some(0));
        assert_eq!(patterns.first_match("compare_note"), Some(1));
        assert_eq!(patterns.first_match("title"), Some(2));
        assert!(FieldPatterns::new(Vec::<String>::new()).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(matches!(
            FieldPatterns::new(["price", "inventory_[a"]),
            Err(SyncError::Validation(_))
        ));
        let lenient = FieldPatterns::lenient(["inventory_[a", "price"]);
        assert_eq!(lenient.first_match("price"), Some(1));
        assert!(!lenient.is_match("inventory_a"));
        assert!(!field_matches("inventory_[a", "inventory_a"));
    }

    fn price_change(old: f64, new: f64) -> FieldChange {
        FieldChange {
            field: "price".into(),
            old_value: Some(json!(old)),
            new_value: Some(json!(new)),
        }
    }

    #[test]
    fn test_threshold_trips_only_when_exceeded() {
        let threshold = ValueThreshold {
            field: "price".into(),
            max_abs_change: Some(5.0),
            max_pct_change: Some(10.0),
        };
        assert!(!threshold.is_exceeded_by(&price_change(100.0, 105.0)));
        assert!(threshold.is_exceeded_by(&price_change(100.0, 111.0)));
        assert!(threshold.is_exceeded_by(&price_change(20.0, 23.0)));
        assert!(threshold.is_exceeded_by(&price_change(0.0, 1.0)));
        assert!(threshold.is_exceeded_by(&FieldChange {
            field: "price".into(),
            old_value: None,
            new_value: Some(json!(9.0)),
        }));
    }
}
