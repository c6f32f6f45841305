//! Approval rule engine
//!
//! 활성 규칙을 우선순위 순으로 평가하여 변경이 자동 적용될 수 있는지,
//! 혹은 검토를 기다려야 하는지 결정합니다. 일치하는 규칙이 없으면 수동 검토입니다.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::domain::approval_rule::{
    ApprovalLevel, FieldPatterns, NewApprovalRule, SyncApprovalRule, field_matches,
};
use crate::domain::errors::{SyncError, SyncResult};
use crate::domain::repositories::ApprovalRuleRepository;
use crate::domain::staged_change::StagedChange;

/// What the rule set says about one change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    AutoApprove {
        rule_id: i64,
    },
    RequiresReview {
        rule_id: Option<i64>,
        level: ApprovalLevel,
        reason: String,
    },
}

impl ApprovalDecision {
    pub fn is_auto_approved(&self) -> bool {
        matches!(self, Self::AutoApprove { .. })
    }
}

/// Does `rule` apply to `change` at all
pub fn rule_matches(rule: &SyncApprovalRule, change: &StagedChange) -> bool {
    if !rule.is_active {
        return false;
    }
    if rule.entity_type.is_some_and(|t| t != change.entity_type) {
        return false;
    }
    if rule.change_type.is_some_and(|t| t != change.change_type) {
        return false;
    }

    let touches_patterns = rule.field_patterns.is_empty()
        || match FieldPatterns::new(&rule.field_patterns) {
            Ok(patterns) => change.field_changes.iter().any(|fc| patterns.is_match(&fc.field)),
            Err(e) => {
                warn!("Approval rule {} skipped: {}", rule.id, e);
                false
            }
        };
    if !touches_patterns {
        return false;
    }

    rule.value_thresholds.is_empty()
        || rule.value_thresholds.iter().any(|threshold| {
            change
                .field_changes
                .iter()
                .filter(|fc| field_matches(&threshold.field, &fc.field))
                .any(|fc| threshold.is_exceeded_by(fc))
        })
}

/// Why a matched, non-blocking rule still cannot auto-approve
fn unmet_condition(rule: &SyncApprovalRule, change: &StagedChange) -> Option<String> {
    let conditions = &rule.auto_approve_conditions;

    if change.has_conflicts {
        match (conditions.max_conflict_severity, change.conflict_severity) {
            (None, _) => return Some("rule tolerates no conflicts".to_string()),
            (Some(max), Some(actual)) if actual > max => {
                return Some(format!("conflict severity {actual} exceeds {max}"));
            }
            _ => {}
        }
    }
    if let Some(max) = conditions.max_field_changes {
        if change.field_changes.len() > max {
            return Some(format!(
                "{} field changes exceed limit {max}",
                change.field_changes.len()
            ));
        }
    }
    if !conditions.allowed_directions.is_empty()
        && !conditions.allowed_directions.contains(&change.sync_direction)
    {
        return Some(format!(
            "direction {} not allowed",
            change.sync_direction.as_str()
        ));
    }
    None
}

/// Pure evaluation; `rules` must already be in evaluation order
pub fn evaluate_rules(rules: &[SyncApprovalRule], change: &StagedChange) -> ApprovalDecision {
    let Some(rule) = rules.iter().find(|rule| rule_matches(rule, change)) else {
        return ApprovalDecision::RequiresReview {
            rule_id: None,
            level: ApprovalLevel::Editor,
            reason: "no matching approval rule".to_string(),
        };
    };

    if rule.requires_approval {
        return ApprovalDecision::RequiresReview {
            rule_id: Some(rule.id),
            level: rule.approval_level,
            reason: format!("rule '{}' requires approval", rule.name),
        };
    }

    match unmet_condition(rule, change) {
        None => ApprovalDecision::AutoApprove { rule_id: rule.id },
        Some(reason) => ApprovalDecision::RequiresReview {
            rule_id: Some(rule.id),
            level: rule.approval_level.max(ApprovalLevel::Editor),
            reason,
        },
    }
}

pub struct ApprovalRuleEngine {
    repository: Arc<dyn ApprovalRuleRepository>,
}

impl ApprovalRuleEngine {
    pub fn new(repository: Arc<dyn ApprovalRuleRepository>) -> Self {
        Self { repository }
    }

    pub async fn create_rule(&self, rule: NewApprovalRule) -> SyncResult<SyncApprovalRule> {
        if rule.name.trim().is_empty() {
            return Err(SyncError::Validation("approval rule needs a name".into()));
        }
        FieldPatterns::new(&rule.field_patterns)?;
        FieldPatterns::new(rule.value_thresholds.iter().map(|t| t.field.as_str()))?;
        if let Some(bad) = rule.value_thresholds.iter().find(|t| {
            t.max_abs_change.is_some_and(|v| v < 0.0) || t.max_pct_change.is_some_and(|v| v < 0.0)
        }) {
            return Err(SyncError::Validation(format!(
                "negative threshold on field {}",
                bad.field
            )));
        }

        let created = self.repository.create(&rule).await?;
        info!("📏 Approval rule {} '{}' created (priority {})", created.id, created.name, created.priority);
        Ok(created)
    }

    pub async fn list_active_rules(&self) -> SyncResult<Vec<SyncApprovalRule>> {
        Ok(self.repository.find_active().await?)
    }

    pub async fn deactivate_rule(&self, rule_id: i64) -> SyncResult<()> {
        if !self.repository.set_active(rule_id, false).await? {
            return Err(SyncError::not_found("approval_rule", rule_id.to_string()));
        }
        info!("📏 Approval rule {} deactivated", rule_id);
        Ok(())
    }

    pub async fn evaluate(&self, change: &StagedChange) -> SyncResult<ApprovalDecision> {
        let rules = self.repository.find_active().await?;
        Ok(evaluate_rules(&rules, change))
    }

    /// Evaluate and auto-approve the change when the rules allow it
    pub async fn apply(&self, change: &mut StagedChange) -> SyncResult<ApprovalDecision> {
        let decision = self.evaluate(change).await?;
        match &decision {
            ApprovalDecision::AutoApprove { rule_id } => {
                change.auto_approve(Some(*rule_id))?;
                info!("🤖 Change {} auto-approved by rule {}", change.change_id, rule_id);
            }
            ApprovalDecision::RequiresReview { reason, level, .. } => {
                debug!(
                    "Change {} waits for {} review: {}",
                    change.change_id, level, reason
                );
            }
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::approval_rule::{AutoApproveConditions, ValueThreshold};
    use crate::domain::conflict::ConflictSeverity;
    use crate::domain::entity::{EntitySnapshot, EntityType, ProductSnapshot};
    use crate::domain::staged_change::{ChangeStatus, ChangeType, SyncDirection};
    use chrono::Utc;

    fn rule(id: i64, requires_approval: bool) -> SyncApprovalRule {
        let now = Utc::now();
        SyncApprovalRule {
            id,
            name: format!("rule-{id}"),
            entity_type: None,
            change_type: None,
            field_patterns: Vec::new(),
            value_thresholds: Vec::new(),
            requires_approval,
            auto_approve_conditions: AutoApproveConditions::default(),
            approval_level: if requires_approval { ApprovalLevel::Manager } else { ApprovalLevel::None },
            priority: 10,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn price_change(old: f64, new: f64) -> StagedChange {
        let snapshot = |price| {
            EntitySnapshot::Product(ProductSnapshot {
                sku: Some("SKU-1".into()),
                price: Some(price),
                ..ProductSnapshot::default()
            })
        };
        StagedChange::new(
            EntityType::Product,
            Some("p-1".into()),
            ChangeType::Update,
            SyncDirection::LocalToRemote,
            Some(snapshot(old)),
            Some(snapshot(new)),
        )
    }

    #[test]
    fn test_no_rule_means_manual_review() {
        let decision = evaluate_rules(&[], &price_change(10.0, 11.0));
        assert!(matches!(decision, ApprovalDecision::RequiresReview { rule_id: None, .. }));
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let mut big_price_moves = rule(1, true);
        big_price_moves.value_thresholds = vec![ValueThreshold {
            field: "price".into(),
            max_abs_change: None,
            max_pct_change: Some(20.0),
        }];
        let catch_all = rule(2, false);
        let rules = vec![big_price_moves, catch_all];

        assert_eq!(
            evaluate_rules(&rules, &price_change(10.0, 11.0)),
            ApprovalDecision::AutoApprove { rule_id: 2 }
        );
        assert!(matches!(
            evaluate_rules(&rules, &price_change(10.0, 15.0)),
            ApprovalDecision::RequiresReview { rule_id: Some(1), level: ApprovalLevel::Manager, .. }
        ));
    }

    #[test]
    fn test_entity_and_field_filters() {
        let mut categories_only = rule(1, false);
        categories_only.entity_type = Some(EntityType::Category);
        let mut titles_only = rule(2, false);
        titles_only.field_patterns = vec!["title".into()];

        let decision = evaluate_rules(&[categories_only, titles_only], &price_change(1.0, 2.0));
        assert!(matches!(decision, ApprovalDecision::RequiresReview { rule_id: None, .. }));
    }

    #[test]
    fn test_glob_patterns_and_broken_rules() {
        let mut broken = rule(1, false);
        broken.field_patterns = vec!["pri[".into()];
        let mut pricing = rule(2, false);
        pricing.field_patterns = vec!["title".into(), "pri*".into()];

        assert_eq!(
            evaluate_rules(&[broken, pricing], &price_change(1.0, 2.0)),
            ApprovalDecision::AutoApprove { rule_id: 2 }
        );
    }

    #[test]
    fn test_conflict_tolerance() {
        let mut tolerant = rule(7, false);
        tolerant.auto_approve_conditions.max_conflict_severity = Some(ConflictSeverity::Medium);

        let mut change = price_change(10.0, 11.0);
        change.has_conflicts = true;
        change.conflict_severity = Some(ConflictSeverity::Low);
        assert!(evaluate_rules(std::slice::from_ref(&tolerant), &change).is_auto_approved());

        change.conflict_severity = Some(ConflictSeverity::High);
        assert!(!evaluate_rules(std::slice::from_ref(&tolerant), &change).is_auto_approved());

        let strict = rule(8, false);
        change.conflict_severity = Some(ConflictSeverity::Low);
        assert!(!evaluate_rules(&[strict], &change).is_auto_approved());
    }

    #[test]
    fn test_direction_and_size_conditions() {
        let mut limited = rule(3, false);
        limited.auto_approve_conditions = AutoApproveConditions {
            max_conflict_severity: None,
            max_field_changes: Some(0),
            allowed_directions: vec![SyncDirection::RemoteToLocal],
        };
        let decision = evaluate_rules(&[limited], &price_change(1.0, 2.0));
        assert!(matches!(decision, ApprovalDecision::RequiresReview { rule_id: Some(3), .. }));
    }

    #[test]
    fn test_inactive_rules_never_match() {
        let mut inactive = rule(1, false);
        inactive.is_active = false;
        assert!(!evaluate_rules(&[inactive], &price_change(1.0, 2.0)).is_auto_approved());
    }

    #[test]
    fn test_auto_approval_skips_reviewer() {
        let mut change = price_change(1.0, 2.0);
        let decision = evaluate_rules(&[rule(5, false)], &change);
        let ApprovalDecision::AutoApprove { rule_id } = decision else {
            panic!("expected auto approval");
        };
        change.auto_approve(Some(rule_id)).unwrap();
        assert_eq!(change.status, ChangeStatus::Approved);
        assert!(change.auto_approved);
        assert!(change.reviewed_by.is_none());
        assert!(change.is_ready_to_apply());
    }
}
