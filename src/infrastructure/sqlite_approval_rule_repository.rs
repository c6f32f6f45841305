//! SQLite-backed approval rules

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::domain::approval_rule::{NewApprovalRule, SyncApprovalRule};
use crate::domain::repositories::ApprovalRuleRepository;
use crate::infrastructure::database_connection::{
    decode_json, decode_timestamp, encode_json, encode_timestamp,
};

const SELECT_RULE: &str = r#"
    SELECT id, name, entity_type, change_type, field_patterns, value_thresholds,
           requires_approval, auto_approve_conditions, approval_level, priority,
           is_active, created_at, updated_at
    FROM sync_approval_rules
"#;

#[derive(Clone)]
pub struct SqliteApprovalRuleRepository {
    pool: SqlitePool,
}

impl SqliteApprovalRuleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_rule(row: &SqliteRow) -> Result<SyncApprovalRule> {
        let entity_type: Option<String> = row.try_get("entity_type")?;
        let change_type: Option<String> = row.try_get("change_type")?;
        let field_patterns: String = row.try_get("field_patterns")?;
        let value_thresholds: String = row.try_get("value_thresholds")?;
        let conditions: String = row.try_get("auto_approve_conditions")?;
        let approval_level: String = row.try_get("approval_level")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(SyncApprovalRule {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            entity_type: entity_type.map(|s| s.parse()).transpose()?,
            change_type: change_type.map(|s| s.parse()).transpose()?,
            field_patterns: decode_json(&field_patterns, "field_patterns")?,
            value_thresholds: decode_json(&value_thresholds, "value_thresholds")?,
            requires_approval: row.try_get("requires_approval")?,
            auto_approve_conditions: decode_json(&conditions, "auto_approve_conditions")?,
            approval_level: approval_level.parse()?,
            priority: row.try_get("priority")?,
            is_active: row.try_get("is_active")?,
            created_at: decode_timestamp(&created_at)?,
            updated_at: decode_timestamp(&updated_at)?,
        })
    }
}

#[async_trait]
impl ApprovalRuleRepository for SqliteApprovalRuleRepository {
    async fn create(&self, rule: &NewApprovalRule) -> Result<SyncApprovalRule> {
        let now = Utc::now().trunc_subsecs(6);
        let id = sqlx::query(
            r#"
            INSERT INTO sync_approval_rules
            (name, entity_type, change_type, field_patterns, value_thresholds,
             requires_approval, auto_approve_conditions, approval_level, priority,
             is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(&rule.name)
        .bind(rule.entity_type.map(|t| t.as_str()))
        .bind(rule.change_type.map(|t| t.to_string()))
        .bind(encode_json(&rule.field_patterns)?)
        .bind(encode_json(&rule.value_thresholds)?)
        .bind(rule.requires_approval)
        .bind(encode_json(&rule.auto_approve_conditions)?)
        .bind(rule.approval_level.as_str())
        .bind(rule.priority)
        .bind(encode_timestamp(&now))
        .bind(encode_timestamp(&now))
        .execute(&self.pool)
        .await
        .with_context(|| format!("creating approval rule {:?}", rule.name))?
        .last_insert_rowid();

        Ok(SyncApprovalRule {
            id,
            name: rule.name.clone(),
            entity_type: rule.entity_type,
            change_type: rule.change_type,
            field_patterns: rule.field_patterns.clone(),
            value_thresholds: rule.value_thresholds.clone(),
            requires_approval: rule.requires_approval,
            auto_approve_conditions: rule.auto_approve_conditions.clone(),
            approval_level: rule.approval_level,
            priority: rule.priority,
            is_active: true,
            created_at: now,
            updated_at: now,
        })
    }

    async fn find_active(&self) -> Result<Vec<SyncApprovalRule>> {
        let rows = sqlx::query(&format!(
            "{SELECT_RULE} WHERE is_active = 1 ORDER BY priority ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_rule).collect()
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<SyncApprovalRule>> {
        let row = sqlx::query(&format!("{SELECT_RULE} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_rule).transpose()
    }

    async fn set_active(&self, id: i64, is_active: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sync_approval_rules SET is_active = ?, updated_at = ? WHERE id = ?",
        )
        .bind(is_active)
        .bind(encode_timestamp(&Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::approval_rule::ValueThreshold;
    use crate::domain::entity::EntityType;
    use crate::infrastructure::database_connection::DatabaseConnection;

    #[tokio::test]
    async fn test_active_rules_come_back_in_evaluation_order() -> Result<()> {
        let db = DatabaseConnection::in_memory().await?;
        db.migrate().await?;
        let repo = SqliteApprovalRuleRepository::new(db.pool().clone());

        let mut price_guard = NewApprovalRule::new("price guard", true, 10);
        price_guard.entity_type = Some(EntityType::Product);
        price_guard.value_thresholds = vec![ValueThreshold {
            field: "price".into(),
            max_abs_change: None,
            max_pct_change: Some(10.0),
        }];
        let late = repo.create(&NewApprovalRule::new("catch-all", true, 50)).await?;
        let early = repo.create(&price_guard).await?;
        let tie = repo.create(&NewApprovalRule::new("tie", false, 50)).await?;

        let ids: Vec<i64> = repo.find_active().await?.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![early.id, late.id, tie.id]);

        assert_eq!(repo.find_by_id(early.id).await?.unwrap(), early);

        assert!(repo.set_active(late.id, false).await?);
        assert!(!repo.set_active(9999, false).await?);
        let ids: Vec<i64> = repo.find_active().await?.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![early.id, tie.id]);
        Ok(())
    }
}
