//! SQLite-backed staged change store

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::domain::repositories::StagedChangeRepository;
use crate::domain::staged_change::{ChangeStatus, StagedChange};
use crate::infrastructure::database_connection::{
    decode_json, decode_optional_json, decode_optional_timestamp, decode_timestamp, encode_json,
    encode_optional_json, encode_timestamp,
};

const SELECT_CHANGE: &str = r#"
    SELECT change_id, entity_type, entity_id, remote_id, change_type, sync_direction,
           current_data, proposed_data, field_changes, has_conflicts, conflict_fields,
           conflict_severity, conflict_resolution, status, reviewed_by, reviewed_at,
           review_notes, auto_approved, approval_rule_id, applied_at, applied_by,
           application_result, rollback_data, previous_version_id, batch_id, priority,
           created_at, updated_at
    FROM staged_changes
"#;

#[derive(Clone)]
pub struct SqliteStagedChangeRepository {
    pool: SqlitePool,
}

impl SqliteStagedChangeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_change(row: &SqliteRow) -> Result<StagedChange> {
        let entity_type: String = row.try_get("entity_type")?;
        let change_type: String = row.try_get("change_type")?;
        let sync_direction: String = row.try_get("sync_direction")?;
        let status: String = row.try_get("status")?;
        let field_changes: String = row.try_get("field_changes")?;
        let conflict_fields: String = row.try_get("conflict_fields")?;
        let conflict_severity: Option<String> = row.try_get("conflict_severity")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(StagedChange {
            change_id: row.try_get("change_id")?,
            entity_type: entity_type.parse()?,
            entity_id: row.try_get("entity_id")?,
            remote_id: row.try_get("remote_id")?,
            change_type: change_type.parse()?,
            sync_direction: sync_direction.parse()?,
            current_data: decode_optional_json(row.try_get("current_data")?, "current_data")?,
            proposed_data: decode_optional_json(row.try_get("proposed_data")?, "proposed_data")?,
            field_changes: decode_json(&field_changes, "field_changes")?,
            has_conflicts: row.try_get("has_conflicts")?,
            conflict_fields: decode_json(&conflict_fields, "conflict_fields")?,
            conflict_severity: conflict_severity.map(|s| s.parse()).transpose()?,
            conflict_resolution: decode_optional_json(
                row.try_get("conflict_resolution")?,
                "conflict_resolution",
            )?,
            status: status.parse()?,
            reviewed_by: row.try_get("reviewed_by")?,
            reviewed_at: decode_optional_timestamp(row.try_get("reviewed_at")?)?,
            review_notes: row.try_get("review_notes")?,
            auto_approved: row.try_get("auto_approved")?,
            approval_rule_id: row.try_get("approval_rule_id")?,
            applied_at: decode_optional_timestamp(row.try_get("applied_at")?)?,
            applied_by: row.try_get("applied_by")?,
            application_result: decode_optional_json(
                row.try_get("application_result")?,
                "application_result",
            )?,
            rollback_data: decode_optional_json(row.try_get("rollback_data")?, "rollback_data")?,
            previous_version_id: row.try_get("previous_version_id")?,
            batch_id: row.try_get("batch_id")?,
            priority: row.try_get("priority")?,
            created_at: decode_timestamp(&created_at)?,
            updated_at: decode_timestamp(&updated_at)?,
        })
    }

    async fn write(&self, change: &StagedChange, replace: bool) -> Result<()> {
        let verb = if replace { "INSERT OR REPLACE" } else { "INSERT" };
        sqlx::query(&format!(
            r#"
            {verb} INTO staged_changes
            (change_id, entity_type, entity_id, remote_id, change_type, sync_direction,
             current_data, proposed_data, field_changes, has_conflicts, conflict_fields,
             conflict_severity, conflict_resolution, status, reviewed_by, reviewed_at,
             review_notes, auto_approved, approval_rule_id, applied_at, applied_by,
             application_result, rollback_data, previous_version_id, batch_id, priority,
             created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#
        ))
        .bind(&change.change_id)
        .bind(change.entity_type.as_str())
        .bind(&change.entity_id)
        .bind(&change.remote_id)
        .bind(change.change_type.to_string())
        .bind(change.sync_direction.as_str())
        .bind(encode_optional_json(change.current_data.as_ref())?)
        .bind(encode_optional_json(change.proposed_data.as_ref())?)
        .bind(encode_json(&change.field_changes)?)
        .bind(change.has_conflicts)
        .bind(encode_json(&change.conflict_fields)?)
        .bind(change.conflict_severity.map(|s| s.to_string()))
        .bind(encode_optional_json(change.conflict_resolution.as_ref())?)
        .bind(change.status.to_string())
        .bind(&change.reviewed_by)
        .bind(change.reviewed_at.as_ref().map(encode_timestamp))
        .bind(&change.review_notes)
        .bind(change.auto_approved)
        .bind(change.approval_rule_id)
        .bind(change.applied_at.as_ref().map(encode_timestamp))
        .bind(&change.applied_by)
        .bind(encode_optional_json(change.application_result.as_ref())?)
        .bind(encode_optional_json(change.rollback_data.as_ref())?)
        .bind(change.previous_version_id)
        .bind(&change.batch_id)
        .bind(change.priority)
        .bind(encode_timestamp(&change.created_at))
        .bind(encode_timestamp(&change.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StagedChangeRepository for SqliteStagedChangeRepository {
    async fn insert(&self, change: &StagedChange) -> Result<()> {
        self.write(change, false).await
    }

    async fn update(&self, change: &StagedChange) -> Result<()> {
        self.write(change, true).await
    }

    async fn find_by_id(&self, change_id: &str) -> Result<Option<StagedChange>> {
        let row = sqlx::query(&format!("{SELECT_CHANGE} WHERE change_id = ?"))
            .bind(change_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_change).transpose()
    }

    async fn find_by_status(&self, status: ChangeStatus, limit: u32) -> Result<Vec<StagedChange>> {
        let rows = sqlx::query(&format!(
            "{SELECT_CHANGE} WHERE status = ? ORDER BY priority ASC, created_at ASC LIMIT ?"
        ))
        .bind(status.to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_change).collect()
    }

    async fn find_by_batch(&self, batch_id: &str) -> Result<Vec<StagedChange>> {
        let rows = sqlx::query(&format!(
            "{SELECT_CHANGE} WHERE batch_id = ? ORDER BY priority ASC, created_at ASC"
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_change).collect()
    }

    async fn count_by_status(&self, status: ChangeStatus) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM staged_changes WHERE status = ?")
            .bind(status.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entity::{EntitySnapshot, EntityType, ProductSnapshot};
    use crate::domain::staged_change::{ChangeType, SyncDirection};
    use crate::infrastructure::database_connection::DatabaseConnection;

    fn change(price: f64) -> StagedChange {
        let current = EntitySnapshot::Product(ProductSnapshot {
            sku: Some("SKU-1".into()),
            price: Some(10.0),
            ..ProductSnapshot::default()
        });
        let proposed = EntitySnapshot::Product(ProductSnapshot {
            sku: Some("SKU-1".into()),
            price: Some(price),
            ..ProductSnapshot::default()
        });
        StagedChange::new(
            EntityType::Product,
            Some("p-1".into()),
            ChangeType::Update,
            SyncDirection::LocalToRemote,
            Some(current),
            Some(proposed),
        )
    }

    #[tokio::test]
    async fn test_insert_update_and_query() -> Result<()> {
        let db = DatabaseConnection::in_memory().await?;
        db.migrate().await?;
        let repo = SqliteStagedChangeRepository::new(db.pool().clone());

        let mut first = change(12.0);
        first.priority = 200;
        let mut second = change(15.0);
        second.priority = 10;
        second.batch_id = Some("batch-a".into());
        repo.insert(&first).await?;
        repo.insert(&second).await?;
        assert!(repo.insert(&first).await.is_err());

        let pending = repo.find_by_status(ChangeStatus::Pending, 10).await?;
        let ids: Vec<&str> = pending.iter().map(|c| c.change_id.as_str()).collect();
        assert_eq!(ids, vec![second.change_id.as_str(), first.change_id.as_str()]);

        first.approve("editor@shop", Some("looks right".into()))?;
        repo.update(&first).await?;
        let loaded = repo.find_by_id(&first.change_id).await?.unwrap();
        assert_eq!(loaded.status, ChangeStatus::Approved);
        assert_eq!(loaded.reviewed_by.as_deref(), Some("editor@shop"));
        assert_eq!(loaded.field_changes, first.field_changes);
        assert_eq!(loaded.proposed_data, first.proposed_data);

        assert_eq!(repo.count_by_status(ChangeStatus::Pending).await?, 1);
        assert_eq!(repo.find_by_batch("batch-a").await?.len(), 1);
        assert!(repo.find_by_id("missing").await?.is_none());
        Ok(())
    }
}
