//! SQLite-backed rollback records

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::domain::repositories::RollbackRepository;
use crate::domain::rollback::{RollbackStatus, SyncRollback};
use crate::infrastructure::database_connection::{
    decode_optional_json, decode_optional_timestamp, decode_timestamp, encode_optional_json,
    encode_timestamp,
};

const SELECT_ROLLBACK: &str = r#"
    SELECT rollback_id, entity_type, entity_id, staged_change_id, previous_version_id,
           rollback_data, status, executed_by, reason, error_message,
           restored_version_id, created_at, completed_at
    FROM sync_rollbacks
"#;

#[derive(Clone)]
pub struct SqliteRollbackRepository {
    pool: SqlitePool,
}

impl SqliteRollbackRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_rollback(row: &SqliteRow) -> Result<SyncRollback> {
        let entity_type: String = row.try_get("entity_type")?;
        let status: String = row.try_get("status")?;
        let created_at: String = row.try_get("created_at")?;

        Ok(SyncRollback {
            rollback_id: row.try_get("rollback_id")?,
            entity_type: entity_type.parse()?,
            entity_id: row.try_get("entity_id")?,
            staged_change_id: row.try_get("staged_change_id")?,
            previous_version_id: row.try_get("previous_version_id")?,
            rollback_data: decode_optional_json(row.try_get("rollback_data")?, "rollback_data")?,
            status: status.parse()?,
            executed_by: row.try_get("executed_by")?,
            reason: row.try_get("reason")?,
            error_message: row.try_get("error_message")?,
            restored_version_id: row.try_get("restored_version_id")?,
            created_at: decode_timestamp(&created_at)?,
            completed_at: decode_optional_timestamp(row.try_get("completed_at")?)?,
        })
    }
}

#[async_trait]
impl RollbackRepository for SqliteRollbackRepository {
    async fn save(&self, rollback: &SyncRollback) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO sync_rollbacks
            (rollback_id, entity_type, entity_id, staged_change_id, previous_version_id,
             rollback_data, status, executed_by, reason, error_message,
             restored_version_id, created_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rollback.rollback_id)
        .bind(rollback.entity_type.as_str())
        .bind(&rollback.entity_id)
        .bind(&rollback.staged_change_id)
        .bind(rollback.previous_version_id)
        .bind(encode_optional_json(rollback.rollback_data.as_ref())?)
        .bind(rollback.status.as_str())
        .bind(&rollback.executed_by)
        .bind(&rollback.reason)
        .bind(&rollback.error_message)
        .bind(rollback.restored_version_id)
        .bind(encode_timestamp(&rollback.created_at))
        .bind(rollback.completed_at.as_ref().map(encode_timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, rollback_id: &str) -> Result<Option<SyncRollback>> {
        let row = sqlx::query(&format!("{SELECT_ROLLBACK} WHERE rollback_id = ?"))
            .bind(rollback_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_rollback).transpose()
    }

    async fn find_by_change(&self, staged_change_id: &str) -> Result<Vec<SyncRollback>> {
        let rows = sqlx::query(&format!(
            "{SELECT_ROLLBACK} WHERE staged_change_id = ? ORDER BY created_at ASC"
        ))
        .bind(staged_change_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_rollback).collect()
    }

    async fn find_by_status(&self, status: RollbackStatus) -> Result<Vec<SyncRollback>> {
        let rows = sqlx::query(&format!(
            "{SELECT_ROLLBACK} WHERE status = ? ORDER BY created_at DESC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_rollback).collect()
    }
}
