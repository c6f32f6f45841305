//! SQLite-backed batch records

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::domain::repositories::SyncBatchRepository;
use crate::domain::sync_batch::{BatchStatus, SyncBatch};
use crate::infrastructure::database_connection::{
    decode_json, decode_optional_timestamp, decode_timestamp, encode_json, encode_timestamp,
};

const SELECT_BATCH: &str = r#"
    SELECT batch_id, operation, status, total_items, processed_items, successful_items,
           failed_items, skipped_items, created_at, started_at, completed_at,
           processing_rate, api_calls_made, rate_limit_hits, retry_attempts,
           error_summary, error_message
    FROM sync_batches
"#;

#[derive(Clone)]
pub struct SqliteBatchRepository {
    pool: SqlitePool,
}

fn to_count(value: i64) -> usize {
    usize::try_from(value).unwrap_or_default()
}

fn to_counter(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn to_column(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl SqliteBatchRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_batch(row: &SqliteRow) -> Result<SyncBatch> {
        let status: String = row.try_get("status")?;
        let created_at: String = row.try_get("created_at")?;
        let error_summary: String = row.try_get("error_summary")?;

        Ok(SyncBatch {
            batch_id: row.try_get("batch_id")?,
            operation: row.try_get("operation")?,
            status: status.parse()?,
            total_items: to_count(row.try_get("total_items")?),
            processed_items: to_count(row.try_get("processed_items")?),
            successful_items: to_count(row.try_get("successful_items")?),
            failed_items: to_count(row.try_get("failed_items")?),
            skipped_items: to_count(row.try_get("skipped_items")?),
            created_at: decode_timestamp(&created_at)?,
            started_at: decode_optional_timestamp(row.try_get("started_at")?)?,
            completed_at: decode_optional_timestamp(row.try_get("completed_at")?)?,
            processing_rate: row.try_get("processing_rate")?,
            api_calls_made: to_counter(row.try_get("api_calls_made")?),
            rate_limit_hits: to_counter(row.try_get("rate_limit_hits")?),
            retry_attempts: to_counter(row.try_get("retry_attempts")?),
            error_summary: decode_json(&error_summary, "error_summary")?,
            error_message: row.try_get("error_message")?,
        })
    }
}

#[async_trait]
impl SyncBatchRepository for SqliteBatchRepository {
    async fn save(&self, batch: &SyncBatch) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO sync_batches
            (batch_id, operation, status, total_items, processed_items, successful_items,
             failed_items, skipped_items, created_at, started_at, completed_at,
             processing_rate, api_calls_made, rate_limit_hits, retry_attempts,
             error_summary, error_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&batch.batch_id)
        .bind(&batch.operation)
        .bind(batch.status.as_str())
        .bind(to_column(batch.total_items as u64))
        .bind(to_column(batch.processed_items as u64))
        .bind(to_column(batch.successful_items as u64))
        .bind(to_column(batch.failed_items as u64))
        .bind(to_column(batch.skipped_items as u64))
        .bind(encode_timestamp(&batch.created_at))
        .bind(batch.started_at.as_ref().map(encode_timestamp))
        .bind(batch.completed_at.as_ref().map(encode_timestamp))
        .bind(batch.processing_rate)
        .bind(to_column(batch.api_calls_made))
        .bind(to_column(batch.rate_limit_hits))
        .bind(to_column(batch.retry_attempts))
        .bind(encode_json(&batch.error_summary)?)
        .bind(&batch.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, batch_id: &str) -> Result<Option<SyncBatch>> {
        let row = sqlx::query(&format!("{SELECT_BATCH} WHERE batch_id = ?"))
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_batch).transpose()
    }

    async fn find_in_range(
        &self,
        status: Option<BatchStatus>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SyncBatch>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "{SELECT_BATCH} WHERE status = ? AND created_at >= ? AND created_at < ? ORDER BY created_at DESC"
                ))
                .bind(status.as_str())
                .bind(encode_timestamp(&from))
                .bind(encode_timestamp(&to))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "{SELECT_BATCH} WHERE created_at >= ? AND created_at < ? ORDER BY created_at DESC"
                ))
                .bind(encode_timestamp(&from))
                .bind(encode_timestamp(&to))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(Self::row_to_batch).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::ItemErrorKind;
    use crate::domain::sync_batch::BatchItemError;
    use crate::infrastructure::database_connection::DatabaseConnection;

    fn batch(id: &str, status: BatchStatus, created_at: DateTime<Utc>) -> SyncBatch {
        SyncBatch {
            batch_id: id.to_string(),
            operation: "apply_changes".into(),
            status,
            total_items: 10,
            processed_items: 10,
            successful_items: 8,
            failed_items: 2,
            skipped_items: 0,
            created_at,
            started_at: Some(created_at),
            completed_at: Some(created_at + chrono::Duration::seconds(2)),
            processing_rate: 5.0,
            api_calls_made: 12,
            rate_limit_hits: 1,
            retry_attempts: 2,
            error_summary: vec![BatchItemError {
                index: 3,
                item_id: "sku-3".into(),
                kind: ItemErrorKind::Permanent,
                message: "missing required field: title".into(),
                attempts: 1,
            }],
            error_message: None,
        }
    }

    #[tokio::test]
    async fn test_save_is_upsert_and_range_is_half_open() -> Result<()> {
        let db = DatabaseConnection::in_memory().await?;
        db.migrate().await?;
        let repo = SqliteBatchRepository::new(db.pool().clone());

        let base = decode_timestamp("2026-03-01T10:00:00.000000Z")?;
        let mut first = batch("b-1", BatchStatus::Running, base);
        repo.save(&first).await?;
        first.status = BatchStatus::CompletedWithErrors;
        repo.save(&first).await?;
        repo.save(&batch("b-2", BatchStatus::Completed, base + chrono::Duration::hours(1)))
            .await?;

        let loaded = repo.find_by_id("b-1").await?.unwrap();
        assert_eq!(loaded, first);

        let all = repo
            .find_in_range(None, base, base + chrono::Duration::hours(2))
            .await?;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].batch_id, "b-2");

        let up_to_second = repo
            .find_in_range(None, base, base + chrono::Duration::hours(1))
            .await?;
        assert_eq!(up_to_second.len(), 1);

        let with_errors = repo
            .find_in_range(
                Some(BatchStatus::CompletedWithErrors),
                base,
                base + chrono::Duration::hours(2),
            )
            .await?;
        assert_eq!(with_errors.len(), 1);
        Ok(())
    }
}
