//! SQLite-backed version store
//!
//! 버전 번호는 엔티티별 잠금 + 트랜잭션(`MAX + 1`)으로 할당되고,
//! `UNIQUE (entity_type, entity_id, version_number)` 제약이 최종 방어선입니다.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::domain::entity::{EntityType, entity_key};
use crate::domain::repositories::VersionRepository;
use crate::domain::sync_version::{NewVersion, SyncVersion};
use crate::infrastructure::bounded_cache::{BoundedCache, ObjectPool, Reclaimable};
use crate::infrastructure::config::StreamingConfig;
use crate::infrastructure::database_connection::{
    decode_json, decode_timestamp, encode_json, encode_timestamp,
};
use crate::infrastructure::entity_locks::EntityLocks;

const SELECT_VERSION: &str = r#"
    SELECT id, entity_type, entity_id, remote_id, version_hash, version_number,
           data_snapshot, source_system, change_id, created_at
    FROM sync_versions
"#;

pub struct SqliteVersionRepository {
    pool: SqlitePool,
    entity_locks: EntityLocks,
    latest_cache: Arc<BoundedCache<String, SyncVersion>>,
    hash_buffers: Arc<ObjectPool<Vec<u8>>>,
}

impl SqliteVersionRepository {
    pub fn new(pool: SqlitePool, config: &StreamingConfig) -> Self {
        Self {
            pool,
            entity_locks: EntityLocks::new(),
            latest_cache: Arc::new(BoundedCache::from_config(config)),
            hash_buffers: Arc::new(ObjectPool::byte_buffers(
                config.buffer_pool_size,
                config.buffer_capacity,
            )),
        }
    }

    /// Auxiliary structures to register with the streaming processor
    pub fn reclaimables(&self) -> Vec<Arc<dyn Reclaimable>> {
        vec![
            Arc::clone(&self.latest_cache) as Arc<dyn Reclaimable>,
            Arc::clone(&self.hash_buffers) as Arc<dyn Reclaimable>,
        ]
    }

    pub fn cache_stats(&self) -> crate::infrastructure::bounded_cache::CacheStats {
        self.latest_cache.stats()
    }

    /// Caller holds the entity lock
    async fn insert_next(&self, version: NewVersion, key: &str) -> Result<SyncVersion> {
        let version_hash = {
            let mut buffer = self.hash_buffers.acquire();
            version.data_snapshot.content_hash_with(&mut buffer)
        };
        let snapshot_json = encode_json(&version.data_snapshot)?;
        // stored with microsecond precision
        let created_at = Utc::now().trunc_subsecs(6);

        let mut tx = self.pool.begin().await?;
        let version_number: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version_number), 0) + 1 FROM sync_versions WHERE entity_type = ? AND entity_id = ?",
        )
        .bind(version.entity_type.as_str())
        .bind(&version.entity_id)
        .fetch_one(&mut *tx)
        .await?;

        let id = sqlx::query(
            r#"
            INSERT INTO sync_versions
            (entity_type, entity_id, remote_id, version_hash, version_number,
             data_snapshot, source_system, change_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(version.entity_type.as_str())
        .bind(&version.entity_id)
        .bind(&version.remote_id)
        .bind(&version_hash)
        .bind(version_number)
        .bind(&snapshot_json)
        .bind(version.source_system.as_str())
        .bind(&version.change_id)
        .bind(encode_timestamp(&created_at))
        .execute(&mut *tx)
        .await
        .with_context(|| format!("appending version {version_number} of {key}"))?
        .last_insert_rowid();
        tx.commit().await?;

        let appended = SyncVersion {
            id,
            entity_type: version.entity_type,
            entity_id: version.entity_id,
            remote_id: version.remote_id,
            version_hash,
            version_number,
            data_snapshot: version.data_snapshot,
            source_system: version.source_system,
            change_id: version.change_id,
            created_at,
        };
        self.latest_cache.insert(key.to_string(), appended.clone());
        Ok(appended)
    }

    fn row_to_version(row: &SqliteRow) -> Result<SyncVersion> {
        let entity_type: String = row.try_get("entity_type")?;
        let source_system: String = row.try_get("source_system")?;
        let snapshot: String = row.try_get("data_snapshot")?;
        let created_at: String = row.try_get("created_at")?;

        Ok(SyncVersion {
            id: row.try_get("id")?,
            entity_type: entity_type.parse()?,
            entity_id: row.try_get("entity_id")?,
            remote_id: row.try_get("remote_id")?,
            version_hash: row.try_get("version_hash")?,
            version_number: row.try_get("version_number")?,
            data_snapshot: decode_json(&snapshot, "data_snapshot")?,
            source_system: source_system.parse()?,
            change_id: row.try_get("change_id")?,
            created_at: decode_timestamp(&created_at)?,
        })
    }
}

#[async_trait]
impl VersionRepository for SqliteVersionRepository {
    async fn append(&self, version: NewVersion) -> Result<SyncVersion> {
        let key = entity_key(version.entity_type, &version.entity_id);
        let appended = {
            let _guard = self.entity_locks.lock(&key).await;
            self.insert_next(version, &key).await?
        };
        debug!("📌 Version {} appended for {}", appended.version_number, key);
        Ok(appended)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<SyncVersion>> {
        let row = sqlx::query(&format!("{SELECT_VERSION} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_version).transpose()
    }

    async fn latest(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<SyncVersion>> {
        let key = entity_key(entity_type, entity_id);
        if let Some(version) = self.latest_cache.get(&key) {
            return Ok(Some(version));
        }

        // 캐시 채우기는 append와 같은 잠금 아래에서만 수행
        let _guard = self.entity_locks.lock(&key).await;
        if let Some(version) = self.latest_cache.get(&key) {
            return Ok(Some(version));
        }
        let row = sqlx::query(&format!(
            "{SELECT_VERSION} WHERE entity_type = ? AND entity_id = ? ORDER BY version_number DESC LIMIT 1"
        ))
        .bind(entity_type.as_str())
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        let latest = row.as_ref().map(Self::row_to_version).transpose()?;
        if let Some(version) = &latest {
            self.latest_cache.insert(key, version.clone());
        }
        Ok(latest)
    }

    async fn history(&self, entity_type: EntityType, entity_id: &str) -> Result<Vec<SyncVersion>> {
        let rows = sqlx::query(&format!(
            "{SELECT_VERSION} WHERE entity_type = ? AND entity_id = ? ORDER BY version_number ASC"
        ))
        .bind(entity_type.as_str())
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_version).collect()
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_versions")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entity::{EntitySnapshot, ProductSnapshot};
    use crate::domain::sync_version::SourceSystem;
    use crate::infrastructure::database_connection::DatabaseConnection;

    async fn repository() -> Result<(DatabaseConnection, Arc<SqliteVersionRepository>)> {
        let db = DatabaseConnection::in_memory().await?;
        db.migrate().await?;
        let repo = SqliteVersionRepository::new(db.pool().clone(), &StreamingConfig::default());
        Ok((db, Arc::new(repo)))
    }

    fn snapshot(price: f64) -> EntitySnapshot {
        EntitySnapshot::Product(ProductSnapshot {
            sku: Some("SKU-9".into()),
            price: Some(price),
            ..ProductSnapshot::default()
        })
    }

    #[tokio::test]
    async fn test_versions_start_at_one_and_increase() -> Result<()> {
        let (_db, repo) = repository().await?;
        for price in [1.0, 2.0, 3.0] {
            repo.append(NewVersion::new(EntityType::Product, "p-1", snapshot(price), SourceSystem::Local))
                .await?;
        }
        repo.append(NewVersion::new(EntityType::Category, "p-1", EntitySnapshot::Tombstone, SourceSystem::Remote))
            .await?;

        let numbers: Vec<i64> = repo
            .history(EntityType::Product, "p-1")
            .await?
            .iter()
            .map(|v| v.version_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);

        let latest = repo.latest(EntityType::Category, "p-1").await?.unwrap();
        assert_eq!(latest.version_number, 1);
        assert!(latest.data_snapshot.is_tombstone());
        assert_eq!(repo.count().await?, 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_gap_free() -> Result<()> {
        let (_db, repo) = repository().await?;
        let mut handles = Vec::new();
        for i in 0..16 {
            let repo = Arc::clone(&repo);
            handles.push(tokio::spawn(async move {
                repo.append(NewVersion::new(
                    EntityType::Product,
                    "p-hot",
                    snapshot(f64::from(i)),
                    SourceSystem::Local,
                ))
                .await
            }));
        }
        for handle in handles {
            handle.await??;
        }

        let numbers: Vec<i64> = repo
            .history(EntityType::Product, "p-hot")
            .await?
            .iter()
            .map(|v| v.version_number)
            .collect();
        assert_eq!(numbers, (1..=16).collect::<Vec<_>>());
        assert!(repo.entity_locks.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_cache_fill_never_goes_backwards() -> Result<()> {
        let (_db, repo) = repository().await?;
        repo.append(NewVersion::new(EntityType::Product, "p-race", snapshot(0.0), SourceSystem::Local))
            .await?;

        let mut handles = Vec::new();
        for i in 1..=12 {
            let repo = Arc::clone(&repo);
            handles.push(tokio::spawn(async move {
                repo.latest_cache.clear();
                repo.latest(EntityType::Product, "p-race").await?;
                repo.append(NewVersion::new(
                    EntityType::Product,
                    "p-race",
                    snapshot(f64::from(i)),
                    SourceSystem::Local,
                ))
                .await?;
                repo.latest(EntityType::Product, "p-race").await?;
                anyhow::Ok(())
            }));
        }
        for handle in handles {
            handle.await??;
        }

        let cached = repo.latest(EntityType::Product, "p-race").await?.unwrap();
        assert_eq!(cached.version_number, 13);
        assert!(repo.entity_locks.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_stored_hash_matches_snapshot() -> Result<()> {
        let (_db, repo) = repository().await?;
        let stored = repo
            .append(
                NewVersion::new(EntityType::Product, "p-2", snapshot(10.0), SourceSystem::Remote)
                    .with_remote_id(Some("gid://product/7".into()))
                    .with_change_id("change-1"),
            )
            .await?;

        let loaded = repo.find_by_id(stored.id).await?.unwrap();
        assert_eq!(loaded, stored);
        assert!(loaded.matches(&snapshot(10.0)));
        assert!(!loaded.matches(&snapshot(11.0)));
        assert_eq!(loaded.remote_id.as_deref(), Some("gid://product/7"));
        Ok(())
    }
}
