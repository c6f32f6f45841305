//! Rollback of applied changes
//!
//! 적용된 변경을 직전 버전 스냅샷으로 되돌립니다. 실패한 롤백은 자동으로
//! 재시도하지 않으며 운영자의 개입을 위해 `failed` 상태로 남습니다.

use std::sync::Arc;

use tracing::{error, info};

use crate::domain::entity::{EntitySnapshot, entity_key};
use crate::domain::errors::{SyncError, SyncResult};
use crate::domain::repositories::{RollbackRepository, StagedChangeRepository, VersionRepository};
use crate::domain::rollback::{RollbackStatus, SyncRollback};
use crate::domain::staged_change::{ChangeStatus, ChangeType, StagedChange, SyncDirection};
use crate::domain::sync_version::{NewVersion, SourceSystem};
use crate::infrastructure::entity_locks::EntityLocks;
use crate::infrastructure::remote_platform::{RemoteError, RemotePlatform};

pub struct RollbackManager {
    versions: Arc<dyn VersionRepository>,
    changes: Arc<dyn StagedChangeRepository>,
    rollbacks: Arc<dyn RollbackRepository>,
    remote: Arc<dyn RemotePlatform>,
    entity_locks: Arc<EntityLocks>,
}

impl RollbackManager {
    pub fn new(
        versions: Arc<dyn VersionRepository>,
        changes: Arc<dyn StagedChangeRepository>,
        rollbacks: Arc<dyn RollbackRepository>,
        remote: Arc<dyn RemotePlatform>,
    ) -> Self {
        Self {
            versions,
            changes,
            rollbacks,
            remote,
            entity_locks: Arc::new(EntityLocks::new()),
        }
    }

    #[must_use]
    pub fn with_entity_locks(mut self, locks: Arc<EntityLocks>) -> Self {
        self.entity_locks = locks;
        self
    }

    pub async fn list_rollbacks(&self, status: RollbackStatus) -> SyncResult<Vec<SyncRollback>> {
        Ok(self.rollbacks.find_by_status(status).await?)
    }

    pub async fn rollbacks_for_change(&self, change_id: &str) -> SyncResult<Vec<SyncRollback>> {
        Ok(self.rollbacks.find_by_change(change_id).await?)
    }

    async fn fail(&self, mut rollback: SyncRollback, message: String) -> SyncResult<SyncRollback> {
        error!(
            "⛔ Rollback {} of change {} failed: {}",
            rollback.rollback_id, rollback.staged_change_id, message
        );
        rollback.fail(message);
        self.rollbacks.save(&rollback).await?;
        Ok(rollback)
    }

    /// Snapshot the entity must return to
    async fn target_state(&self, change: &StagedChange) -> SyncResult<Option<EntitySnapshot>> {
        let Some(previous_id) = change.previous_version_id else {
            // 생성 변경은 이전 버전이 없으므로 삭제로 되돌립니다
            let creates = matches!(change.change_type, ChangeType::Create | ChangeType::Restore);
            return Ok(creates.then_some(EntitySnapshot::Tombstone));
        };
        let Some(previous) = self.versions.find_by_id(previous_id).await? else {
            return Ok(None);
        };
        Ok(Some(change.rollback_data.clone().unwrap_or(previous.data_snapshot)))
    }

    /// Write `target` to the remote; returns the remote id afterwards
    async fn push(
        &self,
        change: &StagedChange,
        current: Option<&EntitySnapshot>,
        target: &EntitySnapshot,
        remote_id: Option<String>,
    ) -> Result<Option<String>, RemoteError> {
        if change.sync_direction == SyncDirection::RemoteToLocal {
            return Ok(remote_id);
        }
        let entity_type = change.entity_type;
        let currently_deleted = current.is_none_or(EntitySnapshot::is_tombstone);

        match (target.is_tombstone(), currently_deleted, remote_id) {
            (true, true, remote_id) => Ok(remote_id),
            (true, false, Some(remote_id)) => {
                match self.remote.delete_entity(entity_type, &remote_id).await {
                    Ok(()) | Err(RemoteError::NotFound { .. }) => Ok(Some(remote_id)),
                    Err(e) => Err(e),
                }
            }
            (false, true, _) => self.remote.create_entity(entity_type, target).await.map(Some),
            (false, false, Some(remote_id)) => {
                self.remote
                    .update_entity(entity_type, &remote_id, target)
                    .await?;
                Ok(Some(remote_id))
            }
            (_, false, None) => Err(RemoteError::Invalid(format!(
                "change {} has no remote id to roll back",
                change.change_id
            ))),
        }
    }

    /// Restore the entity touched by an applied change to its pre-change state
    pub async fn rollback(
        &self,
        change_id: &str,
        executed_by: &str,
        reason: Option<String>,
    ) -> SyncResult<SyncRollback> {
        let mut change = self
            .changes
            .find_by_id(change_id)
            .await?
            .ok_or_else(|| SyncError::not_found("staged_change", change_id))?;
        if change.status != ChangeStatus::Applied {
            return Err(SyncError::InvalidTransition {
                change_id: change.change_id.clone(),
                from: change.status.to_string(),
                to: ChangeStatus::RolledBack.to_string(),
            });
        }
        let entity_id = change.entity_id.clone().ok_or_else(|| {
            SyncError::Validation(format!("applied change {change_id} has no entity id"))
        })?;

        let mut rollback = SyncRollback::pending(
            change.entity_type,
            &entity_id,
            &change.change_id,
            change.previous_version_id,
            executed_by,
            reason,
        );

        let Some(target) = self.target_state(&change).await? else {
            let detail = match change.previous_version_id {
                Some(id) => format!("previous version {id} not found"),
                None => "change has no previous version".to_string(),
            };
            let failed = self.fail(rollback, detail.clone()).await?;
            return Err(SyncError::MissingVersion {
                entity_type: failed.entity_type.to_string(),
                entity_id: failed.entity_id,
                detail,
            });
        };
        rollback.rollback_data = Some(target.clone());
        self.rollbacks.save(&rollback).await?;

        let _entity_guard = self
            .entity_locks
            .lock(&entity_key(change.entity_type, &entity_id))
            .await;
        let current = self.versions.latest(change.entity_type, &entity_id).await?;
        let remote_id = change
            .remote_id
            .clone()
            .or_else(|| current.as_ref().and_then(|v| v.remote_id.clone()));

        let remote_id = match self
            .push(&change, current.as_ref().map(|v| &v.data_snapshot), &target, remote_id)
            .await
        {
            Ok(remote_id) => remote_id,
            Err(e) => {
                let failed = self.fail(rollback, e.to_string()).await?;
                return Err(SyncError::RollbackFailed {
                    rollback_id: failed.rollback_id,
                    message: e.to_string(),
                });
            }
        };

        let source = match change.sync_direction {
            SyncDirection::RemoteToLocal => SourceSystem::Remote,
            SyncDirection::LocalToRemote | SyncDirection::Bidirectional => SourceSystem::Local,
        };
        let version = self
            .versions
            .append(
                NewVersion::new(change.entity_type, &entity_id, target, source)
                    .with_remote_id(remote_id)
                    .with_change_id(&change.change_id),
            )
            .await?;

        rollback.complete(version.id);
        self.rollbacks.save(&rollback).await?;
        change.mark_rolled_back()?;
        self.changes.update(&change).await?;

        info!(
            "⏪ Change {} rolled back by {} ({} {} now at version {})",
            change.change_id, executed_by, change.entity_type, entity_id, version.version_number
        );
        Ok(rollback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entity::{EntityType, ProductSnapshot};
    use crate::infrastructure::config::StreamingConfig;
    use crate::infrastructure::database_connection::DatabaseConnection;
    use crate::infrastructure::remote_platform::InMemoryPlatform;
    use crate::infrastructure::sqlite_rollback_repository::SqliteRollbackRepository;
    use crate::infrastructure::sqlite_staged_change_repository::SqliteStagedChangeRepository;
    use crate::infrastructure::sqlite_version_repository::SqliteVersionRepository;

    struct Fixture {
        manager: RollbackManager,
        versions: Arc<SqliteVersionRepository>,
        changes: Arc<SqliteStagedChangeRepository>,
        remote: Arc<InMemoryPlatform>,
    }

    async fn fixture() -> anyhow::Result<Fixture> {
        let db = DatabaseConnection::in_memory().await?;
        db.migrate().await?;
        let pool = db.pool().clone();
        let versions = Arc::new(SqliteVersionRepository::new(pool.clone(), &StreamingConfig::default()));
        let changes = Arc::new(SqliteStagedChangeRepository::new(pool.clone()));
        let remote = Arc::new(InMemoryPlatform::new());
        let manager = RollbackManager::new(
            versions.clone(),
            changes.clone(),
            Arc::new(SqliteRollbackRepository::new(pool)),
            remote.clone(),
        );
        Ok(Fixture {
            manager,
            versions,
            changes,
            remote,
        })
    }

    fn price(value: f64) -> EntitySnapshot {
        EntitySnapshot::Product(ProductSnapshot {
            sku: Some("SKU-7".into()),
            price: Some(value),
            ..ProductSnapshot::default()
        })
    }

    fn applied_update(previous_version_id: Option<i64>, remote_id: &str) -> StagedChange {
        let mut change = StagedChange::new(
            EntityType::Product,
            Some("p-7".into()),
            ChangeType::Update,
            SyncDirection::LocalToRemote,
            Some(price(5.0)),
            Some(price(6.0)),
        );
        change.status = ChangeStatus::Applied;
        change.remote_id = Some(remote_id.to_string());
        change.previous_version_id = previous_version_id;
        change
    }

    #[tokio::test]
    async fn test_missing_previous_version_fails_rollback() -> anyhow::Result<()> {
        let fx = fixture().await?;
        let change = applied_update(Some(999), "gid://product/1");
        fx.changes.insert(&change).await?;

        let result = fx.manager.rollback(&change.change_id, "ops", None).await;
        assert!(matches!(result, Err(SyncError::MissingVersion { .. })));

        let failed = fx.manager.list_rollbacks(RollbackStatus::Failed).await?;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].staged_change_id, change.change_id);
        assert_eq!(fx.remote.call_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_rollback_data_does_not_hide_missing_previous_version() -> anyhow::Result<()> {
        let fx = fixture().await?;
        fx.remote.insert(EntityType::Product, "gid://product/1", price(6.0));
        let mut change = applied_update(Some(999), "gid://product/1");
        change.rollback_data = Some(price(5.0));
        fx.changes.insert(&change).await?;

        let result = fx.manager.rollback(&change.change_id, "ops", None).await;
        assert!(matches!(result, Err(SyncError::MissingVersion { .. })));
        assert_eq!(fx.manager.list_rollbacks(RollbackStatus::Failed).await?.len(), 1);
        assert_eq!(fx.remote.get(EntityType::Product, "gid://product/1"), Some(price(6.0)));

        let reloaded = fx.changes.find_by_id(&change.change_id).await?.unwrap();
        assert_eq!(reloaded.status, ChangeStatus::Applied);
        Ok(())
    }

    #[tokio::test]
    async fn test_remote_failure_is_terminal() -> anyhow::Result<()> {
        let fx = fixture().await?;
        let previous = fx
            .versions
            .append(NewVersion::new(EntityType::Product, "p-7", price(5.0), SourceSystem::Local))
            .await?;
        fx.versions
            .append(NewVersion::new(EntityType::Product, "p-7", price(6.0), SourceSystem::Local))
            .await?;
        fx.remote.insert(EntityType::Product, "gid://product/1", price(6.0));
        fx.remote.reject_remote_id("gid://product/1");

        let change = applied_update(Some(previous.id), "gid://product/1");
        fx.changes.insert(&change).await?;

        let result = fx.manager.rollback(&change.change_id, "ops", Some("bad price".into())).await;
        assert!(matches!(result, Err(SyncError::RollbackFailed { .. })));

        let attempts = fx.manager.rollbacks_for_change(&change.change_id).await?;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, RollbackStatus::Failed);
        assert!(attempts[0].error_message.is_some());

        let reloaded = fx.changes.find_by_id(&change.change_id).await?.unwrap();
        assert_eq!(reloaded.status, ChangeStatus::Applied);
        assert_eq!(fx.versions.history(EntityType::Product, "p-7").await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_update_rollback_restores_previous_snapshot() -> anyhow::Result<()> {
        let fx = fixture().await?;
        let previous = fx
            .versions
            .append(NewVersion::new(EntityType::Product, "p-7", price(5.0), SourceSystem::Local))
            .await?;
        fx.versions
            .append(NewVersion::new(EntityType::Product, "p-7", price(6.0), SourceSystem::Local))
            .await?;
        fx.remote.insert(EntityType::Product, "gid://product/1", price(6.0));

        let change = applied_update(Some(previous.id), "gid://product/1");
        fx.changes.insert(&change).await?;

        let rollback = fx.manager.rollback(&change.change_id, "ops", None).await?;
        assert_eq!(rollback.status, RollbackStatus::Completed);
        assert_eq!(fx.remote.get(EntityType::Product, "gid://product/1"), Some(price(5.0)));

        let latest = fx.versions.latest(EntityType::Product, "p-7").await?.unwrap();
        assert_eq!(latest.version_number, 3);
        assert_eq!(latest.data_snapshot, price(5.0));
        assert_eq!(rollback.restored_version_id, Some(latest.id));

        let again = fx.manager.rollback(&change.change_id, "ops", None).await;
        assert!(matches!(again, Err(SyncError::InvalidTransition { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_create_rolls_back_as_delete() -> anyhow::Result<()> {
        let fx = fixture().await?;
        fx.versions
            .append(
                NewVersion::new(EntityType::Product, "gid://product/3", price(1.0), SourceSystem::Local)
                    .with_remote_id(Some("gid://product/3".into())),
            )
            .await?;
        fx.remote.insert(EntityType::Product, "gid://product/3", price(1.0));

        let mut change = StagedChange::new(
            EntityType::Product,
            Some("gid://product/3".into()),
            ChangeType::Create,
            SyncDirection::LocalToRemote,
            None,
            Some(price(1.0)),
        );
        change.status = ChangeStatus::Applied;
        fx.changes.insert(&change).await?;

        fx.manager.rollback(&change.change_id, "ops", None).await?;
        assert!(fx.remote.is_empty());
        let latest = fx.versions.latest(EntityType::Product, "gid://product/3").await?.unwrap();
        assert!(latest.data_snapshot.is_tombstone());
        Ok(())
    }
}
