//! Staged change lifecycle
//!
//! 외부 데이터 → 충돌 감지(버전 저장소 기준) → 스테이징 → 승인 규칙 평가 →
//! 적용(원격 반영 + 새 버전 기록) 흐름을 조율합니다. 승인된 변경들은 배치
//! 엔진을 통해 적용되므로 한 변경의 실패가 배치 전체를 멈추지 않습니다.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, warn};

use crate::application::approval_engine::{ApprovalDecision, ApprovalRuleEngine};
use crate::application::conflict_detector::{ConflictDetector, apply_resolution};
use crate::domain::conflict::{Conflict, ConflictResolution, ResolutionStrategy};
use crate::domain::entity::{EntitySnapshot, EntityType, FieldMap, entity_key};
use crate::domain::errors::{SyncError, SyncResult};
use crate::domain::repositories::{StagedChangeRepository, VersionRepository};
use crate::domain::staged_change::{
    ApplicationResult, ChangeStatus, ChangeType, StagedChange, SyncDirection,
};
use crate::domain::sync_version::{NewVersion, SourceSystem, SyncVersion};
use crate::infrastructure::batch_engine::{BatchProcessor, BatchProgress, ItemFn, ItemOutcome};
use crate::infrastructure::entity_locks::EntityLocks;
use crate::infrastructure::remote_platform::RemotePlatform;

/// Input for staging one change
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub entity_type: EntityType,
    /// `None` for creates that have no local identity yet
    pub entity_id: Option<String>,
    pub change_type: ChangeType,
    pub sync_direction: SyncDirection,
    pub proposed: Option<EntitySnapshot>,
    /// State of the other side as last observed, used for conflict detection
    pub observed_target: Option<EntitySnapshot>,
    pub priority: i32,
}

impl StageRequest {
    pub fn new(
        entity_type: EntityType,
        entity_id: Option<String>,
        change_type: ChangeType,
        proposed: Option<EntitySnapshot>,
    ) -> Self {
        Self {
            entity_type,
            entity_id,
            change_type,
            sync_direction: SyncDirection::LocalToRemote,
            proposed,
            observed_target: None,
            priority: 100,
        }
    }

    #[must_use]
    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.sync_direction = direction;
        self
    }

    #[must_use]
    pub fn with_observed_target(mut self, observed: EntitySnapshot) -> Self {
        self.observed_target = Some(observed);
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Rebuild a snapshot of the same schema from merged fields
fn rebuild_like(
    original: &EntitySnapshot,
    entity_type: EntityType,
    fields: FieldMap,
) -> SyncResult<EntitySnapshot> {
    match original {
        EntitySnapshot::Dynamic(_) => Ok(EntitySnapshot::Dynamic(fields)),
        _ => EntitySnapshot::from_fields(entity_type, fields),
    }
}

/// Conflicts caught before staging
struct ConflictOutcome {
    proposed: Option<EntitySnapshot>,
    conflict: Option<Conflict>,
}

pub struct StagingService {
    versions: Arc<dyn VersionRepository>,
    changes: Arc<dyn StagedChangeRepository>,
    detector: Arc<ConflictDetector>,
    approvals: Arc<ApprovalRuleEngine>,
    remote: Arc<dyn RemotePlatform>,
    batches: Arc<BatchProcessor<StagedChange>>,
    in_flight: Mutex<HashSet<String>>,
    entity_locks: Arc<EntityLocks>,
}

impl StagingService {
    pub fn new(
        versions: Arc<dyn VersionRepository>,
        changes: Arc<dyn StagedChangeRepository>,
        detector: Arc<ConflictDetector>,
        approvals: Arc<ApprovalRuleEngine>,
        remote: Arc<dyn RemotePlatform>,
        batches: Arc<BatchProcessor<StagedChange>>,
    ) -> Self {
        Self {
            versions,
            changes,
            detector,
            approvals,
            remote,
            batches,
            in_flight: Mutex::new(HashSet::new()),
            entity_locks: Arc::new(EntityLocks::new()),
        }
    }

    /// Share entity locks with other writers of the version chain
    #[must_use]
    pub fn with_entity_locks(mut self, locks: Arc<EntityLocks>) -> Self {
        self.entity_locks = locks;
        self
    }

    pub fn batches(&self) -> &Arc<BatchProcessor<StagedChange>> {
        &self.batches
    }

    /// Record an externally observed snapshot; unchanged content is not re-versioned
    pub async fn ingest_snapshot(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        remote_id: Option<String>,
        snapshot: EntitySnapshot,
        source: SourceSystem,
    ) -> SyncResult<Option<SyncVersion>> {
        let latest = self.versions.latest(entity_type, entity_id).await?;
        if latest.as_ref().is_some_and(|v| v.matches(&snapshot)) {
            return Ok(None);
        }

        let remote_id = remote_id.or_else(|| latest.and_then(|v| v.remote_id));
        let version = self
            .versions
            .append(NewVersion::new(entity_type, entity_id, snapshot, source).with_remote_id(remote_id))
            .await?;
        info!(
            "📥 Ingested {} {} as version {}",
            entity_type, entity_id, version.version_number
        );
        Ok(Some(version))
    }

    /// Three-way check of the proposal against the observed other side
    fn check_conflicts(
        &self,
        request: &StageRequest,
        current: Option<&SyncVersion>,
    ) -> SyncResult<ConflictOutcome> {
        let (Some(proposed), Some(observed)) = (&request.proposed, &request.observed_target) else {
            return Ok(ConflictOutcome {
                proposed: request.proposed.clone(),
                conflict: None,
            });
        };

        let base = current.map(|v| v.data_snapshot.to_fields());
        let source = proposed.to_fields();
        let Some(conflict) = self
            .detector
            .detect_with_base(base.as_ref(), &source, &observed.to_fields())
        else {
            return Ok(ConflictOutcome {
                proposed: request.proposed.clone(),
                conflict: None,
            });
        };

        if conflict.is_auto_resolvable {
            if let Some(resolved) = self.detector.attempt_auto_resolution(&conflict.conflict_id)? {
                if let Some(merged) = apply_resolution(&source, &resolved) {
                    return Ok(ConflictOutcome {
                        proposed: Some(rebuild_like(proposed, request.entity_type, merged)?),
                        conflict: Some(resolved),
                    });
                }
            }
        }

        Ok(ConflictOutcome {
            proposed: request.proposed.clone(),
            conflict: Some(conflict),
        })
    }

    /// Diff, conflict-check, evaluate approval rules and persist a change
    pub async fn stage_change(&self, request: StageRequest) -> SyncResult<StagedChange> {
        let current = match &request.entity_id {
            Some(entity_id) => self.versions.latest(request.entity_type, entity_id).await?,
            None => None,
        };
        let current_exists = current.as_ref().is_some_and(|v| !v.data_snapshot.is_tombstone());

        match request.change_type {
            ChangeType::Create if current_exists => {
                return Err(SyncError::Validation(format!(
                    "{} {} already exists",
                    request.entity_type,
                    request.entity_id.as_deref().unwrap_or_default()
                )));
            }
            ChangeType::Update | ChangeType::Merge | ChangeType::Delete if !current_exists => {
                return Err(SyncError::MissingVersion {
                    entity_type: request.entity_type.to_string(),
                    entity_id: request.entity_id.clone().unwrap_or_default(),
                    detail: format!("{} needs a synced current version", request.change_type),
                });
            }
            _ => {}
        }
        if request.change_type != ChangeType::Delete && request.proposed.is_none() {
            return Err(SyncError::Validation(format!(
                "{} change needs proposed data",
                request.change_type
            )));
        }

        let outcome = self.check_conflicts(&request, current.as_ref())?;
        let current_data = current
            .as_ref()
            .map(|v| v.data_snapshot.clone())
            .filter(|snapshot| !snapshot.is_tombstone());
        let proposed = if request.change_type == ChangeType::Delete {
            None
        } else {
            outcome.proposed
        };

        let mut change = StagedChange::new(
            request.entity_type,
            request.entity_id.clone(),
            request.change_type,
            request.sync_direction,
            current_data,
            proposed,
        );
        change.priority = request.priority;
        change.remote_id = current.as_ref().and_then(|v| v.remote_id.clone());

        if let Some(conflict) = outcome.conflict {
            // 자동 해결된 충돌은 변경 레코드에만 남기고 큐와 연결하지 않음
            if !conflict.is_resolved() {
                self.detector.link_change(&conflict.conflict_id, &change.change_id)?;
            }
            change.conflict_fields = conflict.conflicting_fields();
            change.conflict_severity = Some(conflict.severity);
            change.has_conflicts = !conflict.is_resolved();
            change.conflict_resolution = conflict.resolution;
        }

        let decision = self.approvals.apply(&mut change).await?;
        self.changes.insert(&change).await?;

        match decision {
            ApprovalDecision::AutoApprove { .. } => info!(
                "📝 Staged change {} ({} {}) auto-approved",
                change.change_id, change.change_type, change.entity_type
            ),
            ApprovalDecision::RequiresReview { reason, .. } => info!(
                "📝 Staged change {} ({} {}) pending review: {}",
                change.change_id, change.change_type, change.entity_type, reason
            ),
        }
        Ok(change)
    }

    /// Stage a local edit, checking it against the remote's current state
    pub async fn stage_local_edit(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        proposed: EntitySnapshot,
    ) -> SyncResult<StagedChange> {
        let latest = self.versions.latest(entity_type, entity_id).await?;
        let mut request = StageRequest::new(
            entity_type,
            Some(entity_id.to_string()),
            ChangeType::Update,
            Some(proposed),
        );
        if let Some(remote_id) = latest.and_then(|v| v.remote_id) {
            if let Some(observed) = self.remote.fetch_entity(entity_type, &remote_id).await? {
                request = request.with_observed_target(observed);
            }
        }
        self.stage_change(request).await
    }

    async fn load(&self, change_id: &str) -> SyncResult<StagedChange> {
        self.changes
            .find_by_id(change_id)
            .await?
            .ok_or_else(|| SyncError::not_found("staged_change", change_id))
    }

    pub async fn get_change(&self, change_id: &str) -> SyncResult<StagedChange> {
        self.load(change_id).await
    }

    pub async fn list_changes(&self, status: ChangeStatus, limit: u32) -> SyncResult<Vec<StagedChange>> {
        Ok(self.changes.find_by_status(status, limit).await?)
    }

    pub async fn changes_in_batch(&self, batch_id: &str) -> SyncResult<Vec<StagedChange>> {
        Ok(self.changes.find_by_batch(batch_id).await?)
    }

    /// Close the change's open conflict in favour of one side
    fn settle_conflict(
        &self,
        change: &mut StagedChange,
        strategy: ResolutionStrategy,
        reviewer: &str,
    ) -> SyncResult<()> {
        let Some(conflict) = self.detector.open_conflict_for_change(&change.change_id) else {
            return Ok(());
        };
        let resolved_values = conflict
            .field_conflicts
            .iter()
            .filter_map(|fc| {
                let value = match strategy {
                    ResolutionStrategy::PreferTarget => fc.target_value.clone(),
                    _ => fc.source_value.clone(),
                };
                value.map(|v| (fc.field.clone(), v))
            })
            .collect();
        let resolved = self.detector.resolve_conflict(
            &conflict.conflict_id,
            ConflictResolution {
                strategy: Some(strategy),
                resolved_values,
                notes: Some(format!("settled by review of change {}", change.change_id)),
            },
            reviewer,
        )?;
        change.conflict_resolution = resolved.resolution;
        Ok(())
    }

    pub async fn approve_change(
        &self,
        change_id: &str,
        reviewer: &str,
        notes: Option<String>,
    ) -> SyncResult<StagedChange> {
        let mut change = self.load(change_id).await?;
        change.approve(reviewer, notes)?;
        if change.has_conflicts {
            self.settle_conflict(&mut change, ResolutionStrategy::PreferSource, reviewer)?;
        }
        self.changes.update(&change).await?;
        info!("👍 Change {} approved by {}", change_id, reviewer);
        Ok(change)
    }

    pub async fn reject_change(
        &self,
        change_id: &str,
        reviewer: &str,
        notes: Option<String>,
    ) -> SyncResult<StagedChange> {
        let mut change = self.load(change_id).await?;
        change.reject(reviewer, notes)?;
        if change.has_conflicts {
            self.settle_conflict(&mut change, ResolutionStrategy::PreferTarget, reviewer)?;
        }
        self.changes.update(&change).await?;
        info!("👎 Change {} rejected by {}", change_id, reviewer);
        Ok(change)
    }

    /// Write the change to its target side; returns the new snapshot and remote id
    async fn push(
        &self,
        change: &StagedChange,
        remote_id: Option<String>,
        current_live: bool,
    ) -> SyncResult<(EntitySnapshot, Option<String>)> {
        let entity_type = change.entity_type;
        let proposed = || {
            change.proposed_data.clone().ok_or_else(|| {
                SyncError::Validation(format!("change {} has no proposed data", change.change_id))
            })
        };
        let require_remote_id = || {
            remote_id.clone().ok_or_else(|| {
                SyncError::Validation(format!("change {} has no remote id", change.change_id))
            })
        };

        // Local side is the version store itself
        if change.sync_direction == SyncDirection::RemoteToLocal {
            let snapshot = match change.change_type {
                ChangeType::Delete => EntitySnapshot::Tombstone,
                _ => proposed()?,
            };
            return Ok((snapshot, remote_id));
        }

        match change.change_type {
            // 살아있는 엔티티의 복원은 중복 생성 대신 갱신
            ChangeType::Restore if current_live && remote_id.is_some() => {
                let snapshot = proposed()?;
                let remote_id = require_remote_id()?;
                self.remote
                    .update_entity(entity_type, &remote_id, &snapshot)
                    .await?;
                Ok((snapshot, Some(remote_id)))
            }
            ChangeType::Create | ChangeType::Restore => {
                let snapshot = proposed()?;
                let created = self.remote.create_entity(entity_type, &snapshot).await?;
                Ok((snapshot, Some(created)))
            }
            ChangeType::Update | ChangeType::Merge => {
                let snapshot = proposed()?;
                let remote_id = require_remote_id()?;
                self.remote
                    .update_entity(entity_type, &remote_id, &snapshot)
                    .await?;
                Ok((snapshot, Some(remote_id)))
            }
            ChangeType::Delete => {
                let remote_id = require_remote_id()?;
                self.remote.delete_entity(entity_type, &remote_id).await?;
                Ok((EntitySnapshot::Tombstone, Some(remote_id)))
            }
        }
    }

    /// Apply one approved change: remote write, new version, rollback data
    pub async fn apply_change(&self, change_id: &str, applied_by: &str) -> SyncResult<StagedChange> {
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if !in_flight.insert(change_id.to_string()) {
                return Err(SyncError::Batch(format!(
                    "change {change_id} is already being applied"
                )));
            }
        }
        let result = self.apply_exclusive(change_id, applied_by).await;
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(change_id);
        result
    }

    async fn apply_exclusive(&self, change_id: &str, applied_by: &str) -> SyncResult<StagedChange> {
        let mut change = self.load(change_id).await?;
        if change.status != ChangeStatus::Approved {
            return Err(SyncError::InvalidTransition {
                change_id: change.change_id.clone(),
                from: change.status.to_string(),
                to: ChangeStatus::Applied.to_string(),
            });
        }
        change.ensure_conflicts_cleared()?;

        // 읽기 → 원격 반영 → 버전 추가를 한 엔티티 안에서 직렬화
        let lock_key = change
            .entity_id
            .as_deref()
            .map(|entity_id| entity_key(change.entity_type, entity_id));
        let _entity_guard = match &lock_key {
            Some(key) => Some(self.entity_locks.lock(key).await),
            None => None,
        };
        let previous = match &change.entity_id {
            Some(entity_id) => self.versions.latest(change.entity_type, entity_id).await?,
            None => None,
        };
        let remote_id = change
            .remote_id
            .clone()
            .or_else(|| previous.as_ref().and_then(|v| v.remote_id.clone()));

        let current_live = previous
            .as_ref()
            .is_some_and(|v| !v.data_snapshot.is_tombstone());
        let (snapshot, remote_id) = match self.push(&change, remote_id, current_live).await {
            Ok(pushed) => pushed,
            Err(e) => {
                warn!("❌ Applying change {} failed: {}", change.change_id, e);
                change.record_failed_attempt(e.to_string());
                self.changes.update(&change).await?;
                return Err(e);
            }
        };

        let entity_id = change
            .entity_id
            .clone()
            .or_else(|| remote_id.clone())
            .unwrap_or_else(|| change.change_id.clone());
        change.entity_id = Some(entity_id.clone());

        let source = match change.sync_direction {
            SyncDirection::RemoteToLocal => SourceSystem::Remote,
            SyncDirection::LocalToRemote | SyncDirection::Bidirectional => SourceSystem::Local,
        };
        let version = self
            .versions
            .append(
                NewVersion::new(change.entity_type, &entity_id, snapshot, source)
                    .with_remote_id(remote_id.clone())
                    .with_change_id(&change.change_id),
            )
            .await?;

        let rollback_data = previous
            .as_ref()
            .map(|v| v.data_snapshot.clone())
            .filter(|snapshot| !snapshot.is_tombstone());
        change.mark_applied(
            applied_by,
            ApplicationResult {
                success: true,
                remote_id,
                version_id: Some(version.id),
                version_number: Some(version.version_number),
                message: None,
            },
            rollback_data,
            previous.map(|v| v.id),
        )?;
        self.changes.update(&change).await?;

        info!(
            "🚀 Change {} applied to {} {} (version {})",
            change.change_id, change.entity_type, entity_id, version.version_number
        );
        Ok(change)
    }

    /// Batch-engine view of one application attempt
    async fn apply_outcome(&self, change_id: &str, applied_by: &str) -> ItemOutcome {
        match self.apply_change(change_id, applied_by).await {
            Ok(_) => ItemOutcome::Success,
            Err(SyncError::UnreviewedConflict { fields, .. }) => {
                ItemOutcome::skipped(format!("awaiting conflict review on [{}]", fields.join(", ")))
            }
            Err(SyncError::InvalidTransition { from, .. }) => {
                ItemOutcome::skipped(format!("change is {from}, no longer approved"))
            }
            Err(e) => ItemOutcome::Failed(e.to_item_error()),
        }
    }

    /// Apply up to `limit` approved changes as one tracked batch
    pub async fn apply_approved_changes(
        self: &Arc<Self>,
        limit: u32,
        applied_by: &str,
    ) -> SyncResult<BatchProgress> {
        let mut approved = self.changes.find_by_status(ChangeStatus::Approved, limit).await?;
        let batch_id = self
            .batches
            .create_batch(approved.clone(), "apply_changes")
            .await?;

        for change in &mut approved {
            change.batch_id = Some(batch_id.clone());
            self.changes.update(change).await?;
        }
        info!("📦 Applying {} approved changes in batch {}", approved.len(), batch_id);

        let service = Arc::clone(self);
        let applied_by = applied_by.to_string();
        let transform = Arc::new(ItemFn(move |change: StagedChange| {
            let service = Arc::clone(&service);
            let applied_by = applied_by.clone();
            async move { service.apply_outcome(&change.change_id, &applied_by).await }
        }));
        self.batches.process_batch(&batch_id, transform).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::approval_rule::NewApprovalRule;
    use crate::domain::entity::ProductSnapshot;
    use crate::infrastructure::config::{BatchConfig, ConflictConfig, StreamingConfig};
    use crate::infrastructure::database_connection::DatabaseConnection;
    use crate::infrastructure::remote_platform::{InMemoryPlatform, RemoteError};
    use crate::infrastructure::sqlite_approval_rule_repository::SqliteApprovalRuleRepository;
    use crate::infrastructure::sqlite_staged_change_repository::SqliteStagedChangeRepository;
    use crate::infrastructure::sqlite_version_repository::SqliteVersionRepository;

    struct Fixture {
        service: Arc<StagingService>,
        remote: Arc<InMemoryPlatform>,
        approvals: Arc<ApprovalRuleEngine>,
    }

    async fn fixture() -> anyhow::Result<Fixture> {
        let db = DatabaseConnection::in_memory().await?;
        db.migrate().await?;
        let pool = db.pool().clone();

        let remote = Arc::new(InMemoryPlatform::new());
        let approvals = Arc::new(ApprovalRuleEngine::new(Arc::new(
            SqliteApprovalRuleRepository::new(pool.clone()),
        )));
        let batch_config = BatchConfig {
            retry_delay_ms: 1,
            ..BatchConfig::default()
        };
        let service = Arc::new(StagingService::new(
            Arc::new(SqliteVersionRepository::new(pool.clone(), &StreamingConfig::default())),
            Arc::new(SqliteStagedChangeRepository::new(pool)),
            Arc::new(ConflictDetector::new(ConflictConfig::default())),
            Arc::clone(&approvals),
            remote.clone(),
            Arc::new(BatchProcessor::new(batch_config)),
        ));
        Ok(Fixture {
            service,
            remote,
            approvals,
        })
    }

    fn product(price: f64, description: &str) -> EntitySnapshot {
        EntitySnapshot::Product(ProductSnapshot {
            sku: Some("SKU-1".into()),
            title: Some("Desk Lamp".into()),
            description: Some(description.into()),
            price: Some(price),
            ..ProductSnapshot::default()
        })
    }

    /// Create, approve and apply a product; returns its entity id
    async fn seed_product(fx: &Fixture) -> anyhow::Result<String> {
        let staged = fx
            .service
            .stage_change(StageRequest::new(
                EntityType::Product,
                None,
                ChangeType::Create,
                Some(product(10.0, "warm light")),
            ))
            .await?;
        fx.service.approve_change(&staged.change_id, "editor", None).await?;
        let applied = fx.service.apply_change(&staged.change_id, "editor").await?;
        Ok(applied.entity_id.unwrap_or_default())
    }

    #[tokio::test]
    async fn test_pending_change_cannot_be_applied() -> anyhow::Result<()> {
        let fx = fixture().await?;
        let staged = fx
            .service
            .stage_change(StageRequest::new(
                EntityType::Product,
                None,
                ChangeType::Create,
                Some(product(10.0, "warm light")),
            ))
            .await?;
        assert_eq!(staged.status, ChangeStatus::Pending);

        let result = fx.service.apply_change(&staged.change_id, "editor").await;
        assert!(matches!(result, Err(SyncError::InvalidTransition { .. })));
        assert!(fx.remote.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_create_then_update_builds_version_chain() -> anyhow::Result<()> {
        let fx = fixture().await?;
        let entity_id = seed_product(&fx).await?;
        assert!(entity_id.starts_with("gid://product/"));

        let staged = fx
            .service
            .stage_change(StageRequest::new(
                EntityType::Product,
                Some(entity_id.clone()),
                ChangeType::Update,
                Some(product(12.5, "warm light")),
            ))
            .await?;
        assert_eq!(staged.field_changes.len(), 1);
        assert_eq!(staged.field_changes[0].field, "price");

        fx.service.approve_change(&staged.change_id, "editor", None).await?;
        let applied = fx.service.apply_change(&staged.change_id, "editor").await?;

        assert_eq!(applied.status, ChangeStatus::Applied);
        assert_eq!(applied.rollback_data, Some(product(10.0, "warm light")));
        assert!(applied.previous_version_id.is_some());
        let result = applied.application_result.unwrap();
        assert_eq!(result.version_number, Some(2));
        assert_eq!(
            fx.remote.get(EntityType::Product, &entity_id),
            Some(product(12.5, "warm light"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_ingest_skips_unchanged_snapshot() -> anyhow::Result<()> {
        let fx = fixture().await?;
        let first = fx
            .service
            .ingest_snapshot(EntityType::Product, "p-1", Some("gid://product/9".into()), product(1.0, "a"), SourceSystem::Remote)
            .await?;
        assert!(first.is_some());

        let again = fx
            .service
            .ingest_snapshot(EntityType::Product, "p-1", None, product(1.0, "a"), SourceSystem::Remote)
            .await?;
        assert!(again.is_none());

        let changed = fx
            .service
            .ingest_snapshot(EntityType::Product, "p-1", None, product(2.0, "a"), SourceSystem::Remote)
            .await?
            .unwrap();
        assert_eq!(changed.version_number, 2);
        assert_eq!(changed.remote_id.as_deref(), Some("gid://product/9"));
        Ok(())
    }

    #[tokio::test]
    async fn test_both_sides_changing_price_needs_review() -> anyhow::Result<()> {
        let fx = fixture().await?;
        fx.approvals
            .create_rule(NewApprovalRule::new("auto everything", false, 100))
            .await?;
        let entity_id = seed_product(&fx).await?;

        let request = StageRequest::new(
            EntityType::Product,
            Some(entity_id),
            ChangeType::Update,
            Some(product(11.0, "warm light")),
        )
        .with_observed_target(product(13.0, "warm light"));
        let staged = fx.service.stage_change(request).await?;

        assert!(staged.has_conflicts);
        assert_eq!(staged.conflict_fields, vec!["price".to_string()]);
        assert_eq!(staged.status, ChangeStatus::Pending);
        Ok(())
    }

    #[tokio::test]
    async fn test_disjoint_edits_stage_cleanly() -> anyhow::Result<()> {
        let fx = fixture().await?;
        let entity_id = seed_product(&fx).await?;

        let request = StageRequest::new(
            EntityType::Product,
            Some(entity_id),
            ChangeType::Update,
            Some(product(11.0, "warm light")),
        )
        .with_observed_target(product(10.0, "bright light"));
        let staged = fx.service.stage_change(request).await?;

        assert!(!staged.has_conflicts);
        assert!(staged.conflict_fields.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_remote_failure_keeps_change_approved() -> anyhow::Result<()> {
        let fx = fixture().await?;
        let entity_id = seed_product(&fx).await?;
        let staged = fx
            .service
            .stage_change(StageRequest::new(
                EntityType::Product,
                Some(entity_id),
                ChangeType::Update,
                Some(product(20.0, "warm light")),
            ))
            .await?;
        fx.service.approve_change(&staged.change_id, "editor", None).await?;

        fx.remote.fail_next(RemoteError::Timeout("upstream".into()));
        let result = fx.service.apply_change(&staged.change_id, "editor").await;
        assert!(matches!(result, Err(SyncError::Remote(_))));

        let reloaded = fx.service.get_change(&staged.change_id).await?;
        assert_eq!(reloaded.status, ChangeStatus::Approved);
        assert!(reloaded.application_result.is_some_and(|r| !r.success));

        let applied = fx.service.apply_change(&staged.change_id, "editor").await?;
        assert_eq!(applied.status, ChangeStatus::Applied);
        Ok(())
    }

    #[tokio::test]
    async fn test_apply_approved_changes_isolates_failures() -> anyhow::Result<()> {
        let fx = fixture().await?;
        let first = seed_product(&fx).await?;
        let second = seed_product(&fx).await?;
        fx.remote.reject_remote_id(second.clone());

        for entity_id in [&first, &second] {
            let staged = fx
                .service
                .stage_change(StageRequest::new(
                    EntityType::Product,
                    Some(entity_id.clone()),
                    ChangeType::Update,
                    Some(product(30.0, "warm light")),
                ))
                .await?;
            fx.service.approve_change(&staged.change_id, "editor", None).await?;
        }

        let progress = fx.service.apply_approved_changes(10, "scheduler").await?;
        assert_eq!(progress.batch.total_items, 2);
        assert_eq!(progress.batch.successful_items, 1);
        assert_eq!(progress.batch.failed_items, 1);

        let tagged = fx.service.changes_in_batch(&progress.batch.batch_id).await?;
        assert_eq!(tagged.len(), 2);
        assert_eq!(fx.service.list_changes(ChangeStatus::Approved, 10).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_update_of_unknown_entity_is_rejected() -> anyhow::Result<()> {
        let fx = fixture().await?;
        let result = fx
            .service
            .stage_change(StageRequest::new(
                EntityType::Product,
                Some("ghost".into()),
                ChangeType::Update,
                Some(product(1.0, "x")),
            ))
            .await;
        assert!(matches!(result, Err(SyncError::MissingVersion { .. })));
        Ok(())
    }
}
