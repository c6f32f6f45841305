//! Repository interfaces for the sync stores
//!
//! Contains trait definitions for the durable state of the engine. SQLite
//! implementations live in the infrastructure layer.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::approval_rule::{NewApprovalRule, SyncApprovalRule};
use crate::domain::entity::EntityType;
use crate::domain::rollback::{RollbackStatus, SyncRollback};
use crate::domain::staged_change::{ChangeStatus, StagedChange};
use crate::domain::sync_batch::{BatchStatus, SyncBatch};
use crate::domain::sync_version::{NewVersion, SyncVersion};

/// Append-only version chain per entity
#[async_trait]
pub trait VersionRepository: Send + Sync {
    /// Append the next version; numbers are assigned gap-free per entity
    async fn append(&self, version: NewVersion) -> Result<SyncVersion>;
    async fn find_by_id(&self, id: i64) -> Result<Option<SyncVersion>>;
    async fn latest(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<SyncVersion>>;
    async fn history(&self, entity_type: EntityType, entity_id: &str) -> Result<Vec<SyncVersion>>;
    async fn count(&self) -> Result<u64>;
}

#[async_trait]
pub trait StagedChangeRepository: Send + Sync {
    async fn insert(&self, change: &StagedChange) -> Result<()>;
    async fn update(&self, change: &StagedChange) -> Result<()>;
    async fn find_by_id(&self, change_id: &str) -> Result<Option<StagedChange>>;
    /// Ordered by priority then creation time
    async fn find_by_status(&self, status: ChangeStatus, limit: u32) -> Result<Vec<StagedChange>>;
    async fn find_by_batch(&self, batch_id: &str) -> Result<Vec<StagedChange>>;
    async fn count_by_status(&self, status: ChangeStatus) -> Result<u64>;
}

#[async_trait]
pub trait SyncBatchRepository: Send + Sync {
    /// Insert or replace the terminal record of a batch
    async fn save(&self, batch: &SyncBatch) -> Result<()>;
    async fn find_by_id(&self, batch_id: &str) -> Result<Option<SyncBatch>>;
    /// Batches created inside `[from, to)`, newest first
    async fn find_in_range(
        &self,
        status: Option<BatchStatus>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SyncBatch>>;
}

#[async_trait]
pub trait ApprovalRuleRepository: Send + Sync {
    async fn create(&self, rule: &NewApprovalRule) -> Result<SyncApprovalRule>;
    /// Active rules in evaluation order
    async fn find_active(&self) -> Result<Vec<SyncApprovalRule>>;
    async fn find_by_id(&self, id: i64) -> Result<Option<SyncApprovalRule>>;
    async fn set_active(&self, id: i64, is_active: bool) -> Result<bool>;
}

#[async_trait]
pub trait RollbackRepository: Send + Sync {
    async fn save(&self, rollback: &SyncRollback) -> Result<()>;
    async fn find_by_id(&self, rollback_id: &str) -> Result<Option<SyncRollback>>;
    async fn find_by_change(&self, staged_change_id: &str) -> Result<Vec<SyncRollback>>;
    async fn find_by_status(&self, status: RollbackStatus) -> Result<Vec<SyncRollback>>;
}
