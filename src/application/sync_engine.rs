//! Engine facade
//!
//! 모든 서비스를 명시적으로 생성하고 연결합니다. 전역 싱글턴 없이
//! `start`/`shutdown`으로 메모리 모니터의 수명을 관리합니다.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use tracing::info;

use crate::application::approval_engine::ApprovalRuleEngine;
use crate::application::conflict_detector::ConflictDetector;
use crate::application::record_validation::{CatalogRecord, RequiredFieldsValidator};
use crate::application::rollback_manager::RollbackManager;
use crate::application::staging_service::StagingService;
use crate::application::sync_health::SyncHealthService;
use crate::domain::errors::SyncResult;
use crate::domain::staged_change::StagedChange;
use crate::infrastructure::Reclaimable;
use crate::domain::sync_batch::BatchStatus;
use crate::infrastructure::batch_engine::{BatchProcessor, BatchProgress, BatchTransform};
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::database_connection::DatabaseConnection;
use crate::infrastructure::entity_locks::EntityLocks;
use crate::infrastructure::memory_monitor::{MemoryMonitor, MemorySampler, SystemMemorySampler};
use crate::infrastructure::remote_platform::{ApiUsageSource, RateLimitedPlatform, RemotePlatform};
use crate::infrastructure::sqlite_approval_rule_repository::SqliteApprovalRuleRepository;
use crate::infrastructure::sqlite_batch_repository::SqliteBatchRepository;
use crate::infrastructure::sqlite_rollback_repository::SqliteRollbackRepository;
use crate::infrastructure::sqlite_staged_change_repository::SqliteStagedChangeRepository;
use crate::infrastructure::sqlite_version_repository::SqliteVersionRepository;
use crate::infrastructure::streaming::StreamingChunkProcessor;

/// Totals of a streamed validation run
#[derive(Debug, Clone, Serialize)]
pub struct ValidationSummary {
    pub batches: Vec<BatchProgress>,
    pub total_items: usize,
    pub processed_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,
    pub skipped_items: usize,
}

impl ValidationSummary {
    fn from_batches(batches: Vec<BatchProgress>) -> Self {
        let sum = |f: fn(&BatchProgress) -> usize| batches.iter().map(f).sum::<usize>();
        Self {
            total_items: sum(|p| p.batch.total_items),
            processed_items: sum(|p| p.batch.processed_items),
            successful_items: sum(|p| p.batch.successful_items),
            failed_items: sum(|p| p.batch.failed_items),
            skipped_items: sum(|p| p.batch.skipped_items),
            batches,
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.processed_items == 0 {
            0.0
        } else {
            self.failed_items as f64 / self.processed_items as f64
        }
    }

    /// Least favourable status across the run's batches
    pub fn status(&self) -> BatchStatus {
        let statuses = || self.batches.iter().map(BatchProgress::status);
        if statuses().any(|s| s == BatchStatus::Failed) {
            BatchStatus::Failed
        } else if statuses().any(|s| s == BatchStatus::Cancelled) {
            BatchStatus::Cancelled
        } else if statuses().any(|s| s == BatchStatus::CompletedWithErrors) {
            BatchStatus::CompletedWithErrors
        } else {
            BatchStatus::Completed
        }
    }
}

pub struct SyncEngine {
    config: AppConfig,
    database: DatabaseConnection,
    remote: Arc<dyn RemotePlatform>,
    memory: Arc<MemoryMonitor>,
    streaming: StreamingChunkProcessor,
    detector: Arc<ConflictDetector>,
    approvals: Arc<ApprovalRuleEngine>,
    staging: Arc<StagingService>,
    rollbacks: Arc<RollbackManager>,
    health: Arc<SyncHealthService>,
    record_batches: Arc<BatchProcessor<CatalogRecord>>,
}

impl SyncEngine {
    /// Open the configured database, migrate it and wire every service
    pub async fn connect<P>(config: AppConfig, platform: P) -> Result<Self>
    where
        P: RemotePlatform + 'static,
    {
        let database = DatabaseConnection::from_config(&config.database).await?;
        database.migrate().await.context("database migration failed")?;
        let sampler = Arc::new(SystemMemorySampler::new()?);
        Self::build(config, database, platform, sampler)
    }

    pub fn build<P>(
        config: AppConfig,
        database: DatabaseConnection,
        platform: P,
        sampler: Arc<dyn MemorySampler>,
    ) -> Result<Self>
    where
        P: RemotePlatform + 'static,
    {
        let pool = database.pool().clone();
        let limited = Arc::new(RateLimitedPlatform::new(platform, &config.remote)?);
        let remote: Arc<dyn RemotePlatform> = limited.clone();
        let api_usage: Arc<dyn ApiUsageSource> = limited;

        let memory = Arc::new(MemoryMonitor::new(config.memory.clone(), sampler));
        let versions = Arc::new(SqliteVersionRepository::new(pool.clone(), &config.streaming));
        let changes = Arc::new(SqliteStagedChangeRepository::new(pool.clone()));
        let batch_records = Arc::new(SqliteBatchRepository::new(pool.clone()));
        let rollback_records = Arc::new(SqliteRollbackRepository::new(pool.clone()));
        let rules = Arc::new(SqliteApprovalRuleRepository::new(pool));

        let streaming = StreamingChunkProcessor::new(config.streaming.chunk_size);
        for reclaimable in versions.reclaimables() {
            streaming.register_reclaimable(reclaimable);
        }
        streaming.attach_to(&memory);

        let change_batches = Arc::new(
            BatchProcessor::<StagedChange>::new(config.batch.clone())
                .with_repository(batch_records.clone())
                .with_memory_monitor(Arc::clone(&memory))
                .with_api_usage(api_usage),
        );
        change_batches.attach_memory_callbacks(&memory);
        let record_batches = Arc::new(
            BatchProcessor::<CatalogRecord>::new(config.batch.clone())
                .with_repository(batch_records.clone())
                .with_memory_monitor(Arc::clone(&memory)),
        );
        record_batches.attach_memory_callbacks(&memory);

        let detector = Arc::new(ConflictDetector::new(config.conflicts.clone()));
        streaming.register_reclaimable(Arc::clone(&detector) as Arc<dyn Reclaimable>);
        let approvals = Arc::new(ApprovalRuleEngine::new(rules));
        // 적용과 롤백이 같은 엔티티 버전 체인을 번갈아 쓰지 않도록 잠금 공유
        let entity_locks = Arc::new(EntityLocks::new());
        let staging = Arc::new(
            StagingService::new(
                versions.clone(),
                changes.clone(),
                Arc::clone(&detector),
                Arc::clone(&approvals),
                Arc::clone(&remote),
                change_batches,
            )
            .with_entity_locks(Arc::clone(&entity_locks)),
        );
        let rollbacks = Arc::new(
            RollbackManager::new(
                versions,
                changes.clone(),
                rollback_records.clone(),
                Arc::clone(&remote),
            )
            .with_entity_locks(entity_locks),
        );
        let health = Arc::new(
            SyncHealthService::new(
                config.health.clone(),
                batch_records,
                changes,
                rollback_records,
                Arc::clone(&detector),
            )
            .with_memory_monitor(Arc::clone(&memory)),
        );

        Ok(Self {
            config,
            database,
            remote,
            memory,
            streaming,
            detector,
            approvals,
            staging,
            rollbacks,
            health,
            record_batches,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn staging(&self) -> &Arc<StagingService> {
        &self.staging
    }

    pub fn rollbacks(&self) -> &Arc<RollbackManager> {
        &self.rollbacks
    }

    pub fn approvals(&self) -> &Arc<ApprovalRuleEngine> {
        &self.approvals
    }

    pub fn conflicts(&self) -> &Arc<ConflictDetector> {
        &self.detector
    }

    pub fn health(&self) -> &Arc<SyncHealthService> {
        &self.health
    }

    pub fn memory(&self) -> &Arc<MemoryMonitor> {
        &self.memory
    }

    pub fn streaming(&self) -> &StreamingChunkProcessor {
        &self.streaming
    }

    pub fn record_batches(&self) -> &Arc<BatchProcessor<CatalogRecord>> {
        &self.record_batches
    }

    pub fn change_batches(&self) -> &Arc<BatchProcessor<StagedChange>> {
        self.staging.batches()
    }

    /// Start background tasks
    pub fn start(&self) {
        if self.memory.start() {
            info!("🚀 Sync engine started");
        }
    }

    /// Stop background tasks and close the pool
    pub async fn shutdown(&self) {
        self.memory.shutdown().await;
        self.database.close().await;
        info!("🛑 Sync engine stopped");
    }

    pub async fn upload_image(&self, file_name: &str, bytes: &[u8]) -> SyncResult<String> {
        Ok(self.remote.upload_image(file_name, bytes).await?)
    }

    /// Stream records through chunking and run each chunk as a tracked batch
    pub async fn validate_records<S>(
        &self,
        records: S,
        validator: RequiredFieldsValidator,
    ) -> SyncResult<ValidationSummary>
    where
        S: Stream<Item = CatalogRecord>,
    {
        let transform: Arc<dyn BatchTransform<CatalogRecord>> = Arc::new(validator);
        let batches = Arc::clone(&self.record_batches);

        let results: Vec<SyncResult<BatchProgress>> = self
            .streaming
            .process(records, move |chunk| {
                let batches = Arc::clone(&batches);
                let transform = Arc::clone(&transform);
                async move { batches.run_batch(chunk, "validate_records", transform).await }
            })
            .collect()
            .await;

        let progress = results.into_iter().collect::<SyncResult<Vec<_>>>()?;
        let summary = ValidationSummary::from_batches(progress);
        info!(
            "✅ Validated {} records: {} ok, {} failed, {} skipped",
            summary.processed_items,
            summary.successful_items,
            summary.failed_items,
            summary.skipped_items
        );
        Ok(summary)
    }
}
