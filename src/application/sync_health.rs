//! Sync health reporting
//!
//! 지정된 시간 창 안의 배치 결과, 대기 중인 변경, 열린 충돌, 실패한 롤백과
//! 최근 메모리 샘플을 모아 하나의 상태 지표로 요약합니다.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::application::conflict_detector::ConflictDetector;
use crate::domain::errors::{SyncError, SyncResult};
use crate::domain::repositories::{RollbackRepository, StagedChangeRepository, SyncBatchRepository};
use crate::domain::rollback::RollbackStatus;
use crate::domain::staged_change::ChangeStatus;
use crate::domain::sync_batch::BatchStatus;
use crate::infrastructure::config::HealthConfig;
use crate::infrastructure::memory_monitor::{MemoryMonitor, MemoryPressure, MemoryStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncHealthReport {
    pub status: HealthStatus,
    /// Human readable reasons for a non-healthy status
    pub issues: Vec<String>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub batches_by_status: BTreeMap<BatchStatus, usize>,
    pub items_processed: usize,
    pub items_failed: usize,
    pub error_rate: f64,
    pub pending_changes: u64,
    pub approved_changes: u64,
    pub open_conflicts: usize,
    pub failed_rollbacks: usize,
    pub memory: Option<MemoryStats>,
}

pub struct SyncHealthService {
    config: HealthConfig,
    batches: Arc<dyn SyncBatchRepository>,
    changes: Arc<dyn StagedChangeRepository>,
    rollbacks: Arc<dyn RollbackRepository>,
    detector: Arc<ConflictDetector>,
    memory: Option<Arc<MemoryMonitor>>,
}

impl SyncHealthService {
    pub fn new(
        config: HealthConfig,
        batches: Arc<dyn SyncBatchRepository>,
        changes: Arc<dyn StagedChangeRepository>,
        rollbacks: Arc<dyn RollbackRepository>,
        detector: Arc<ConflictDetector>,
    ) -> Self {
        Self {
            config,
            batches,
            changes,
            rollbacks,
            detector,
            memory: None,
        }
    }

    #[must_use]
    pub fn with_memory_monitor(mut self, monitor: Arc<MemoryMonitor>) -> Self {
        self.memory = Some(monitor);
        self
    }

    /// Report over the configured default window
    pub async fn current(&self) -> SyncResult<SyncHealthReport> {
        self.report(self.config.window()).await
    }

    /// Report over the last `window`
    pub async fn report(&self, window: Duration) -> SyncResult<SyncHealthReport> {
        let window = chrono::Duration::from_std(window)
            .map_err(|e| SyncError::Validation(format!("invalid health window: {e}")))?;
        let to = Utc::now();
        self.report_range(to - window, to).await
    }

    /// Report over `[from, to)`
    pub async fn report_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> SyncResult<SyncHealthReport> {
        let batches = self.batches.find_in_range(None, from, to).await?;
        let mut batches_by_status = BTreeMap::new();
        let (mut items_processed, mut items_failed) = (0usize, 0usize);
        for batch in &batches {
            *batches_by_status.entry(batch.status).or_insert(0) += 1;
            items_processed += batch.processed_items;
            items_failed += batch.failed_items;
        }
        let error_rate = if items_processed == 0 {
            0.0
        } else {
            items_failed as f64 / items_processed as f64
        };

        let pending_changes = self.changes.count_by_status(ChangeStatus::Pending).await?;
        let approved_changes = self.changes.count_by_status(ChangeStatus::Approved).await?;
        let failed_rollbacks = self.rollbacks.find_by_status(RollbackStatus::Failed).await?.len();
        let open_conflicts = self.detector.open_conflict_count();
        let memory = self.memory.as_ref().and_then(|monitor| monitor.latest_stats());

        let mut report = SyncHealthReport {
            status: HealthStatus::Healthy,
            issues: Vec::new(),
            window_start: from,
            window_end: to,
            batches_by_status,
            items_processed,
            items_failed,
            error_rate,
            pending_changes,
            approved_changes,
            open_conflicts,
            failed_rollbacks,
            memory,
        };
        self.assess(&mut report);

        if report.status == HealthStatus::Healthy {
            debug!("💚 Sync health: healthy ({} batches)", batches.len());
        } else {
            warn!("🩺 Sync health: {:?} - {}", report.status, report.issues.join("; "));
        }
        Ok(report)
    }

    fn assess(&self, report: &mut SyncHealthReport) {
        let mut raise = |status: HealthStatus, issue: String| {
            report.status = report.status.max(status);
            report.issues.push(issue);
        };

        if report.error_rate >= self.config.unhealthy_error_rate {
            raise(
                HealthStatus::Unhealthy,
                format!("item error rate {:.1}%", report.error_rate * 100.0),
            );
        } else if report.error_rate >= self.config.degraded_error_rate && report.items_failed > 0 {
            raise(
                HealthStatus::Degraded,
                format!("item error rate {:.1}%", report.error_rate * 100.0),
            );
        }

        if report.failed_rollbacks > 0 {
            raise(
                HealthStatus::Unhealthy,
                format!("{} failed rollbacks need manual intervention", report.failed_rollbacks),
            );
        }

        let failed_batches = report
            .batches_by_status
            .get(&BatchStatus::Failed)
            .copied()
            .unwrap_or(0);
        if failed_batches > 0 {
            raise(HealthStatus::Degraded, format!("{failed_batches} batches failed"));
        }

        if report.open_conflicts > self.config.max_open_conflicts {
            raise(
                HealthStatus::Degraded,
                format!("{} open conflicts", report.open_conflicts),
            );
        }

        match report.memory.as_ref().map(|stats| stats.pressure) {
            Some(MemoryPressure::Critical) => {
                raise(HealthStatus::Unhealthy, "memory usage is critical".to_string());
            }
            Some(MemoryPressure::Warning) => {
                raise(HealthStatus::Degraded, "memory usage is high".to_string());
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::rollback::SyncRollback;
    use crate::domain::entity::EntityType;
    use crate::domain::sync_batch::SyncBatch;
    use crate::infrastructure::config::{ConflictConfig, MemoryConfig};
    use crate::infrastructure::database_connection::DatabaseConnection;
    use crate::infrastructure::memory_monitor::FixedMemorySampler;
    use crate::infrastructure::sqlite_batch_repository::SqliteBatchRepository;
    use crate::infrastructure::sqlite_rollback_repository::SqliteRollbackRepository;
    use crate::infrastructure::sqlite_staged_change_repository::SqliteStagedChangeRepository;

    struct Fixture {
        service: SyncHealthService,
        batches: Arc<SqliteBatchRepository>,
        rollbacks: Arc<SqliteRollbackRepository>,
    }

    async fn fixture() -> anyhow::Result<Fixture> {
        let db = DatabaseConnection::in_memory().await?;
        db.migrate().await?;
        let pool = db.pool().clone();
        let batches = Arc::new(SqliteBatchRepository::new(pool.clone()));
        let rollbacks = Arc::new(SqliteRollbackRepository::new(pool.clone()));
        let service = SyncHealthService::new(
            HealthConfig::default(),
            batches.clone(),
            Arc::new(SqliteStagedChangeRepository::new(pool)),
            rollbacks.clone(),
            Arc::new(ConflictDetector::new(ConflictConfig::default())),
        );
        Ok(Fixture {
            service,
            batches,
            rollbacks,
        })
    }

    fn finished_batch(processed: usize, failed: usize) -> SyncBatch {
        let mut batch = SyncBatch::new("validate_records", processed);
        batch.status = if failed > 0 {
            BatchStatus::CompletedWithErrors
        } else {
            BatchStatus::Completed
        };
        batch.processed_items = processed;
        batch.failed_items = failed;
        batch.successful_items = processed - failed;
        batch
    }

    #[tokio::test]
    async fn test_quiet_system_is_healthy() -> anyhow::Result<()> {
        let fx = fixture().await?;
        let report = fx.service.report(Duration::from_secs(60)).await?;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.issues.is_empty());
        assert_eq!(report.error_rate, 0.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_error_rate_drives_status() -> anyhow::Result<()> {
        let fx = fixture().await?;
        fx.batches.save(&finished_batch(100, 10)).await?;
        let report = fx.service.report(Duration::from_secs(60)).await?;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.batches_by_status.get(&BatchStatus::CompletedWithErrors), Some(&1));
        assert!((report.error_rate - 0.1).abs() < f64::EPSILON);

        fx.batches.save(&finished_batch(10, 10)).await?;
        let report = fx.service.report(Duration::from_secs(60)).await?;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.items_processed, 110);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_rollback_is_unhealthy() -> anyhow::Result<()> {
        let fx = fixture().await?;
        let mut rollback = SyncRollback::pending(EntityType::Product, "p-1", "c-1", Some(1), "ops", None);
        rollback.fail("remote rejected payload");
        fx.rollbacks.save(&rollback).await?;

        let report = fx.service.report(Duration::from_secs(60)).await?;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.failed_rollbacks, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_pressure_is_reported() -> anyhow::Result<()> {
        let fx = fixture().await?;
        let sampler = Arc::new(FixedMemorySampler::new(950, 1000));
        let monitor = Arc::new(MemoryMonitor::new(MemoryConfig::default(), sampler));
        monitor.check_once()?;
        let service = fx.service.with_memory_monitor(monitor);

        let report = service.report(Duration::from_secs(60)).await?;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report.memory.is_some_and(|stats| stats.is_critical));
        Ok(())
    }
}
