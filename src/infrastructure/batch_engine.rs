//! 배치 실행 엔진
//!
//! 작업 목록을 추적 가능하고 취소 가능한 병렬 실행 단위로 변환합니다.
//!
//! - 항목은 `batch_size` 크기의 청크로 나뉘고, 최대 `max_workers`개의 워커가
//!   청크를 동시에 처리합니다 (`enable_parallel = false`면 순차 처리).
//! - 재시도 가능한 항목 실패는 백오프 후 같은 청크 안에서 재시도됩니다.
//! - 취소와 타임아웃은 청크 사이에서 확인되며, 진행 중인 청크는 끝까지
//!   처리됩니다.
//! - 진행 상황은 청크마다 갱신되고 실행 중에도 조회할 수 있습니다.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::errors::{ItemError, ItemErrorKind, SyncError, SyncResult};
use crate::domain::repositories::SyncBatchRepository;
use crate::domain::staged_change::StagedChange;
use crate::domain::sync_batch::{BatchItemError, BatchStatus, SyncBatch};
use crate::infrastructure::config::BatchConfig;
use crate::infrastructure::memory_monitor::{MemoryMonitor, MemoryPressure, MemoryStats};
use crate::infrastructure::remote_platform::{ApiUsage, ApiUsageSource};
use crate::infrastructure::retry_manager::RetryPolicy;

/// Bounded number of throttle pauses before a chunk is dispatched anyway
const MAX_THROTTLE_PAUSES: u32 = 20;

/// Unit of work accepted by the engine
pub trait BatchItem: Clone + Send + Sync + 'static {
    /// Identifier used when attributing errors
    fn item_id(&self) -> String;
}

impl BatchItem for StagedChange {
    fn item_id(&self) -> String {
        self.change_id.clone()
    }
}

/// Result of feeding one item through a transform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Success,
    /// Excluded by a precondition; never attempted
    Skipped { reason: String },
    /// Attempted and errored
    Failed(ItemError),
}

impl ItemOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    pub fn failed(error: ItemError) -> Self {
        Self::Failed(error)
    }
}

/// Caller-supplied transform: one outcome per item, in input order
#[async_trait]
pub trait BatchTransform<T>: Send + Sync {
    async fn transform(&self, items: &[T]) -> Vec<ItemOutcome>;
}

/// Chunk-level transform from a closure
pub struct ChunkFn<F>(pub F);

#[async_trait]
impl<T, F, Fut> BatchTransform<T> for ChunkFn<F>
where
    T: BatchItem,
    F: Fn(Vec<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Vec<ItemOutcome>> + Send,
{
    async fn transform(&self, items: &[T]) -> Vec<ItemOutcome> {
        (self.0)(items.to_vec()).await
    }
}

/// Per-item transform from a closure; items of a chunk run one after another
pub struct ItemFn<F>(pub F);

#[async_trait]
impl<T, F, Fut> BatchTransform<T> for ItemFn<F>
where
    T: BatchItem,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = ItemOutcome> + Send,
{
    async fn transform(&self, items: &[T]) -> Vec<ItemOutcome> {
        let mut outcomes = Vec::with_capacity(items.len());
        for item in items {
            outcomes.push((self.0)(item.clone()).await);
        }
        outcomes
    }
}

/// Queryable view of a batch, derived from its counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchProgress {
    pub batch: SyncBatch,
    pub progress_percentage: f64,
    pub error_rate: f64,
    pub throughput_per_second: f64,
    pub eta_seconds: Option<f64>,
}

impl BatchProgress {
    fn from_record(batch: SyncBatch) -> Self {
        let progress_percentage = if batch.total_items == 0 {
            if batch.status.is_terminal() { 100.0 } else { 0.0 }
        } else {
            batch.processed_items as f64 / batch.total_items as f64 * 100.0
        };

        let elapsed = batch.started_at.map(|started| {
            let end = batch.completed_at.unwrap_or_else(Utc::now);
            ((end - started).num_milliseconds().max(1)) as f64 / 1000.0
        });
        let throughput_per_second = elapsed.map_or(0.0, |secs| batch.processed_items as f64 / secs);
        let remaining = batch.total_items.saturating_sub(batch.processed_items);
        let eta_seconds = (batch.status == BatchStatus::Running && throughput_per_second > 0.0)
            .then(|| remaining as f64 / throughput_per_second);

        Self {
            error_rate: batch.error_rate(),
            batch,
            progress_percentage,
            throughput_per_second,
            eta_seconds,
        }
    }

    pub fn status(&self) -> BatchStatus {
        self.batch.status
    }
}

/// Engine-wide counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStats {
    pub total_batches: usize,
    pub batches_by_status: BTreeMap<BatchStatus, usize>,
    pub total_items: usize,
    pub processed_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,
    pub skipped_items: usize,
    pub memory: Option<MemoryStats>,
}

struct BatchEntry<T> {
    record: Mutex<SyncBatch>,
    items: Mutex<Option<Vec<T>>>,
    cancel: CancellationToken,
}

impl<T> BatchEntry<T> {
    fn snapshot(&self) -> SyncBatch {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn with_record<R>(&self, f: impl FnOnce(&mut SyncBatch) -> R) -> R {
        let mut record = self.record.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut record)
    }
}

/// Final per-item result of one chunk
struct ChunkReport {
    outcomes: Vec<(usize, String, ItemOutcome, u32)>,
    retries: u64,
}

fn record_chunk(record: &mut SyncBatch, report: ChunkReport, max_error_details: usize) {
    record.retry_attempts += report.retries;
    for (index, item_id, outcome, attempts) in report.outcomes {
        record.processed_items += 1;
        match outcome {
            ItemOutcome::Success => record.successful_items += 1,
            ItemOutcome::Skipped { reason } => {
                record.skipped_items += 1;
                debug!("Item {} skipped: {}", item_id, reason);
            }
            ItemOutcome::Failed(err) => {
                record.failed_items += 1;
                if record.error_summary.len() < max_error_details {
                    record.error_summary.push(BatchItemError {
                        index,
                        item_id,
                        kind: err.kind,
                        message: err.message,
                        attempts,
                    });
                }
            }
        }
    }
}

/// Generic batch processor; one instance per item type
pub struct BatchProcessor<T: BatchItem> {
    config: BatchConfig,
    batches: RwLock<HashMap<String, Arc<BatchEntry<T>>>>,
    repository: Option<Arc<dyn SyncBatchRepository>>,
    memory_monitor: Option<Arc<MemoryMonitor>>,
    api_usage: Option<Arc<dyn ApiUsageSource>>,
}

impl<T: BatchItem> BatchProcessor<T> {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            batches: RwLock::new(HashMap::new()),
            repository: None,
            memory_monitor: None,
            api_usage: None,
        }
    }

    /// Durable store for batch records
    #[must_use]
    pub fn with_repository(mut self, repository: Arc<dyn SyncBatchRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Memory source for throttling and system stats
    #[must_use]
    pub fn with_memory_monitor(mut self, monitor: Arc<MemoryMonitor>) -> Self {
        self.memory_monitor = Some(monitor);
        self
    }

    /// Transport counters attributed to each batch
    #[must_use]
    pub fn with_api_usage(mut self, source: Arc<dyn ApiUsageSource>) -> Self {
        self.api_usage = Some(source);
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Warning pressure evicts aged terminal batches, critical evicts all of them
    pub fn attach_memory_callbacks(self: &Arc<Self>, monitor: &MemoryMonitor) {
        let processor: Weak<Self> = Arc::downgrade(self);
        monitor.register_callback(Arc::new(move |pressure, _stats| {
            let Some(processor) = processor.upgrade() else {
                return;
            };
            let evicted = match pressure {
                MemoryPressure::Normal => return,
                MemoryPressure::Warning => {
                    processor.cleanup_completed_batches(processor.config.completed_batch_max_age())
                }
                MemoryPressure::Critical => processor.cleanup_completed_batches(Duration::ZERO),
            };
            if evicted > 0 {
                info!("🧹 Evicted {} terminal batches under {:?} memory pressure", evicted, pressure);
            }
        }));
    }

    fn entry(&self, batch_id: &str) -> SyncResult<Arc<BatchEntry<T>>> {
        self.batches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(batch_id)
            .cloned()
            .ok_or_else(|| SyncError::not_found("batch", batch_id))
    }

    async fn persist(&self, record: &SyncBatch) -> SyncResult<()> {
        if let Some(repository) = &self.repository {
            repository.save(record).await?;
        }
        Ok(())
    }

    /// Register items as a new pending batch
    pub async fn create_batch(&self, items: Vec<T>, operation: &str) -> SyncResult<String> {
        let record = SyncBatch::new(operation, items.len());
        let batch_id = record.batch_id.clone();
        self.persist(&record).await?;

        let entry = Arc::new(BatchEntry {
            record: Mutex::new(record),
            items: Mutex::new(Some(items)),
            cancel: CancellationToken::new(),
        });
        self.batches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(batch_id.clone(), entry);

        info!("📦 Created batch {} ({})", batch_id, operation);
        Ok(batch_id)
    }

    /// Convenience for `create_batch` followed by `process_batch`
    pub async fn run_batch(
        &self,
        items: Vec<T>,
        operation: &str,
        transform: Arc<dyn BatchTransform<T>>,
    ) -> SyncResult<BatchProgress> {
        let batch_id = self.create_batch(items, operation).await?;
        self.process_batch(&batch_id, transform).await
    }

    pub fn get_batch_progress(&self, batch_id: &str) -> SyncResult<BatchProgress> {
        Ok(BatchProgress::from_record(self.entry(batch_id)?.snapshot()))
    }

    pub fn list_batches(&self, status: Option<BatchStatus>) -> Vec<BatchProgress> {
        let entries: Vec<_> = self
            .batches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut batches: Vec<_> = entries
            .iter()
            .map(|entry| entry.snapshot())
            .filter(|record| status.is_none_or(|s| record.status == s))
            .map(BatchProgress::from_record)
            .collect();
        batches.sort_by(|a, b| b.batch.created_at.cmp(&a.batch.created_at));
        batches
    }

    /// Stop scheduling further chunks; in-flight chunks still complete
    ///
    /// Returns false when the batch had already settled.
    pub async fn cancel_batch(&self, batch_id: &str) -> SyncResult<bool> {
        let entry = self.entry(batch_id)?;
        let cancelled = entry.with_record(|record| {
            if !record.status.is_cancellable() {
                return None;
            }
            let was_pending = record.status == BatchStatus::Pending;
            record.status = BatchStatus::Cancelled;
            record.completed_at = Some(Utc::now());
            Some((was_pending, record.clone()))
        });

        let Some((was_pending, record)) = cancelled else {
            return Ok(false);
        };
        entry.cancel.cancel();
        warn!("🛑 Batch {} cancelled", batch_id);

        // A running batch persists itself once its workers drain
        if was_pending {
            entry
                .items
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            self.persist(&record).await?;
        }
        Ok(true)
    }

    /// Drop terminal batches that completed more than `max_age` ago
    pub fn cleanup_completed_batches(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut batches = self.batches.write().unwrap_or_else(PoisonError::into_inner);
        let before = batches.len();
        batches.retain(|_, entry| {
            let record = entry.snapshot();
            !(record.status.is_terminal() && record.completed_at.is_some_and(|done| done <= cutoff))
        });
        before - batches.len()
    }

    pub fn get_system_stats(&self) -> SystemStats {
        let records: Vec<SyncBatch> = self
            .batches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| entry.snapshot())
            .collect();

        let mut batches_by_status: BTreeMap<BatchStatus, usize> =
            BatchStatus::ALL.iter().map(|s| (*s, 0)).collect();
        let mut stats = SystemStats {
            total_batches: records.len(),
            batches_by_status: BTreeMap::new(),
            total_items: 0,
            processed_items: 0,
            successful_items: 0,
            failed_items: 0,
            skipped_items: 0,
            memory: None,
        };
        for record in &records {
            *batches_by_status.entry(record.status).or_insert(0) += 1;
            stats.total_items += record.total_items;
            stats.processed_items += record.processed_items;
            stats.successful_items += record.successful_items;
            stats.failed_items += record.failed_items;
            stats.skipped_items += record.skipped_items;
        }
        stats.batches_by_status = batches_by_status;
        stats.memory = self.memory_monitor.as_ref().and_then(|monitor| {
            monitor
                .get_memory_stats()
                .map_err(|e| warn!("Memory stats unavailable: {:#}", e))
                .ok()
        });
        stats
    }

    /// Pause while memory is critical; never fails items
    async fn throttle_for_memory(&self, batch_id: &str, cancel: &CancellationToken) {
        let Some(monitor) = &self.memory_monitor else {
            return;
        };
        let mut pauses = 0;
        while monitor.current_pressure() == MemoryPressure::Critical && pauses < MAX_THROTTLE_PAUSES {
            if pauses == 0 {
                warn!("🐢 Batch {} throttled: memory is critical", batch_id);
            }
            pauses += 1;
            tokio::select! {
                () = tokio::time::sleep(monitor.config().throttle_delay()) => {}
                () = cancel.cancelled() => return,
            }
            if let Err(e) = monitor.get_memory_stats() {
                warn!("Memory sampling failed during throttle: {:#}", e);
                return;
            }
        }
    }

    /// Execute a pending batch to completion, cancellation or timeout
    pub async fn process_batch(
        &self,
        batch_id: &str,
        transform: Arc<dyn BatchTransform<T>>,
    ) -> SyncResult<BatchProgress> {
        let entry = self.entry(batch_id)?;

        let started = entry.with_record(|record| match record.status {
            BatchStatus::Pending => {
                record.status = BatchStatus::Running;
                record.started_at = Some(Utc::now());
                Ok(true)
            }
            BatchStatus::Cancelled => Ok(false),
            other => Err(SyncError::Batch(format!(
                "batch {batch_id} cannot be processed from status {other}"
            ))),
        })?;
        if !started {
            return Ok(BatchProgress::from_record(entry.snapshot()));
        }

        let items = entry
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default();
        let usage_before = self.api_usage.as_ref().map(|source| source.api_usage());

        let workers = if self.config.enable_parallel {
            self.config.max_workers.max(1)
        } else {
            1
        };
        info!(
            "🔄 Processing batch {}: {} items, chunk size {}, {} worker(s)",
            batch_id,
            items.len(),
            self.config.batch_size,
            workers
        );

        let deadline = Instant::now() + self.config.timeout();
        let semaphore = Arc::new(Semaphore::new(workers));
        let policy = RetryPolicy::from_config(&self.config);
        let chunk_size = self.config.batch_size.max(1);
        let mut join_set = JoinSet::new();
        let mut timed_out = false;

        let chunks: Vec<(usize, Vec<T>)> = items
            .chunks(chunk_size)
            .enumerate()
            .map(|(n, chunk)| (n * chunk_size, chunk.to_vec()))
            .collect();
        drop(items);

        let mut pending_chunks = chunks.into_iter();
        while let Some((start, chunk)) = pending_chunks.next() {
            if entry.cancel.is_cancelled() {
                break;
            }
            self.throttle_for_memory(batch_id, &entry.cancel).await;

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                () = entry.cancel.cancelled() => break,
            };
            if entry.cancel.is_cancelled() {
                break;
            }
            if Instant::now() >= deadline {
                timed_out = true;
                let remaining = std::iter::once((start, chunk)).chain(pending_chunks.by_ref());
                self.fail_unscheduled(&entry, remaining);
                break;
            }

            let worker = ChunkWorker {
                transform: Arc::clone(&transform),
                policy: policy.clone(),
                cancel: entry.cancel.clone(),
                deadline,
            };
            let entry = Arc::clone(&entry);
            let max_error_details = self.config.max_error_details;
            join_set.spawn(async move {
                let report = worker.run(start, chunk).await;
                entry.with_record(|record| record_chunk(record, report, max_error_details));
                drop(permit);
            });
        }

        // Drain in-flight chunks
        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                error!("❌ Batch {} worker ended abnormally: {}", batch_id, e);
            }
        }

        let usage = match (&self.api_usage, usage_before) {
            (Some(source), Some(before)) => source.api_usage().since(before),
            _ => ApiUsage::default(),
        };

        let record = entry.with_record(|record| {
            record.api_calls_made += usage.api_calls_made;
            record.rate_limit_hits += usage.rate_limit_hits;
            if record.status == BatchStatus::Running {
                record.status = if timed_out {
                    record.error_message = Some(format!(
                        "batch deadline of {}s exceeded",
                        self.config.timeout_seconds
                    ));
                    BatchStatus::Failed
                } else if record.failed_items > 0 {
                    BatchStatus::CompletedWithErrors
                } else {
                    BatchStatus::Completed
                };
                record.completed_at = Some(Utc::now());
            }
            if let Some(seconds) = record.duration_seconds() {
                record.processing_rate = if seconds > 0.0 {
                    record.processed_items as f64 / seconds
                } else {
                    record.processed_items as f64
                };
            }
            record.clone()
        });

        self.persist(&record).await?;

        let progress = BatchProgress::from_record(record);
        match progress.status() {
            BatchStatus::Completed => info!(
                "✅ Batch {} completed: {}/{} succeeded, {} skipped",
                batch_id, progress.batch.successful_items, progress.batch.total_items, progress.batch.skipped_items
            ),
            BatchStatus::CompletedWithErrors => warn!(
                "⚠️ Batch {} completed with errors: {} failed of {} ({:.1}% error rate)",
                batch_id,
                progress.batch.failed_items,
                progress.batch.processed_items,
                progress.error_rate * 100.0
            ),
            status => warn!(
                "❌ Batch {} ended as {} after {}/{} items",
                batch_id, status, progress.batch.processed_items, progress.batch.total_items
            ),
        }
        Ok(progress)
    }

    /// Items never scheduled before the deadline count as timed-out failures
    fn fail_unscheduled(&self, entry: &BatchEntry<T>, chunks: impl Iterator<Item = (usize, Vec<T>)>) {
        let outcomes = chunks
            .flat_map(|(start, chunk)| {
                chunk.into_iter().enumerate().map(move |(offset, item)| {
                    (
                        start + offset,
                        item.item_id(),
                        ItemOutcome::Failed(ItemError::new(
                            ItemErrorKind::Timeout,
                            "batch deadline expired before the item was attempted",
                        )),
                        0,
                    )
                })
            })
            .collect();
        let report = ChunkReport {
            outcomes,
            retries: 0,
        };
        entry.with_record(|record| record_chunk(record, report, self.config.max_error_details));
    }
}

/// Runs one chunk with per-item retries
struct ChunkWorker<T> {
    transform: Arc<dyn BatchTransform<T>>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    deadline: Instant,
}

impl<T: BatchItem> ChunkWorker<T> {
    async fn invoke(&self, items: &[T]) -> Vec<ItemOutcome> {
        let call = AssertUnwindSafe(self.transform.transform(items)).catch_unwind();
        let mut outcomes = match call.await {
            Ok(outcomes) => outcomes,
            Err(_) => {
                error!("❌ Transform panicked on a chunk of {} items", items.len());
                return vec![ItemOutcome::Failed(ItemError::permanent("transform panicked")); items.len()];
            }
        };

        if outcomes.len() != items.len() {
            warn!(
                "Transform returned {} results for {} items",
                outcomes.len(),
                items.len()
            );
            let message = format!(
                "transform returned {} results for {} items",
                outcomes.len(),
                items.len()
            );
            outcomes.resize(items.len(), ItemOutcome::Failed(ItemError::permanent(message)));
        }
        outcomes
    }

    async fn run(self, start: usize, chunk: Vec<T>) -> ChunkReport {
        let mut finals: Vec<Option<ItemOutcome>> = vec![None; chunk.len()];
        let mut attempts = vec![0u32; chunk.len()];
        let mut pending: Vec<usize> = (0..chunk.len()).collect();
        let mut current = chunk.clone();
        let mut schedule = self.policy.schedule();
        let mut retries = 0u64;

        loop {
            let outcomes = self.invoke(&current).await;
            let mut retry = Vec::new();
            let mut retry_after_ms: Option<u64> = None;

            for (&pos, outcome) in pending.iter().zip(outcomes) {
                attempts[pos] += 1;
                if let ItemOutcome::Failed(err) = &outcome {
                    if self.policy.should_retry(err, attempts[pos]) {
                        retry_after_ms = retry_after_ms.max(err.retry_after_ms);
                        retry.push(pos);
                    }
                }
                finals[pos] = Some(outcome);
            }

            if retry.is_empty() {
                break;
            }

            let delay = schedule.next_delay(retry_after_ms.map(Duration::from_millis));
            if Instant::now() + delay >= self.deadline {
                debug!("Retry of {} items abandoned: deadline too close", retry.len());
                break;
            }

            let cancelled = tokio::select! {
                () = tokio::time::sleep(delay) => false,
                () = self.cancel.cancelled() => true,
            };
            if cancelled {
                for &pos in &retry {
                    let message = match &finals[pos] {
                        Some(ItemOutcome::Failed(err)) => format!("cancelled before retry: {}", err.message),
                        _ => "cancelled before retry".to_string(),
                    };
                    finals[pos] = Some(ItemOutcome::Failed(ItemError::new(
                        ItemErrorKind::Cancelled,
                        message,
                    )));
                }
                break;
            }

            retries += retry.len() as u64;
            debug!("🔄 Retrying {} items after {:?}", retry.len(), delay);
            current = retry.iter().map(|&pos| chunk[pos].clone()).collect();
            pending = retry;
        }

        let outcomes = chunk
            .iter()
            .zip(finals)
            .zip(attempts)
            .enumerate()
            .map(|(offset, ((item, outcome), attempts))| {
                let outcome = outcome.unwrap_or_else(|| {
                    ItemOutcome::Failed(ItemError::permanent("item produced no outcome"))
                });
                (start + offset, item.item_id(), outcome, attempts)
            })
            .collect();

        ChunkReport { outcomes, retries }
    }
}
