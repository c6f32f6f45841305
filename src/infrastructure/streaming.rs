//! Memory-bounded streaming over large record sequences
//!
//! 입력 스트림을 고정 크기 청크로 묶어 청크 단위로 변환합니다. 메모리 모니터
//! 콜백은 정리 요청만 기록하고, 실제 정리는 다음 청크 경계에서 수행되므로
//! 진행 중인 변환이 읽는 상태를 건드리지 않습니다.

use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, info};

use crate::infrastructure::bounded_cache::{CleanupLevel, Reclaimable};
use crate::infrastructure::memory_monitor::{MemoryMonitor, MemoryPressure};

const NO_CLEANUP: u8 = 0;
const GENTLE_CLEANUP: u8 = 1;
const FORCED_CLEANUP: u8 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamingStats {
    pub chunks_processed: u64,
    pub records_processed: u64,
    pub gentle_cleanups: u64,
    pub forced_cleanups: u64,
    pub entries_reclaimed: u64,
}

struct ProcessorState {
    chunk_size: usize,
    reclaimables: RwLock<Vec<Arc<dyn Reclaimable>>>,
    pending_cleanup: AtomicU8,
    chunks_processed: AtomicU64,
    records_processed: AtomicU64,
    gentle_cleanups: AtomicU64,
    forced_cleanups: AtomicU64,
    entries_reclaimed: AtomicU64,
}

/// Chunking stream processor; clones share state
#[derive(Clone)]
pub struct StreamingChunkProcessor {
    state: Arc<ProcessorState>,
}

impl StreamingChunkProcessor {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            state: Arc::new(ProcessorState {
                chunk_size: chunk_size.max(1),
                reclaimables: RwLock::new(Vec::new()),
                pending_cleanup: AtomicU8::new(NO_CLEANUP),
                chunks_processed: AtomicU64::new(0),
                records_processed: AtomicU64::new(0),
                gentle_cleanups: AtomicU64::new(0),
                forced_cleanups: AtomicU64::new(0),
                entries_reclaimed: AtomicU64::new(0),
            }),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.state.chunk_size
    }

    /// Auxiliary structure cleared under memory pressure
    pub fn register_reclaimable(&self, reclaimable: Arc<dyn Reclaimable>) {
        self.state
            .reclaimables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(reclaimable);
    }

    /// Warning pressure requests gentle cleanup, critical requests forced
    pub fn attach_to(&self, monitor: &MemoryMonitor) {
        let processor = self.clone();
        monitor.register_callback(Arc::new(move |pressure, _stats| {
            let level = match pressure {
                MemoryPressure::Normal => return,
                MemoryPressure::Warning => CleanupLevel::Gentle,
                MemoryPressure::Critical => CleanupLevel::Forced,
            };
            processor.request_cleanup(level);
        }));
    }

    pub fn request_cleanup(&self, level: CleanupLevel) {
        let flag = match level {
            CleanupLevel::Gentle => GENTLE_CLEANUP,
            CleanupLevel::Forced => FORCED_CLEANUP,
        };
        self.state.pending_cleanup.fetch_max(flag, Ordering::SeqCst);
    }

    /// Reclaim from every registered structure now
    pub fn cleanup(&self, level: CleanupLevel) -> usize {
        let reclaimables = self
            .state
            .reclaimables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let released: usize = reclaimables.iter().map(|r| r.reclaim(level)).sum();

        let counter = match level {
            CleanupLevel::Gentle => &self.state.gentle_cleanups,
            CleanupLevel::Forced => &self.state.forced_cleanups,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.state
            .entries_reclaimed
            .fetch_add(released as u64, Ordering::Relaxed);

        match level {
            CleanupLevel::Gentle => debug!("🧹 Gentle cleanup released {} entries", released),
            CleanupLevel::Forced => info!("🧹 Forced cleanup released {} entries", released),
        }
        released
    }

    /// Run a cleanup requested since the last chunk boundary, if any
    fn run_pending_cleanup(&self) {
        match self.state.pending_cleanup.swap(NO_CLEANUP, Ordering::SeqCst) {
            GENTLE_CLEANUP => {
                self.cleanup(CleanupLevel::Gentle);
            }
            FORCED_CLEANUP => {
                self.cleanup(CleanupLevel::Forced);
            }
            _ => {}
        }
    }

    /// Chunk `source` and apply `transform` to each chunk, one at a time
    pub fn process<S, F, Fut, R>(&self, source: S, mut transform: F) -> impl Stream<Item = R>
    where
        S: Stream,
        F: FnMut(Vec<S::Item>) -> Fut,
        Fut: Future<Output = R>,
    {
        let processor = self.clone();
        source.chunks(self.state.chunk_size).then(move |chunk| {
            processor.run_pending_cleanup();
            let records = chunk.len() as u64;
            let pending = transform(chunk);
            let processor = processor.clone();
            async move {
                let result = pending.await;
                processor
                    .state
                    .chunks_processed
                    .fetch_add(1, Ordering::Relaxed);
                processor
                    .state
                    .records_processed
                    .fetch_add(records, Ordering::Relaxed);
                result
            }
        })
    }

    /// Same as [`process`](Self::process) for a lazy iterator
    pub fn process_iter<I, F, Fut, R>(&self, source: I, transform: F) -> impl Stream<Item = R>
    where
        I: IntoIterator,
        F: FnMut(Vec<I::Item>) -> Fut,
        Fut: Future<Output = R>,
    {
        self.process(stream::iter(source), transform)
    }

    pub fn stats(&self) -> StreamingStats {
        let state = &self.state;
        StreamingStats {
            chunks_processed: state.chunks_processed.load(Ordering::Relaxed),
            records_processed: state.records_processed.load(Ordering::Relaxed),
            gentle_cleanups: state.gentle_cleanups.load(Ordering::Relaxed),
            forced_cleanups: state.forced_cleanups.load(Ordering::Relaxed),
            entries_reclaimed: state.entries_reclaimed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bounded_cache::BoundedCache;
    use crate::infrastructure::config::MemoryConfig;
    use crate::infrastructure::memory_monitor::FixedMemorySampler;

    #[tokio::test]
    async fn test_chunks_have_fixed_size_with_short_tail() {
        let processor = StreamingChunkProcessor::new(4);
        let sizes: Vec<usize> = processor
            .process_iter(0..10, |chunk| async move { chunk.len() })
            .collect()
            .await;

        assert_eq!(sizes, vec![4, 4, 2]);
        let stats = processor.stats();
        assert_eq!(stats.chunks_processed, 3);
        assert_eq!(stats.records_processed, 10);
    }

    #[tokio::test]
    async fn test_source_is_consumed_lazily() {
        let processor = StreamingChunkProcessor::new(3);
        let first: Vec<Vec<u64>> = processor
            .process_iter(0u64.., |chunk| async move { chunk })
            .take(2)
            .collect()
            .await;
        assert_eq!(first, vec![vec![0, 1, 2], vec![3, 4, 5]]);
    }

    #[tokio::test]
    async fn test_memory_callbacks_trigger_cleanup_at_chunk_boundary() {
        let cache = Arc::new(BoundedCache::new(100, 0.5, 0.25));
        for i in 0..40 {
            cache.insert(i, i);
        }

        let processor = StreamingChunkProcessor::new(2);
        processor.register_reclaimable(cache.clone());

        let sampler = Arc::new(FixedMemorySampler::new(10, 100));
        let monitor = MemoryMonitor::new(
            MemoryConfig {
                warning_threshold_percent: 50.0,
                critical_threshold_percent: 80.0,
                ..MemoryConfig::default()
            },
            sampler.clone(),
        );
        processor.attach_to(&monitor);

        sampler.set_resident_mb(60);
        monitor.check_once().unwrap();
        // Nothing is reclaimed until the next chunk starts
        assert_eq!(cache.len(), 40);

        let _: Vec<usize> = processor
            .process_iter(0..2, |chunk| async move { chunk.len() })
            .collect()
            .await;
        assert_eq!(cache.len(), 25);
        assert_eq!(processor.stats().gentle_cleanups, 1);

        sampler.set_resident_mb(90);
        monitor.check_once().unwrap();
        let _: Vec<usize> = processor
            .process_iter(0..2, |chunk| async move { chunk.len() })
            .collect()
            .await;
        assert!(cache.is_empty());
        assert_eq!(processor.stats().forced_cleanups, 1);
    }

    #[test]
    fn test_forced_request_wins_over_gentle() {
        let processor = StreamingChunkProcessor::new(1);
        processor.request_cleanup(CleanupLevel::Forced);
        processor.request_cleanup(CleanupLevel::Gentle);
        processor.run_pending_cleanup();
        let stats = processor.stats();
        assert_eq!(stats.forced_cleanups, 1);
        assert_eq!(stats.gentle_cleanups, 0);
    }
}
