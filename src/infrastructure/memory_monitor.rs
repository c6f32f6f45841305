//! Process memory monitor
//!
//! 주기적으로 프로세스 메모리를 샘플링하고 경고/위험 임계값을 넘으면
//! 등록된 콜백을 호출합니다. 폴링 루프는 명시적인 `start`/`shutdown`을
//! 가진 취소 가능한 tokio 태스크입니다.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::infrastructure::config::MemoryConfig;

const MB: u64 = 1024 * 1024;

/// Raw numbers as read from the operating system, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMemorySample {
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// Source of memory samples
pub trait MemorySampler: Send + Sync {
    fn sample(&self) -> Result<RawMemorySample>;
}

/// sysinfo-backed sampler for the current process
pub struct SystemMemorySampler {
    system: Mutex<System>,
    pid: Pid,
}

impl SystemMemorySampler {
    pub fn new() -> Result<Self> {
        let pid = sysinfo::get_current_pid().map_err(|e| anyhow!("Cannot resolve current pid: {e}"))?;
        Ok(Self {
            system: Mutex::new(System::new()),
            pid,
        })
    }
}

impl MemorySampler for SystemMemorySampler {
    fn sample(&self) -> Result<RawMemorySample> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        if !system.refresh_process(self.pid) {
            return Err(anyhow!("Process {} is not visible to sysinfo", self.pid));
        }
        let process = system
            .process(self.pid)
            .ok_or_else(|| anyhow!("Process {} disappeared", self.pid))?;

        Ok(RawMemorySample {
            resident_bytes: process.memory(),
            virtual_bytes: process.virtual_memory(),
            total_bytes: system.total_memory(),
            available_bytes: system.available_memory(),
        })
    }
}

/// Sampler reporting whatever resident size it was last told
///
/// Used by dry runs and tests to drive pressure transitions deterministically.
pub struct FixedMemorySampler {
    resident_bytes: AtomicU64,
    total_bytes: u64,
}

impl FixedMemorySampler {
    pub fn new(resident_mb: u64, total_mb: u64) -> Self {
        Self {
            resident_bytes: AtomicU64::new(resident_mb * MB),
            total_bytes: total_mb * MB,
        }
    }

    pub fn set_resident_mb(&self, resident_mb: u64) {
        self.resident_bytes.store(resident_mb * MB, Ordering::Relaxed);
    }
}

impl MemorySampler for FixedMemorySampler {
    fn sample(&self) -> Result<RawMemorySample> {
        let resident_bytes = self.resident_bytes.load(Ordering::Relaxed);
        Ok(RawMemorySample {
            resident_bytes,
            virtual_bytes: resident_bytes * 2,
            total_bytes: self.total_bytes,
            available_bytes: self.total_bytes.saturating_sub(resident_bytes),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    Normal,
    Warning,
    Critical,
}

/// Point-in-time memory statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStats {
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
    pub total_system_bytes: u64,
    pub available_system_bytes: u64,
    /// Resident size as percent of total system memory
    pub system_percent: f64,
    /// Resident size as percent of the configured budget (system memory without one)
    pub budget_percent: f64,
    pub pressure: MemoryPressure,
    pub is_critical: bool,
    pub sampled_at: DateTime<Utc>,
}

impl MemoryStats {
    pub fn resident_mb(&self) -> f64 {
        self.resident_bytes as f64 / MB as f64
    }

    pub fn available_mb(&self) -> f64 {
        self.available_system_bytes as f64 / MB as f64
    }
}

/// Invoked from the polling loop while usage is at or above the warning level
pub type MemoryCallback = Arc<dyn Fn(MemoryPressure, &MemoryStats) + Send + Sync>;

struct MonitorTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct MemoryMonitor {
    config: MemoryConfig,
    sampler: Arc<dyn MemorySampler>,
    callbacks: RwLock<Vec<MemoryCallback>>,
    latest: RwLock<Option<MemoryStats>>,
    task: Mutex<Option<MonitorTask>>,
}

impl MemoryMonitor {
    pub fn new(config: MemoryConfig, sampler: Arc<dyn MemorySampler>) -> Self {
        Self {
            config,
            sampler,
            callbacks: RwLock::new(Vec::new()),
            latest: RwLock::new(None),
            task: Mutex::new(None),
        }
    }

    /// Monitor backed by the operating system's view of this process
    pub fn for_current_process(config: MemoryConfig) -> Result<Self> {
        Ok(Self::new(config, Arc::new(SystemMemorySampler::new()?)))
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    fn classify(&self, budget_percent: f64) -> MemoryPressure {
        if budget_percent >= self.config.critical_threshold_percent {
            MemoryPressure::Critical
        } else if budget_percent >= self.config.warning_threshold_percent {
            MemoryPressure::Warning
        } else {
            MemoryPressure::Normal
        }
    }

    /// Take a fresh sample and remember it as the latest reading
    pub fn get_memory_stats(&self) -> Result<MemoryStats> {
        let raw = self.sampler.sample()?;

        let percent_of = |total: u64| {
            if total == 0 {
                0.0
            } else {
                raw.resident_bytes as f64 / total as f64 * 100.0
            }
        };
        let system_percent = percent_of(raw.total_bytes);
        let budget_percent = match self.config.memory_limit_mb {
            Some(limit_mb) => percent_of(limit_mb * MB),
            None => system_percent,
        };
        let pressure = self.classify(budget_percent);

        let stats = MemoryStats {
            resident_bytes: raw.resident_bytes,
            virtual_bytes: raw.virtual_bytes,
            total_system_bytes: raw.total_bytes,
            available_system_bytes: raw.available_bytes,
            system_percent,
            budget_percent,
            pressure,
            is_critical: pressure == MemoryPressure::Critical,
            sampled_at: Utc::now(),
        };

        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(stats.clone());
        Ok(stats)
    }

    /// Last sample taken, without touching the operating system
    pub fn latest_stats(&self) -> Option<MemoryStats> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Pressure of the latest sample; `Normal` before the first one
    pub fn current_pressure(&self) -> MemoryPressure {
        self.latest_stats()
            .map_or(MemoryPressure::Normal, |stats| stats.pressure)
    }

    pub fn register_callback(&self, callback: MemoryCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// One polling step: sample, then notify callbacks when above warning
    pub fn check_once(&self) -> Result<MemoryStats> {
        let stats = self.get_memory_stats()?;
        if stats.pressure == MemoryPressure::Normal {
            return Ok(stats);
        }

        warn!(
            "⚠️ Memory pressure {:?}: {:.1} MB resident ({:.1}% of budget)",
            stats.pressure,
            stats.resident_mb(),
            stats.budget_percent
        );

        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks {
            callback(stats.pressure, &stats);
        }
        Ok(stats)
    }

    /// Spawn the polling loop; returns false if it is already running
    pub fn start(self: &Arc<Self>) -> bool {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return false;
        }

        let token = CancellationToken::new();
        let child = token.clone();
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.poll_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = child.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = monitor.check_once() {
                            warn!("❌ Memory sampling failed: {:#}", e);
                        }
                    }
                }
            }
            debug!("Memory monitor loop stopped");
        });

        info!(
            "🔄 Memory monitor started (interval {:?}, warning {}%, critical {}%)",
            self.config.poll_interval(),
            self.config.warning_threshold_percent,
            self.config.critical_threshold_percent
        );
        *task = Some(MonitorTask { token, handle });
        true
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop the polling loop and wait for it to exit
    pub async fn shutdown(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(MonitorTask { token, handle }) = task {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("Memory monitor task ended abnormally: {}", e);
            }
            info!("✅ Memory monitor stopped");
        }
    }
}
