//! Size-capped reusable structures
//!
//! [`BoundedCache`] is an LRU map with hysteresis: once occupancy passes the
//! high-water mark an eviction pass drops least-recently-used entries down to
//! the low-water mark, so a full cache does not evict on every insert.
//! [`ObjectPool`] hands out reusable objects and keeps at most `max_size` of
//! them when they come back.

use std::hash::Hash;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use lru::LruCache;
use serde::Serialize;
use tracing::debug;

use crate::infrastructure::config::StreamingConfig;

/// How hard a memory cleanup pass should reclaim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupLevel {
    /// Drop what is cheap to rebuild, keep the warm set
    Gentle,
    /// Drop everything auxiliary
    Forced,
}

/// Structure that can give memory back under pressure
pub trait Reclaimable: Send + Sync {
    /// Returns the number of entries released
    fn reclaim(&self, level: CleanupLevel) -> usize;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub len: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct BoundedCache<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, V>>,
    capacity: usize,
    high_water: usize,
    low_water: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K: Hash + Eq, V: Clone> BoundedCache<K, V> {
    /// `high_fraction` and `low_fraction` are fractions of `capacity`
    pub fn new(capacity: usize, high_fraction: f64, low_fraction: f64) -> Self {
        let capacity = capacity.max(1);
        let high_water = ((capacity as f64 * high_fraction).ceil() as usize).clamp(1, capacity);
        let low_water = ((capacity as f64 * low_fraction).floor() as usize).min(high_water - 1);

        Self {
            entries: Mutex::new(LruCache::unbounded()),
            capacity,
            high_water,
            low_water,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &StreamingConfig) -> Self {
        Self::new(
            config.cache_capacity,
            config.cache_high_water,
            config.cache_low_water,
        )
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let value = entries.get(key).cloned();
        let counter = if value.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        value
    }

    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.put(key, value);
        if entries.len() > self.high_water {
            let evicted = Self::evict_to(&mut entries, self.low_water);
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            debug!("Cache eviction pass dropped {} entries", evicted);
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop(key)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let released = entries.len();
        entries.clear();
        released
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            len: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn evict_to(entries: &mut LruCache<K, V>, target: usize) -> usize {
        let mut evicted = 0;
        while entries.len() > target {
            if entries.pop_lru().is_none() {
                break;
            }
            evicted += 1;
        }
        evicted
    }
}

impl<K, V> Reclaimable for BoundedCache<K, V>
where
    K: Hash + Eq + Send,
    V: Clone + Send,
{
    fn reclaim(&self, level: CleanupLevel) -> usize {
        match level {
            CleanupLevel::Gentle => {
                let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
                let evicted = Self::evict_to(&mut entries, self.low_water);
                self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
                evicted
            }
            CleanupLevel::Forced => self.clear(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub available: usize,
    pub max_size: usize,
    pub created: u64,
    pub reused: u64,
    pub discarded: u64,
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type Reset<T> = Box<dyn Fn(&mut T) + Send + Sync>;

pub struct ObjectPool<T> {
    available: Mutex<Vec<T>>,
    max_size: usize,
    factory: Factory<T>,
    reset: Reset<T>,
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

impl<T: Send> ObjectPool<T> {
    pub fn new(
        max_size: usize,
        factory: impl Fn() -> T + Send + Sync + 'static,
        reset: impl Fn(&mut T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            available: Mutex::new(Vec::with_capacity(max_size)),
            max_size,
            factory: Box::new(factory),
            reset: Box::new(reset),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    pub fn acquire(&self) -> Pooled<'_, T> {
        let reused = self
            .available
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let object = match reused {
            Some(object) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                object
            }
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                (self.factory)()
            }
        };
        Pooled {
            pool: self,
            object: Some(object),
        }
    }

    fn release(&self, mut object: T) {
        (self.reset)(&mut object);
        let mut available = self.available.lock().unwrap_or_else(PoisonError::into_inner);
        if available.len() < self.max_size {
            available.push(object);
        } else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            available: self
                .available
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            max_size: self.max_size,
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

impl ObjectPool<Vec<u8>> {
    /// Pool of byte buffers; oversized buffers are shrunk back on return
    pub fn byte_buffers(max_size: usize, buffer_capacity: usize) -> Self {
        Self::new(
            max_size,
            move || Vec::with_capacity(buffer_capacity),
            move |buffer: &mut Vec<u8>| {
                buffer.clear();
                if buffer.capacity() > buffer_capacity * 4 {
                    buffer.shrink_to(buffer_capacity);
                }
            },
        )
    }
}

impl<T: Send> Reclaimable for ObjectPool<T> {
    fn reclaim(&self, level: CleanupLevel) -> usize {
        let mut available = self.available.lock().unwrap_or_else(PoisonError::into_inner);
        let keep = match level {
            CleanupLevel::Gentle => available.len() / 2,
            CleanupLevel::Forced => 0,
        };
        let released = available.len() - keep;
        available.truncate(keep);
        released
    }
}

/// Object on loan from an [`ObjectPool`]; goes back on drop
pub struct Pooled<'a, T: Send> {
    pool: &'a ObjectPool<T>,
    object: Option<T>,
}

impl<T: Send> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `Drop` takes the object out
        match &self.object {
            Some(object) => object,
            None => unreachable!("pooled object used after release"),
        }
    }
}

impl<T: Send> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.object {
            Some(object) => object,
            None => unreachable!("pooled object used after release"),
        }
    }
}

impl<T: Send> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            self.pool.release(object);
        }
    }
}
