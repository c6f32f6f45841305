//! Outbound transport to the remote e-commerce platform
//!
//! The engine only needs a handful of CRUD calls. Products map to remote
//! products and categories to remote collections; the wire protocol itself
//! lives behind [`RemotePlatform`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, direct::NotKeyed},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::entity::{EntitySnapshot, EntityType};
use crate::domain::errors::{ItemError, ItemErrorKind};
use crate::infrastructure::config::RemoteConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Rate limited by remote platform (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Remote call timed out: {0}")]
    Timeout(String),

    #[error("Remote platform unavailable: {0}")]
    Unavailable(String),

    #[error("Remote platform rejected payload: {0}")]
    Invalid(String),

    #[error("Remote {resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },
}

impl RemoteError {
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Unavailable(_)
        )
    }

    pub fn to_item_error(&self) -> ItemError {
        match self {
            Self::RateLimited { retry_after_ms } => {
                ItemError::rate_limited(self.to_string(), *retry_after_ms)
            }
            Self::Timeout(_) | Self::Unavailable(_) => {
                ItemError::new(ItemErrorKind::Transient, self.to_string())
            }
            Self::Invalid(_) | Self::NotFound { .. } => ItemError::permanent(self.to_string()),
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

#[async_trait]
pub trait RemotePlatform: Send + Sync {
    /// Create the entity and return its remote identifier
    async fn create_entity(
        &self,
        entity_type: EntityType,
        snapshot: &EntitySnapshot,
    ) -> RemoteResult<String>;

    async fn update_entity(
        &self,
        entity_type: EntityType,
        remote_id: &str,
        snapshot: &EntitySnapshot,
    ) -> RemoteResult<()>;

    async fn delete_entity(&self, entity_type: EntityType, remote_id: &str) -> RemoteResult<()>;

    async fn fetch_entity(
        &self,
        entity_type: EntityType,
        remote_id: &str,
    ) -> RemoteResult<Option<EntitySnapshot>>;

    /// Upload an image asset and return its public url
    async fn upload_image(&self, file_name: &str, bytes: &[u8]) -> RemoteResult<String>;
}

#[async_trait]
impl<T: RemotePlatform + ?Sized> RemotePlatform for Arc<T> {
    async fn create_entity(
        &self,
        entity_type: EntityType,
        snapshot: &EntitySnapshot,
    ) -> RemoteResult<String> {
        (**self).create_entity(entity_type, snapshot).await
    }

    async fn update_entity(
        &self,
        entity_type: EntityType,
        remote_id: &str,
        snapshot: &EntitySnapshot,
    ) -> RemoteResult<()> {
        (**self).update_entity(entity_type, remote_id, snapshot).await
    }

    async fn delete_entity(&self, entity_type: EntityType, remote_id: &str) -> RemoteResult<()> {
        (**self).delete_entity(entity_type, remote_id).await
    }

    async fn fetch_entity(
        &self,
        entity_type: EntityType,
        remote_id: &str,
    ) -> RemoteResult<Option<EntitySnapshot>> {
        (**self).fetch_entity(entity_type, remote_id).await
    }

    async fn upload_image(&self, file_name: &str, bytes: &[u8]) -> RemoteResult<String> {
        (**self).upload_image(file_name, bytes).await
    }
}

/// API usage counters reported into batch records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApiUsage {
    pub api_calls_made: u64,
    pub rate_limit_hits: u64,
}

impl ApiUsage {
    /// Counters accumulated since an earlier reading
    pub fn since(self, earlier: Self) -> Self {
        Self {
            api_calls_made: self.api_calls_made.saturating_sub(earlier.api_calls_made),
            rate_limit_hits: self.rate_limit_hits.saturating_sub(earlier.rate_limit_hits),
        }
    }
}

/// Read access to usage counters of a transport
pub trait ApiUsageSource: Send + Sync {
    fn api_usage(&self) -> ApiUsage;
}

/// Decorator that throttles every call with a direct rate limiter
pub struct RateLimitedPlatform<P> {
    inner: P,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    request_timeout: Duration,
    api_calls: AtomicU64,
    rate_limit_hits: AtomicU64,
}

impl<P: RemotePlatform> RateLimitedPlatform<P> {
    pub fn new(inner: P, config: &RemoteConfig) -> anyhow::Result<Self> {
        let per_second = NonZeroU32::new(config.max_requests_per_second)
            .ok_or_else(|| anyhow::anyhow!("Rate limit must be greater than 0"))?;

        Ok(Self {
            inner,
            rate_limiter: RateLimiter::direct(Quota::per_second(per_second)),
            request_timeout: Duration::from_secs(config.request_timeout_seconds.max(1)),
            api_calls: AtomicU64::new(0),
            rate_limit_hits: AtomicU64::new(0),
        })
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    async fn call<T, F>(&self, operation: &'static str, future: F) -> RemoteResult<T>
    where
        F: Future<Output = RemoteResult<T>> + Send,
    {
        if self.rate_limiter.check().is_err() {
            debug!("⏳ Local rate limit reached before {}", operation);
            self.rate_limiter.until_ready().await;
        }
        self.api_calls.fetch_add(1, Ordering::Relaxed);

        let result = match tokio::time::timeout(self.request_timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(format!(
                "{operation} exceeded {:?}",
                self.request_timeout
            ))),
        };

        if let Err(RemoteError::RateLimited { retry_after_ms }) = &result {
            self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            warn!(
                "🚦 Remote throttled {} (retry after {:?} ms)",
                operation, retry_after_ms
            );
        }
        result
    }
}

impl<P: RemotePlatform> ApiUsageSource for RateLimitedPlatform<P> {
    fn api_usage(&self) -> ApiUsage {
        ApiUsage {
            api_calls_made: self.api_calls.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl<P: RemotePlatform> RemotePlatform for RateLimitedPlatform<P> {
    async fn create_entity(
        &self,
        entity_type: EntityType,
        snapshot: &EntitySnapshot,
    ) -> RemoteResult<String> {
        self.call("create", self.inner.create_entity(entity_type, snapshot))
            .await
    }

    async fn update_entity(
        &self,
        entity_type: EntityType,
        remote_id: &str,
        snapshot: &EntitySnapshot,
    ) -> RemoteResult<()> {
        self.call(
            "update",
            self.inner.update_entity(entity_type, remote_id, snapshot),
        )
        .await
    }

    async fn delete_entity(&self, entity_type: EntityType, remote_id: &str) -> RemoteResult<()> {
        self.call("delete", self.inner.delete_entity(entity_type, remote_id))
            .await
    }

    async fn fetch_entity(
        &self,
        entity_type: EntityType,
        remote_id: &str,
    ) -> RemoteResult<Option<EntitySnapshot>> {
        self.call("fetch", self.inner.fetch_entity(entity_type, remote_id))
            .await
    }

    async fn upload_image(&self, file_name: &str, bytes: &[u8]) -> RemoteResult<String> {
        self.call("upload_image", self.inner.upload_image(file_name, bytes))
            .await
    }
}

/// In-process platform for dry runs and tests, with fault injection
#[derive(Default)]
pub struct InMemoryPlatform {
    records: Mutex<HashMap<(EntityType, String), EntitySnapshot>>,
    images: Mutex<HashMap<String, usize>>,
    queued_failures: Mutex<VecDeque<RemoteError>>,
    rejected_ids: Mutex<HashSet<String>>,
    next_id: AtomicU64,
    calls: AtomicU64,
    latency_ms: AtomicU64,
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next call fails with `error` (FIFO when queued repeatedly)
    pub fn fail_next(&self, error: RemoteError) {
        self.queued_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    /// Every write waits this long before landing
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::Relaxed);
    }

    async fn simulate_latency(&self) {
        let millis = self.latency_ms.load(Ordering::Relaxed);
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }

    /// Every mutation touching `remote_id` is rejected as invalid
    pub fn reject_remote_id(&self, remote_id: impl Into<String>) {
        self.rejected_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(remote_id.into());
    }

    /// Seed a record as if it already existed remotely
    pub fn insert(&self, entity_type: EntityType, remote_id: impl Into<String>, snapshot: EntitySnapshot) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((entity_type, remote_id.into()), snapshot);
    }

    pub fn get(&self, entity_type: EntityType, remote_id: &str) -> Option<EntitySnapshot> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(entity_type, remote_id.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn enter(&self, remote_id: Option<&str>) -> RemoteResult<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(error) = self
            .queued_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            return Err(error);
        }
        if let Some(remote_id) = remote_id {
            let rejected = self.rejected_ids.lock().unwrap_or_else(PoisonError::into_inner);
            if rejected.contains(remote_id) {
                return Err(RemoteError::Invalid(format!("{remote_id} is rejected")));
            }
        }
        Ok(())
    }
}

fn validate_payload(snapshot: &EntitySnapshot) -> RemoteResult<()> {
    match snapshot {
        EntitySnapshot::Tombstone => Err(RemoteError::Invalid(
            "tombstone cannot be written".to_string(),
        )),
        _ => Ok(()),
    }
}

#[async_trait]
impl RemotePlatform for InMemoryPlatform {
    async fn create_entity(
        &self,
        entity_type: EntityType,
        snapshot: &EntitySnapshot,
    ) -> RemoteResult<String> {
        self.simulate_latency().await;
        self.enter(None)?;
        validate_payload(snapshot)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let remote_id = format!("gid://{}/{id}", entity_type.remote_resource());
        self.insert(entity_type, remote_id.clone(), snapshot.clone());
        Ok(remote_id)
    }

    async fn update_entity(
        &self,
        entity_type: EntityType,
        remote_id: &str,
        snapshot: &EntitySnapshot,
    ) -> RemoteResult<()> {
        self.simulate_latency().await;
        self.enter(Some(remote_id))?;
        validate_payload(snapshot)?;
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        match records.get_mut(&(entity_type, remote_id.to_string())) {
            Some(existing) => {
                *existing = snapshot.clone();
                Ok(())
            }
            None => Err(RemoteError::NotFound {
                resource: entity_type.remote_resource(),
                id: remote_id.to_string(),
            }),
        }
    }

    async fn delete_entity(&self, entity_type: EntityType, remote_id: &str) -> RemoteResult<()> {
        self.simulate_latency().await;
        self.enter(Some(remote_id))?;
        let removed = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(entity_type, remote_id.to_string()));
        match removed {
            Some(_) => Ok(()),
            None => Err(RemoteError::NotFound {
                resource: entity_type.remote_resource(),
                id: remote_id.to_string(),
            }),
        }
    }

    async fn fetch_entity(
        &self,
        entity_type: EntityType,
        remote_id: &str,
    ) -> RemoteResult<Option<EntitySnapshot>> {
        self.enter(None)?;
        Ok(self.get(entity_type, remote_id))
    }

    async fn upload_image(&self, file_name: &str, bytes: &[u8]) -> RemoteResult<String> {
        self.enter(None)?;
        if bytes.is_empty() {
            return Err(RemoteError::Invalid(format!("{file_name} is empty")));
        }
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(file_name.to_string(), bytes.len());
        Ok(format!("https://cdn.invalid/files/{file_name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entity::ProductSnapshot;

    fn product(title: &str) -> EntitySnapshot {
        EntitySnapshot::Product(ProductSnapshot {
            title: Some(title.to_string()),
            ..ProductSnapshot::default()
        })
    }

    #[tokio::test]
    async fn test_in_memory_crud() {
        let platform = InMemoryPlatform::new();
        let id = platform
            .create_entity(EntityType::Product, &product("Lamp"))
            .await
            .unwrap();
        assert!(id.starts_with("gid://product/"));

        platform
            .update_entity(EntityType::Product, &id, &product("Desk Lamp"))
            .await
            .unwrap();
        assert_eq!(platform.get(EntityType::Product, &id), Some(product("Desk Lamp")));

        platform.delete_entity(EntityType::Product, &id).await.unwrap();
        assert!(platform.is_empty());
        assert!(matches!(
            platform.delete_entity(EntityType::Product, &id).await,
            Err(RemoteError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_fault_injection_and_classification() {
        let platform = InMemoryPlatform::new();
        platform.fail_next(RemoteError::RateLimited {
            retry_after_ms: Some(20),
        });
        let err = platform
            .create_entity(EntityType::Category, &product("x"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.to_item_error().kind, ItemErrorKind::RateLimited);
        assert_eq!(err.to_item_error().retry_after_ms, Some(20));

        platform.reject_remote_id("gid://product/9");
        let err = platform
            .update_entity(EntityType::Product, "gid://product/9", &product("x"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.to_item_error().kind, ItemErrorKind::Permanent);
    }

    #[tokio::test]
    async fn test_rate_limited_platform_counts_calls_and_hits() {
        let config = RemoteConfig {
            max_requests_per_second: 100,
            request_timeout_seconds: 5,
        };
        let platform = RateLimitedPlatform::new(InMemoryPlatform::new(), &config).unwrap();
        platform.inner().fail_next(RemoteError::RateLimited {
            retry_after_ms: None,
        });

        let before = platform.api_usage();
        let _ = platform.create_entity(EntityType::Product, &product("a")).await;
        platform
            .create_entity(EntityType::Product, &product("b"))
            .await
            .unwrap();

        let usage = platform.api_usage().since(before);
        assert_eq!(usage.api_calls_made, 2);
        assert_eq!(usage.rate_limit_hits, 1);
    }

    #[test]
    fn test_zero_rate_is_rejected() {
        let config = RemoteConfig {
            max_requests_per_second: 0,
            request_timeout_seconds: 5,
        };
        assert!(RateLimitedPlatform::new(InMemoryPlatform::new(), &config).is_err());
    }
}
