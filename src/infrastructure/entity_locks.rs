//! Keyed async locks
//!
//! 엔티티 키마다 하나의 `tokio::sync::Mutex`를 두고, 마지막 보유자가 풀면
//! 항목을 맵에서 제거해 키 수만큼 메모리가 쌓이지 않도록 합니다.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

#[derive(Default)]
pub struct EntityLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held while one task owns an entity; releases the map entry on drop
pub struct EntityGuard<'a> {
    owner: &'a EntityLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> EntityGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        EntityGuard {
            owner: self,
            key: key.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Number of keys currently locked or waited on
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for EntityGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.owner.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // 대기자가 없으면 맵만 참조를 가지고 있음
        if locks.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(EntityLocks::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let locks = Arc::clone(&locks);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let _guard = locks.lock("product:p-1").await;
                order.lock().unwrap().push("first-start");
                tokio::time::sleep(Duration::from_millis(30)).await;
                order.lock().unwrap().push("first-end");
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = {
            let locks = Arc::clone(&locks);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let _guard = locks.lock("product:p-1").await;
                order.lock().unwrap().push("second");
            })
        };
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["first-start", "first-end", "second"]);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = EntityLocks::new();
        let _a = locks.lock("product:a").await;
        let _b = locks.lock("product:b").await;
        assert_eq!(locks.len(), 2);
    }
}
