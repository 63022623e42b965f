//! Time-bounded cache of assembled API clients.
//!
//! Each key has its own async lock, so building a client for one cluster
//! (credential fetch included) never blocks lookups for another.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::Result;

/// Kind of client cached for a cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClientKind {
    Compute,
    Resources,
}

impl std::fmt::Display for ClientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compute => write!(f, "compute"),
            Self::Resources => write!(f, "resources"),
        }
    }
}

struct Entry<V> {
    value: V,
    created: Instant,
}

type Slot<V> = Arc<tokio::sync::Mutex<Option<Entry<V>>>>;

pub struct ClientCache<K, V> {
    ttl: Duration,
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K, V> ClientCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Drop slots nobody is using whose value is missing or expired.
    fn sweep(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            slot.try_lock().map_or(true, |entry| {
                entry
                    .as_ref()
                    .is_some_and(|e| e.created.elapsed() < self.ttl)
            })
        });
    }

    fn slot(&self, key: &K) -> Slot<V> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(key.clone()).or_default().clone()
    }

    /// Return the cached value for `key`, building it with `init` when absent
    /// or older than the TTL. Concurrent callers for the same key wait for a
    /// single build; a failed build leaves the slot empty.
    pub async fn get_or_try_init<F, Fut>(&self, key: &K, init: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        self.sweep();
        let slot = self.slot(key);
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.as_ref()
            && entry.created.elapsed() < self.ttl
        {
            return Ok(entry.value.clone());
        }

        debug!(key = ?key, "Building client");
        let value = init().await?;
        *guard = Some(Entry {
            value: value.clone(),
            created: Instant::now(),
        });
        Ok(value)
    }

    /// Drop the cached value for `key`. A build already in flight finishes
    /// into a detached slot and is not reused.
    pub fn invalidate(&self, key: &K) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SroError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_caches_within_ttl() {
        let cache: ClientCache<String, usize> = ClientCache::new(Duration::from_secs(60));
        let builds = AtomicUsize::new(0);
        for _ in 0..3 {
            let v = cache
                .get_or_try_init(&"c1".to_string(), || async {
                    Ok(builds.fetch_add(1, Ordering::SeqCst))
                })
                .await
                .unwrap();
            assert_eq!(v, 0);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rebuilds_after_ttl() {
        let cache: ClientCache<String, usize> = ClientCache::new(Duration::ZERO);
        let builds = AtomicUsize::new(0);
        for _ in 0..2 {
            cache
                .get_or_try_init(&"c1".to_string(), || async {
                    Ok(builds.fetch_add(1, Ordering::SeqCst))
                })
                .await
                .unwrap();
        }
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_build_not_cached() {
        let cache: ClientCache<String, usize> = ClientCache::new(Duration::from_secs(60));
        let key = "c1".to_string();
        let err = cache
            .get_or_try_init(&key, || async { Err(SroError::Credentials("nope".into())) })
            .await;
        assert!(err.is_err());
        let v = cache.get_or_try_init(&key, || async { Ok(7) }).await.unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache: ClientCache<(String, ClientKind), usize> =
            ClientCache::new(Duration::from_secs(60));
        let key = ("c1".to_string(), ClientKind::Compute);
        cache.get_or_try_init(&key, || async { Ok(1) }).await.unwrap();
        cache.invalidate(&key);
        assert_eq!(cache.len(), 0);
        let v = cache.get_or_try_init(&key, || async { Ok(2) }).await.unwrap();
        assert_eq!(v, 2);
    }

    #[tokio::test]
    async fn test_expired_slots_swept() {
        let cache: ClientCache<String, usize> = ClientCache::new(Duration::ZERO);
        cache.get_or_try_init(&"c1".to_string(), || async { Ok(1) }).await.unwrap();
        cache.get_or_try_init(&"c2".to_string(), || async { Ok(2) }).await.unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_live_slots_kept() {
        let cache: ClientCache<String, usize> = ClientCache::new(Duration::from_secs(60));
        cache.get_or_try_init(&"c1".to_string(), || async { Ok(1) }).await.unwrap();
        cache.get_or_try_init(&"c2".to_string(), || async { Ok(2) }).await.unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_keys_do_not_contend() {
        let cache = Arc::new(ClientCache::<String, usize>::new(Duration::from_secs(60)));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        // Hold the "slow" key's build open until the "fast" key has resolved.
        let slow_cache = cache.clone();
        let slow = tokio::spawn(async move {
            slow_cache
                .get_or_try_init(&"slow".to_string(), || async {
                    let _ = rx.await;
                    Ok(1)
                })
                .await
        });
        tokio::task::yield_now().await;

        let fast = cache
            .get_or_try_init(&"fast".to_string(), || async { Ok(2) })
            .await
            .unwrap();
        assert_eq!(fast, 2);

        tx.send(()).unwrap();
        assert_eq!(slow.await.unwrap().unwrap(), 1);
    }
}
