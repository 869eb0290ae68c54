//! Shared model registry (C6): a `(model_id, device)`-keyed cache with
//! single-flight loading, so two nodes that need the same model on the same
//! device don't load it twice.

pub mod cache;
pub mod config;
pub mod error;
pub mod handle;
pub mod metrics;

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::RwLock;

pub use cache::CacheEntry;
pub use config::ModelKey;
pub use handle::ModelHandle;
pub use metrics::ModelRegistryMetrics;

use cache::LoadCoordinator;
use metrics::ModelRegistryCounters;

/// Process-wide cache of loaded models, shared by every node that calls
/// `get_or_load` with the same `ModelKey`.
///
/// # Example
///
/// ```
/// use remotemedia_core::model_registry::{ModelKey, ModelRegistry};
///
/// # tokio_test::block_on(async {
/// let registry = ModelRegistry::new();
/// let key = ModelKey::new("whisper-base", "cpu");
/// let handle = registry.get_or_load(&key, || async { Ok((42u32, 1024)) }).await.unwrap();
/// # let _ = handle;
/// # });
/// ```
pub struct ModelRegistry {
    entries: RwLock<std::collections::HashMap<ModelKey, CacheEntry>>,
    coordinator: LoadCoordinator,
    counters: ModelRegistryCounters,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self {
            entries: RwLock::new(std::collections::HashMap::new()),
            coordinator: LoadCoordinator::new(),
            counters: ModelRegistryCounters::default(),
        }
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached model for `key`, loading it with `loader` if this
    /// is the first request. Concurrent callers for the same key share one
    /// loader invocation.
    pub async fn get_or_load<T, F, Fut>(&self, key: &ModelKey, loader: F) -> crate::Result<ModelHandle>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::Result<(T, u64)>>,
    {
        if let Some(entry) = self.entries.read().await.get(key) {
            self.counters.record_hit();
            return Ok(entry.handle.clone());
        }

        let (should_load, notify) = self.coordinator.claim_or_wait(key);
        if !should_load {
            // Create the `Notified` future before checking the cache again:
            // the loader writes its cache entry before calling
            // `notify_waiters`, so if the load already finished by the time
            // this future is created, the entry is already visible to the
            // read below and we never wait on a notification we'd otherwise
            // miss. Creating the future after the check instead would leave
            // a window where the loader could finish and notify between the
            // check and the `notified()` call, and that wakeup would be
            // lost for good since `notify_waiters` only wakes waiters
            // already registered when it's called.
            let notified = notify.notified();
            if let Some(entry) = self.entries.read().await.get(key) {
                self.counters.record_hit();
                return Ok(entry.handle.clone());
            }
            notified.await;
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(key) {
                self.counters.record_hit();
                return Ok(entry.handle.clone());
            }
            drop(entries);
            return Err(match self.coordinator.take_failure(key) {
                Some(message) => crate::error::Error::init_failed(format!("load for '{key}' failed: {message}")),
                None => crate::error::Error::init_failed(format!("load for '{key}' failed in another task")),
            });
        }

        let result = loader().await;
        let outcome = match result {
            Ok((model, memory_bytes)) => {
                let handle = ModelHandle::new(model);
                self.entries.write().await.insert(
                    key.clone(),
                    CacheEntry {
                        handle: handle.clone(),
                        memory_bytes,
                    },
                );
                self.counters.record_miss(memory_bytes);
                self.coordinator.finish(key);
                Ok(handle)
            }
            Err(e) => {
                self.coordinator.finish_with_error(key, e.message.clone());
                Err(e)
            }
        };
        outcome
    }

    /// Drop every cached model.
    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        for (_, entry) in entries.drain() {
            self.counters.record_evict(entry.memory_bytes);
        }
    }

    /// Current hit/miss/memory metrics.
    pub async fn metrics(&self) -> ModelRegistryMetrics {
        let count = self.entries.read().await.len();
        self.counters.snapshot(count)
    }
}

/// Process-global shared registry, so every node in a worker process shares
/// one cache regardless of which scheduler constructed them.
pub fn global_registry() -> Arc<ModelRegistry> {
    static REGISTRY: std::sync::OnceLock<Arc<ModelRegistry>> = std::sync::OnceLock::new();
    REGISTRY.get_or_init(|| Arc::new(ModelRegistry::new())).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn second_request_is_a_cache_hit() {
        let registry = ModelRegistry::new();
        let key = ModelKey::new("whisper-base", "cpu");
        let loads = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let loads = loads.clone();
            registry
                .get_or_load(&key, || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok((42u32, 1024))
                })
                .await
                .unwrap();
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        let metrics = registry.metrics().await;
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
    }

    #[tokio::test]
    async fn hit_rate_reflects_two_of_three_requests() {
        let registry = ModelRegistry::new();
        let key = ModelKey::new("m", "cpu");
        for _ in 0..3 {
            registry.get_or_load(&key, || async move { Ok((1u32, 0)) }).await.unwrap();
        }
        let metrics = registry.metrics().await;
        assert_eq!(metrics.hits, 2);
        assert_eq!(metrics.misses, 1);
        assert!((metrics.hit_rate - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn concurrent_requests_single_flight_the_loader() {
        let registry = Arc::new(ModelRegistry::new());
        let key = ModelKey::new("m", "cpu");
        let loads = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let key = key.clone();
            let loads = loads.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .get_or_load(&key, || async move {
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        loads.fetch_add(1, Ordering::SeqCst);
                        Ok((1u32, 0))
                    })
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waiters_see_the_original_failure_when_the_coalesced_load_fails() {
        let registry = Arc::new(ModelRegistry::new());
        let key = ModelKey::new("m", "cpu");

        let leader_registry = registry.clone();
        let leader_key = key.clone();
        let leader = tokio::spawn(async move {
            leader_registry
                .get_or_load::<u32, _, _>(&leader_key, || async move {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Err(crate::error::Error::init_failed("model weights corrupt"))
                })
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let waiter_registry = registry.clone();
        let waiter_key = key.clone();
        let waiter = tokio::spawn(async move {
            waiter_registry
                .get_or_load::<u32, _, _>(&waiter_key, || async move { unreachable!("waiter must not load") })
                .await
        });

        let leader_result = leader.await.unwrap();
        let waiter_result = waiter.await.unwrap();

        assert!(leader_result.is_err());
        let waiter_err = waiter_result.unwrap_err();
        assert!(waiter_err.message.contains("model weights corrupt"));
    }

    #[tokio::test]
    async fn clear_resets_memory_and_forces_reload() {
        let registry = ModelRegistry::new();
        let key = ModelKey::new("m", "cpu");
        registry.get_or_load(&key, || async move { Ok((1u32, 512)) }).await.unwrap();
        registry.clear().await;
        let metrics = registry.metrics().await;
        assert_eq!(metrics.total_models, 0);
        assert_eq!(metrics.total_memory_bytes, 0);
    }
}
