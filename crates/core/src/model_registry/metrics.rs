//! Cache hit/miss accounting for the shared model registry.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic hit/miss counters plus a running memory estimate, safe to share
/// across concurrent `get_or_load` callers.
#[derive(Default)]
pub struct ModelRegistryCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    total_memory_bytes: AtomicU64,
}

impl ModelRegistryCounters {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self, memory_bytes: u64) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.total_memory_bytes.fetch_add(memory_bytes, Ordering::Relaxed);
    }

    pub fn record_evict(&self, memory_bytes: u64) {
        self.total_memory_bytes.fetch_sub(memory_bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self, total_models: usize) -> ModelRegistryMetrics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        ModelRegistryMetrics {
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            total_models,
            total_memory_bytes: self.total_memory_bytes.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot surfaced to callers via `ModelRegistry::metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct ModelRegistryMetrics {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub total_models: usize,
    pub total_memory_bytes: u64,
}
