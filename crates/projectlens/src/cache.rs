//! Best-effort response cache.
//!
//! Stage 1 serves fresh entries without a network call, and the error
//! handler's fallback strategy serves the last known body (even if expired)
//! when a request cannot be recovered. A miss never blocks correctness.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Cache counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

/// Capability contract for a key-value response cache.
pub trait CacheService: Send + Sync {
    /// Fresh value for `key`, counting a hit or miss.
    fn get(&self, key: &str) -> Option<serde_json::Value>;
    /// Value for `key` even if expired. Does not touch hit statistics.
    fn get_stale(&self, key: &str) -> Option<serde_json::Value>;
    fn set(&self, key: &str, value: serde_json::Value, ttl: Duration);
    fn delete(&self, key: &str) -> bool;
    /// Whether a fresh value exists. Does not touch hit statistics.
    fn has(&self, key: &str) -> bool;
    fn clear(&self);
    fn stats(&self) -> CacheStats;
}

struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// In-process [`CacheService`].
///
/// Expired entries are kept for [`CacheService::get_stale`] until they are
/// overwritten, deleted, or purged.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop expired entries; returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }
}

impl CacheService for MemoryCache {
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        let value = self
            .entries()
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone());
        match value {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        value
    }

    fn get_stale(&self, key: &str) -> Option<serde_json::Value> {
        self.entries().get(key).map(|e| e.value.clone())
    }

    fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        self.entries().insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn delete(&self, key: &str) -> bool {
        self.entries().remove(key).is_some()
    }

    fn has(&self, key: &str) -> bool {
        self.entries()
            .get(key)
            .is_some_and(|e| e.expires_at > Instant::now())
    }

    fn clear(&self) {
        self.entries().clear();
    }

    fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            entries: self.entries().len(),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}
