//! Generic parametric cache: byte-size cap, entry-count cap, TTL,
//! and LRU eviction by last access. One implementation backs the schema,
//! HTTP-response, and query-result caches; only the limits differ.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Rough byte-size estimate for a string entry: 2 bytes/char.
pub fn estimate_string_size(s: &str) -> usize {
    s.chars().count() * 2
}

/// `byte buffers: byteLength`.
pub fn estimate_bytes_size(bytes: &[u8]) -> usize {
    bytes.len()
}

/// `otherwise: JSON-length × 2`, for values with no cheaper estimate.
pub fn estimate_json_size<T: Serialize>(value: &T) -> usize {
    serde_json::to_string(value).map(|s| s.len() * 2).unwrap_or(0)
}

#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    pub max_bytes: usize,
    pub max_entries: usize,
    pub ttl: Duration,
    pub cleanup_interval: Duration,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: usize,
    pub max_bytes: usize,
    pub max_entries: usize,
}

struct Entry<V> {
    value: V,
    size: usize,
    expires_at: Instant,
    last_access: Instant,
    access_count: u64,
}

pub struct Cache<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    total_bytes: AtomicUsize,
    limits: CacheLimits,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(limits: CacheLimits) -> Self {
        Self { entries: RwLock::new(HashMap::new()), total_bytes: AtomicUsize::new(0), limits }
    }

    /// Evicts least-recently-used entries until `size` more bytes (and one
    /// more entry) fit within the configured caps, then inserts. A value
    /// whose own `size` exceeds `max_bytes` can never fit no matter how much
    /// is evicted, so `set` is a no-op for it rather than evicting
    /// everything and pinning `total_bytes` above the cap.
    pub async fn set(&self, key: K, value: V, size: usize, ttl: Option<Duration>) {
        if size > self.limits.max_bytes {
            return;
        }

        let mut entries = self.entries.write().await;

        while !entries.is_empty()
            && (self.total_bytes.load(Ordering::Relaxed) + size > self.limits.max_bytes
                || entries.len() >= self.limits.max_entries)
        {
            let Some(lru_key) = entries.iter().min_by_key(|(_, e)| e.last_access).map(|(k, _)| k.clone()) else {
                break;
            };
            if let Some(removed) = entries.remove(&lru_key) {
                self.total_bytes.fetch_sub(removed.size, Ordering::Relaxed);
            }
        }

        let now = Instant::now();
        let expires_at = now + ttl.unwrap_or(self.limits.ttl);
        if let Some(old) = entries.insert(key, Entry { value, size, expires_at, last_access: now, access_count: 0 }) {
            self.total_bytes.fetch_sub(old.size, Ordering::Relaxed);
        }
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
    }

    /// Returns `None` and evicts the entry if it has expired; otherwise
    /// bumps its access count and last-access timestamp.
    pub async fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(key) {
            if Instant::now() >= entry.expires_at {
                if let Some(removed) = entries.remove(key) {
                    self.total_bytes.fetch_sub(removed.size, Ordering::Relaxed);
                }
                return None;
            }
        }
        let entry = entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_access = Instant::now();
        Some(entry.value.clone())
    }

    /// Presence check with no side effects; does not evict an expired entry.
    pub async fn has(&self, key: &K) -> bool {
        let entries = self.entries.read().await;
        entries.get(key).map(|e| Instant::now() < e.expires_at).unwrap_or(false)
    }

    pub async fn delete(&self, key: &K) -> bool {
        let mut entries = self.entries.write().await;
        if let Some(removed) = entries.remove(key) {
            self.total_bytes.fetch_sub(removed.size, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.clear();
        self.total_bytes.store(0, Ordering::Relaxed);
    }

    /// Removes every expired entry; returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        let expired: Vec<K> = entries.iter().filter(|(_, e)| now >= e.expires_at).map(|(k, _)| k.clone()).collect();
        for key in &expired {
            if let Some(removed) = entries.remove(key) {
                self.total_bytes.fetch_sub(removed.size, Ordering::Relaxed);
            }
        }
        expired.len()
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        CacheStats {
            entries: entries.len(),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            max_bytes: self.limits.max_bytes,
            max_entries: self.limits.max_entries,
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.limits.cleanup_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> CacheLimits {
        CacheLimits { max_bytes: 1_000, max_entries: 3, ttl: Duration::from_secs(60), cleanup_interval: Duration::from_secs(30) }
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache: Cache<String, String> = Cache::new(limits());
        cache.set("a".into(), "hello".into(), 10, None).await;
        assert_eq!(cache.get(&"a".to_string()).await, Some("hello".to_string()));
    }

    #[tokio::test]
    async fn expired_entry_is_evicted_on_get() {
        let cache: Cache<String, String> = Cache::new(limits());
        cache.set("a".into(), "hello".into(), 10, Some(Duration::from_millis(1))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get(&"a".to_string()).await, None);
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn evicts_lru_when_entry_count_cap_exceeded() {
        let cache: Cache<String, String> = Cache::new(limits());
        cache.set("a".into(), "1".into(), 1, None).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.set("b".into(), "2".into(), 1, None).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.set("c".into(), "3".into(), 1, None).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        // accessing "a" makes it the most-recently-used, so "b" is evicted next.
        cache.get(&"a".to_string()).await;
        cache.set("d".into(), "4".into(), 1, None).await;
        assert!(cache.has(&"a".to_string()).await);
        assert!(!cache.has(&"b".to_string()).await);
    }

    #[tokio::test]
    async fn evicts_by_byte_size_cap() {
        let cache: Cache<String, Vec<u8>> =
            Cache::new(CacheLimits { max_bytes: 15, max_entries: 100, ttl: Duration::from_secs(60), cleanup_interval: Duration::from_secs(30) });
        cache.set("a".into(), vec![0; 10], 10, None).await;
        cache.set("b".into(), vec![0; 10], 10, None).await;
        let stats = cache.stats().await;
        assert!(stats.total_bytes <= 15);
        assert!(!cache.has(&"a".to_string()).await);
    }

    #[tokio::test]
    async fn oversized_value_is_a_no_op_and_never_pins_total_bytes_above_cap() {
        let cache: Cache<String, Vec<u8>> =
            Cache::new(CacheLimits { max_bytes: 15, max_entries: 100, ttl: Duration::from_secs(60), cleanup_interval: Duration::from_secs(30) });
        cache.set("a".into(), vec![0; 10], 10, None).await;
        cache.set("too_big".into(), vec![0; 20], 20, None).await;
        assert!(!cache.has(&"too_big".to_string()).await);
        assert!(cache.has(&"a".to_string()).await);
        let stats = cache.stats().await;
        assert!(stats.total_bytes <= stats.max_bytes);
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_entries() {
        let cache: Cache<String, String> = Cache::new(limits());
        cache.set("a".into(), "x".into(), 1, Some(Duration::from_millis(1))).await;
        cache.set("b".into(), "y".into(), 1, Some(Duration::from_secs(60))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = cache.cleanup().await;
        assert_eq!(removed, 1);
        assert!(cache.has(&"b".to_string()).await);
    }
}
