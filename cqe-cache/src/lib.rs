//! Cache tier: one parametric cache implementation, specialized by
//! limits into the schema cache, HTTP-response cache, and query-result
//! cache used across the rest of this workspace.

mod cache;

use std::time::Duration;

pub use cache::{estimate_bytes_size, estimate_json_size, estimate_string_size, Cache, CacheLimits, CacheStats};

use cqe_core::{FileSchema, QueryResultPayload};
use cqe_http::HttpResponse;

pub type SchemaCache = Cache<String, FileSchema>;
pub type HttpResponseCache = Cache<String, HttpResponse>;
pub type QueryResultCache = Cache<String, QueryResultPayload>;

pub fn schema_cache() -> SchemaCache {
    Cache::new(CacheLimits {
        max_bytes: 10 * 1024 * 1024,
        max_entries: 500,
        ttl: Duration::from_secs(2 * 3600),
        cleanup_interval: Duration::from_secs(10 * 60),
    })
}

pub fn http_response_cache() -> HttpResponseCache {
    Cache::new(CacheLimits {
        max_bytes: 50 * 1024 * 1024,
        max_entries: 200,
        ttl: Duration::from_secs(30 * 60),
        cleanup_interval: Duration::from_secs(5 * 60),
    })
}

pub fn query_result_cache() -> QueryResultCache {
    Cache::new(CacheLimits {
        max_bytes: 200 * 1024 * 1024,
        max_entries: 100,
        ttl: Duration::from_secs(15 * 60),
        cleanup_interval: Duration::from_secs(5 * 60),
    })
}

/// Normalized key for the query-result cache: trimmed, whitespace-collapsed
/// SQL plus the serialized bind parameters.
pub fn query_result_cache_key(sql: &str, params: &serde_json::Value) -> String {
    let normalized: String = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("{normalized}|{}", params.to_string())
}

/// Spawns the periodic `cleanup` sweep that removes expired entries from a
/// cache. The returned handle may be aborted on shutdown.
pub fn spawn_cleanup_task<K, V>(cache: std::sync::Arc<Cache<K, V>>) -> tokio::task::JoinHandle<()>
where
    K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let interval = cache.cleanup_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = cache.cleanup().await;
            if removed > 0 {
                tracing::debug!(removed, "cache cleanup swept expired entries");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_cache_round_trips() {
        let cache = schema_cache();
        let schema = FileSchema {
            columns: vec![],
            format: cqe_core::FormatTag::Csv,
            row_count: Some(10),
        };
        cache.set("https://x/data.csv".into(), schema.clone(), estimate_json_size(&schema), None).await;
        assert_eq!(cache.get(&"https://x/data.csv".to_string()).await, Some(schema));
    }

    #[test]
    fn query_result_cache_key_normalizes_whitespace() {
        let a = query_result_cache_key("SELECT  *\nFROM t", &serde_json::json!([]));
        let b = query_result_cache_key("SELECT * FROM t", &serde_json::json!([]));
        assert_eq!(a, b);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Whatever sequence of sets happens, total bytes tracked by stats()
        /// never exceeds the configured cap.
        #[test]
        fn total_bytes_never_exceeds_cap(sizes in prop::collection::vec(1usize..200, 1..30)) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let cache: Cache<usize, usize> = Cache::new(CacheLimits {
                    max_bytes: 500,
                    max_entries: 1000,
                    ttl: Duration::from_secs(60),
                    cleanup_interval: Duration::from_secs(30),
                });
                for (i, size) in sizes.iter().enumerate() {
                    cache.set(i, *size, *size, None).await;
                }
                let stats = cache.stats().await;
                prop_assert!(stats.total_bytes <= 500);
                Ok(())
            })?;
        }

        /// Entry count never exceeds the configured cap regardless of
        /// insertion order.
        #[test]
        fn entry_count_never_exceeds_cap(n in 1usize..50) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let cache: Cache<usize, usize> = Cache::new(CacheLimits {
                    max_bytes: 1_000_000,
                    max_entries: 10,
                    ttl: Duration::from_secs(60),
                    cleanup_interval: Duration::from_secs(30),
                });
                for i in 0..n {
                    cache.set(i, i, 1, None).await;
                }
                let stats = cache.stats().await;
                prop_assert!(stats.entries <= 10);
                Ok(())
            })?;
        }
    }
}
