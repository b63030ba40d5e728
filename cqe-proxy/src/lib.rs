//! Proxy service: health-weighted endpoint selection with rotation
//! on failure across a pool of endpoints ranked by health × priority,
//! plus response caching for requests routed through a proxy.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cqe_core::{Error, Result};
use cqe_http::{HttpResponse, RequestOptions};
use dashmap::DashMap;
use reqwest::{Client as ReqwestClient, Method};
use tokio::time::Instant;
use tracing::{instrument, warn};

const CACHE_EVICTION_THRESHOLD: usize = 100;
const INITIAL_HEALTH: i64 = 100;
const HEALTH_DECAY: i64 = 10;

#[derive(Debug, Clone)]
pub struct ProxyEndpointConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub priority: i64,
}

struct ProxyEndpoint {
    config: ProxyEndpointConfig,
    health: AtomicI64,
}

impl ProxyEndpoint {
    fn decay(&self) {
        let mut current = self.health.load(Ordering::Relaxed);
        loop {
            let next = (current - HEALTH_DECAY).max(0);
            match self.health.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }
}

struct CachedResponse {
    response: HttpResponse,
    expires_at: Instant,
}

/// Proxies requests to hosts that reject direct cross-origin access,
/// rotating away from unhealthy endpoints.
pub struct ProxyService {
    client: ReqwestClient,
    endpoints: Vec<ProxyEndpoint>,
    cache: DashMap<String, CachedResponse>,
    cache_ttl: Duration,
    cors_response_headers: Vec<(String, String)>,
}

impl ProxyService {
    pub fn new(endpoints: Vec<ProxyEndpointConfig>, cache_ttl: Duration) -> Self {
        Self {
            client: ReqwestClient::builder().build().expect("failed to build reqwest client"),
            endpoints: endpoints
                .into_iter()
                .map(|config| ProxyEndpoint { config, health: AtomicI64::new(INITIAL_HEALTH) })
                .collect(),
            cache: DashMap::new(),
            cache_ttl,
            cors_response_headers: Vec::new(),
        }
    }

    pub fn with_cors_response_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.cors_response_headers = headers;
        self
    }

    /// `health × priority`, restricted to endpoints with `health > 0` and
    /// not already excluded from the current request.
    fn select(&self, excluded: &HashSet<usize>) -> Option<usize> {
        self.endpoints
            .iter()
            .enumerate()
            .filter(|(i, _)| !excluded.contains(i))
            .filter(|(_, e)| e.health.load(Ordering::Relaxed) > 0)
            .max_by_key(|(_, e)| e.health.load(Ordering::Relaxed) * e.config.priority)
            .map(|(i, _)| i)
    }

    #[instrument(skip(self, options), fields(url = %url))]
    pub async fn fetch(&self, url: &str, options: RequestOptions) -> Result<HttpResponse> {
        let cache_key = cache_key(&options.method, url, &options.headers);
        let cacheable = options.method != Method::HEAD;

        if cacheable {
            if let Some(cached) = self.cache.get(&cache_key) {
                if cached.expires_at > Instant::now() {
                    return Ok(cached.response.clone());
                }
            }
        }

        let mut excluded = HashSet::new();
        loop {
            let idx = self
                .select(&excluded)
                .ok_or_else(|| Error::proxy_failed("no healthy proxy endpoint available"))?;

            match self.send_via(idx, url, &options).await {
                Ok(resp) => {
                    if cacheable {
                        self.cache.insert(
                            cache_key.clone(),
                            CachedResponse { response: resp.clone(), expires_at: Instant::now() + self.cache_ttl },
                        );
                        self.evict_expired_if_needed();
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    warn!(endpoint = %self.endpoints[idx].config.url, %err, "proxy endpoint failed, rotating");
                    self.endpoints[idx].decay();
                    excluded.insert(idx);
                }
            }
        }
    }

    async fn send_via(&self, idx: usize, target_url: &str, options: &RequestOptions) -> Result<HttpResponse> {
        let endpoint = &self.endpoints[idx];
        let mut proxy_url = url::Url::parse(&endpoint.config.url)
            .map_err(|e| Error::proxy_failed(format!("invalid proxy endpoint URL: {e}")))?;
        proxy_url
            .path_segments_mut()
            .map_err(|_| Error::proxy_failed("proxy endpoint URL cannot be a base"))?
            .pop_if_empty()
            .push("fetch");
        proxy_url.query_pairs_mut().append_pair("url", target_url);

        let mut builder = self.client.request(options.method.clone(), proxy_url);
        for (name, value) in &self.cors_response_headers {
            builder = builder.header(name, value);
        }
        for (name, value) in &options.headers {
            builder = builder.header(name, value);
        }
        builder = builder.header("X-Original-URL", target_url);
        if let Some(api_key) = &endpoint.config.api_key {
            builder = builder.header("X-Proxy-Authorization", api_key);
        }
        if let Some(body) = options.body.clone() {
            builder = builder.body(body);
        }

        let response = builder
            .timeout(Duration::from_millis(options.timeout_ms))
            .send()
            .await
            .map_err(|e| Error::proxy_failed(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_ascii_lowercase(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let body = response.bytes().await.map_err(|e| Error::proxy_failed(e.to_string()))?;
        let resp = HttpResponse { status, headers, body };
        if !resp.is_success() {
            return Err(Error::proxy_failed(format!("proxy returned HTTP {status}")));
        }
        Ok(resp)
    }

    fn evict_expired_if_needed(&self) {
        if self.cache.len() <= CACHE_EVICTION_THRESHOLD {
            return;
        }
        let now = Instant::now();
        self.cache.retain(|_, v| v.expires_at > now);
    }

    pub fn health_snapshot(&self) -> Vec<(String, i64)> {
        self.endpoints
            .iter()
            .map(|e| (e.config.url.clone(), e.health.load(Ordering::Relaxed)))
            .collect()
    }
}

fn cache_key(method: &Method, url: &str, headers: &std::collections::HashMap<String, String>) -> String {
    let mut keys: Vec<&String> = headers.keys().collect();
    keys.sort();
    let header_part: Vec<String> = keys.iter().map(|k| format!("{k}={}", headers[*k])).collect();
    format!("{method}:{url}:{}", header_part.join(","))
}

/// Thin wrapper so callers (e.g. the cloud file service) don't need their
/// own `Arc` bookkeeping.
pub type SharedProxyService = Arc<ProxyService>;

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options() -> RequestOptions {
        RequestOptions { timeout_ms: 5_000, ..Default::default() }
    }

    #[tokio::test]
    async fn rotates_to_next_endpoint_on_failure() {
        let bad = MockServer::start().await;
        let good = MockServer::start().await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(502)).mount(&bad).await;
        Mock::given(method("GET"))
            .and(query_param("url", "https://example.com/data.csv"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&good)
            .await;

        let service = ProxyService::new(
            vec![
                ProxyEndpointConfig { url: bad.uri(), api_key: None, priority: 2 },
                ProxyEndpointConfig { url: good.uri(), api_key: None, priority: 1 },
            ],
            Duration::from_secs(60),
        );

        let resp = service.fetch("https://example.com/data.csv", options()).await.unwrap();
        assert_eq!(resp.body, bytes::Bytes::from("ok"));

        let health = service.health_snapshot();
        assert_eq!(health[0].1, 90);
        assert_eq!(health[1].1, 100);
    }

    #[tokio::test]
    async fn request_hits_fetch_path_with_original_url_header() {
        let proxy = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fetch"))
            .and(query_param("url", "https://example.com/data.csv"))
            .and(header("X-Original-URL", "https://example.com/data.csv"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&proxy)
            .await;

        let service =
            ProxyService::new(vec![ProxyEndpointConfig { url: proxy.uri(), api_key: None, priority: 1 }], Duration::from_secs(60));

        let resp = service.fetch("https://example.com/data.csv", options()).await.unwrap();
        assert_eq!(resp.body, bytes::Bytes::from("ok"));
    }

    #[tokio::test]
    async fn fails_when_every_endpoint_is_exhausted() {
        let bad = MockServer::start().await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(502)).mount(&bad).await;

        let service =
            ProxyService::new(vec![ProxyEndpointConfig { url: bad.uri(), api_key: None, priority: 1 }], Duration::from_secs(60));

        let err = service.fetch("https://example.com/data.csv", options()).await.unwrap_err();
        assert_eq!(err.code(), "PROXY_FAILED");
    }

    #[tokio::test]
    async fn caches_successful_responses() {
        let proxy = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("cached"))
            .expect(1)
            .mount(&proxy)
            .await;

        let service =
            ProxyService::new(vec![ProxyEndpointConfig { url: proxy.uri(), api_key: None, priority: 1 }], Duration::from_secs(60));

        let first = service.fetch("https://example.com/data.csv", options()).await.unwrap();
        let second = service.fetch("https://example.com/data.csv", options()).await.unwrap();
        assert_eq!(first.body, second.body);
        proxy.verify().await;
    }
}
