//! HTTP access client: timed fetch, CORS probing, retry, and
//! provider detection over plain URL inspection, for arbitrary
//! cloud-storage URLs rather than a single fixed endpoint.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use cqe_core::{CorsHandling, Error, ProviderTag, Result};
use dashmap::DashMap;
use reqwest::{Client as ReqwestClient, Method};
use tracing::{instrument, warn};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
    pub timeout_ms: u64,
    pub cors_handling: CorsHandling,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: HashMap::new(),
            body: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            cors_handling: CorsHandling::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.headers.get(&lower).map(|v| v.as_str())
    }

    /// Parses `Last-Modified` (RFC 1123) into a Unix timestamp.
    pub fn last_modified(&self) -> Option<i64> {
        let raw = self.header("last-modified")?;
        httpdate::parse_http_date(raw).ok().map(|t| {
            t.duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0)
        })
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }

    pub fn content_type(&self) -> &str {
        self.header("content-type").unwrap_or("application/octet-stream")
    }

    pub fn etag(&self) -> Option<&str> {
        self.header("etag")
    }
}

/// Result of a cached CORS probe.
#[derive(Debug, Clone)]
pub struct CorsVerdict {
    pub direct_supported: bool,
    pub requires_proxy: bool,
    pub allowed_methods: Vec<String>,
    pub max_observed_content_length: Option<u64>,
}

/// Cache key ignores the query string: only host and path distinguish
/// one CORS probe from another.
fn cors_cache_key(url: &str) -> Option<(String, String)> {
    let parsed = url::Url::parse(url).ok()?;
    Some((parsed.host_str().unwrap_or("").to_string(), parsed.path().to_string()))
}

pub struct HttpClient {
    client: ReqwestClient,
    cors_cache: DashMap<(String, String), CorsVerdict>,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    pub fn new() -> Self {
        Self {
            client: ReqwestClient::builder()
                .build()
                .expect("failed to build reqwest client"),
            cors_cache: DashMap::new(),
        }
    }

    /// Plain timed request. The timeout fires at `options.timeout_ms` from
    /// issue regardless of what the in-flight send is doing; `reqwest`
    /// drops (and thus cancels) the send future on timeout, so cleanup
    /// happens on every exit path.
    #[instrument(skip(self, options), fields(url = %url))]
    pub async fn fetch(&self, url: &str, options: RequestOptions) -> Result<HttpResponse> {
        let timeout_ms = options.timeout_ms;
        match tokio::time::timeout(Duration::from_millis(timeout_ms), self.send(url, &options)).await {
            Ok(result) => result,
            Err(_) => Err(Error::network(format!(
                "request to '{url}' timed out after {timeout_ms}ms"
            ))),
        }
    }

    async fn send(&self, url: &str, options: &RequestOptions) -> Result<HttpResponse> {
        let mut builder = self.client.request(options.method.clone(), url);
        for (name, value) in &options.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = options.body.clone() {
            builder = builder.body(body);
        }
        let response = builder.send().await.map_err(|e| Error::network(e.to_string()))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_ascii_lowercase(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let body = response.bytes().await.map_err(|e| Error::network(e.to_string()))?;
        let resp = HttpResponse { status, headers, body };
        if !resp.is_success() {
            return Err(Error::http(status, format!("request to '{url}' failed")));
        }
        Ok(resp)
    }

    /// Cached per `(host, path)`; issues a `HEAD` on miss. Never retried:
    /// the probe itself stands in for the retry-free step.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn test_cors_support(&self, url: &str) -> Result<CorsVerdict> {
        let key = cors_cache_key(url).ok_or_else(|| Error::network(format!("invalid URL '{url}'")))?;
        if let Some(cached) = self.cors_cache.get(&key) {
            return Ok(cached.clone());
        }

        let verdict = match self.client.head(url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let allowed = resp
                    .headers()
                    .get("allow")
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.split(',').map(|m| m.trim().to_ascii_uppercase()).collect())
                    .unwrap_or_else(|| vec!["GET".to_string()]);
                let content_length = resp.headers().get("content-length").and_then(|v| v.to_str().ok()).and_then(|s| s.parse().ok());
                CorsVerdict {
                    direct_supported: true,
                    requires_proxy: false,
                    allowed_methods: allowed,
                    max_observed_content_length: content_length,
                }
            }
            _ => CorsVerdict { direct_supported: false, requires_proxy: true, allowed_methods: Vec::new(), max_observed_content_length: None },
        };

        self.cors_cache.insert(key, verdict.clone());
        Ok(verdict)
    }

    /// Probes for direct support, then fetches directly or fails with a
    /// `CORS_ERROR` for the proxy service to handle. `CorsHandling::Proxy`
    /// skips the probe and fails immediately, letting the caller route to
    /// the proxy service without wasting a `HEAD`.
    pub async fn fetch_with_cors_handling(&self, url: &str, options: RequestOptions) -> Result<HttpResponse> {
        match options.cors_handling {
            CorsHandling::Direct => self.fetch(url, options).await,
            CorsHandling::Proxy => Err(Error::cors(format!("'{url}' is configured for proxy access"))),
            CorsHandling::Auto => {
                let verdict = self.test_cors_support(url).await?;
                if verdict.direct_supported {
                    self.fetch(url, options).await
                } else {
                    Err(Error::cors(format!("'{url}' does not support direct cross-origin access")))
                }
            }
        }
    }

    /// Wraps [`fetch_with_cors_handling`], retrying only errors that look
    /// transient, with `2^attempt` second backoff.
    #[instrument(skip(self, options), fields(url = %url, retries))]
    pub async fn fetch_with_retry(&self, url: &str, options: RequestOptions, retries: u32) -> Result<HttpResponse> {
        let mut attempt = 0;
        loop {
            match self.fetch_with_cors_handling(url, options.clone()).await {
                Ok(resp) => return Ok(resp),
                Err(err) if attempt < retries && err.is_retryable() => {
                    let delay = Duration::from_secs(2u64.saturating_pow(attempt));
                    warn!(attempt, delay_secs = delay.as_secs(), %url, "retrying request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Pure URL inspection; never makes a network call.
    pub fn detect_provider(url: &str) -> ProviderTag {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|s| s.to_ascii_lowercase()))
            .unwrap_or_default();
        if host.ends_with(".amazonaws.com") || host.starts_with("s3.") {
            ProviderTag::S3
        } else if host.ends_with("r2.dev") || host.ends_with("r2.cloudflarestorage.com") {
            ProviderTag::R2
        } else if host.ends_with("googleapis.com") || host.ends_with("storage.cloud.google.com") {
            ProviderTag::Gcs
        } else if host.ends_with("blob.core.windows.net") {
            ProviderTag::AzureBlob
        } else {
            ProviderTag::S3
        }
    }
}
