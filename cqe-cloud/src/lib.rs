//! Cloud file service: fetches remote files through the HTTP/proxy
//! stack, derives auth headers per provider, and infers lightweight
//! schemas by sampling a prefix of the object. Composes `cqe-http`,
//! `cqe-proxy`, `cqe-auth`, and `cqe-cache` into one client-facing handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use cqe_auth::{AuthManager, Credentials};
use cqe_cache::SchemaCache;
use cqe_core::{ColumnSchema, ColumnType, CorsHandling, Error, FileSchema, FormatTag, ProviderTag, Result};
use cqe_http::{CorsVerdict, HttpClient, RequestOptions};
use cqe_proxy::ProxyService;
use futures::stream::{self, Stream};
use reqwest::Method;
use tracing::instrument;

#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub size: Option<u64>,
    pub content_type: String,
    pub last_modified: Option<i64>,
    pub etag: Option<String>,
    pub provider: ProviderTag,
}

/// A fetched remote file. `as_bytes`/`as_text`/`as_stream` are single-shot:
/// the first call consumes the handle's body, matching a one-time-read
/// stream API. `clone()` is stateless — it hands back a fresh, unconsumed
/// handle over the same bytes.
pub struct FileHandle {
    url: String,
    metadata: FileMetadata,
    format: Option<FormatTag>,
    body: Bytes,
    consumed: AtomicBool,
}

impl FileHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn format(&self) -> Option<FormatTag> {
        self.format
    }

    fn mark_consumed(&self) -> Result<()> {
        if self.consumed.swap(true, Ordering::SeqCst) {
            return Err(Error::batch_failed(format!("file handle for '{}' was already consumed", self.url)));
        }
        Ok(())
    }

    pub fn as_bytes(&self) -> Result<Bytes> {
        self.mark_consumed()?;
        Ok(self.body.clone())
    }

    pub fn as_text(&self) -> Result<String> {
        self.mark_consumed()?;
        String::from_utf8(self.body.to_vec()).map_err(|e| Error::schema(e.to_string()))
    }

    pub fn as_stream(&self) -> Result<impl Stream<Item = Result<Bytes>>> {
        self.mark_consumed()?;
        Ok(stream::once(async { Ok(self.body.clone()) }))
    }
}

impl Clone for FileHandle {
    fn clone(&self) -> Self {
        Self {
            url: self.url.clone(),
            metadata: self.metadata.clone(),
            format: self.format,
            body: self.body.clone(),
            consumed: AtomicBool::new(false),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GetFileOptions {
    pub cors_handling: CorsHandling,
    pub timeout_ms: u64,
}

impl Default for GetFileOptions {
    fn default() -> Self {
        Self { cors_handling: CorsHandling::Auto, timeout_ms: 30_000 }
    }
}

pub struct CloudFileService {
    http: HttpClient,
    proxy: Option<Arc<ProxyService>>,
    auth: Arc<AuthManager>,
    schema_cache: Arc<SchemaCache>,
}

impl CloudFileService {
    pub fn new(auth: Arc<AuthManager>, schema_cache: Arc<SchemaCache>) -> Self {
        Self { http: HttpClient::new(), proxy: None, auth, schema_cache }
    }

    pub fn with_proxy(mut self, proxy: Arc<ProxyService>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn configure_provider(&self, provider: ProviderTag, creds: Credentials) -> Result<()> {
        self.auth.validate(provider, &creds)?;
        self.auth.set_credentials(provider, creds);
        Ok(())
    }

    pub fn set_credentials(&self, provider: ProviderTag, creds: Credentials) {
        self.auth.set_credentials(provider, creds);
    }

    /// Probes (and caches) whether `url` supports direct cross-origin
    /// access, sharing the same per-(host, path) cache `get_file` consults.
    pub async fn test_cors_support(&self, url: &str) -> Result<CorsVerdict> {
        self.http.test_cors_support(url).await
    }

    #[instrument(skip(self, opts), fields(url = %url))]
    pub async fn get_file(&self, url: &str, opts: GetFileOptions) -> Result<FileHandle> {
        let provider = HttpClient::detect_provider(url);
        let headers = self.auth.auth_headers(provider).await?;
        let options = RequestOptions { headers, cors_handling: opts.cors_handling, timeout_ms: opts.timeout_ms, ..Default::default() };

        let response = match opts.cors_handling {
            CorsHandling::Proxy => self.via_proxy(url, options).await?,
            _ => match self.http.fetch_with_cors_handling(url, options.clone()).await {
                Ok(resp) => resp,
                Err(e) if e.code() == "CORS_ERROR" => self.via_proxy(url, options).await?,
                Err(e) => return Err(e),
            },
        };

        if !response.is_success() {
            return Err(Error::http(response.status, format!("failed to fetch '{url}'")));
        }

        Ok(FileHandle {
            url: url.to_string(),
            metadata: FileMetadata {
                size: response.content_length(),
                content_type: response.content_type().to_string(),
                last_modified: response.last_modified(),
                etag: response.etag().map(|s| s.to_string()),
                provider,
            },
            format: FormatTag::from_url(url),
            body: response.body,
            consumed: AtomicBool::new(false),
        })
    }

    async fn via_proxy(&self, url: &str, options: RequestOptions) -> Result<cqe_http::HttpResponse> {
        let proxy = self.proxy.as_ref().ok_or_else(|| Error::cors(format!("'{url}' requires a proxy but none is configured")))?;
        proxy.fetch(url, options).await
    }

    /// Cache-first. On miss: `HEAD` for content type, fall back to URL
    /// suffix, then sample a prefix of the body.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn get_file_schema(&self, url: &str) -> Result<FileSchema> {
        if let Some(cached) = self.schema_cache.get(&url.to_string()).await {
            return Ok(cached);
        }

        let provider = HttpClient::detect_provider(url);
        let headers = self.auth.auth_headers(provider).await?;

        let head_options = RequestOptions { method: Method::HEAD, headers: headers.clone(), ..Default::default() };
        let head = self.http.fetch_with_cors_handling(url, head_options).await.ok();

        let format = head
            .as_ref()
            .and_then(|r| content_type_to_format(r.content_type()))
            .or_else(|| FormatTag::from_url(url))
            .ok_or_else(|| Error::unsupported_format(url.to_string()))?;

        let schema = match format {
            FormatTag::Csv => self.sample_csv(url, &headers).await?,
            FormatTag::Json | FormatTag::Jsonl => self.sample_json(url, &headers, format).await?,
            FormatTag::Columnar | FormatTag::Arrow => self.placeholder_columnar_schema(url, &headers, format).await,
        };

        self.schema_cache.set(url.to_string(), schema.clone(), cqe_cache::estimate_json_size(&schema), None).await;
        Ok(schema)
    }

    async fn sample_csv(&self, url: &str, headers: &HashMap<String, String>) -> Result<FileSchema> {
        let options = RequestOptions { headers: with_range(headers, "bytes=0-4095"), ..Default::default() };
        let resp = self.http.fetch_with_cors_handling(url, options).await?;
        let sample = resp.body.slice(0..resp.body.len().min(4096));
        let text = String::from_utf8_lossy(&sample);
        let first_line = text.lines().next().unwrap_or_default();
        let columns = first_line
            .split(',')
            .map(|c| ColumnSchema { name: c.trim().to_string(), column_type: ColumnType::String })
            .collect();
        Ok(FileSchema { columns, format: FormatTag::Csv, row_count: None })
    }

    async fn sample_json(&self, url: &str, headers: &HashMap<String, String>, format: FormatTag) -> Result<FileSchema> {
        let options = RequestOptions { headers: with_range(headers, "bytes=0-8191"), ..Default::default() };
        let resp = self.http.fetch_with_cors_handling(url, options).await?;
        let sample = &resp.body[..resp.body.len().min(8192)];

        let first_object = if format == FormatTag::Jsonl {
            sample
                .split(|b| *b == b'\n')
                .find(|line| !line.is_empty())
                .and_then(|line| serde_json::from_slice::<serde_json::Value>(line).ok())
        } else {
            serde_json::from_slice::<serde_json::Value>(sample).ok().and_then(|v| match v {
                serde_json::Value::Array(items) => items.into_iter().next(),
                other => Some(other),
            })
        };

        let columns = match first_object {
            Some(serde_json::Value::Object(map)) => {
                map.iter().map(|(k, v)| ColumnSchema { name: k.clone(), column_type: json_value_type(v) }).collect()
            }
            _ => Vec::new(),
        };

        Ok(FileSchema { columns, format, row_count: None })
    }

    /// A real columnar footer parser is out of scope; this samples
    /// the trailing bytes and returns a single-column placeholder.
    async fn placeholder_columnar_schema(&self, url: &str, headers: &HashMap<String, String>, format: FormatTag) -> FileSchema {
        let options = RequestOptions { headers: with_range(headers, "bytes=-8192"), ..Default::default() };
        let _ = self.http.fetch_with_cors_handling(url, options).await;
        FileSchema {
            columns: vec![ColumnSchema { name: "column_0".to_string(), column_type: ColumnType::String }],
            format,
            row_count: None,
        }
    }

    /// Settle-all: succeeds with whatever loaded, fails only if every URL
    /// failed.
    pub async fn get_multiple_files(&self, urls: &[String], opts: GetFileOptions) -> Result<Vec<FileHandle>> {
        let results = futures::future::join_all(urls.iter().map(|url| self.get_file(url, opts.clone()))).await;

        let mut handles = Vec::new();
        let mut failures = 0usize;
        for result in results {
            match result {
                Ok(handle) => handles.push(handle),
                Err(_) => failures += 1,
            }
        }

        if handles.is_empty() && failures > 0 {
            return Err(Error::batch_failed(format!("all {failures} files failed to load")));
        }
        Ok(handles)
    }
}

fn with_range(headers: &HashMap<String, String>, range: &str) -> HashMap<String, String> {
    let mut headers = headers.clone();
    headers.insert("Range".to_string(), range.to_string());
    headers
}

fn content_type_to_format(content_type: &str) -> Option<FormatTag> {
    match content_type.split(';').next().unwrap_or("").trim() {
        "text/csv" => Some(FormatTag::Csv),
        "application/json" => Some(FormatTag::Json),
        "application/x-ndjson" | "application/jsonl" => Some(FormatTag::Jsonl),
        "application/vnd.apache.parquet" | "application/x-parquet" => Some(FormatTag::Columnar),
        _ => None,
    }
}

fn json_value_type(value: &serde_json::Value) -> ColumnType {
    match value {
        serde_json::Value::Number(_) => ColumnType::Number,
        serde_json::Value::Bool(_) => ColumnType::Boolean,
        _ => ColumnType::String,
    }
}
