//! Remote-table orchestrator: registers a cloud file as a queryable
//! SQL table, either directly (SQL engine reads the URL itself) or proxied
//! (the cloud file service fetches the bytes and registers them as an
//! in-memory virtual file), and runs a configurable fallback chain when a
//! query against a registered table fails.
//!
//! The SQL engine is an external collaborator: this crate only
//! depends on the [`SqlEngine`]/[`SqlConnection`] trait pair, never a
//! concrete embedded database, so it stays agnostic to whatever engine a
//! caller wires in.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use cqe_cache::QueryResultCache;
use cqe_cloud::{CloudFileService, GetFileOptions};
use cqe_core::{CorsHandling, Error, FormatTag, Result};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::instrument;

/// A single query/DDL round-trip against the embedded SQL engine. Each
/// orchestrator operation opens, uses, and closes one connection.
#[async_trait]
pub trait SqlConnection: Send {
    async fn query(&mut self, sql: &str) -> Result<Vec<serde_json::Value>>;
    async fn execute(&mut self, sql: &str) -> Result<()>;
    async fn close(self: Box<Self>) -> Result<()>;
}

/// The SQL engine collaborator contract. `register_file_buffer` and
/// `register_file_text` make an in-memory blob addressable by the file
/// functions used in a `CREATE TABLE ... AS SELECT ... FROM read_*(...)`.
#[async_trait]
pub trait SqlEngine: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn SqlConnection>>;
    fn register_file_buffer(&self, virtual_name: &str, bytes: Bytes) -> Result<()>;
    fn register_file_text(&self, virtual_name: &str, text: String) -> Result<()>;
    fn list_tables(&self) -> Result<Vec<String>>;
    async fn terminate(&self) -> Result<()>;
}

/// A fallback strategy tried, in order, when `query_cloud_table` fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackStrategy {
    /// Re-register the table in proxy mode and retry the query once.
    Proxy,
    /// Return a cached result for the same SQL, if one exists. A miss
    /// advances to the next strategy rather than failing.
    Cache,
    /// Propagate the error. Always the effective final strategy even if
    /// omitted from the configured chain.
    Error,
}

/// How a table was registered, decided once by `select_mode` and then
/// reused by re-registration and by the proxy fallback strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegistrationMode {
    Direct,
    Proxy,
}

/// Per-table registration options.
#[derive(Debug, Clone)]
pub struct RegisterTableOptions {
    pub cors_handling: CorsHandling,
    pub columns: Option<Vec<String>>,
    pub predicate: Option<String>,
}

impl Default for RegisterTableOptions {
    fn default() -> Self {
        Self { cors_handling: CorsHandling::Auto, columns: None, predicate: None }
    }
}

#[derive(Debug, Clone)]
struct TableRecord {
    url: String,
    format: FormatTag,
    mode: RegistrationMode,
    options: RegisterTableOptions,
}

fn select_list(columns: &Option<Vec<String>>) -> String {
    match columns {
        Some(cols) if !cols.is_empty() => cols.join(", "),
        _ => "*".to_string(),
    }
}

fn where_clause(predicate: &Option<String>) -> String {
    match predicate {
        Some(p) if !p.is_empty() => format!(" WHERE {p}"),
        _ => String::new(),
    }
}

/// Owns the table name → (URL, format, mode) map and serializes every
/// register/query/unregister against it so the invariant `has(t) ↔
/// sql_engine.list_tables().contains(t)` never observes a half-updated
/// state.
pub struct RemoteTableOrchestrator {
    sql_engine: Arc<dyn SqlEngine>,
    cloud: Arc<CloudFileService>,
    query_cache: Option<Arc<QueryResultCache>>,
    tables: DashMap<String, TableRecord>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    forced_proxy: std::sync::atomic::AtomicBool,
    fallback_chain: std::sync::RwLock<Vec<FallbackStrategy>>,
}

impl RemoteTableOrchestrator {
    pub fn new(sql_engine: Arc<dyn SqlEngine>, cloud: Arc<CloudFileService>) -> Self {
        Self {
            sql_engine,
            cloud,
            query_cache: None,
            tables: DashMap::new(),
            locks: DashMap::new(),
            forced_proxy: std::sync::atomic::AtomicBool::new(false),
            fallback_chain: std::sync::RwLock::new(vec![
                FallbackStrategy::Proxy,
                FallbackStrategy::Cache,
                FallbackStrategy::Error,
            ]),
        }
    }

    pub fn with_query_cache(mut self, cache: Arc<QueryResultCache>) -> Self {
        self.query_cache = Some(cache);
        self
    }

    /// `initialize({ enableHttpExt, ... })`: attempts to load the SQL
    /// engine's HTTP filesystem extension via a probe query; on failure,
    /// enters forced-proxy mode for the lifetime of this orchestrator.
    #[instrument(skip(self))]
    pub async fn initialize(&self, enable_http_ext: bool) -> Result<()> {
        if !enable_http_ext {
            self.forced_proxy.store(true, std::sync::atomic::Ordering::SeqCst);
            return Ok(());
        }
        let mut conn = self.sql_engine.connect().await?;
        let loaded = conn.execute("INSTALL httpfs; LOAD httpfs;").await;
        conn.close().await?;
        if loaded.is_err() {
            tracing::warn!("http filesystem extension unavailable, forcing proxy mode");
            self.forced_proxy.store(true, std::sync::atomic::Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn enable_proxied_access(&self, force: bool) {
        self.forced_proxy.store(force, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn configure_fallback_strategies(&self, chain: Vec<FallbackStrategy>) {
        *self.fallback_chain.write().unwrap() = chain;
    }

    pub fn has(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    fn table_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks.entry(name.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    async fn select_mode(&self, url: &str, cors_handling: CorsHandling) -> RegistrationMode {
        if self.forced_proxy.load(std::sync::atomic::Ordering::SeqCst) {
            return RegistrationMode::Proxy;
        }
        match cors_handling {
            CorsHandling::Direct => RegistrationMode::Direct,
            CorsHandling::Proxy => RegistrationMode::Proxy,
            CorsHandling::Auto => match self.cloud.test_cors_support(url).await {
                Ok(verdict) if verdict.direct_supported => RegistrationMode::Direct,
                _ => RegistrationMode::Proxy,
            },
        }
    }

    /// Idempotent per name: re-registration drops and recreates.
    /// Concurrent calls for the *same* name are serialized through a
    /// per-table lock so the registry and SQL engine never diverge.
    #[instrument(skip(self, options), fields(name = %name, url = %url))]
    pub async fn register_cloud_table(&self, name: &str, url: &str, options: RegisterTableOptions) -> Result<()> {
        let lock = self.table_lock(name);
        let _guard = lock.lock().await;

        let format = FormatTag::from_url(url).ok_or_else(|| Error::unsupported_format(url.to_string()))?;

        if self.tables.contains_key(name) {
            self.drop_table_statement(name).await.ok();
        }

        let mode = self.select_mode(url, options.cors_handling).await;
        match mode {
            RegistrationMode::Direct => self.register_direct(name, url, format, &options).await?,
            RegistrationMode::Proxy => self.register_proxied(name, url, format, &options).await?,
        }

        self.tables.insert(name.to_string(), TableRecord { url: url.to_string(), format, mode, options });
        Ok(())
    }

    async fn register_direct(&self, name: &str, url: &str, format: FormatTag, options: &RegisterTableOptions) -> Result<()> {
        let sql = format!(
            "CREATE TABLE {name} AS SELECT {} FROM {}('{url}'){}",
            select_list(&options.columns),
            format.read_function(),
            where_clause(&options.predicate),
        );
        self.run_ddl(name, &sql).await
    }

    async fn register_proxied(&self, name: &str, url: &str, format: FormatTag, options: &RegisterTableOptions) -> Result<()> {
        let handle = self.cloud.get_file(url, GetFileOptions { cors_handling: CorsHandling::Proxy, ..Default::default() }).await?;
        let virtual_name = format!("{name}.{}", format.virtual_extension());
        match format {
            FormatTag::Columnar | FormatTag::Arrow => {
                self.sql_engine.register_file_buffer(&virtual_name, handle.as_bytes()?)?;
            }
            FormatTag::Csv | FormatTag::Json | FormatTag::Jsonl => {
                self.sql_engine.register_file_text(&virtual_name, handle.as_text()?)?;
            }
        }
        let sql = format!(
            "CREATE TABLE {name} AS SELECT {} FROM {}('{virtual_name}'){}",
            select_list(&options.columns),
            format.read_function(),
            where_clause(&options.predicate),
        );
        self.run_ddl(name, &sql).await
    }

    async fn run_ddl(&self, name: &str, sql: &str) -> Result<()> {
        let mut conn = self.sql_engine.connect().await?;
        let result = conn.execute(sql).await;
        conn.close().await?;
        result.map_err(|e| Error::table_registration_failed(name, e.to_string()))
    }

    async fn drop_table_statement(&self, name: &str) -> Result<()> {
        self.run_ddl(name, &format!("DROP TABLE IF EXISTS {name}")).await
    }

    /// Runs `sql` (or `SELECT * FROM <name>`) through the SQL engine; on
    /// failure, walks the configured fallback chain.
    #[instrument(skip(self, sql), fields(name = %name))]
    pub async fn query_cloud_table(&self, name: &str, sql: Option<&str>) -> Result<Vec<serde_json::Value>> {
        if !self.tables.contains_key(name) {
            return Err(Error::query_failed(format!("table '{name}' is not registered")));
        }
        let statement = sql.map(str::to_string).unwrap_or_else(|| format!("SELECT * FROM {name}"));

        match self.run_query(&statement).await {
            Ok(rows) => Ok(rows),
            Err(first_err) => self.run_fallback_chain(name, &statement, first_err).await,
        }
    }

    async fn run_query(&self, sql: &str) -> Result<Vec<serde_json::Value>> {
        let mut conn = self.sql_engine.connect().await?;
        let result = conn.query(sql).await;
        conn.close().await?;
        result
    }

    async fn run_fallback_chain(&self, name: &str, sql: &str, first_err: Error) -> Result<Vec<serde_json::Value>> {
        let chain = self.fallback_chain.read().unwrap().clone();
        for strategy in chain {
            match strategy {
                FallbackStrategy::Proxy => {
                    let lock = self.table_lock(name);
                    let _guard = lock.lock().await;
                    let Some(record) = self.tables.get(name).map(|r| r.clone()) else {
                        continue;
                    };
                    if record.mode == RegistrationMode::Proxy {
                        continue;
                    }
                    self.drop_table_statement(name).await.ok();
                    if self.register_proxied(name, &record.url, record.format, &record.options).await.is_err() {
                        // The DROP already ran, so the table no longer exists in the SQL
                        // engine: drop the now-stale registry entry too rather than leave
                        // `has(name)` true with nothing backing it.
                        self.tables.remove(name);
                        continue;
                    }
                    self.tables.insert(
                        name.to_string(),
                        TableRecord { mode: RegistrationMode::Proxy, ..record },
                    );
                    drop(_guard);
                    if let Ok(rows) = self.run_query(sql).await {
                        return Ok(rows);
                    }
                }
                FallbackStrategy::Cache => {
                    if let Some(cache) = &self.query_cache {
                        let key = cqe_cache::query_result_cache_key(sql, &serde_json::Value::Null);
                        if let Some(payload) = cache.get(&key).await {
                            return Ok(payload.rows);
                        }
                    }
                }
                FallbackStrategy::Error => {
                    return Err(Error::query_failed(format!(
                        "query against '{name}' failed after exhausting the fallback chain: {first_err}"
                    )));
                }
            }
        }
        Err(Error::query_failed(format!(
            "query against '{name}' failed after exhausting the fallback chain: {first_err}"
        )))
    }

    /// Best-effort DROP TABLE followed by registry removal; removal
    /// proceeds even if DROP fails.
    #[instrument(skip(self), fields(name = %name))]
    pub async fn unregister_cloud_table(&self, name: &str) -> Result<()> {
        let lock = self.table_lock(name);
        let _guard = lock.lock().await;
        let _ = self.drop_table_statement(name).await;
        self.tables.remove(name);
        Ok(())
    }

    pub fn list_tables(&self) -> Vec<String> {
        self.tables.iter().map(|e| e.key().clone()).collect()
    }

    /// `loadData(rows, tableName)`: registers an in-memory table via
    /// the SQL engine's JSON-text path, bypassing the cloud file service
    /// entirely (there is no URL to probe or fetch).
    #[instrument(skip(self, rows), fields(name = %name))]
    pub async fn register_in_memory_json(&self, name: &str, virtual_name: &str, rows: &[serde_json::Value]) -> Result<()> {
        let lock = self.table_lock(name);
        let _guard = lock.lock().await;

        if self.tables.contains_key(name) {
            self.drop_table_statement(name).await.ok();
        }

        let text = serde_json::to_string(rows)?;
        self.sql_engine.register_file_text(virtual_name, text)?;
        let sql = format!("CREATE TABLE {name} AS SELECT * FROM read_json_auto('{virtual_name}')");
        self.run_ddl(name, &sql).await?;

        self.tables.insert(
            name.to_string(),
            TableRecord {
                url: virtual_name.to_string(),
                format: FormatTag::Json,
                mode: RegistrationMode::Proxy,
                options: RegisterTableOptions::default(),
            },
        );
        Ok(())
    }
}
