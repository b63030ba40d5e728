//! Engine facade: the single entry point applications hold. Owns
//! the dependency registry, the remote-table orchestrator, the cache
//! tier, and (optionally) the compute module; reports aggregate status
//! and query metrics behind one shared handle.

pub mod config;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cqe_auth::{AuthManager, Credentials};
use cqe_cache::{query_result_cache, schema_cache, QueryResultCache, SchemaCache};
use cqe_cloud::CloudFileService;
use cqe_core::{Error, QueryResultPayload, Result};
use cqe_orchestrator::{RegisterTableOptions, RemoteTableOrchestrator, SqlEngine};
use cqe_registry::{DependencyRegistry, LoadOptions, VersionedModule};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock as AsyncRwLock;
use tokio::time::Instant;
use tracing::instrument;

pub use config::{CorsConfig, DependencyConfig, EngineConfig, EngineConfigBuilder, LogLevel};

/// Opaque collaborator: only presence in the registry is validated,
/// no method on it is ever called by this crate.
pub trait ColumnarRuntime: VersionedModule {}

/// The struct returned by a compute module's `process_data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeResult {
    pub data: String,
    pub row_count: usize,
    pub execution_time_ms: u64,
    pub memory_used_bytes: u64,
}

/// Compute-module collaborator: post-processes large query results.
/// Cross-language boundary, so it trades bytes for a small structured
/// record rather than sharing memory.
pub trait ComputeModule: VersionedModule {
    fn process_data(&self, bytes: Bytes) -> Result<ComputeResult>;
    fn memory_usage(&self) -> u64;
}

const LARGE_RESULT_ROW_COUNT: usize = 1_000;
const LARGE_RESULT_EXECUTION_MS: u64 = 1_000;

#[derive(Debug, Clone, Serialize)]
pub struct QueryMetadata {
    pub row_count: usize,
    pub execution_time_ms: u64,
    pub memory_used_bytes: Option<u64>,
    pub post_processed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub data: Vec<serde_json::Value>,
    pub metadata: QueryMetadata,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineMetrics {
    pub query_count: u64,
    pub total_execution_time_ms: u64,
    pub average_response_time_ms: f64,
    pub memory_peak_usage_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub initialized: bool,
    pub sql_engine_ready: bool,
    pub columnar_runtime_ready: bool,
    pub compute_module_ready: bool,
    pub overall_ready: bool,
    pub memory_usage_bytes: u64,
    pub uptime_ms: u64,
    pub dependency_health_score: u8,
}

const DEP_SQL_ENGINE: &str = "sql-engine";
const DEP_COLUMNAR_RUNTIME: &str = "columnar-runtime";
const DEP_CLOUD_SUBSYSTEM: &str = "cloud-subsystem";
const DEP_COMPUTE_MODULE: &str = "compute-module";

struct MetricsInner {
    query_count: AtomicU64,
    total_execution_time_ms: AtomicU64,
    memory_peak_usage_bytes: AtomicU64,
}

impl MetricsInner {
    fn new() -> Self {
        Self {
            query_count: AtomicU64::new(0),
            total_execution_time_ms: AtomicU64::new(0),
            memory_peak_usage_bytes: AtomicU64::new(0),
        }
    }

    fn record(&self, execution_time_ms: u64, memory_used_bytes: u64) {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.total_execution_time_ms.fetch_add(execution_time_ms, Ordering::Relaxed);
        self.memory_peak_usage_bytes.fetch_max(memory_used_bytes, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineMetrics {
        let query_count = self.query_count.load(Ordering::Relaxed);
        let total = self.total_execution_time_ms.load(Ordering::Relaxed);
        let average = if query_count > 0 { total as f64 / query_count as f64 } else { 0.0 };
        EngineMetrics {
            query_count,
            total_execution_time_ms: total,
            average_response_time_ms: average,
            memory_peak_usage_bytes: self.memory_peak_usage_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Cache tier plus dependency/orchestrator state, all process-wide
/// singletons for the lifetime of one `EngineFacade`.
pub struct EngineFacade {
    config: EngineConfig,
    registry: DependencyRegistry,
    sql_engine: AsyncRwLock<Option<Arc<dyn SqlEngine>>>,
    orchestrator: AsyncRwLock<Option<Arc<RemoteTableOrchestrator>>>,
    compute_module: AsyncRwLock<Option<Arc<dyn ComputeModule>>>,
    schema_cache: Arc<SchemaCache>,
    query_cache: Arc<QueryResultCache>,
    metrics: MetricsInner,
    started_at: Instant,
    initialized: std::sync::atomic::AtomicBool,
}

impl EngineFacade {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: DependencyRegistry::new(),
            sql_engine: AsyncRwLock::new(None),
            orchestrator: AsyncRwLock::new(None),
            compute_module: AsyncRwLock::new(None),
            schema_cache: Arc::new(schema_cache()),
            query_cache: Arc::new(query_result_cache()),
            metrics: MetricsInner::new(),
            started_at: Instant::now(),
            initialized: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Seeds `auth` with credentials for every configured provider whose
    /// `auth_method` is `IamRole`. Other auth methods carry their secret
    /// shape in `ProviderConfig::credentials` and are expected to be seeded
    /// by the caller directly via `AuthManager::set_credentials` before
    /// `initialize` is called.
    fn seed_iam_role_credentials(&self, auth: &AuthManager) {
        for entry in &self.config.cloud_providers {
            let (provider, provider_config) = entry;
            if provider_config.auth_method != Some(config::AuthMethod::IamRole) {
                continue;
            }
            let Some(role_arn) = &provider_config.role_arn else {
                tracing::warn!(%provider, "iam role auth configured with no role_arn, skipping");
                continue;
            };
            auth.set_credentials(*provider, Credentials::IamRole { role_arn: role_arn.clone() });
        }
    }

    fn load_opts(&self) -> LoadOptions {
        LoadOptions {
            timeout_ms: self.config.dependency_config.timeout_ms,
            max_retries: self.config.dependency_config.max_retries,
            retry_delay_ms: self.config.dependency_config.retry_delay,
            enable_progress_events: self.config.dependency_config.enable_progress_events,
        }
    }

    /// Concurrently loads the SQL engine, columnar runtime, cloud
    /// subsystem, and (if enabled) compute module. The cloud subsystem's
    /// own loader awaits SQL-engine readiness internally before resolving,
    /// so it "completes after" the SQL engine without the facade needing a
    /// bespoke barrier.
    #[instrument(skip(self, sql_engine, columnar_runtime, compute_module, auth, build_cloud))]
    pub async fn initialize<SE, CR, CM, FSE, FutSE, FCR, FutCR, FCM, FutCM>(
        &self,
        sql_engine: FSE,
        columnar_runtime: FCR,
        compute_module: Option<FCM>,
        auth: Arc<AuthManager>,
        build_cloud: impl FnOnce(Arc<RemoteTableOrchestrator>) + Send,
    ) -> Result<()>
    where
        SE: SqlEngine + VersionedModule + 'static,
        CR: ColumnarRuntime + 'static,
        CM: ComputeModule + 'static,
        FSE: Fn() -> FutSE + Send + Sync + 'static,
        FutSE: std::future::Future<Output = Result<SE>> + Send + 'static,
        FCR: Fn() -> FutCR + Send + Sync + 'static,
        FutCR: std::future::Future<Output = Result<CR>> + Send + 'static,
        FCM: Fn() -> FutCM + Send + Sync + 'static,
        FutCM: std::future::Future<Output = Result<CM>> + Send + 'static,
    {
        let opts = self.load_opts();

        let sql_fut = self.registry.load::<SE, _, _>(DEP_SQL_ENGINE, opts.clone(), sql_engine);
        let columnar_fut = self.registry.load::<CR, _, _>(DEP_COLUMNAR_RUNTIME, opts.clone(), columnar_runtime);

        let (sql_result, columnar_result) = tokio::join!(sql_fut, columnar_fut);
        if let Err(e) = &columnar_result {
            tracing::warn!(error = %e, "columnar runtime failed to load, degrading");
        }

        let sql_engine: Arc<SE> = sql_result?;
        let sql_engine_dyn: Arc<dyn SqlEngine> = sql_engine.clone();
        *self.sql_engine.write().await = Some(sql_engine_dyn.clone());

        self.seed_iam_role_credentials(&auth);
        let cloud = Arc::new(CloudFileService::new(auth, self.schema_cache.clone()));
        let orchestrator = Arc::new(RemoteTableOrchestrator::new(sql_engine_dyn, cloud).with_query_cache(self.query_cache.clone()));
        orchestrator.initialize(true).await.ok();
        build_cloud(orchestrator.clone());
        *self.orchestrator.write().await = Some(orchestrator);

        if let Some(compute_loader) = compute_module {
            if self.config.enable_compute_module {
                match self.registry.load::<CM, _, _>(DEP_COMPUTE_MODULE, opts, compute_loader).await {
                    Ok(module) => *self.compute_module.write().await = Some(module as Arc<dyn ComputeModule>),
                    Err(e) => tracing::warn!(error = %e, "compute module failed to load, degrading"),
                }
            }
        }

        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!("engine facade initialized");
        Ok(())
    }

    pub async fn wait_for_ready(&self, names: &[&str], timeout: Duration) -> Result<()> {
        for name in names {
            self.registry.wait_for(name, timeout).await?;
        }
        Ok(())
    }

    pub async fn wait_for_sql_engine(&self, timeout: Duration) -> Result<()> {
        self.registry.wait_for(DEP_SQL_ENGINE, timeout).await.map(|_| ())
    }

    pub async fn wait_for_columnar_runtime(&self, timeout: Duration) -> Result<()> {
        self.registry.wait_for(DEP_COLUMNAR_RUNTIME, timeout).await.map(|_| ())
    }

    pub async fn wait_for_compute_module(&self, timeout: Duration) -> Result<()> {
        self.registry.wait_for(DEP_COMPUTE_MODULE, timeout).await.map(|_| ())
    }

    async fn try_orchestrator(&self) -> Result<Arc<RemoteTableOrchestrator>> {
        self.orchestrator
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::query_failed("engine facade has not been initialized"))
    }

    /// Routes `sql` through the SQL engine; on a large result, post-process
    /// via the compute module if one is loaded, merging its timing and
    /// memory figures into the outcome's metadata. Post-processing
    /// failure falls back to the unprocessed result rather than failing
    /// the whole query.
    #[instrument(skip(self, sql), fields(table = %table))]
    pub async fn query(&self, table: &str, sql: Option<&str>) -> Result<QueryOutcome> {
        let orchestrator = self.try_orchestrator().await?;
        let start = Instant::now();
        let rows = orchestrator.query_cloud_table(table, sql).await?;
        let execution_time_ms = start.elapsed().as_millis() as u64;
        let row_count = rows.len();

        let is_large = row_count > LARGE_RESULT_ROW_COUNT || execution_time_ms > LARGE_RESULT_EXECUTION_MS;
        let mut metadata = QueryMetadata { row_count, execution_time_ms, memory_used_bytes: None, post_processed: false };
        let mut data = rows;

        if is_large {
            if let Some(module) = self.compute_module.read().await.clone() {
                let payload = serde_json::to_vec(&data)?;
                match module.process_data(Bytes::from(payload)) {
                    Ok(processed) => {
                        if let Ok(parsed) = serde_json::from_str::<Vec<serde_json::Value>>(&processed.data) {
                            data = parsed;
                        }
                        metadata.row_count = processed.row_count;
                        metadata.execution_time_ms = processed.execution_time_ms;
                        metadata.memory_used_bytes = Some(processed.memory_used_bytes);
                        metadata.post_processed = true;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "compute module post-processing failed, returning raw result");
                    }
                }
            }
        }

        self.metrics.record(metadata.execution_time_ms, metadata.memory_used_bytes.unwrap_or(0));
        Ok(QueryOutcome { data, metadata })
    }

    pub async fn load_data(&self, table_name: &str, rows: &[serde_json::Value]) -> Result<()> {
        let orchestrator = self.try_orchestrator().await?;
        let virtual_name = format!("{table_name}.json");
        orchestrator.register_in_memory_json(table_name, &virtual_name, rows).await
    }

    pub async fn create_table(&self, name: &str, url: &str, options: RegisterTableOptions) -> Result<()> {
        let orchestrator = self.try_orchestrator().await?;
        orchestrator.register_cloud_table(name, url, options).await
    }

    pub async fn list_tables(&self) -> Result<Vec<String>> {
        let orchestrator = self.try_orchestrator().await?;
        Ok(orchestrator.list_tables())
    }

    pub async fn get_table_info(&self, name: &str) -> Result<bool> {
        let orchestrator = self.try_orchestrator().await?;
        Ok(orchestrator.has(name))
    }

    pub fn metrics(&self) -> EngineMetrics {
        self.metrics.snapshot()
    }

    pub async fn status(&self) -> EngineStatus {
        let health = self.registry.health();
        let sql_ready = self.registry.is_ready(DEP_SQL_ENGINE).await;
        let columnar_ready = self.registry.is_ready(DEP_COLUMNAR_RUNTIME).await;
        let compute_ready = self.registry.is_ready(DEP_COMPUTE_MODULE).await;
        EngineStatus {
            initialized: self.initialized.load(Ordering::SeqCst),
            sql_engine_ready: sql_ready,
            columnar_runtime_ready: columnar_ready,
            compute_module_ready: compute_ready,
            overall_ready: sql_ready,
            memory_usage_bytes: self.metrics.snapshot().memory_peak_usage_bytes,
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            dependency_health_score: health.health_score,
        }
    }

    /// Terminates the SQL engine, clears every cache and the dependency
    /// registry, and drops the orchestrator and compute module handles.
    pub async fn close(&self) -> Result<()> {
        if let Some(sql_engine) = self.sql_engine.write().await.take() {
            sql_engine.terminate().await?;
        }
        if let Some(orchestrator) = self.orchestrator.write().await.take() {
            for name in orchestrator.list_tables() {
                orchestrator.unregister_cloud_table(&name).await.ok();
            }
        }
        self.compute_module.write().await.take();
        self.schema_cache.clear().await;
        self.query_cache.clear().await;
        self.registry.clear();
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cqe_core::FormatTag;
    use cqe_orchestrator::SqlConnection;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::RwLock as TokioRwLock;

    struct FakeEngineState {
        tables: TokioRwLock<Vec<String>>,
        rows: StdMutex<Vec<serde_json::Value>>,
        terminated: std::sync::atomic::AtomicBool,
    }

    #[derive(Clone)]
    struct FakeEngine(Arc<FakeEngineState>);
    impl VersionedModule for FakeEngine {}

    impl FakeEngine {
        fn new(rows: Vec<serde_json::Value>) -> Self {
            Self(Arc::new(FakeEngineState {
                tables: TokioRwLock::new(vec![]),
                rows: StdMutex::new(rows),
                terminated: std::sync::atomic::AtomicBool::new(false),
            }))
        }
    }

    struct FakeConn {
        engine: FakeEngine,
    }

    #[async_trait]
    impl SqlConnection for FakeConn {
        async fn query(&mut self, _sql: &str) -> Result<Vec<serde_json::Value>> {
            Ok(self.engine.0.rows.lock().unwrap().clone())
        }

        async fn execute(&mut self, sql: &str) -> Result<()> {
            if let Some(rest) = sql.strip_prefix("CREATE TABLE ") {
                let name = rest.split_whitespace().next().unwrap_or_default().to_string();
                self.engine.0.tables.write().await.push(name);
            }
            Ok(())
        }

        async fn close(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl SqlEngine for FakeEngine {
        async fn connect(&self) -> Result<Box<dyn SqlConnection>> {
            Ok(Box::new(FakeConn { engine: self.clone() }))
        }
        fn register_file_buffer(&self, _virtual_name: &str, _bytes: Bytes) -> Result<()> {
            Ok(())
        }
        fn register_file_text(&self, _virtual_name: &str, _text: String) -> Result<()> {
            Ok(())
        }
        fn list_tables(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn terminate(&self) -> Result<()> {
            self.0.terminated.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeColumnar;
    impl VersionedModule for FakeColumnar {}
    impl ColumnarRuntime for FakeColumnar {}

    #[derive(Clone)]
    struct FakeCompute;
    impl VersionedModule for FakeCompute {}
    impl ComputeModule for FakeCompute {
        fn process_data(&self, bytes: Bytes) -> Result<ComputeResult> {
            let rows: Vec<serde_json::Value> = serde_json::from_slice(&bytes)?;
            Ok(ComputeResult {
                data: serde_json::to_string(&rows)?,
                row_count: rows.len(),
                execution_time_ms: 5,
                memory_used_bytes: 1024,
            })
        }
        fn memory_usage(&self) -> u64 {
            1024
        }
    }

    fn auth() -> Arc<AuthManager> {
        Arc::new(AuthManager::new(Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn status_before_initialize_is_not_ready() {
        let facade = EngineFacade::new(EngineConfig::default());
        let status = facade.status().await;
        assert!(!status.initialized);
        assert!(!status.overall_ready);
    }

    #[tokio::test]
    async fn initialize_then_register_then_query_then_close() {
        let facade = EngineFacade::new(EngineConfig::default());
        let engine = FakeEngine::new(vec![serde_json::json!({"a": 1})]);
        let engine_for_loader = engine.clone();
        facade
            .initialize(
                move || {
                    let engine = engine_for_loader.clone();
                    async move { Ok(engine) }
                },
                || async { Ok(FakeColumnar) },
                Some(|| async { Ok(FakeCompute) }),
                auth(),
                |_orchestrator| {},
            )
            .await
            .unwrap();

        let status = facade.status().await;
        assert!(status.initialized);
        assert!(status.sql_engine_ready);

        facade
            .create_table("t", "https://x/data.csv", RegisterTableOptions { cors_handling: cqe_core::CorsHandling::Direct, ..Default::default() })
            .await
            .unwrap();
        assert!(facade.get_table_info("t").await.unwrap());

        let outcome = facade.query("t", None).await.unwrap();
        assert_eq!(outcome.data, vec![serde_json::json!({"a": 1})]);
        assert_eq!(facade.metrics().query_count, 1);

        facade.close().await.unwrap();
        let status = facade.status().await;
        assert!(!status.initialized);
        assert!(engine.0.terminated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn initialize_seeds_iam_role_credentials_from_cloud_providers() {
        let mut config = EngineConfig::default();
        config.cloud_providers.insert(
            cqe_core::ProviderTag::S3,
            config::ProviderConfig {
                auth_method: Some(config::AuthMethod::IamRole),
                role_arn: Some("arn:aws:iam::123:role/reader".into()),
                ..Default::default()
            },
        );
        let facade = EngineFacade::new(config);
        let engine = FakeEngine::new(vec![]);
        let auth_manager = auth();
        let auth_for_headers = auth_manager.clone();
        facade
            .initialize(
                move || {
                    let engine = engine.clone();
                    async move { Ok(engine) }
                },
                || async { Ok(FakeColumnar) },
                None::<fn() -> std::future::Ready<Result<FakeCompute>>>,
                auth_manager,
                |_orchestrator| {},
            )
            .await
            .unwrap();

        let headers = auth_for_headers.auth_headers(cqe_core::ProviderTag::S3).await.unwrap();
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer arn:aws:iam::123:role/reader");
    }

    #[test]
    fn format_read_function_table_is_exhaustive_for_facade_paths() {
        for f in [FormatTag::Csv, FormatTag::Json, FormatTag::Jsonl, FormatTag::Columnar, FormatTag::Arrow] {
            assert!(!f.read_function().is_empty());
        }
    }
}
