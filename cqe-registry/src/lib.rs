//! Dependency lifecycle registry: deterministic, retry-aware loading
//! of heavy async dependencies with readiness gates.
//!
//! State machine: `initializing -> loading -> {ready | error | timeout}`,
//! with `loading -> loading` on retry. `ready` is terminal.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cqe_core::events::DependencyEvent;
use cqe_core::{Error, Result};
use dashmap::DashMap;
use futures::future::{FutureExt, Shared};
use tokio::sync::{broadcast, RwLock};

/// A loaded module's version, probed the way the source probes a JS
/// object's `version`/`VERSION`/`get_version()` — here expressed as a
/// trait each loadable module implements.
pub trait VersionedModule: Send + Sync {
    fn module_version(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyState {
    Initializing,
    Loading,
    Ready,
    Error,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub enable_progress_events: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            enable_progress_events: false,
        }
    }
}

/// Point-in-time snapshot of a dependency record, safe to hand to callers
/// without holding the internal lock.
#[derive(Debug, Clone)]
pub struct DependencyRecord {
    pub name: String,
    pub state: DependencyState,
    pub start: Instant,
    pub end: Option<Instant>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub last_error: Option<String>,
    pub version: Option<String>,
    pub has_module: bool,
}

#[derive(Debug)]
struct RecordInner {
    state: DependencyState,
    start: Instant,
    end: Option<Instant>,
    retry_count: u32,
    opts: LoadOptions,
    last_error: Option<String>,
    version: Option<String>,
    module: Option<Arc<dyn Any + Send + Sync>>,
}

impl RecordInner {
    fn new(opts: LoadOptions) -> Self {
        Self {
            state: DependencyState::Initializing,
            start: Instant::now(),
            end: None,
            retry_count: 0,
            opts,
            last_error: None,
            version: None,
            module: None,
        }
    }

    fn snapshot(&self, name: &str) -> DependencyRecord {
        DependencyRecord {
            name: name.to_string(),
            state: self.state,
            start: self.start,
            end: self.end,
            retry_count: self.retry_count,
            max_retries: self.opts.max_retries,
            timeout_ms: self.opts.timeout_ms,
            last_error: self.last_error.clone(),
            version: self.version.clone(),
            has_module: self.module.is_some(),
        }
    }
}

type ModuleRef = Arc<dyn Any + Send + Sync>;
type SharedLoad = Shared<Pin<Box<dyn Future<Output = std::result::Result<ModuleRef, String>> + Send>>>;

#[derive(Debug, Clone, Copy)]
pub struct RegistryHealth {
    pub total: usize,
    pub ready: usize,
    pub loading: usize,
    pub error: usize,
    pub timeout: usize,
    pub health_score: u8,
}

/// Process-wide registry of named async dependencies. Cheaply `Clone`
/// (internally `Arc`-backed) so every holder shares one underlying state.
#[derive(Clone)]
pub struct DependencyRegistry {
    records: Arc<DashMap<String, Arc<RwLock<RecordInner>>>>,
    in_flight: Arc<DashMap<String, SharedLoad>>,
    events_tx: broadcast::Sender<DependencyEvent>,
}

impl Default for DependencyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyRegistry {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            records: Arc::new(DashMap::new()),
            in_flight: Arc::new(DashMap::new()),
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DependencyEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: DependencyEvent) {
        // A lagging/absent subscriber is not an error: events are best-effort
        // observability, the registry itself is the source of truth.
        let _ = self.events_tx.send(event);
    }

    /// Idempotent: returns the existing record if already registered.
    pub async fn register(&self, name: &str, opts: LoadOptions) -> DependencyRecord {
        let entry = self
            .records
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(RecordInner::new(opts))))
            .clone();
        entry.read().await.snapshot(name)
    }

    pub async fn state(&self, name: &str) -> Option<DependencyState> {
        let entry = self.records.get(name)?.clone();
        Some(entry.read().await.state)
    }

    pub async fn is_ready(&self, name: &str) -> bool {
        matches!(self.state(name).await, Some(DependencyState::Ready))
    }

    pub async fn record(&self, name: &str) -> Option<DependencyRecord> {
        let entry = self.records.get(name)?.clone();
        Some(entry.read().await.snapshot(name))
    }

    pub fn health(&self) -> RegistryHealth {
        let mut h = RegistryHealth { total: 0, ready: 0, loading: 0, error: 0, timeout: 0, health_score: 100 };
        for entry in self.records.iter() {
            h.total += 1;
            // Synchronous snapshot via try_read: health() is advertised as
            // synchronous in the contract, so we accept a momentarily stale
            // read on a record that is mid-transition rather than block.
            let state = entry
                .value()
                .try_read()
                .map(|r| r.state)
                .unwrap_or(DependencyState::Loading);
            match state {
                DependencyState::Ready => h.ready += 1,
                DependencyState::Loading | DependencyState::Initializing => h.loading += 1,
                DependencyState::Error => h.error += 1,
                DependencyState::Timeout => h.timeout += 1,
            }
        }
        if h.total > 0 {
            h.health_score = ((h.ready * 100) / h.total) as u8;
        }
        h
    }

    /// At-most-one concurrent load per name: a call made while a load is
    /// in flight awaits that same load rather than starting a second one.
    pub async fn load<T, F, Fut>(&self, name: &str, opts: LoadOptions, loader: F) -> Result<Arc<T>>
    where
        T: VersionedModule + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.register(name, opts.clone()).await;

        if let Some(shared) = self.in_flight.get(name).map(|e| e.clone()) {
            let module = self.await_shared(name, shared).await?;
            return Self::downcast(name, module);
        }

        let record = self.records.get(name).unwrap().clone();
        let registry = self.clone();
        let name_owned = name.to_string();

        let fut: Pin<Box<dyn Future<Output = std::result::Result<ModuleRef, String>> + Send>> =
            Box::pin(async move { registry.run_load(name_owned, record, loader).await });
        let shared = fut.shared();
        self.in_flight.insert(name.to_string(), shared.clone());

        let result = self.await_shared(name, shared).await;
        self.in_flight.remove(name);
        Self::downcast(name, result?)
    }

    fn downcast<T: VersionedModule + 'static>(name: &str, module: ModuleRef) -> Result<Arc<T>> {
        module
            .downcast::<T>()
            .map_err(|_| Error::dependency_load_error(name, "loaded module type mismatch"))
    }

    async fn await_shared(&self, name: &str, shared: SharedLoad) -> Result<Arc<dyn Any + Send + Sync>> {
        shared.await.map_err(|message| Error::dependency_load_error(name, message))
    }

    async fn run_load<T, F, Fut>(
        &self,
        name: String,
        record: Arc<RwLock<RecordInner>>,
        loader: F,
    ) -> std::result::Result<ModuleRef, String>
    where
        T: VersionedModule + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        {
            let mut r = record.write().await;
            r.state = DependencyState::Loading;
            r.start = Instant::now();
        }
        self.emit(DependencyEvent::Loading { name: name.clone() });

        let (timeout_ms, max_retries, retry_delay_ms, report_progress) = {
            let r = record.read().await;
            (r.opts.timeout_ms, r.opts.max_retries, r.opts.retry_delay_ms, r.opts.enable_progress_events)
        };

        if report_progress {
            self.emit(DependencyEvent::Progress { name: name.clone(), percent: 0 });
        }

        loop {
            let attempt_result =
                tokio::time::timeout(Duration::from_millis(timeout_ms), loader()).await;

            match attempt_result {
                Err(_elapsed) => {
                    let mut r = record.write().await;
                    r.state = DependencyState::Timeout;
                    r.end = Some(Instant::now());
                    r.last_error = Some(format!("timed out after {timeout_ms}ms"));
                    drop(r);
                    self.emit(DependencyEvent::Timeout { name: name.clone(), timeout_ms });
                    return Err(format!("dependency '{name}' timed out"));
                }
                Ok(Err(err)) => {
                    let retryable = err.is_retryable();
                    let mut r = record.write().await;
                    if retryable && r.retry_count < max_retries {
                        r.retry_count += 1;
                        let attempt = r.retry_count;
                        let delay_ms = (retry_delay_ms.saturating_mul(attempt as u64)).min(10_000);
                        r.last_error = Some(err.to_string());
                        drop(r);
                        self.emit(DependencyEvent::Retry { name: name.clone(), attempt, delay_ms });
                        if report_progress {
                            let percent = ((attempt as u64 * 100) / (max_retries as u64 + 1)).min(99) as u8;
                            self.emit(DependencyEvent::Progress { name: name.clone(), percent });
                        }
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        continue;
                    } else {
                        r.state = DependencyState::Error;
                        r.end = Some(Instant::now());
                        r.last_error = Some(err.to_string());
                        let retry_count = r.retry_count;
                        drop(r);
                        self.emit(DependencyEvent::Error {
                            name: name.clone(),
                            message: err.to_string(),
                            retry_count,
                        });
                        return Err(err.to_string());
                    }
                }
                Ok(Ok(module)) => {
                    let version = module.module_version();
                    let mut r = record.write().await;
                    r.state = DependencyState::Ready;
                    r.end = Some(Instant::now());
                    r.version = version.clone();
                    r.module = Some(Arc::new(module) as ModuleRef);
                    drop(r);
                    if report_progress {
                        self.emit(DependencyEvent::Progress { name: name.clone(), percent: 100 });
                    }
                    self.emit(DependencyEvent::Ready { name: name.clone(), version });
                    let record = record.read().await;
                    return Ok(record.module.clone().expect("just set"));
                }
            }
        }
    }

    /// Awaits readiness, failing with a timeout error if not ready in time.
    /// Also surfaces a terminal `error` state immediately rather than
    /// waiting out the full deadline.
    pub async fn wait_for(&self, name: &str, timeout: Duration) -> Result<Arc<dyn Any + Send + Sync>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(entry) = self.records.get(name) {
                let r = entry.read().await;
                match r.state {
                    DependencyState::Ready => {
                        return Ok(r.module.clone().expect("ready implies module"));
                    }
                    DependencyState::Error | DependencyState::Timeout => {
                        return Err(Error::dependency_load_error(
                            name,
                            r.last_error.clone().unwrap_or_else(|| "dependency failed".into()),
                        ));
                    }
                    _ => {}
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::dependency_timeout(name));
            }
            tokio::time::sleep(Duration::from_millis(5).min(timeout / 4 + Duration::from_millis(1))).await;
        }
    }

    /// Awaits the named set (or every registered dependency) in parallel,
    /// all-settled: every wait runs to completion regardless of others
    /// failing.
    pub async fn wait_for_all(
        &self,
        names: Option<Vec<String>>,
        timeout: Duration,
    ) -> Vec<(String, Result<()>)> {
        let names = names.unwrap_or_else(|| self.records.iter().map(|e| e.key().clone()).collect());
        let futures = names.into_iter().map(|name| {
            let registry = self.clone();
            async move {
                let result = registry.wait_for(&name, timeout).await.map(|_| ());
                (name, result)
            }
        });
        futures::future::join_all(futures).await
    }

    /// Global teardown: clears all records and drops any module references.
    pub fn clear(&self) {
        self.records.clear();
        self.in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Dummy(&'static str);
    impl VersionedModule for Dummy {
        fn module_version(&self) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn successful_load_is_ready_with_version() {
        let registry = DependencyRegistry::new();
        let result = registry
            .load("sql-engine", LoadOptions::default(), || async { Ok(Dummy("1.2.3")) })
            .await
            .unwrap();
        assert_eq!(result.downcast_ref::<Dummy>().unwrap().0, "1.2.3");
        assert!(registry.is_ready("sql-engine").await);
        let record = registry.record("sql-engine").await.unwrap();
        assert_eq!(record.version.as_deref(), Some("1.2.3"));
    }

    #[tokio::test]
    async fn timeout_transitions_to_timeout_state() {
        let registry = DependencyRegistry::new();
        let opts = LoadOptions { timeout_ms: 20, max_retries: 0, retry_delay_ms: 1, enable_progress_events: false };
        let result = registry
            .load::<Dummy, _, _>("slow", opts, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Dummy("x"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(registry.state("slow").await, Some(DependencyState::Timeout));
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let registry = DependencyRegistry::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();
        let opts = LoadOptions { timeout_ms: 1_000, max_retries: 3, retry_delay_ms: 5, enable_progress_events: false };
        let start = Instant::now();
        let result = registry
            .load("bar", opts, move || {
                let attempts = attempts2.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(Error::network("connection timeout"))
                    } else {
                        Ok(Dummy("ok"))
                    }
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert_eq!(registry.state("bar").await, Some(DependencyState::Ready));
    }

    #[tokio::test]
    async fn progress_events_emitted_only_when_enabled() {
        let registry = DependencyRegistry::new();
        let mut rx = registry.subscribe();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();
        let opts = LoadOptions { timeout_ms: 1_000, max_retries: 2, retry_delay_ms: 1, enable_progress_events: true };
        registry
            .load("progressive", opts, move || {
                let attempts = attempts2.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n < 1 {
                        Err(Error::network("connection timeout"))
                    } else {
                        Ok(Dummy("ok"))
                    }
                }
            })
            .await
            .unwrap();

        let mut percents = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let DependencyEvent::Progress { percent, .. } = event {
                percents.push(percent);
            }
        }
        assert_eq!(percents, vec![0, 33, 100]);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        let registry = DependencyRegistry::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();
        let opts = LoadOptions { timeout_ms: 1_000, max_retries: 5, retry_delay_ms: 1, enable_progress_events: false };
        let result = registry
            .load("cors-dep", opts, move || {
                let attempts = attempts2.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<Dummy, _>(Error::cors("blocked"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(registry.state("cors-dep").await, Some(DependencyState::Error));
    }

    #[tokio::test]
    async fn wait_for_times_out_promptly() {
        let registry = DependencyRegistry::new();
        registry.register("never", LoadOptions::default()).await;
        let start = Instant::now();
        let result = registry.wait_for("never", Duration::from_millis(10)).await;
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn health_reports_ready_count() {
        let registry = DependencyRegistry::new();
        registry
            .load("a", LoadOptions::default(), || async { Ok(Dummy("a")) })
            .await
            .unwrap();
        registry.register("b", LoadOptions::default()).await;
        let health = registry.health();
        assert_eq!(health.total, 2);
        assert_eq!(health.ready, 1);
        assert_eq!(health.loading, 1);
    }
}
