//! Dependency lifecycle events.
//!
//! Events are the observable surface of the dependency registry: every
//! state transition emits exactly one event, in order, never duplicated for
//! the same transition.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DependencyEvent {
    Loading { name: String },
    Ready { name: String, version: Option<String> },
    Error { name: String, message: String, retry_count: u32 },
    Timeout { name: String, timeout_ms: u64 },
    Retry { name: String, attempt: u32, delay_ms: u64 },
    /// Coarse progress percentage for long-running loads (0-100), emitted
    /// only when `enable_progress_events` is configured.
    Progress { name: String, percent: u8 },
}

impl DependencyEvent {
    pub fn dependency_name(&self) -> &str {
        match self {
            DependencyEvent::Loading { name }
            | DependencyEvent::Ready { name, .. }
            | DependencyEvent::Error { name, .. }
            | DependencyEvent::Timeout { name, .. }
            | DependencyEvent::Retry { name, .. }
            | DependencyEvent::Progress { name, .. } => name,
        }
    }
}

/// Subscribable dependency identifiers with named projections, so
/// callers can listen for one dependency's readiness rather than filtering
/// the full event stream by string comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WellKnownDependency {
    SqlEngine,
    ColumnarRuntime,
    ComputeModule,
}

impl WellKnownDependency {
    pub fn name(&self) -> &'static str {
        match self {
            WellKnownDependency::SqlEngine => "sql-engine",
            WellKnownDependency::ColumnarRuntime => "columnar-runtime",
            WellKnownDependency::ComputeModule => "compute-module",
        }
    }
}

impl std::fmt::Display for WellKnownDependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
