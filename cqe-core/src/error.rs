//! Typed error taxonomy shared by every subsystem.
//!
//! Plain [`ErrorKind`] variants carry the causal message; [`Error`] wraps a
//! kind with the troubleshooting metadata the facade surfaces to callers
//! (dependency name, provider, retry count, remediation bullets).

use std::fmt;

use thiserror::Error as ThisError;

/// Which subsystem originated an error. The SQL engine and compute module
/// are opaque external collaborators; everything else is "orchestration".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorSource {
    Orchestration,
    SqlEngine,
    ComputeModule,
}

/// Ambient facts attached to an error for user-facing diagnostics.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ErrorContext {
    pub network_online: Option<bool>,
    pub user_agent: Option<String>,
    pub load_time_ms: Option<u64>,
    pub shared_memory_supported: Option<bool>,
}

/// The plain, causal error. Stable per the `#[error(...)]` message; `code()`
/// gives the machine-readable identifier derived from the variant.
#[derive(ThisError, Debug)]
pub enum ErrorKind {
    #[error("dependency '{dependency}' timed out")]
    DependencyTimeout { dependency: String },

    #[error("dependency '{dependency}' failed to load: {message}")]
    DependencyLoadError { dependency: String, message: String },

    #[error("CORS error: {message}")]
    Cors { message: String },

    #[error("proxy request failed: {message}")]
    ProxyFailed { message: String },

    #[error("network error: {message}")]
    Network { message: String },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("unsupported format: {format}")]
    UnsupportedFormat { format: String },

    #[error("unsupported auth method: {method}")]
    UnsupportedAuthMethod { method: String },

    #[error("no OAuth2 token available for provider '{provider}'")]
    NoOauth2Token { provider: String },

    #[error("OAuth2 token refresh failed for provider '{provider}': {message}")]
    TokenRefreshFailed { provider: String, message: String },

    #[error("schema error: {message}")]
    Schema { message: String },

    #[error("batch operation failed: {message}")]
    BatchFailed { message: String },

    #[error("failed to register table '{table}': {message}")]
    TableRegistrationFailed { table: String, message: String },

    #[error("query failed: {message}")]
    QueryFailed { message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ErrorKind {
    /// The stable machine-readable code, with the per-dependency prefix
    /// applied where the taxonomy calls for one (`COLUMNAR_LOAD_ERROR`,
    /// `SQL_ENGINE_TIMEOUT`, ...).
    pub fn code(&self) -> String {
        fn prefix(name: &str) -> String {
            name.to_uppercase().replace(['-', ' '], "_")
        }
        match self {
            ErrorKind::DependencyTimeout { dependency } => {
                format!("{}_TIMEOUT", prefix(dependency))
            }
            ErrorKind::DependencyLoadError { dependency, .. } => {
                format!("{}_LOAD_ERROR", prefix(dependency))
            }
            ErrorKind::Cors { .. } => "CORS_ERROR".into(),
            ErrorKind::ProxyFailed { .. } => "PROXY_FAILED".into(),
            ErrorKind::Network { .. } => "NETWORK_ERROR".into(),
            ErrorKind::Http { status, .. } => format!("HTTP_{status}"),
            ErrorKind::UnsupportedFormat { .. } => "UNSUPPORTED_FORMAT".into(),
            ErrorKind::UnsupportedAuthMethod { .. } => "UNSUPPORTED_AUTH_METHOD".into(),
            ErrorKind::NoOauth2Token { .. } => "NO_OAUTH2_TOKEN".into(),
            ErrorKind::TokenRefreshFailed { .. } => "TOKEN_REFRESH_FAILED".into(),
            ErrorKind::Schema { .. } => "SCHEMA_ERROR".into(),
            ErrorKind::BatchFailed { .. } => "BATCH_FAILED".into(),
            ErrorKind::TableRegistrationFailed { .. } => "TABLE_REGISTRATION_FAILED".into(),
            ErrorKind::QueryFailed { .. } => "QUERY_FAILED".into(),
            ErrorKind::Serialization(_) => "SERIALIZATION_ERROR".into(),
            ErrorKind::Io(_) => "IO_ERROR".into(),
        }
    }

    /// Whether the HTTP/retry layers should retry an error of this shape.
    /// CORS failures, 404s, and missing-capability errors are terminal;
    /// everything else that looks like a transient network hiccup retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorKind::Cors { .. } => false,
            ErrorKind::Http { status, .. } => *status != 404 && *status >= 500,
            ErrorKind::UnsupportedFormat { .. }
            | ErrorKind::UnsupportedAuthMethod { .. }
            | ErrorKind::NoOauth2Token { .. } => false,
            ErrorKind::Network { message } | ErrorKind::ProxyFailed { message } => {
                let m = message.to_ascii_lowercase();
                ["network", "timeout", "connection", "temporary", "service-unavailable", "too-many-requests"]
                    .iter()
                    .any(|token| m.contains(token))
            }
            _ => false,
        }
    }

    fn default_troubleshooting(&self) -> Vec<String> {
        match self {
            ErrorKind::DependencyTimeout { dependency } => vec![
                format!("The dependency '{dependency}' timed out while loading."),
                "Check your network connection.".into(),
                "Try refreshing the page or increasing the configured timeout.".into(),
            ],
            ErrorKind::DependencyLoadError { dependency, .. } => vec![
                format!("The dependency '{dependency}' could not be loaded."),
                "Verify the CDN or bundled asset is reachable.".into(),
                "Check the browser console for WebAssembly support issues.".into(),
            ],
            ErrorKind::Cors { .. } => vec![
                "The remote host does not allow direct cross-origin access.".into(),
                "Configure a proxy endpoint, or set corsHandling to 'proxy'.".into(),
            ],
            ErrorKind::ProxyFailed { .. } => vec![
                "All configured proxy endpoints failed or are unhealthy.".into(),
                "Check proxy endpoint health and credentials.".into(),
            ],
            ErrorKind::Network { .. } => vec![
                "Check your network connection and try again.".into(),
            ],
            ErrorKind::Http { status, .. } => vec![
                format!("The remote server responded with HTTP {status}."),
                "Verify the URL and any required credentials.".into(),
            ],
            ErrorKind::UnsupportedFormat { format } => vec![
                format!("'{format}' is not a format this engine can read."),
                "Supported formats: parquet, csv, json, jsonl, arrow.".into(),
            ],
            ErrorKind::NoOauth2Token { provider } => vec![
                format!("No valid OAuth2 token for provider '{provider}'."),
                "Call setCredentials with a refresh token for this provider.".into(),
            ],
            ErrorKind::TokenRefreshFailed { .. } => vec![
                "The OAuth2 token endpoint rejected the refresh request.".into(),
                "Verify the refresh token has not been revoked.".into(),
            ],
            ErrorKind::QueryFailed { .. } => vec![
                "The query failed after exhausting the configured fallback chain.".into(),
            ],
            _ => vec![],
        }
    }
}

/// The error type returned across this crate family: a [`ErrorKind`] plus
/// the metadata the facade needs to classify and explain it.
#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub source_component: ErrorSource,
    pub dependency: Option<String>,
    pub provider: Option<String>,
    pub retry_count: u32,
    pub troubleshooting: Vec<String>,
    pub context: ErrorContext,
}

impl Error {
    pub fn new(kind: ErrorKind, source_component: ErrorSource) -> Self {
        let troubleshooting = kind.default_troubleshooting();
        Self {
            kind,
            source_component,
            dependency: None,
            provider: None,
            retry_count: 0,
            troubleshooting,
            context: ErrorContext::default(),
        }
    }

    pub fn orchestration(kind: ErrorKind) -> Self {
        Self::new(kind, ErrorSource::Orchestration)
    }

    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependency = Some(name.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    pub fn code(&self) -> String {
        self.kind.code()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    // Convenience constructors, one per `ErrorKind` variant.
    pub fn dependency_timeout(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::orchestration(ErrorKind::DependencyTimeout { dependency: name.clone() })
            .with_dependency(name)
    }

    pub fn dependency_load_error(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        Self::orchestration(ErrorKind::DependencyLoadError {
            dependency: name.clone(),
            message: message.into(),
        })
        .with_dependency(name)
    }

    pub fn cors(message: impl Into<String>) -> Self {
        Self::orchestration(ErrorKind::Cors { message: message.into() })
    }

    pub fn proxy_failed(message: impl Into<String>) -> Self {
        Self::orchestration(ErrorKind::ProxyFailed { message: message.into() })
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::orchestration(ErrorKind::Network { message: message.into() })
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::orchestration(ErrorKind::Http { status, message: message.into() })
    }

    pub fn unsupported_format(format: impl Into<String>) -> Self {
        Self::orchestration(ErrorKind::UnsupportedFormat { format: format.into() })
    }

    pub fn unsupported_auth_method(method: impl Into<String>) -> Self {
        Self::orchestration(ErrorKind::UnsupportedAuthMethod { method: method.into() })
    }

    pub fn no_oauth2_token(provider: impl Into<String>) -> Self {
        let provider = provider.into();
        Self::orchestration(ErrorKind::NoOauth2Token { provider: provider.clone() })
            .with_provider(provider)
    }

    pub fn token_refresh_failed(provider: impl Into<String>, message: impl Into<String>) -> Self {
        let provider = provider.into();
        Self::orchestration(ErrorKind::TokenRefreshFailed {
            provider: provider.clone(),
            message: message.into(),
        })
        .with_provider(provider)
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::orchestration(ErrorKind::Schema { message: message.into() })
    }

    pub fn batch_failed(message: impl Into<String>) -> Self {
        Self::orchestration(ErrorKind::BatchFailed { message: message.into() })
    }

    pub fn table_registration_failed(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::orchestration(ErrorKind::TableRegistrationFailed {
            table: table.into(),
            message: message.into(),
        })
    }

    pub fn query_failed(message: impl Into<String>) -> Self {
        Self::orchestration(ErrorKind::QueryFailed { message: message.into() })
    }

    /// Short causal message plus bulleted remediation, as surfaced to the UI.
    pub fn user_message(&self) -> String {
        let mut out = format!("{} ({})", self.kind, self.code());
        for bullet in &self.troubleshooting {
            out.push_str("\n  - ");
            out.push_str(bullet);
        }
        out
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::orchestration(ErrorKind::Serialization(e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::orchestration(ErrorKind::Io(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_code_has_dependency_prefix() {
        let err = Error::dependency_timeout("sql-engine");
        assert_eq!(err.code(), "SQL_ENGINE_TIMEOUT");
    }

    #[test]
    fn cors_errors_are_not_retryable() {
        assert!(!Error::cors("blocked").is_retryable());
    }

    #[test]
    fn network_timeout_message_is_retryable() {
        assert!(Error::network("connection timeout").is_retryable());
    }

    #[test]
    fn not_found_is_not_retryable() {
        assert!(!Error::http(404, "missing").is_retryable());
    }

    #[test]
    fn server_error_is_retryable() {
        assert!(Error::http(503, "unavailable").is_retryable());
    }

    #[test]
    fn user_message_includes_troubleshooting() {
        let msg = Error::dependency_timeout("columnar-runtime").user_message();
        assert!(msg.contains("columnar-runtime"));
        assert!(msg.contains("Check your network"));
    }
}
