//! Layered engine configuration: defaults, an optional config
//! file, and `ENGINE_`-prefixed environment overrides, assembled into a
//! validated config before the engine facade is constructed.

use std::collections::HashMap;
use std::path::Path;

use cqe_core::ProviderTag;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// The `tracing_subscriber::EnvFilter` directive this level maps to,
    /// for callers that want to set verbosity programmatically instead of
    /// via `RUST_LOG`.
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay: u64,
    pub preload: Vec<String>,
    pub enable_progress_events: bool,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000, max_retries: 3, retry_delay: 1_000, preload: Vec::new(), enable_progress_events: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorsStrategy {
    Auto,
    Direct,
    Proxy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub strategy: CorsStrategy,
    pub proxy_endpoint: Option<String>,
    pub cache_timeout: u64,
    pub retry_attempts: u32,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self { strategy: CorsStrategy::Auto, proxy_endpoint: None, cache_timeout: 1_800_000, retry_attempts: 3 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    IamRole,
    ApiKey,
    OAuth2,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub auth_method: Option<AuthMethod>,
    pub region: Option<String>,
    pub account_id: Option<String>,
    pub role_arn: Option<String>,
    pub credentials: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EngineConfig {
    pub enable_compute_module: bool,
    #[validate(range(min = 1))]
    pub max_memory_mb: u64,
    #[validate(range(min = 1))]
    pub query_timeout_ms: u64,
    pub log_level: LogLevel,
    pub dependency_config: DependencyConfig,
    pub cors_config: CorsConfig,
    pub cloud_providers: HashMap<ProviderTag, ProviderConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_compute_module: true,
            max_memory_mb: 4_096,
            query_timeout_ms: 30_000,
            log_level: LogLevel::Info,
            dependency_config: DependencyConfig::default(),
            cors_config: CorsConfig::default(),
            cloud_providers: HashMap::new(),
        }
    }
}

#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error("invalid engine configuration: {0}")]
    Invalid(String),
    #[error("failed to load layered configuration: {0}")]
    Layering(#[from] config::ConfigError),
}

impl EngineConfig {
    /// Shape-only, synchronous validation: rejects configurations
    /// that can never make progress, without touching the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Validate::validate(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.dependency_config.max_retries == 0 && self.dependency_config.enable_progress_events {
            return Err(ConfigError::Invalid(
                "max_retries = 0 with enable_progress_events leaves no terminal event to observe".into(),
            ));
        }
        Ok(())
    }

    /// Layers an optional config file and `{env_prefix}_`-prefixed
    /// environment variables over `defaults`, validating the result.
    pub fn from_layers(defaults: EngineConfig, file: Option<&Path>, env_prefix: &str) -> Result<EngineConfig, ConfigError> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&defaults)?);
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix(env_prefix).separator("__"));
        let layered: EngineConfig = builder.build()?.try_deserialize()?;
        layered.validate()?;
        Ok(layered)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self { config: EngineConfig::default() }
    }

    pub fn enable_compute_module(mut self, enable: bool) -> Self {
        self.config.enable_compute_module = enable;
        self
    }

    pub fn max_memory_mb(mut self, mb: u64) -> Self {
        self.config.max_memory_mb = mb;
        self
    }

    pub fn query_timeout_ms(mut self, ms: u64) -> Self {
        self.config.query_timeout_ms = ms;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    pub fn dependency_config(mut self, dep: DependencyConfig) -> Self {
        self.config.dependency_config = dep;
        self
    }

    pub fn cors_config(mut self, cors: CorsConfig) -> Self {
        self.config.cors_config = cors;
        self
    }

    pub fn with_provider(mut self, provider: ProviderTag, config: ProviderConfig) -> Self {
        self.config.cloud_providers.insert(provider, config);
        self
    }

    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_retries_with_progress_events_is_rejected() {
        let mut config = EngineConfig::default();
        config.dependency_config.max_retries = 0;
        config.dependency_config.enable_progress_events = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = EngineConfigBuilder::new().max_memory_mb(8_192).enable_compute_module(false).build().unwrap();
        assert_eq!(config.max_memory_mb, 8_192);
        assert!(!config.enable_compute_module);
    }

    #[test]
    fn from_layers_applies_env_override() {
        std::env::set_var("TESTENGINE__MAX_MEMORY_MB", "2048");
        let config = EngineConfig::from_layers(EngineConfig::default(), None, "TESTENGINE").unwrap();
        assert_eq!(config.max_memory_mb, 2048);
        std::env::remove_var("TESTENGINE__MAX_MEMORY_MB");
    }
}
