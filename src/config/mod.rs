pub mod validation;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::protocol::canonical::Api;

pub use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// HTTP client settings for the default reqwest transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Longest wait for any single read from the socket; 0 disables it.
    /// Never bounds a stream that keeps producing bytes.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    #[serde(default = "default_pool_idle_timeout_secs")]
    pub pool_idle_timeout_secs: u64,
    #[serde(default)]
    pub use_env_proxy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

fn default_read_timeout_secs() -> u64 {
    600
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_pool_max_idle_per_host() -> usize {
    16
}
fn default_pool_idle_timeout_secs() -> u64 {
    15
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: default_read_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout_secs(),
            use_env_proxy: false,
            proxy: None,
        }
    }
}

/// Connection-phase retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplicative jitter applied to each computed delay, `0.1` = ±10%.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_jitter_ratio() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

/// Stream read settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Cancel a read when no bytes arrive for this long. `0` disables.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Override for the Codex backend, which can stay silent while reasoning.
    #[serde(default = "default_codex_idle_timeout_ms")]
    pub codex_idle_timeout_ms: u64,
}

fn default_idle_timeout_ms() -> u64 {
    120_000
}
fn default_codex_idle_timeout_ms() -> u64 {
    300_000
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            codex_idle_timeout_ms: default_codex_idle_timeout_ms(),
        }
    }
}

impl StreamConfig {
    /// Idle timeout for a backend, `None` when disabled.
    #[must_use]
    pub fn idle_timeout_for(&self, api: Api) -> Option<Duration> {
        let ms = match api {
            Api::OpenaiCodexResponses => self.codex_idle_timeout_ms,
            _ => self.idle_timeout_ms,
        };
        (ms > 0).then(|| Duration::from_millis(ms))
    }
}

/// Credentials and endpoint for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub api: Api,
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable consulted when `api_key` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ProviderConfig {
    /// Configured key, falling back to the named environment variable.
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| {
                self.api_key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
                    .filter(|key| !key.trim().is_empty())
            })
    }
}

/// Per-model prices, currency units per million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingConfig {
    pub model: String,
    pub input: f64,
    pub output: f64,
    #[serde(default)]
    pub cache_read: f64,
    #[serde(default)]
    pub cache_write: f64,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub pricing: Vec<PricingConfig>,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            http: HttpConfig::default(),
            retry: RetryConfig::default(),
            stream: StreamConfig::default(),
            providers: Vec::new(),
            pricing: Vec::new(),
        }
    }
}

impl AppConfig {
    #[must_use]
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|provider| provider.name == name)
    }
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] when parsing fails or
/// [`ConfigError::Validation`] when semantic validation fails.
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_example_config() {
        let config = load_config("config.example.yaml");
        assert!(
            config.is_ok(),
            "Failed to load example config: {:?}",
            config.err()
        );
        let config = config.unwrap();
        assert_eq!(config.log_level, "INFO");
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.providers.len() >= 4);
        let codex = config.provider("codex").unwrap();
        assert_eq!(codex.api, Api::OpenaiCodexResponses);
        assert!(!config.pricing.is_empty());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = parse_config("{}").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.http.pool_max_idle_per_host, 16);
        assert!((config.retry.jitter_ratio - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_http_timeouts_are_per_read() {
        let config = parse_config("http:\n  read_timeout_secs: 0\n").unwrap();
        assert_eq!(config.http.read_timeout_secs, 0);
        assert!(validate_config(&config).is_ok());
        assert_eq!(HttpConfig::default().read_timeout_secs, 600);
    }

    #[test]
    fn test_unknown_api_is_a_parse_error() {
        let yaml = "providers:\n  - name: x\n    api: carrier-pigeon\n    base_url: https://x\n";
        assert!(matches!(parse_config(yaml), Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_idle_timeout_per_api() {
        let stream = StreamConfig {
            idle_timeout_ms: 1_000,
            codex_idle_timeout_ms: 0,
        };
        assert_eq!(
            stream.idle_timeout_for(Api::AnthropicMessages),
            Some(Duration::from_secs(1))
        );
        assert_eq!(stream.idle_timeout_for(Api::OpenaiCodexResponses), None);
    }

    #[test]
    fn test_api_key_env_fallback() {
        let provider = ProviderConfig {
            name: "p".into(),
            api: Api::OpenaiCompletions,
            base_url: "https://api.example.com/v1".into(),
            api_key: Some("  ".into()),
            api_key_env: Some("UNISTREAM_TEST_MISSING_KEY_VAR".into()),
            api_version: None,
            headers: BTreeMap::new(),
        };
        assert_eq!(provider.resolve_api_key(), None);
    }
}
