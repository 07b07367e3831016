use std::collections::HashSet;

use super::{AppConfig, ConfigError};

/// Validate the full config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_http(config)?;
    validate_retry(config)?;
    validate_providers(config)?;
    validate_pricing(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_http(config: &AppConfig) -> Result<(), ConfigError> {
    let http = &config.http;
    if http.pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "http.pool_max_idle_per_host must be greater than 0",
        ));
    }
    if let Some(proxy) = http.proxy.as_deref() {
        let parsed = url::Url::parse(proxy)
            .map_err(|err| validation_err(format!("http.proxy is not a valid URL: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https" | "socks5" | "socks5h") {
            return Err(validation_err(format!(
                "http.proxy has unsupported scheme '{}'",
                parsed.scheme()
            )));
        }
    }
    Ok(())
}

fn validate_retry(config: &AppConfig) -> Result<(), ConfigError> {
    let retry = &config.retry;
    if !(0.0..=1.0).contains(&retry.jitter_ratio) {
        return Err(validation_err("retry.jitter_ratio must be within [0, 1]"));
    }
    if retry.base_delay_ms > retry.max_delay_ms {
        return Err(validation_err(
            "retry.base_delay_ms must not exceed retry.max_delay_ms",
        ));
    }
    Ok(())
}

fn validate_providers(config: &AppConfig) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for provider in &config.providers {
        if provider.name.trim().is_empty() {
            return Err(validation_err("provider name cannot be empty"));
        }
        if !names.insert(provider.name.as_str()) {
            return Err(validation_err(format!(
                "Duplicate provider name: '{}'",
                provider.name
            )));
        }
        let base_url = provider.base_url.trim();
        if base_url.is_empty() {
            return Err(validation_err(format!(
                "Provider '{}': base_url cannot be empty",
                provider.name
            )));
        }
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(validation_err(format!(
                "Provider '{}': base_url must start with http:// or https://",
                provider.name
            )));
        }
        for (header, value) in &provider.headers {
            if http::HeaderName::from_bytes(header.as_bytes()).is_err()
                || http::HeaderValue::from_str(value).is_err()
            {
                return Err(validation_err(format!(
                    "Provider '{}': invalid header '{header}'",
                    provider.name
                )));
            }
        }
    }
    Ok(())
}

fn validate_pricing(config: &AppConfig) -> Result<(), ConfigError> {
    for entry in &config.pricing {
        let prices = [entry.input, entry.output, entry.cache_read, entry.cache_write];
        if prices.iter().any(|price| !price.is_finite() || *price < 0.0) {
            return Err(validation_err(format!(
                "Pricing for '{}' must be finite and non-negative",
                entry.model
            )));
        }
    }
    Ok(())
}

const VALID_LOG_LEVELS: &[&str] = &[
    "TRACE", "DEBUG", "INFO", "WARNING", "WARN", "ERROR", "CRITICAL", "DISABLED",
];

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let level = config.log_level.to_uppercase();
    if !VALID_LOG_LEVELS.contains(&level.as_str()) {
        return Err(validation_err(format!(
            "Invalid log_level '{}'. Must be one of: {}",
            config.log_level,
            VALID_LOG_LEVELS.join(", ")
        )));
    }
    Ok(())
}
