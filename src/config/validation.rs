use crate::config::types::{
    CircuitBreakerConfig, Config, ExtractConfig, FetchConfig, FrontierConfig, PipelineConfig,
    RetryConfig, ScopeConfig,
};
use crate::crawler::{ASSET_KIND, PAGE_KIND};
use crate::{ConfigError, ConfigResult};
use scraper::Selector;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_pipeline_config(&config.pipeline)?;
    validate_fetch_config(&config.fetch)?;
    validate_retry_config(&config.retry)?;
    validate_frontier_config(&config.frontier)?;
    validate_breaker_config(&config.circuit_breaker)?;
    validate_scope(&config.scope)?;
    validate_extract_rules(&config.extract)?;
    validate_seeds(&config.seeds)?;

    if config.storage.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database-path cannot be empty".to_string(),
        ));
    }

    if matches!(config.storage.asset_dir.as_deref(), Some("")) {
        return Err(ConfigError::Validation(
            "asset-dir cannot be empty; omit it to keep assets in the database only".to_string(),
        ));
    }

    Ok(())
}

fn validate_pipeline_config(config: &PipelineConfig) -> ConfigResult<()> {
    if config.workers < 1 || config.workers > 256 {
        return Err(ConfigError::Validation(format!(
            "workers must be between 1 and 256, got {}",
            config.workers
        )));
    }

    if config.requests_per_second < 1 {
        return Err(ConfigError::Validation(format!(
            "requests-per-second must be >= 1, got {}",
            config.requests_per_second
        )));
    }

    Ok(())
}

fn validate_fetch_config(config: &FetchConfig) -> ConfigResult<()> {
    if config.timeout_ms < 100 {
        return Err(ConfigError::Validation(format!(
            "timeout-ms must be >= 100ms, got {}ms",
            config.timeout_ms
        )));
    }

    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user-agent cannot be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_retry_config(config: &RetryConfig) -> ConfigResult<()> {
    if config.max_attempts < 1 {
        return Err(ConfigError::Validation(format!(
            "max-attempts must be >= 1, got {}",
            config.max_attempts
        )));
    }

    if !config.multiplier.is_finite() || config.multiplier < 1.0 {
        return Err(ConfigError::Validation(format!(
            "multiplier must be a finite number >= 1.0, got {}",
            config.multiplier
        )));
    }

    if config.max_delay_ms < config.base_delay_ms {
        return Err(ConfigError::Validation(format!(
            "max-delay-ms ({}) must be >= base-delay-ms ({})",
            config.max_delay_ms, config.base_delay_ms
        )));
    }

    Ok(())
}

fn validate_frontier_config(config: &FrontierConfig) -> ConfigResult<()> {
    if config.max_pending < 1 {
        return Err(ConfigError::Validation(
            "max-pending must be >= 1".to_string(),
        ));
    }

    if config.per_host_concurrency < 1 {
        return Err(ConfigError::Validation(
            "per-host-concurrency must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_breaker_config(config: &CircuitBreakerConfig) -> ConfigResult<()> {
    if config.failure_threshold < 1 {
        return Err(ConfigError::Validation(
            "failure-threshold must be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_scope(scope: &ScopeConfig) -> ConfigResult<()> {
    for pattern in scope.allow.iter().chain(scope.deny.iter()) {
        validate_host_pattern(pattern)?;
    }
    Ok(())
}

fn validate_extract_rules(extract: &ExtractConfig) -> ConfigResult<()> {
    for rule in &extract.rules {
        if rule.kind.is_empty() || rule.kind.contains(':') {
            return Err(ConfigError::Validation(format!(
                "extract rule kind must be non-empty and contain no ':', got '{}'",
                rule.kind
            )));
        }

        if rule.kind == PAGE_KIND || rule.kind == ASSET_KIND {
            return Err(ConfigError::Validation(format!(
                "extract rule kind '{}' is reserved",
                rule.kind
            )));
        }

        if rule.key.is_empty() {
            return Err(ConfigError::Validation(format!(
                "extract rule '{}' needs a key attribute",
                rule.kind
            )));
        }

        for selector in std::iter::once(&rule.selector).chain(rule.fields.values()) {
            Selector::parse(selector).map_err(|e| {
                ConfigError::InvalidPattern(format!(
                    "Invalid selector '{}' in rule '{}': {:?}",
                    selector, rule.kind, e
                ))
            })?;
        }
    }
    Ok(())
}

fn validate_seeds(seeds: &[String]) -> ConfigResult<()> {
    for seed in seeds {
        let url = Url::parse(seed)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid seed URL '{}': {}", seed, e)))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::Validation(format!(
                "Seed URL '{}' must use http or https",
                seed
            )));
        }
    }
    Ok(())
}

/// Validates a host pattern (supports a leading `*.` wildcard)
fn validate_host_pattern(pattern: &str) -> ConfigResult<()> {
    if pattern.is_empty() {
        return Err(ConfigError::InvalidPattern(
            "Host pattern cannot be empty".to_string(),
        ));
    }

    let host = pattern.strip_prefix("*.").unwrap_or(pattern);

    if host.is_empty() {
        return Err(ConfigError::InvalidPattern(format!(
            "Host pattern '{}' has no host after the wildcard",
            pattern
        )));
    }

    if !host
        .chars()
        .all(|c| c.is_alphanumeric() || c == '.' || c == '-')
    {
        return Err(ConfigError::InvalidPattern(format!(
            "Host '{}' contains invalid characters",
            host
        )));
    }

    if host.starts_with('.') || host.ends_with('.') || host.contains("..") {
        return Err(ConfigError::InvalidPattern(format!(
            "Host '{}' has misplaced dots",
            host
        )));
    }

    Ok(())
}
