//! Configuration file loading, environment overrides and validation.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};

use super::model::AppConfig;
use crate::error::ConfigError;
use crate::validation::validate_config;

/// Loads the configuration file from disk and parses it.
pub fn load_from_path(path: &Path) -> Result<AppConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    // An empty document means "all defaults".
    if content.trim().is_empty() {
        return Ok(AppConfig::default());
    }

    let config: AppConfig =
        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    Ok(config)
}

/// Applies overrides from the process environment.
pub fn apply_env_overrides(config: &mut AppConfig) -> Result<(), ConfigError> {
    apply_overrides(config, |var| std::env::var(var).ok())
}

/// Applies overrides using the given variable lookup.
///
/// Unset and empty variables leave the file value untouched.
pub fn apply_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |var: &str| lookup(var).filter(|v| !v.is_empty());

    if let Some(url) = get("RABBITMQ_URL") {
        config.rabbitmq.url = url;
    }

    if let Some(host) = get("REDIS_HOST") {
        config.redis.host = host;
    }
    if let Some(port) = get("REDIS_PORT") {
        config.redis.port = parse_env("REDIS_PORT", &port)?;
    }
    if let Some(password) = get("REDIS_PASSWORD") {
        config.redis.password = Some(password);
    }

    if let Some(host) = get("POSTGRES_HOST") {
        config.database.host = host;
    }
    if let Some(port) = get("POSTGRES_PORT") {
        config.database.port = parse_env("POSTGRES_PORT", &port)?;
    }
    if let Some(user) = get("POSTGRES_USER") {
        config.database.user = user;
    }
    if let Some(password) = get("POSTGRES_PASSWORD") {
        config.database.password = password;
    }
    if let Some(name) = get("POSTGRES_DB") {
        config.database.name = name;
    }

    if let Some(region) = get("AWS_REGION") {
        config.storage.region = region;
    }
    if let Some(bucket) = get("AWS_BUCKET_NAME") {
        config.storage.bucket = bucket;
    }
    if let Some(endpoint) = get("AWS_ENDPOINT_URL") {
        config.storage.endpoint = Some(endpoint);
    }

    Ok(())
}

fn parse_env<T: FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}

/// Loads the configuration file and applies environment overrides, without validation.
pub fn load(path: &Path) -> Result<AppConfig> {
    let mut config = load_from_path(path).context("Failed to load configuration")?;
    apply_env_overrides(&mut config).context("Failed to apply environment overrides")?;
    Ok(config)
}

/// Loads the configuration file, applies environment overrides and fully validates it.
pub fn load_and_validate(path: &Path) -> Result<AppConfig> {
    let config = load(path)?;

    let result = validate_config(&config);

    for issue in result.warnings() {
        tracing::warn!(
            path = %issue.path,
            message = %issue.message,
            suggestion = ?issue.suggestion,
            "Config validation warning"
        );
    }

    if !result.is_valid() {
        tracing::error!("{}", result);
        anyhow::bail!(ConfigError::ValidationFailed {
            error_count: result.error_count()
        });
    }

    Ok(config)
}
