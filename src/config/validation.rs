use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_prepare_config(config)?;
    validate_vendor_config(config)?;
    validate_sieve_config(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "server.http_pool_max_idle_per_host must be greater than 0",
        ));
    }
    if server.connect_timeout_secs == 0 {
        return Err(validation_err(
            "server.connect_timeout_secs must be greater than 0",
        ));
    }
    if server.body_limit_bytes == 0 {
        return Err(validation_err("server.body_limit_bytes must be greater than 0"));
    }
    if let Some(worker_threads) = server.runtime_worker_threads {
        if worker_threads == 0 {
            return Err(validation_err(
                "server.runtime_worker_threads must be greater than 0 when set",
            ));
        }
    }
    if let Some(max_blocking_threads) = server.runtime_max_blocking_threads {
        if max_blocking_threads == 0 {
            return Err(validation_err(
                "server.runtime_max_blocking_threads must be greater than 0 when set",
            ));
        }
    }
    let base_path = server.base_path.trim();
    if !base_path.is_empty() && !base_path.starts_with('/') {
        return Err(validation_err("server.base_path must start with '/' when set"));
    }
    Ok(())
}

fn validate_prepare_config(config: &AppConfig) -> Result<(), ConfigError> {
    let prepare = &config.prepare;
    validate_http_url("prepare.url", &prepare.url)?;
    validate_http_url("prepare.release_url", &prepare.release_url)?;
    if prepare.timeout_secs == 0 {
        return Err(validation_err("prepare.timeout_secs must be greater than 0"));
    }
    if prepare.release_timeout_ms == 0 {
        return Err(validation_err(
            "prepare.release_timeout_ms must be greater than 0",
        ));
    }
    if let Some(token) = prepare.internal_token.as_deref() {
        if token.trim().is_empty() {
            return Err(validation_err(
                "prepare.internal_token cannot be empty when set",
            ));
        }
    }
    Ok(())
}

fn validate_vendor_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_http_url("vendor.completion_url", &config.vendor.completion_url)?;
    for (name, value) in &config.vendor.headers {
        if http::HeaderName::from_bytes(name.as_bytes()).is_err() {
            return Err(validation_err(format!(
                "vendor.headers: invalid header name '{name}'"
            )));
        }
        if http::HeaderValue::from_str(value).is_err() {
            return Err(validation_err(format!(
                "vendor.headers: invalid value for header '{name}'"
            )));
        }
    }
    Ok(())
}

fn validate_sieve_config(config: &AppConfig) -> Result<(), ConfigError> {
    let sieve = &config.sieve;
    if sieve.capture_limit_bytes == 0 {
        return Err(validation_err("sieve.capture_limit_bytes must be greater than 0"));
    }
    if sieve.hold_window_chars == 0 {
        return Err(validation_err("sieve.hold_window_chars must be greater than 0"));
    }
    if sieve.context_tail_chars == 0 {
        return Err(validation_err("sieve.context_tail_chars must be greater than 0"));
    }
    if sieve.hold_window_chars > sieve.capture_limit_bytes {
        return Err(validation_err(
            "sieve.hold_window_chars cannot exceed sieve.capture_limit_bytes",
        ));
    }
    Ok(())
}

fn validate_http_url(field_name: &str, value: &str) -> Result<(), ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(validation_err(format!("{field_name} cannot be empty")));
    }
    let parsed = url::Url::parse(value)
        .map_err(|err| validation_err(format!("{field_name} is not a valid URL: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(format!(
            "{field_name} must use http:// or https://"
        )));
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}
