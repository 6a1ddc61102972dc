use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - Concurrency limits, intervals and timeouts are not 0
/// - The output layout names at least one file
/// - A bucket is set whenever other storage settings are
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(invalid("server.port cannot be 0"));
    }

    let orchestrator = &config.orchestrator;
    if orchestrator.default_concurrency == 0 {
        return Err(invalid("orchestrator.default_concurrency must be at least 1"));
    }
    if orchestrator.upload_concurrency == 0 {
        return Err(invalid("orchestrator.upload_concurrency must be at least 1"));
    }
    if orchestrator.poll_interval_ms == 0 {
        return Err(invalid("orchestrator.poll_interval_ms cannot be 0"));
    }
    if orchestrator.disk_space_multiplier < 0.0 {
        return Err(invalid("orchestrator.disk_space_multiplier cannot be negative"));
    }
    for (name, secs) in orchestrator.timeouts.all() {
        if secs == 0 {
            return Err(invalid(format!("orchestrator.timeouts.{} cannot be 0", name)));
        }
    }
    let retry = &orchestrator.retry;
    if retry.backoff_multiplier < 1.0 {
        return Err(invalid("orchestrator.retry.backoff_multiplier must be at least 1.0"));
    }
    if retry.max_delay_ms < retry.initial_delay_ms {
        return Err(invalid(
            "orchestrator.retry.max_delay_ms cannot be below initial_delay_ms",
        ));
    }

    if config.layout.required_files.is_empty() {
        return Err(invalid("layout.required_files cannot be empty"));
    }
    if config.layout.manifest.as_os_str().is_empty() {
        return Err(invalid("layout.manifest cannot be empty"));
    }

    let storage = &config.storage;
    let storage_touched = storage.access_token.is_some() || !storage.folder_prefix.is_empty();
    if storage_touched && !storage.is_configured() {
        return Err(invalid("storage.bucket is required when storage is configured"));
    }
    if storage.bucket.trim() != storage.bucket {
        return Err(invalid("storage.bucket cannot have surrounding whitespace"));
    }
    if storage.request_timeout_secs == 0 {
        return Err(invalid("storage.request_timeout_secs cannot be 0"));
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}
