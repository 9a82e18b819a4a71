use super::models::Config;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("limiter.rate_budget must be positive")]
    ZeroRateBudget,

    #[error("worker.concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("Interval must be positive: {field} = 0")]
    ZeroInterval { field: &'static str },

    #[error("queue.max_attempts must be at least 1")]
    ZeroMaxAttempts,

    #[error("queue.backoff_max_ms ({max}) is below queue.backoff_base_ms ({base})")]
    InvalidBackoff { base: u64, max: u64 },

    #[error("provider.link_hosts is set but provider.base_url is missing")]
    MissingProviderBaseUrl,

    #[error("api.max_urls_per_bundle must be at least 1")]
    ZeroBundleSize,
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_limiter(config)?;
    validate_worker(config)?;
    validate_queue(config)?;
    validate_provider(config)?;
    validate_api(config)?;
    Ok(())
}

/// A zero budget would stall every transfer forever
fn validate_limiter(config: &Config) -> Result<(), ValidationError> {
    if config.limiter.rate_budget.as_u64() == 0 {
        return Err(ValidationError::ZeroRateBudget);
    }
    Ok(())
}

fn validate_worker(config: &Config) -> Result<(), ValidationError> {
    let worker = &config.worker;
    if worker.concurrency == 0 {
        return Err(ValidationError::ZeroConcurrency);
    }

    let intervals = [
        ("worker.poll_interval_ms", worker.poll_interval_ms),
        ("worker.progress_interval_ms", worker.progress_interval_ms),
        ("worker.checkpoint_interval_ms", worker.checkpoint_interval_ms),
        ("worker.stall_timeout_secs", worker.stall_timeout_secs),
        ("worker.connect_timeout_secs", worker.connect_timeout_secs),
    ];
    for (field, value) in intervals {
        if value == 0 {
            return Err(ValidationError::ZeroInterval { field });
        }
    }
    Ok(())
}

fn validate_queue(config: &Config) -> Result<(), ValidationError> {
    let queue = &config.queue;
    if queue.max_attempts == 0 {
        return Err(ValidationError::ZeroMaxAttempts);
    }
    if queue.backoff_max_ms < queue.backoff_base_ms {
        return Err(ValidationError::InvalidBackoff {
            base: queue.backoff_base_ms,
            max: queue.backoff_max_ms,
        });
    }
    if queue.retention_days == 0 {
        return Err(ValidationError::ZeroInterval {
            field: "queue.retention_days",
        });
    }
    Ok(())
}

fn validate_provider(config: &Config) -> Result<(), ValidationError> {
    if !config.provider.link_hosts.is_empty() && config.provider.base_url.is_none() {
        return Err(ValidationError::MissingProviderBaseUrl);
    }
    Ok(())
}

fn validate_api(config: &Config) -> Result<(), ValidationError> {
    if config.api.max_urls_per_bundle == 0 {
        return Err(ValidationError::ZeroBundleSize);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::humanize::ByteSize;

    #[test]
    fn test_valid_config() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_rate_budget() {
        let mut config = Config::default();
        config.limiter.rate_budget = ByteSize(0);

        let result = validate(&config);
        assert!(matches!(result, Err(ValidationError::ZeroRateBudget)));
    }

    #[test]
    fn test_zero_concurrency() {
        let mut config = Config::default();
        config.worker.concurrency = 0;

        let result = validate(&config);
        assert!(matches!(result, Err(ValidationError::ZeroConcurrency)));
    }

    #[test]
    fn test_zero_checkpoint_interval() {
        let mut config = Config::default();
        config.worker.checkpoint_interval_ms = 0;

        let result = validate(&config);
        assert!(matches!(
            result,
            Err(ValidationError::ZeroInterval {
                field: "worker.checkpoint_interval_ms"
            })
        ));
    }

    #[test]
    fn test_backoff_bounds() {
        let mut config = Config::default();
        config.queue.backoff_base_ms = 5000;
        config.queue.backoff_max_ms = 1000;

        let result = validate(&config);
        assert!(matches!(result, Err(ValidationError::InvalidBackoff { .. })));
    }

    #[test]
    fn test_link_hosts_need_base_url() {
        let mut config = Config::default();
        config.provider.link_hosts = vec!["files.provider.test".to_string()];

        let result = validate(&config);
        assert!(matches!(
            result,
            Err(ValidationError::MissingProviderBaseUrl)
        ));

        config.provider.base_url = Some("https://provider.test/api".to_string());
        assert!(validate(&config).is_ok());
    }
}
