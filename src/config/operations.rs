//! Config loading and validation.

use super::model::EngineConfig;
use super::types::BackendSelection;
use crate::error::{LockError, Result};
use std::path::Path;

impl EngineConfig {
    /// Load config from a YAML file.
    ///
    /// Unknown fields in the YAML are silently ignored for forward compatibility.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path).map_err(|e| {
            LockError::Config(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        Self::from_yaml(&content)
    }

    /// Load config from a YAML file, falling back to defaults if it does not exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)
            .map_err(|e| LockError::Config(format!("failed to parse config YAML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize config to YAML string.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| LockError::Config(format!("failed to serialize config to YAML: {}", e)))
    }

    /// Validate config values and return error on invalid values.
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: impl std::fmt::Display) -> LockError {
            LockError::Config(format!("config validation failed: {}", msg))
        }

        if self.lock_ttl_secs == 0 {
            return Err(invalid("lock_ttl_secs must be greater than 0"));
        }
        if self.performance.acquisition_timeout_secs == 0 {
            return Err(invalid(
                "performance.acquisition_timeout_secs must be greater than 0",
            ));
        }
        if self.performance.health_check_interval_ms == 0 {
            return Err(invalid(
                "performance.health_check_interval_ms must be greater than 0",
            ));
        }
        if self.performance.metrics_interval_ms == 0 {
            return Err(invalid("performance.metrics_interval_ms must be greater than 0"));
        }
        if self.performance.queue_batch_size == 0 {
            return Err(invalid("performance.queue_batch_size must be greater than 0"));
        }
        if self.fallback.failure_threshold == 0 || self.fallback.recovery_threshold == 0 {
            return Err(invalid(
                "fallback.failure_threshold and fallback.recovery_threshold must be greater than 0",
            ));
        }

        if self.backend == BackendSelection::Distributed && self.redis.addresses.is_empty() {
            return Err(invalid(
                "backend 'distributed' requires at least one entry in redis.addresses",
            ));
        }
        for address in &self.redis.addresses {
            let valid = address
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !valid {
                return Err(invalid(format!(
                    "redis address '{}' must have the form host:port",
                    address
                )));
            }
        }
        if self.redis.cluster_mode {
            return Err(invalid(
                "redis.cluster_mode is not supported: lock scripts need all keys on one node; \
                 point redis.addresses at a single endpoint or proxy",
            ));
        }
        if self.redis.pool_size == 0 {
            return Err(invalid("redis.pool_size must be greater than 0"));
        }

        if self.retry.base_delay_ms == 0 {
            return Err(invalid("retry.base_delay_ms must be greater than 0"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(invalid("retry.max_delay_ms must not be below retry.base_delay_ms"));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_percent) {
            return Err(invalid("retry.jitter_percent must be between 0.0 and 1.0"));
        }

        Ok(())
    }
}
