//! Configuration model for the locking engine.
//!
//! This module defines the EngineConfig struct that represents `tflock.yaml`.
//! It supports forward-compatible YAML parsing (unknown fields are ignored),
//! sensible defaults for optional fields, and validation of config values.

mod model;
mod operations;
pub mod types;


// Re-export public API
pub use model::EngineConfig;
pub use types::{
    BackendSelection, FallbackConfig, FeatureToggles, PerformanceConfig, RedisConfig, RetryConfig,
    RetryPreset,
};
