//! Configuration loading and management.
//!
//! This module is split into logical submodules:
//! - [`types`]: Config struct definitions and TOML loading
//! - [`defaults`]: serde default functions
//! - [`env`]: environment variable overrides
//! - [`validation`]: startup sanity checks

pub mod defaults;
mod env;
mod types;
mod validation;

pub use env::{ENV_KEEPALIVE_TIMEOUT, ENV_OBJECT_BUFFER_SIZE};
pub use types::{
    CacheConfig, Config, ConfigError, LogFormat, MetricsConfig, NodeConfig, ObjectConfig,
    RspConfig, TimeoutsConfig,
};
pub use validation::ValidationError;
