//! Configuration module for the historian.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Server settings (port, bind address)
//! - Bus settings (host, auth, subscription pattern, reconnect backoff)
//! - Database settings (path, queue capacity, batching, timeouts)
//! - Retention settings (window, sweep cadence)
//! - Query limits and logging

mod app;
mod validation;

pub use app::{
    AppConfig, BusAuthConfig, BusAuthMethod, BusConfig, DatabaseConfig, LogConfig, QueryConfig,
    RetentionConfig, ServerConfig,
};
pub use validation::{ConfigError, expand_env_vars};

// Re-export constants
pub use app::{
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_QUERY_LIMIT, DEFAULT_QUERY_LIMIT,
    DEFAULT_RETENTION_WINDOW, DEFAULT_SWEEP_INTERVAL,
};
