//! Application configuration structures.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use super::validation::{ConfigError, expand_env_vars};

// =============================================================================
// Constants
// =============================================================================

/// Default connection pool size.
pub const DEFAULT_POOL_SIZE: u32 = 4;

/// Default ingestion queue capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Default retention window (24 hours).
pub const DEFAULT_RETENTION_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Default sweep interval (5 minutes).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default query limit when the client provides none.
pub const DEFAULT_QUERY_LIMIT: u32 = 100;

/// Hard maximum query limit.
pub const DEFAULT_MAX_QUERY_LIMIT: u32 = 10_000;

fn default_pool_size() -> u32 {
    DEFAULT_POOL_SIZE
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_batch_size() -> usize {
    500
}

fn default_batch_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_checkpoint_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_op_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_retention_window() -> Duration {
    DEFAULT_RETENTION_WINDOW
}

fn default_sweep_interval() -> Duration {
    DEFAULT_SWEEP_INTERVAL
}

fn default_sweep_batch_size() -> usize {
    5_000
}

fn default_query_limit() -> u32 {
    DEFAULT_QUERY_LIMIT
}

fn default_max_query_limit() -> u32 {
    DEFAULT_MAX_QUERY_LIMIT
}

fn default_subscribe_pattern() -> String {
    "^.*".to_string()
}

fn default_group_id() -> String {
    "chronik".to_string()
}

fn default_reconnect_min() -> Duration {
    Duration::from_secs(1)
}

fn default_reconnect_max() -> Duration {
    Duration::from_secs(60)
}

fn default_log_level() -> String {
    "info".to_string()
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Web server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address (default: "0.0.0.0").
    pub bind: String,

    /// Server port (default: 8080).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

// =============================================================================
// Bus Configuration
// =============================================================================

/// Authentication method for the bus connection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, EnumString, Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BusAuthMethod {
    /// No authentication (local development).
    #[default]
    None,
    /// Bearer token loaded from a mounted, rotating credential file.
    Bearer,
}

/// Bus authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BusAuthConfig {
    /// Authentication method (default: none).
    pub method: BusAuthMethod,

    /// Path to the mounted credential file (required for bearer).
    pub credential_path: Option<String>,
}

/// Message bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Bus host (default: "localhost").
    pub host: String,

    /// Bus port (default: 9092).
    pub port: u16,

    /// Wildcard subscription pattern covering all topics (default: "^.*").
    pub subscribe_pattern: String,

    /// Consumer group identifier (default: "chronik").
    pub group_id: String,

    /// Authentication settings.
    pub auth: BusAuthConfig,

    /// Reconnect backoff floor (default: 1s).
    #[serde(with = "humantime_serde")]
    pub reconnect_min: Duration,

    /// Reconnect backoff ceiling (default: 60s).
    #[serde(with = "humantime_serde")]
    pub reconnect_max: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9092,
            subscribe_pattern: default_subscribe_pattern(),
            group_id: default_group_id(),
            auth: BusAuthConfig::default(),
            reconnect_min: default_reconnect_min(),
            reconnect_max: default_reconnect_max(),
        }
    }
}

// =============================================================================
// Database Configuration
// =============================================================================

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file path.
    pub path: String,

    /// Connection pool size for read operations (default: 4).
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Ingestion queue capacity (default: 10000).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Writer batch size (default: 500).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Writer batch flush interval (default: 1s).
    #[serde(default = "default_batch_flush_interval", with = "humantime_serde")]
    pub batch_flush_interval: Duration,

    /// WAL checkpoint interval (default: 5s).
    #[serde(default = "default_checkpoint_interval", with = "humantime_serde")]
    pub checkpoint_interval: Duration,

    /// Per-call timeout for read operations (default: 5s).
    #[serde(default = "default_op_timeout", with = "humantime_serde")]
    pub op_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "chronik.db".to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            batch_size: default_batch_size(),
            batch_flush_interval: default_batch_flush_interval(),
            checkpoint_interval: default_checkpoint_interval(),
            op_timeout: default_op_timeout(),
        }
    }
}

// =============================================================================
// Retention Configuration
// =============================================================================

/// Retention sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Maximum record age before purge eligibility, over `received_at`
    /// (default: 24h).
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Interval between sweeps (default: 5m).
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Maximum rows deleted per sweep batch (default: 5000).
    pub sweep_batch_size: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            window: default_retention_window(),
            sweep_interval: default_sweep_interval(),
            sweep_batch_size: default_sweep_batch_size(),
        }
    }
}

// =============================================================================
// Query Configuration
// =============================================================================

/// Query service limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Limit applied when the client provides none (default: 100).
    pub default_limit: u32,

    /// Hard maximum; larger requests are rejected, not clamped (default: 10000).
    pub max_limit: u32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_query_limit(),
            max_limit: default_max_query_limit(),
        }
    }
}

// =============================================================================
// Log Configuration
// =============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log filter used when `RUST_LOG` is unset (default: "info").
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Web server configuration.
    pub server: ServerConfig,

    /// Message bus configuration.
    pub bus: BusConfig,

    /// Database configuration.
    pub database: DatabaseConfig,

    /// Retention sweeper configuration.
    pub retention: RetentionConfig,

    /// Query service limits.
    pub query: QueryConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// Environment variables in the file are expanded (`${VAR}` and
    /// `${VAR:-default}`) before parsing.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&expand_env_vars(&content))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate server bind address
        self.server.bind.parse::<IpAddr>().map_err(|_| {
            ConfigError::ValidationError(format!(
                "invalid server bind address: '{}'",
                self.server.bind
            ))
        })?;

        // Validate server port
        if self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "server port must be non-zero".to_string(),
            ));
        }

        if self.bus.port == 0 {
            return Err(ConfigError::ValidationError(
                "bus port must be non-zero".to_string(),
            ));
        }

        if self.bus.subscribe_pattern.is_empty() {
            return Err(ConfigError::ValidationError(
                "bus subscribe_pattern must not be empty".to_string(),
            ));
        }

        if self.bus.auth.method == BusAuthMethod::Bearer
            && self.bus.auth.credential_path.is_none()
        {
            return Err(ConfigError::ValidationError(
                "bus auth method 'bearer' requires credential_path".to_string(),
            ));
        }

        if self.bus.reconnect_min.is_zero() || self.bus.reconnect_max < self.bus.reconnect_min {
            return Err(ConfigError::ValidationError(
                "bus reconnect backoff must satisfy 0 < reconnect_min <= reconnect_max"
                    .to_string(),
            ));
        }

        if self.database.pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "database pool_size must be positive".to_string(),
            ));
        }

        if self.database.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "database channel_capacity must be positive".to_string(),
            ));
        }

        if self.database.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "database batch_size must be positive".to_string(),
            ));
        }

        if self.retention.window.is_zero() {
            return Err(ConfigError::ValidationError(
                "retention window must be positive".to_string(),
            ));
        }

        if self.retention.sweep_interval < Duration::from_secs(1) {
            return Err(ConfigError::ValidationError(
                "retention sweep_interval must be at least 1s".to_string(),
            ));
        }

        if self.retention.sweep_batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "retention sweep_batch_size must be positive".to_string(),
            ));
        }

        if self.query.default_limit == 0 || self.query.max_limit < self.query.default_limit {
            return Err(ConfigError::ValidationError(
                "query limits must satisfy 0 < default_limit <= max_limit".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_auth_method_from_str_case_insensitive() {
        assert_eq!(BusAuthMethod::from_str("none").unwrap(), BusAuthMethod::None);
        assert_eq!(
            BusAuthMethod::from_str("Bearer").unwrap(),
            BusAuthMethod::Bearer
        );
        assert!(BusAuthMethod::from_str("kerberos").is_err());
    }

    #[test]
    fn test_auth_method_as_str() {
        assert_eq!(BusAuthMethod::None.as_ref(), "none");
        assert_eq!(BusAuthMethod::Bearer.as_ref(), "bearer");
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retention.window, Duration::from_secs(86400));
        assert_eq!(config.query.default_limit, 100);
        assert_eq!(config.bus.subscribe_pattern, "^.*");
    }

    #[test]
    fn test_load_from_yaml() {
        let yaml = r#"
server:
  bind: "127.0.0.1"
  port: 9000
bus:
  host: broker.internal
  port: 9093
  auth:
    method: bearer
    credential_path: /etc/creds/token
database:
  path: ./data/history.db
  channel_capacity: 5000
retention:
  window: 6h
  sweep_interval: 1m
query:
  default_limit: 50
  max_limit: 500
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, yaml).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.bus.host, "broker.internal");
        assert_eq!(config.bus.auth.method, BusAuthMethod::Bearer);
        assert_eq!(config.retention.window, Duration::from_secs(6 * 3600));
        assert_eq!(config.retention.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.query.max_limit, 500);
    }

    #[test]
    fn test_validation_invalid_port() {
        let config = AppConfig {
            server: ServerConfig {
                bind: "0.0.0.0".to_string(),
                port: 0,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_invalid_bind_address() {
        let config = AppConfig {
            server: ServerConfig {
                bind: "not-an-ip".to_string(),
                port: 8080,
            },
            ..Default::default()
        };

        let result = config.validate();
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("invalid server bind address")
        );
    }

    #[test]
    fn test_validation_bearer_requires_credential_path() {
        let mut config = AppConfig::default();
        config.bus.auth.method = BusAuthMethod::Bearer;
        config.bus.auth.credential_path = None;

        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("credential_path"));
    }

    #[test]
    fn test_validation_rejects_inverted_query_limits() {
        let mut config = AppConfig::default();
        config.query.default_limit = 1000;
        config.query.max_limit = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_retention() {
        let mut config = AppConfig::default();
        config.retention.window = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
