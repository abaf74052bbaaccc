use clap::Parser;
use thiserror::Error;

use crate::domain::rule::validate_rule_group_interval;

/// Errors in the service configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid default interval: {0}")]
    DefaultInterval(String),

    #[error("invalid connection pool bounds: min {min} > max {max}")]
    PoolBounds { min: u32, max: u32 },
}

/// Provisioning service configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "ruleprov")]
#[command(about = "Alert rule provisioning service")]
pub struct Config {
    /// HTTP server listen address
    #[arg(long, default_value = "0.0.0.0:8080", env = "RULEPROV_LISTEN_ADDR")]
    pub listen_addr: String,

    /// PostgreSQL connection URL (optional, uses in-memory storage if not set)
    #[arg(long, env = "RULEPROV_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Minimum pooled database connections
    #[arg(long, default_value = "1", env = "RULEPROV_DB_MIN_CONNECTIONS")]
    pub db_min_connections: u32,

    /// Maximum pooled database connections
    #[arg(long, default_value = "10", env = "RULEPROV_DB_MAX_CONNECTIONS")]
    pub db_max_connections: u32,

    /// Interval in seconds given to rules of a new group
    #[arg(long, default_value = "60", env = "RULEPROV_DEFAULT_INTERVAL_SECS")]
    pub default_interval_secs: i64,

    /// Scheduler base interval in seconds; group intervals must be multiples of it
    #[arg(long, default_value = "10", env = "RULEPROV_BASE_INTERVAL_SECS")]
    pub base_interval_secs: i64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, default_value = "false", env = "RULEPROV_LOG_JSON")]
    pub log_json: bool,

    /// Enable graceful shutdown
    #[arg(long, default_value = "true", env = "RULEPROV_GRACEFUL_SHUTDOWN")]
    pub graceful_shutdown: bool,
}

impl Config {
    /// Check that the interval settings and pool bounds are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_rule_group_interval(self.default_interval_secs, self.base_interval_secs)
            .map_err(ConfigError::DefaultInterval)?;

        if self.db_min_connections > self.db_max_connections {
            return Err(ConfigError::PoolBounds {
                min: self.db_min_connections,
                max: self.db_max_connections,
            });
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: "0.0.0.0:8080".to_string(),
            database_url: None,
            db_min_connections: 1,
            db_max_connections: 10,
            default_interval_secs: 60,
            base_interval_secs: 10,
            log_level: "info".to_string(),
            log_json: false,
            graceful_shutdown: true,
        }
    }
}
