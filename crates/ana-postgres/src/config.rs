//! Configuration loading from environment variables.

use std::time::Duration;

use ana::ReaperConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Connection and maintenance settings for the PostgreSQL backend.
#[derive(Debug, Clone)]
pub struct PgConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Rows per maintenance sweep batch.
    pub sweep_batch_size: i64,
    pub sweep_interval: Duration,
}

impl PgConfig {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `ANA_DATABASE_URL`: PostgreSQL connection string
    ///
    /// Optional (with defaults):
    /// - `ANA_MAX_CONNECTIONS`: Pool size (default: 5)
    /// - `ANA_SWEEP_BATCH_SIZE`: Rows per sweep batch (default: 100)
    /// - `ANA_SWEEP_INTERVAL_SECS`: Seconds between reaper passes (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("ANA_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("ANA_DATABASE_URL"))?;

        let max_connections: u32 = std::env::var("ANA_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("ANA_MAX_CONNECTIONS", "must be a positive integer")
            })?;

        let sweep_batch_size: i64 = std::env::var("ANA_SWEEP_BATCH_SIZE")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .ok()
            .filter(|size| *size > 0)
            .ok_or(ConfigError::Invalid(
                "ANA_SWEEP_BATCH_SIZE",
                "must be a positive integer",
            ))?;

        let sweep_interval_secs: u64 = std::env::var("ANA_SWEEP_INTERVAL_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .ok()
            .filter(|secs| *secs > 0)
            .ok_or(ConfigError::Invalid(
                "ANA_SWEEP_INTERVAL_SECS",
                "must be a positive number of seconds",
            ))?;

        Ok(Self {
            database_url,
            max_connections,
            sweep_batch_size,
            sweep_interval: Duration::from_secs(sweep_interval_secs),
        })
    }

    pub async fn connect(&self) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(&self.database_url)
            .await
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            batch_size: self.sweep_batch_size,
            interval: self.sweep_interval,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
