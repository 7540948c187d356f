//! Configuration management.
//!
//! Settings are layered from configuration files and environment variables
//! and validated once at load time.
//!
//! ## Example Configuration
//!
//! ```toml
//! [database]
//! url = "postgres://localhost:5432/datajpa"
//! pool_size = 10
//!
//! [session]
//! lock_timeout_ms = 3000
//! default_page_size = 20
//! max_page_size = 2000
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseSettings,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Database connection URL
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_db_timeout")]
    pub timeout_seconds: u64,
}

/// Unit-of-work and query defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long a pessimistic lock request waits before failing
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Page size used when a caller does not supply one
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,

    /// Largest page size a request may ask for
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,

    /// Log every compiled statement at debug level
    #[serde(default = "default_true")]
    pub log_statements: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            log_statements: true,
        }
    }
}

impl SessionConfig {
    /// Lock wait as a Duration
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Service name attached to log records
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Enable JSON logging format
    #[serde(default)]
    pub json_logging: bool,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            json_logging: false,
            log_level: default_log_level(),
        }
    }
}

fn default_pool_size() -> u32 {
    10
}

fn default_db_timeout() -> u64 {
    30
}

fn default_lock_timeout_ms() -> u64 {
    3000
}

fn default_page_size() -> u32 {
    crate::pagination::DEFAULT_PAGE_SIZE
}

fn default_max_page_size() -> u32 {
    2000
}

fn default_true() -> bool {
    true
}

fn default_service_name() -> String {
    "datajpa".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from configuration files and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. config/default.toml (if exists)
    /// 2. config/{environment}.toml (if exists, where environment is from APP_ENV)
    /// 3. Environment variables prefixed with APP_, e.g. `APP_SESSION__LOCK_TIMEOUT_MS=500`
    pub fn load() -> Result<Self> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL is required");
        }

        if self.database.pool_size == 0 {
            anyhow::bail!("Database pool size must be greater than 0");
        }

        if self.database.timeout_seconds == 0 {
            anyhow::bail!("Database timeout must be greater than 0");
        }

        if self.session.default_page_size == 0 {
            anyhow::bail!("Default page size must be greater than 0");
        }

        if self.session.default_page_size > self.session.max_page_size {
            anyhow::bail!(
                "Default page size {} exceeds max page size {}",
                self.session.default_page_size,
                self.session.max_page_size
            );
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "Invalid log level '{}'. Must be one of: {}",
                self.telemetry.log_level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Get the database connection timeout as a Duration
    pub fn database_timeout(&self) -> Duration {
        Duration::from_secs(self.database.timeout_seconds)
    }

    /// Create a development configuration with sensible defaults
    pub fn development() -> Self {
        Self {
            database: DatabaseSettings {
                url: "postgres://localhost:5432/datajpa_dev".to_string(),
                pool_size: 5,
                timeout_seconds: 30,
            },
            session: SessionConfig {
                lock_timeout_ms: 1000,
                ..SessionConfig::default()
            },
            telemetry: TelemetryConfig {
                service_name: "datajpa-dev".to_string(),
                json_logging: false,
                log_level: "debug".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::development();

        assert!(config.validate().is_ok());

        config.database.url = String::new();
        assert!(config.validate().is_err());
        config.database.url = "postgres://localhost/test".to_string();

        config.session.default_page_size = 0;
        assert!(config.validate().is_err());
        config.session.default_page_size = 5000;
        assert!(config.validate().is_err());
        config.session.default_page_size = 20;

        config.telemetry.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_defaults() {
        let session = SessionConfig::default();
        assert_eq!(session.lock_timeout(), Duration::from_millis(3000));
        assert_eq!(session.default_page_size, 20);
        assert!(session.log_statements);
    }

    #[test]
    fn test_deserialize_with_missing_sections() {
        let config: AppConfig = serde_json::from_str(
            r#"{ "database": { "url": "postgres://localhost/test" } }"#,
        )
        .unwrap();

        assert_eq!(config.database.pool_size, 10);
        assert_eq!(config.session.max_page_size, 2000);
        assert_eq!(config.telemetry.log_level, "info");
        assert!(config.validate().is_ok());
    }
}
