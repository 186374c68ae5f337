//! Configuration system for keyward.
//!
//! Configuration is loaded from multiple sources with the following precedence:
//! 1. Environment variables (highest priority)
//! 2. `config.toml` file
//! 3. Default values (lowest priority)
//!
//! # Environment Variables
//!
//! - `KEYWARD_DATABASE_TYPE` - `sqlite` or `postgres`
//! - `KEYWARD_DATABASE_URL` - Database connection URL
//! - `KEYWARD_ENCRYPTION_KEY` - AES-256 key (64 hex chars) or passphrase
//! - `KEYWARD_HASH_SECRET` - HMAC secret for key digests
//! - `KEYWARD_GENERATOR_MAX_RETRIES` - Collision re-rolls per generated key
//! - `KEYWARD_LOGGING_ENABLED` - Enable the tracing subscriber
//! - `KEYWARD_LOG_LEVEL` - Log level (trace, debug, info, warn, error)

use config::Config;
use serde::Deserialize;
use std::env;
use std::sync::OnceLock;

use crate::errors::{LicenseError, LicenseResult};

/// Global configuration singleton.
static CONFIG: OnceLock<KeywardConfig> = OnceLock::new();

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KeywardConfig {
    pub database: DatabaseConfig,
    pub crypto: CryptoConfig,
    pub generator: GeneratorConfig,
    pub lifecycle: LifecycleConfig,
    pub logging: LoggingConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database type: "sqlite" or "postgres"
    pub db_type: String,
    /// SQLite connection URL
    pub sqlite_url: String,
    /// PostgreSQL connection URL
    pub postgres_url: String,
    /// Pool size
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_type: "sqlite".to_string(),
            sqlite_url: "sqlite://keyward.db?mode=rwc".to_string(),
            postgres_url: "postgres://localhost/keyward".to_string(),
            max_connections: 5,
        }
    }
}

/// Secrets for the key codec.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// 64 hex characters are used as the raw AES-256 key; any other value
    /// is stretched with SHA-256.
    pub encryption_key: String,
    /// HMAC-SHA256 secret used to derive lookup digests.
    pub hash_secret: String,
}

/// Key generator limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Re-rolls allowed per key when a candidate collides
    pub max_retries: u32,
    /// Largest batch a single `generate` call accepts
    pub max_batch: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            max_batch: 1000,
        }
    }
}

/// License lifecycle tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Compare-and-set attempts for activation counter writes
    pub max_write_attempts: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_write_attempts: 3,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Enable logging
    pub enabled: bool,
    /// Log level: trace, debug, info, warn, error
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "info".to_string(),
        }
    }
}

fn config_err(e: config::ConfigError) -> LicenseError {
    LicenseError::ConfigError(e.to_string())
}

impl KeywardConfig {
    /// Load configuration from defaults, `config.toml` and the environment,
    /// without touching the global cache.
    pub fn load() -> LicenseResult<Self> {
        let builder = Config::builder()
            .set_default("database.db_type", "sqlite")
            .map_err(config_err)?
            .set_default("database.sqlite_url", "sqlite://keyward.db?mode=rwc")
            .map_err(config_err)?
            .set_default("database.postgres_url", "postgres://localhost/keyward")
            .map_err(config_err)?
            .set_default("database.max_connections", 5)
            .map_err(config_err)?
            .set_default("crypto.encryption_key", "")
            .map_err(config_err)?
            .set_default("crypto.hash_secret", "")
            .map_err(config_err)?
            .set_default("generator.max_retries", 10)
            .map_err(config_err)?
            .set_default("generator.max_batch", 1000)
            .map_err(config_err)?
            .set_default("lifecycle.max_write_attempts", 3)
            .map_err(config_err)?
            .set_default("logging.enabled", false)
            .map_err(config_err)?
            .set_default("logging.level", "info")
            .map_err(config_err)?
            // Load from config.toml (optional)
            .add_source(config::File::with_name("config").required(false))
            // Override with environment variables
            .set_override_option("database.db_type", env::var("KEYWARD_DATABASE_TYPE").ok())
            .map_err(config_err)?
            .set_override_option(
                "database.sqlite_url",
                env::var("KEYWARD_DATABASE_URL")
                    .ok()
                    .filter(|url| url.starts_with("sqlite")),
            )
            .map_err(config_err)?
            .set_override_option(
                "database.postgres_url",
                env::var("KEYWARD_DATABASE_URL")
                    .ok()
                    .filter(|url| url.starts_with("postgres")),
            )
            .map_err(config_err)?
            .set_override_option(
                "crypto.encryption_key",
                env::var("KEYWARD_ENCRYPTION_KEY").ok(),
            )
            .map_err(config_err)?
            .set_override_option("crypto.hash_secret", env::var("KEYWARD_HASH_SECRET").ok())
            .map_err(config_err)?
            .set_override_option(
                "generator.max_retries",
                env::var("KEYWARD_GENERATOR_MAX_RETRIES")
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok()),
            )
            .map_err(config_err)?
            .set_override_option(
                "logging.enabled",
                env::var("KEYWARD_LOGGING_ENABLED")
                    .ok()
                    .and_then(|v| v.parse::<bool>().ok()),
            )
            .map_err(config_err)?
            .set_override_option("logging.level", env::var("KEYWARD_LOG_LEVEL").ok())
            .map_err(config_err)?;

        let settings = builder
            .build()
            .map_err(|e| LicenseError::ConfigError(format!("failed to build config: {e}")))?;

        settings
            .try_deserialize()
            .map_err(|e| LicenseError::ConfigError(format!("failed to deserialize config: {e}")))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> LicenseResult<()> {
        match self.database.db_type.as_str() {
            "sqlite" | "postgres" => {}
            other => {
                return Err(LicenseError::ConfigError(format!(
                    "database.db_type must be 'sqlite' or 'postgres', got '{other}'"
                )));
            }
        }
        if self.database.max_connections == 0 {
            return Err(LicenseError::ConfigError(
                "database.max_connections must be greater than 0".to_string(),
            ));
        }

        // Without both secrets stored keys could be neither redisplayed nor found
        if self.crypto.encryption_key.is_empty() {
            return Err(LicenseError::ConfigError(
                "crypto.encryption_key is required".to_string(),
            ));
        }
        if self.crypto.hash_secret.is_empty() {
            return Err(LicenseError::ConfigError(
                "crypto.hash_secret is required".to_string(),
            ));
        }

        if self.generator.max_retries == 0 {
            return Err(LicenseError::ConfigError(
                "generator.max_retries must be greater than 0".to_string(),
            ));
        }
        if self.generator.max_batch == 0 {
            return Err(LicenseError::ConfigError(
                "generator.max_batch must be greater than 0".to_string(),
            ));
        }
        if self.lifecycle.max_write_attempts == 0 {
            return Err(LicenseError::ConfigError(
                "lifecycle.max_write_attempts must be greater than 0".to_string(),
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(LicenseError::ConfigError(format!(
                    "logging.level must be one of: trace, debug, info, warn, error. Got '{other}'"
                )));
            }
        }

        Ok(())
    }
}

/// Get the global configuration.
///
/// This loads the configuration on first access and caches it.
/// Returns an error if configuration loading or validation fails.
pub fn get_config() -> LicenseResult<&'static KeywardConfig> {
    if let Some(config) = CONFIG.get() {
        return Ok(config);
    }

    let config = KeywardConfig::load()?;
    config.validate()?;

    // Another thread may have won the race; either value is valid
    Ok(CONFIG.get_or_init(|| config))
}
