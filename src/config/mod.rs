//! Configuration system for medgate
//!
//! Loads configuration from TOML files with environment overrides for secrets.

mod types;

pub use types::*;

use crate::audit::AnomalyThresholds;
use chrono::Duration;
use secrecy::SecretString;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

/// Environment variable holding the token signing secret
pub const ENV_TOKEN_SECRET: &str = "MEDGATE_TOKEN_SECRET";
/// Environment variable holding the PostgreSQL connection string
pub const ENV_DATABASE_URL: &str = "MEDGATE_DATABASE_URL";

/// Minimum accepted length of the token signing secret, in bytes
pub const MIN_SECRET_LEN: usize = 32;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main medgate configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Session token settings
    pub token: TokenConfig,
    /// Password hashing settings
    pub password: PasswordConfig,
    /// Audit query and anomaly detection settings
    pub audit: AuditConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Client address resolution
    pub network: NetworkConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file and apply environment overrides
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).await?;
        Self::parse(&content)?.with_env_overrides()
    }

    /// Load configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        Self::from_raw(raw)
    }

    /// Convert from raw TOML config to validated config
    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            token: raw.token.unwrap_or_default().try_into()?,
            password: raw.password.unwrap_or_default().try_into()?,
            audit: raw.audit.unwrap_or_default().try_into()?,
            storage: raw.storage.unwrap_or_default().try_into()?,
            network: raw.network.unwrap_or_default().try_into()?,
            logging: raw.logging.unwrap_or_default().into(),
        })
    }

    /// Replace secrets with values from the process environment when set
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(secret) = std::env::var(ENV_TOKEN_SECRET) {
            if !secret.is_empty() {
                self.token.secret = Some(SecretString::from(secret));
            }
        }

        if let Ok(url) = std::env::var(ENV_DATABASE_URL) {
            if !url.is_empty() {
                self.storage.database_url = Some(SecretString::from(url));
            }
        }

        Ok(self)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            token: TokenConfig::default(),
            password: PasswordConfig::default(),
            audit: AuditConfig::default(),
            storage: StorageConfig::default(),
            network: NetworkConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("medgate")
            .join("config.toml")
    }

    /// Get the default storage path
    pub fn default_storage_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("medgate")
            .join("medgate.json")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Session token configuration
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// HMAC signing secret; at least [`MIN_SECRET_LEN`] bytes
    pub secret: Option<SecretString>,
    /// Lifetime of an issued token
    pub ttl: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: None,
            ttl: Duration::hours(24),
        }
    }
}

/// Password hashing configuration
#[derive(Debug, Clone)]
pub struct PasswordConfig {
    /// bcrypt work factor
    pub bcrypt_cost: u32,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self { bcrypt_cost: 12 }
    }
}

/// Audit query and anomaly detection configuration
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Page size used when a query does not ask for one
    pub default_page_size: u64,
    /// Upper bound on any requested page size
    pub max_page_size: u64,
    /// Failed logins from one address that raise an alert
    pub failed_login_threshold: u64,
    /// Failed logins from one address that make the alert high severity
    pub high_severity_threshold: u64,
    /// Window over which failed logins are counted
    pub failed_login_window: Duration,
    /// Distinct resources one user may touch before the access pattern is flagged
    pub resource_spread_threshold: u64,
    /// Window over which distinct resources are counted
    pub resource_spread_window: Duration,
}

impl AuditConfig {
    /// Thresholds handed to the anomaly detector
    pub fn thresholds(&self) -> AnomalyThresholds {
        AnomalyThresholds {
            failed_login_threshold: self.failed_login_threshold,
            high_severity_threshold: self.high_severity_threshold,
            failed_login_window: self.failed_login_window,
            resource_spread_threshold: self.resource_spread_threshold,
            resource_spread_window: self.resource_spread_window,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            default_page_size: 50,
            max_page_size: 500,
            failed_login_threshold: 3,
            high_severity_threshold: 5,
            failed_login_window: Duration::hours(24),
            resource_spread_threshold: 5,
            resource_spread_window: Duration::hours(1),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Storage backend type
    pub backend: StorageBackendType,
    /// Path for file storage
    pub file_path: Option<PathBuf>,
    /// Connection string for the PostgreSQL backend
    pub database_url: Option<SecretString>,
    /// Pool size for the PostgreSQL backend
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendType::File,
            file_path: Some(Config::default_storage_path()),
            database_url: None,
            max_connections: 10,
        }
    }
}

/// Storage backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackendType {
    /// Volatile in-process store
    Memory,
    /// JSON snapshot on local disk
    File,
    /// PostgreSQL database (requires the `postgres` feature)
    Postgres,
}

/// How the client address of a request is determined
#[derive(Debug, Clone, Default)]
pub struct NetworkConfig {
    /// Peers allowed to report the client address through `X-Forwarded-For`
    /// or `X-Real-IP`. Empty means proxy headers are never read.
    pub trusted_proxies: Vec<IpAddr>,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Format: "json" or "pretty"
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format
    Pretty,
    /// JSON format
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(
            r#"
            [token]
            secret = "0123456789abcdef0123456789abcdef"
            ttl_hours = 8

            [password]
            bcrypt_cost = 10

            [audit]
            default_page_size = 20
            failed_login_threshold = 4
            high_severity_threshold = 6
            resource_spread_window_minutes = 30

            [storage]
            backend = "memory"

            [network]
            trusted_proxies = ["10.0.0.1", "::1"]

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.token.secret.as_ref().map(|s| s.expose_secret().len()),
            Some(32)
        );
        assert_eq!(config.token.ttl, Duration::hours(8));
        assert_eq!(config.password.bcrypt_cost, 10);
        assert_eq!(config.audit.default_page_size, 20);
        assert_eq!(config.audit.max_page_size, 500);
        assert_eq!(config.audit.failed_login_threshold, 4);
        assert_eq!(config.audit.resource_spread_window, Duration::minutes(30));
        assert_eq!(config.storage.backend, StorageBackendType::Memory);
        assert_eq!(
            config.network.trusted_proxies,
            vec!["10.0.0.1".parse::<IpAddr>().unwrap(), "::1".parse().unwrap()]
        );
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_defaults_from_empty_document() {
        let config = Config::parse("").unwrap();

        assert!(config.token.secret.is_none());
        assert_eq!(config.token.ttl, Duration::hours(24));
        assert_eq!(config.password.bcrypt_cost, 12);
        assert_eq!(config.audit.failed_login_threshold, 3);
        assert_eq!(config.audit.high_severity_threshold, 5);
        assert_eq!(config.storage.backend, StorageBackendType::File);
        assert!(config.network.trusted_proxies.is_empty());
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            Config::parse("[storage]\nbackend = \"vault\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::parse("[password]\nbcrypt_cost = 2"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::parse("[token]\nttl_hours = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::parse("[audit]\nfailed_login_threshold = 6\nhigh_severity_threshold = 5"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::parse("[network]\ntrusted_proxies = [\"10.0.0.300\"]"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::parse("[token"),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_audit_windows_are_bounded() {
        assert!(matches!(
            Config::parse("[audit]\nfailed_login_window_hours = 9223372036854775807"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::parse("[audit]\nresource_spread_window_minutes = -5"),
            Err(ConfigError::Invalid(_))
        ));

        let config = Config::parse(
            "[audit]\nfailed_login_window_hours = 8760\nresource_spread_window_minutes = 1440",
        )
        .unwrap();
        assert_eq!(config.audit.failed_login_window, Duration::hours(8760));
        assert_eq!(config.audit.resource_spread_window, Duration::minutes(1440));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let result = Config::load("/nonexistent/medgate/config.toml").await;
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}
