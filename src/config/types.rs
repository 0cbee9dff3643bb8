//! Raw configuration types for TOML parsing

use super::*;
use serde::Deserialize;

/// Raw configuration as parsed from TOML
#[derive(Debug, Deserialize, Default)]
pub struct RawConfig {
    pub token: Option<RawTokenConfig>,
    pub password: Option<RawPasswordConfig>,
    pub audit: Option<RawAuditConfig>,
    pub storage: Option<RawStorageConfig>,
    pub network: Option<RawNetworkConfig>,
    pub logging: Option<RawLoggingConfig>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RawTokenConfig {
    pub secret: Option<String>,
    pub ttl_hours: Option<i64>,
}

impl TryFrom<RawTokenConfig> for TokenConfig {
    type Error = ConfigError;

    fn try_from(raw: RawTokenConfig) -> Result<Self, Self::Error> {
        let ttl_hours = raw.ttl_hours.unwrap_or(24);
        if !(1..=24 * 365).contains(&ttl_hours) {
            return Err(ConfigError::Invalid(format!(
                "token.ttl_hours must be between 1 and 8760, got {}",
                ttl_hours
            )));
        }

        Ok(Self {
            secret: raw.secret.filter(|s| !s.is_empty()).map(SecretString::from),
            ttl: Duration::hours(ttl_hours),
        })
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct RawPasswordConfig {
    pub bcrypt_cost: Option<u32>,
}

impl TryFrom<RawPasswordConfig> for PasswordConfig {
    type Error = ConfigError;

    fn try_from(raw: RawPasswordConfig) -> Result<Self, Self::Error> {
        let cost = raw.bcrypt_cost.unwrap_or(12);
        if !(crate::auth::MIN_BCRYPT_COST..=crate::auth::MAX_BCRYPT_COST).contains(&cost) {
            return Err(ConfigError::Invalid(format!(
                "password.bcrypt_cost must be between {} and {}, got {}",
                crate::auth::MIN_BCRYPT_COST,
                crate::auth::MAX_BCRYPT_COST,
                cost
            )));
        }

        Ok(Self { bcrypt_cost: cost })
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct RawAuditConfig {
    pub default_page_size: Option<u64>,
    pub max_page_size: Option<u64>,
    pub failed_login_threshold: Option<u64>,
    pub high_severity_threshold: Option<u64>,
    pub failed_login_window_hours: Option<i64>,
    pub resource_spread_threshold: Option<u64>,
    pub resource_spread_window_minutes: Option<i64>,
}

impl TryFrom<RawAuditConfig> for AuditConfig {
    type Error = ConfigError;

    fn try_from(raw: RawAuditConfig) -> Result<Self, Self::Error> {
        let defaults = AuditConfig::default();

        let config = Self {
            default_page_size: raw.default_page_size.unwrap_or(defaults.default_page_size),
            max_page_size: raw.max_page_size.unwrap_or(defaults.max_page_size),
            failed_login_threshold: raw
                .failed_login_threshold
                .unwrap_or(defaults.failed_login_threshold),
            high_severity_threshold: raw
                .high_severity_threshold
                .unwrap_or(defaults.high_severity_threshold),
            failed_login_window: match raw.failed_login_window_hours {
                Some(hours) => window(hours, MAX_WINDOW_HOURS, Duration::try_hours)
                    .ok_or_else(|| {
                        ConfigError::Invalid(format!(
                            "audit.failed_login_window_hours must be between 1 and {}, got {}",
                            MAX_WINDOW_HOURS, hours
                        ))
                    })?,
                None => defaults.failed_login_window,
            },
            resource_spread_threshold: raw
                .resource_spread_threshold
                .unwrap_or(defaults.resource_spread_threshold),
            resource_spread_window: match raw.resource_spread_window_minutes {
                Some(minutes) => window(minutes, MAX_WINDOW_HOURS * 60, Duration::try_minutes)
                    .ok_or_else(|| {
                        ConfigError::Invalid(format!(
                            "audit.resource_spread_window_minutes must be between 1 and {}, got {}",
                            MAX_WINDOW_HOURS * 60,
                            minutes
                        ))
                    })?,
                None => defaults.resource_spread_window,
            },
        };

        if config.default_page_size == 0 || config.default_page_size > config.max_page_size {
            return Err(ConfigError::Invalid(
                "audit.default_page_size must be between 1 and audit.max_page_size".to_string(),
            ));
        }
        if config.failed_login_threshold == 0
            || config.high_severity_threshold < config.failed_login_threshold
        {
            return Err(ConfigError::Invalid(
                "audit.high_severity_threshold must be at least audit.failed_login_threshold"
                    .to_string(),
            ));
        }
        if config.resource_spread_threshold == 0 {
            return Err(ConfigError::Invalid(
                "audit.resource_spread_threshold must be positive".to_string(),
            ));
        }
        if config.failed_login_window <= Duration::zero()
            || config.resource_spread_window <= Duration::zero()
        {
            return Err(ConfigError::Invalid(
                "audit windows must be positive".to_string(),
            ));
        }

        Ok(config)
    }
}

/// Longest accepted audit window, one year
const MAX_WINDOW_HOURS: i64 = 24 * 365;

fn window(value: i64, max: i64, build: fn(i64) -> Option<Duration>) -> Option<Duration> {
    if (1..=max).contains(&value) {
        build(value)
    } else {
        None
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct RawStorageConfig {
    pub backend: Option<String>,
    pub file: Option<RawFileStorageConfig>,
    pub postgres: Option<RawPostgresConfig>,
}

impl TryFrom<RawStorageConfig> for StorageConfig {
    type Error = ConfigError;

    fn try_from(raw: RawStorageConfig) -> Result<Self, Self::Error> {
        let backend = match raw.backend.as_deref() {
            Some("file") | None => StorageBackendType::File,
            Some("memory") => StorageBackendType::Memory,
            Some("postgres") => StorageBackendType::Postgres,
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "Unknown storage backend: {}",
                    other
                )))
            }
        };

        let file_path = raw
            .file
            .and_then(|f| f.path)
            .map(|p| expand_home(&p))
            .or_else(|| Some(Config::default_storage_path()));

        let (database_url, max_connections) = match raw.postgres {
            Some(pg) => (pg.url.map(SecretString::from), pg.max_connections.unwrap_or(10)),
            None => (None, 10),
        };

        Ok(Self {
            backend,
            file_path,
            database_url,
            max_connections,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct RawFileStorageConfig {
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawPostgresConfig {
    pub url: Option<String>,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RawNetworkConfig {
    pub trusted_proxies: Option<Vec<String>>,
}

impl TryFrom<RawNetworkConfig> for NetworkConfig {
    type Error = ConfigError;

    fn try_from(raw: RawNetworkConfig) -> Result<Self, Self::Error> {
        let trusted_proxies = raw
            .trusted_proxies
            .unwrap_or_default()
            .iter()
            .map(|addr| {
                addr.trim().parse::<IpAddr>().map_err(|_| {
                    ConfigError::Invalid(format!(
                        "network.trusted_proxies: invalid IP address '{}'",
                        addr
                    ))
                })
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { trusted_proxies })
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct RawLoggingConfig {
    pub level: Option<String>,
    pub format: Option<String>,
}

impl From<RawLoggingConfig> for LoggingConfig {
    fn from(raw: RawLoggingConfig) -> Self {
        Self {
            level: raw.level.unwrap_or_else(|| "info".to_string()),
            format: match raw.format.as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        }
    }
}

// Expand ~ to home directory
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}
