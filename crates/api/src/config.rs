//! Application configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::outbound::ProviderConfig;
use crate::websocket::HubConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database; the in-memory store is used when unset
    pub database_url: Option<String>,
    pub database_max_connections: u32,

    // Identity
    pub default_country_code: String,

    // Real-time
    pub heartbeat_interval: Duration,
    pub outbound_queue_capacity: usize,
    pub catchup_limit: usize,
    pub typing_ttl: Duration,

    // Provider; replies are only logged unless all three are set
    pub provider_api_url: Option<String>,
    pub provider_api_key: Option<String>,
    pub provider_instance: Option<String>,
    pub outbound_timeout: Duration,

    // Logging
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            database_url: None,
            database_max_connections: 10,
            default_country_code: "55".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            outbound_queue_capacity: 256,
            catchup_limit: 50,
            typing_ttl: Duration::from_secs(5),
            provider_api_url: None,
            provider_api_key: None,
            provider_instance: None,
            outbound_timeout: Duration::from_millis(10_000),
            log_json: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let default_country_code =
            env::var("DEFAULT_COUNTRY_CODE").unwrap_or(defaults.default_country_code);
        if default_country_code.is_empty()
            || !default_country_code.chars().all(|c| c.is_ascii_digit())
        {
            return Err(ConfigError::Invalid {
                name: "DEFAULT_COUNTRY_CODE",
                value: default_country_code,
            });
        }

        let heartbeat_secs: u64 = parse_var("WS_HEARTBEAT_INTERVAL_SECS", 30)?;
        if heartbeat_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "WS_HEARTBEAT_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or(defaults.bind_address),

            // Database
            database_url: non_empty_var("DATABASE_URL"),
            database_max_connections: parse_var(
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,

            default_country_code,

            // Real-time
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            outbound_queue_capacity: parse_var(
                "WS_OUTBOUND_QUEUE_CAPACITY",
                defaults.outbound_queue_capacity,
            )?
            .max(1),
            catchup_limit: parse_var("CATCHUP_LIMIT", defaults.catchup_limit)?.max(1),
            typing_ttl: Duration::from_secs(parse_var("TYPING_TTL_SECS", 5)?),

            // Provider
            provider_api_url: non_empty_var("PROVIDER_API_URL"),
            provider_api_key: non_empty_var("PROVIDER_API_KEY"),
            provider_instance: non_empty_var("PROVIDER_INSTANCE"),
            outbound_timeout: Duration::from_millis(parse_var("OUTBOUND_TIMEOUT_MS", 10_000)?),

            // Logging
            log_json: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }

    /// Provider settings, when the outbound sender is fully configured.
    pub fn provider(&self) -> Option<ProviderConfig> {
        Some(ProviderConfig {
            base_url: self.provider_api_url.clone()?,
            api_key: self.provider_api_key.clone()?,
            instance: self.provider_instance.clone()?,
            timeout: self.outbound_timeout,
        })
    }

    pub fn hub(&self) -> HubConfig {
        HubConfig {
            outbound_queue_capacity: self.outbound_queue_capacity,
            catchup_limit: self.catchup_limit,
            heartbeat_interval: self.heartbeat_interval,
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "BIND_ADDRESS",
        "DATABASE_URL",
        "DATABASE_MAX_CONNECTIONS",
        "DEFAULT_COUNTRY_CODE",
        "WS_HEARTBEAT_INTERVAL_SECS",
        "WS_OUTBOUND_QUEUE_CAPACITY",
        "CATCHUP_LIMIT",
        "TYPING_TTL_SECS",
        "PROVIDER_API_URL",
        "PROVIDER_API_KEY",
        "PROVIDER_INSTANCE",
        "OUTBOUND_TIMEOUT_MS",
        "LOG_FORMAT",
    ];

    /// Helper to clear env vars before and after tests
    fn cleanup_config() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_env() {
        cleanup_config();
        let config = Config::from_env().unwrap();

        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert!(config.database_url.is_none());
        assert_eq!(config.default_country_code, "55");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.catchup_limit, 50);
        assert_eq!(config.typing_ttl, Duration::from_secs(5));
        assert!(config.provider().is_none());
        assert!(!config.log_json);
    }

    #[test]
    #[serial]
    fn test_overrides_are_applied() {
        cleanup_config();
        env::set_var("DATABASE_URL", "postgres://localhost/relaydesk");
        env::set_var("WS_OUTBOUND_QUEUE_CAPACITY", "16");
        env::set_var("DEFAULT_COUNTRY_CODE", "1");
        env::set_var("LOG_FORMAT", "JSON");

        let config = Config::from_env().unwrap();
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/relaydesk"));
        assert_eq!(config.hub().outbound_queue_capacity, 16);
        assert_eq!(config.default_country_code, "1");
        assert!(config.log_json);

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_provider_requires_all_settings() {
        cleanup_config();
        env::set_var("PROVIDER_API_URL", "http://evolution:8080");
        env::set_var("PROVIDER_API_KEY", "key");
        assert!(Config::from_env().unwrap().provider().is_none());

        env::set_var("PROVIDER_INSTANCE", "support");
        let provider = Config::from_env().unwrap().provider().unwrap();
        assert_eq!(provider.instance, "support");
        assert_eq!(provider.timeout, Duration::from_millis(10_000));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_invalid_values_are_rejected() {
        cleanup_config();
        env::set_var("CATCHUP_LIMIT", "lots");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid { name: "CATCHUP_LIMIT", .. })
        ));

        cleanup_config();
        env::set_var("DEFAULT_COUNTRY_CODE", "+55");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid { name: "DEFAULT_COUNTRY_CODE", .. })
        ));

        cleanup_config();
        env::set_var("WS_HEARTBEAT_INTERVAL_SECS", "0");
        assert!(Config::from_env().is_err());

        cleanup_config();
    }
}
