use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::rooms::RetryPolicy;

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Port of the HTTP API and the presence channel
    #[serde(default = "default_port")]
    pub port: u16,

    /// Port of the document sync channel
    #[serde(default = "default_sync_port")]
    pub sync_port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins, comma separated
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Database URL
    pub db_url: Option<String>,

    /// Quiet period after the last edit before a room is saved
    #[serde(default = "default_save_debounce_ms")]
    pub save_debounce_ms: u64,

    /// Attempts per storage operation
    #[serde(default = "default_db_max_retries")]
    pub db_max_retries: u32,

    /// Base delay of the linear retry backoff
    #[serde(default = "default_db_retry_delay_ms")]
    pub db_retry_delay_ms: u64,

    /// Close rooms without connections after this long; 0 keeps them forever
    #[serde(default = "default_idle_room_timeout_secs")]
    pub idle_room_timeout_secs: u64,

    #[serde(default = "default_idle_sweep_interval_secs")]
    pub idle_sweep_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        // Load from environment variables using envy
        Self::from_vars(std::env::vars())
    }

    /// Build the configuration from key/value pairs. Logging is left to the
    /// caller, which may not have a subscriber yet.
    fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::from_iter::<_, Config>(vars).map_err(ConfigError::EnvError)
    }

    /// Get the full address of the API / presence server
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get the full address of the sync server
    pub fn sync_address(&self) -> String {
        format!("{}:{}", self.host, self.sync_port)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }

    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.db_max_retries,
            base_delay: Duration::from_millis(self.db_retry_delay_ms),
        }
    }

    /// Idle timeout for rooms, `None` when eviction is disabled
    pub fn idle_room_timeout(&self) -> Option<Duration> {
        (self.idle_room_timeout_secs > 0).then(|| Duration::from_secs(self.idle_room_timeout_secs))
    }

    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.idle_sweep_interval_secs.max(1))
    }

    /// Parsed CORS origins, empty when none are configured
    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            sync_port: default_sync_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            cors_origins: None,
            db_url: None,
            save_debounce_ms: default_save_debounce_ms(),
            db_max_retries: default_db_max_retries(),
            db_retry_delay_ms: default_db_retry_delay_ms(),
            idle_room_timeout_secs: default_idle_room_timeout_secs(),
            idle_sweep_interval_secs: default_idle_sweep_interval_secs(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    EnvError(envy::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EnvError(e) => write!(f, "Environment variable error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3001
}

fn default_sync_port() -> u16 {
    1234
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_save_debounce_ms() -> u64 {
    2500
}

fn default_db_max_retries() -> u32 {
    3
}

fn default_db_retry_delay_ms() -> u64 {
    1000
}

fn default_idle_room_timeout_secs() -> u64 {
    300
}

fn default_idle_sweep_interval_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.save_debounce(), Duration::from_millis(2500));
        assert_eq!(config.retry_policy().max_attempts, 3);
        assert_eq!(config.retry_policy().base_delay, Duration::from_millis(1000));
        assert_eq!(config.idle_room_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(config.server_address(), "0.0.0.0:3001");
        assert_eq!(config.sync_address(), "0.0.0.0:1234");
        assert!(config.is_development());
    }

    #[test]
    fn vars_override_defaults() {
        let config = Config::from_vars(vec![
            ("SYNC_PORT".to_string(), "4000".to_string()),
            ("DB_MAX_RETRIES".to_string(), "5".to_string()),
        ])
        .unwrap();
        assert_eq!(config.sync_port, 4000);
        assert_eq!(config.retry_policy().max_attempts, 5);
        assert_eq!(config.port, 3001);
    }

    #[test]
    fn malformed_var_is_reported_as_error() {
        let err = Config::from_vars(vec![("PORT".to_string(), "not-a-port".to_string())]).unwrap_err();
        assert!(err.to_string().starts_with("Environment variable error"));
    }

    #[test]
    fn zero_idle_timeout_disables_eviction() {
        let config = Config {
            idle_room_timeout_secs: 0,
            ..Config::default()
        };
        assert_eq!(config.idle_room_timeout(), None);
    }

    #[test]
    fn cors_origins_are_split_and_trimmed() {
        let config = Config {
            cors_origins: Some("http://localhost:5173, http://localhost:3000,".to_string()),
            ..Config::default()
        };
        assert_eq!(
            config.cors_origin_list(),
            vec!["http://localhost:5173".to_string(), "http://localhost:3000".to_string()]
        );
    }
}
