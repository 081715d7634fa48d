//! Configuration Module
//!
//! Provides TOML-based configuration for the response router with support for:
//! - Logging level
//! - HTTP API bind address
//! - Broker connection and reconnect behaviour
//! - Outbound queue bound
//! - Environment variable overrides (ROUTER__* prefix)
//! - The legacy deployment variables (MSG_BROKER_ADDR, SEND_TOPIC, API_PORT, ...)

use std::net::SocketAddr;
use std::path::Path;

use config::{builder::DefaultState, ConfigBuilder, Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use broker::BrokerConfig;
pub use metrics::MetricsConfig;

mod broker;
mod metrics;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// HTTP API configuration
    pub api: ApiConfig,
    /// Broker connection
    pub broker: BrokerConfig,
    /// Outbound queue
    pub queue: QueueConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// TCP bind address
    pub bind: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

/// Outbound queue configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queued commands (0 = unbounded)
    pub max_messages: usize,
}

/// Deployment variables understood for compatibility, with the key each one
/// maps to. They replace built-in defaults only; the config file and
/// `ROUTER__*` variables take precedence.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("MSG_BROKER_ADDR", "broker.address"),
    ("MSG_BROKER_USER", "broker.username"),
    ("MSG_BROKER_PASSWORD", "broker.password"),
    ("SEND_TOPIC", "broker.topic"),
    ("LOG_LEVEL", "log.level"),
];

fn apply_legacy_env(
    mut builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    for (var, key) in LEGACY_ENV {
        if let Ok(value) = std::env::var(var) {
            builder = builder.set_default(*key, value)?;
        }
    }
    if let Ok(port) = std::env::var("API_PORT") {
        let port: u16 = port.trim().parse().map_err(|_| {
            ConfigError::Validation(format!("API_PORT is not a valid port: {:?}", port))
        })?;
        builder = builder.set_default("api.bind", format!("0.0.0.0:{}", port))?;
    }
    Ok(builder)
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports three forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `ROUTER__` prefix with double underscores for nesting:
    ///    - `ROUTER__API__BIND=0.0.0.0:9000` overrides `api.bind`
    ///    - `ROUTER__BROKER__TOPIC=cars` overrides `broker.topic`
    /// 3. Legacy deployment variables, which only replace the defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let defaults = BrokerConfig::default();
        let builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("api.bind", "0.0.0.0:8080")?
            .set_default("broker.address", defaults.address)?
            .set_default("broker.topic", defaults.topic)?
            .set_default("broker.client_id", defaults.client_id)?
            .set_default("broker.keepalive", defaults.keepalive as i64)?
            .set_default("broker.connect_timeout", defaults.connect_timeout as i64)?
            .set_default("broker.min_reconnect_delay", defaults.min_reconnect_delay as i64)?
            .set_default("broker.max_reconnect_delay", defaults.max_reconnect_delay as i64)?
            .set_default("broker.max_inflight", defaults.max_inflight as i64)?
            .set_default("broker.target_property", defaults.target_property)?
            .set_default("broker.shutdown_grace", defaults.shutdown_grace as i64)?
            .set_default("broker.max_packet_size", defaults.max_packet_size as i64)?
            .set_default("queue.max_messages", 0)?
            .set_default("metrics.enabled", true)?;
        let mut builder = apply_legacy_env(builder)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (ROUTER__BROKER__ADDRESS, etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("ROUTER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let broker = &self.broker;
        if broker.address.trim().is_empty() {
            return Err(ConfigError::Validation(
                "broker.address must not be empty".to_string(),
            ));
        }
        if broker.topic.is_empty() {
            return Err(ConfigError::Validation(
                "broker.topic must not be empty".to_string(),
            ));
        }
        if broker.topic.contains(['+', '#']) {
            return Err(ConfigError::Validation(format!(
                "broker.topic '{}' must not contain wildcards",
                broker.topic
            )));
        }
        if broker.target_property.is_empty() {
            return Err(ConfigError::Validation(
                "broker.target_property must not be empty".to_string(),
            ));
        }
        if broker.min_reconnect_delay < 1 {
            return Err(ConfigError::Validation(
                "broker.min_reconnect_delay must be at least 1 second".to_string(),
            ));
        }
        if broker.max_reconnect_delay < broker.min_reconnect_delay {
            return Err(ConfigError::Validation(format!(
                "broker.max_reconnect_delay ({}) must not be below min_reconnect_delay ({})",
                broker.max_reconnect_delay, broker.min_reconnect_delay
            )));
        }
        if broker.max_inflight == 0 {
            return Err(ConfigError::Validation(
                "broker.max_inflight must be at least 1".to_string(),
            ));
        }
        if broker.password.is_some() && broker.username.is_none() {
            return Err(ConfigError::Validation(
                "broker.password requires broker.username".to_string(),
            ));
        }
        Ok(())
    }
}
