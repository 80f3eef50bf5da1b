//! Configuration file parsing and structures.
//!
//! direktived uses TOML for declarative configuration. Secrets that are
//! generated rather than user-supplied (encryption key, webhook secret) live
//! in the persisted entry state instead, see [`crate::entry`].

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use tracing_subscriber::filter::LevelFilter;

/// Top-level configuration structure
#[derive(Debug, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub homeassistant: HomeAssistantConfig,
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Entity ids whose state changes are forwarded to the cloud.
    /// `sun.sun` is always tracked in addition to this list.
    #[serde(default)]
    pub entities: Vec<String>,
}

#[derive(Debug, Default, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

/// Direktive.ai cloud API configuration
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the cloud service
    #[serde(default = "default_api_base_url")]
    pub base_url: String,

    /// Per-installation API key, issued by the cloud service
    pub api_key: String,
}

fn default_api_base_url() -> String {
    "https://api.direktive.ai".to_string()
}

/// Home Assistant instance configuration
#[derive(Debug, Deserialize)]
pub struct HomeAssistantConfig {
    /// Base URL of the Home Assistant instance (e.g. "http://homeassistant.local:8123")
    pub base_url: String,

    /// Long-lived access token for the REST API
    pub access_token: String,

    /// Country code reported during webhook registration
    #[serde(default)]
    pub country: Option<String>,

    /// IANA timezone identifier (e.g. "Europe/Oslo")
    #[serde(default)]
    pub timezone: Option<String>,

    /// Friendly location name
    #[serde(default)]
    pub location_name: Option<String>,
}

/// MQTT connection and topic configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// MQTT broker hostname or IP address
    pub broker: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Topic carrying `{entity_id, state, attributes}` state-change events
    #[serde(default = "default_state_topic")]
    pub state_topic: String,

    /// Topic carrying scenario trigger payloads from the vision addon
    #[serde(default = "default_scenario_topic")]
    pub scenario_trigger_topic: String,

    /// Home Assistant MQTT discovery prefix for the directive sensor
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_client_id() -> String {
    "direktived".to_string()
}

fn default_state_topic() -> String {
    "direktive/state_changed".to_string()
}

fn default_scenario_topic() -> String {
    "direktive-vision-ha-addon/scenario_triggers".to_string()
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

/// HTTP server (webhook + WebSocket command API) configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8321
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.api.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid("api.api_key must not be empty"));
        }
        if self.homeassistant.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "homeassistant.base_url must not be empty",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(std::path::PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
