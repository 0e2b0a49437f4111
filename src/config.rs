//! Device configuration loaded from TOML
//!
//! ```toml
//! [device]
//! domain_key = "ABCDEF"
//! api_key_env = "DEVICE_API_KEY"
//! device_id = "KitchenCamera"
//! device_model = "RaspCAM"
//! firmware_version = "1.0.0"
//!
//! [mqtt]
//! broker_url = "tcp://mqtt.example.io:1883"
//! heartbeat_ms = 30000
//! auto_reconnect = true
//! ```
//!
//! The API key itself never lives in the file; only the name of the
//! environment variable holding it does.

use crate::protocol::{DeviceIdentity, ValidationError};
use crate::transport::mqtt::parse_broker_url;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main device configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub device: DeviceSection,
    pub mqtt: MqttSection,
}

/// Who the device is
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    pub domain_key: String,
    /// Environment variable containing the platform API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    pub device_id: String,
    pub device_model: String,
    pub firmware_version: String,
}

fn default_api_key_env() -> String {
    "DEVICE_API_KEY".to_string()
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL with scheme (tcp, mqtt, ssl, mqtts) and optional port
    pub broker_url: String,
    /// Longest the session may stay silent before a PING (default: 30000)
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,
}

fn default_heartbeat_ms() -> u64 {
    30_000
}

fn default_auto_reconnect() -> bool {
    true
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid device identity: {0}")]
    InvalidIdentity(#[from] ValidationError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DeviceConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: DeviceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.identity().validate()?;

        if self.device.api_key_env.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "api_key_env cannot be empty".to_string(),
            ));
        }

        parse_broker_url(&self.mqtt.broker_url)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        if self.mqtt.heartbeat_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "heartbeat_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(
            &self.device.domain_key,
            &self.device.device_id,
            &self.device.device_model,
            &self.device.firmware_version,
        )
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.mqtt.heartbeat_ms)
    }

    /// Read the API key from the configured environment variable
    pub fn api_key(&self) -> Result<String, ConfigError> {
        std::env::var(&self.device.api_key_env)
            .map_err(|_| ConfigError::EnvVarNotFound(self.device.api_key_env.clone()))
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
domain_key = "DOMAIN"
api_key_env = "CLOUDLINK_TEST_API_KEY"
device_id = "KitchenCamera"
device_model = "RaspCAM"
firmware_version = "1.0.0"

[mqtt]
broker_url = "tcp://localhost:1883"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
