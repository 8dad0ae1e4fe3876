//! Configuration for the constrained-device connection layer
//!
//! Loaded once from TOML at startup and consumed by the adapters at
//! construction. Every section and field has a default, so an empty file is
//! a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::data::DEFAULT_LOCATION_ID;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_COAP_PORT: u16 = 5683;
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
pub const MIN_KEEP_ALIVE_SECS: u64 = 5;
pub const DEFAULT_QOS: u8 = 0;
pub const DEFAULT_POLL_CYCLES: u32 = 5;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CdaConfig {
    #[serde(default)]
    pub coap_gateway: CoapGatewaySection,
    #[serde(default)]
    pub mqtt_gateway: MqttGatewaySection,
    #[serde(default)]
    pub constrained_device: ConstrainedDeviceSection,
}

/// Which request/response client implementation to construct
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClientRuntime {
    Blocking,
    #[default]
    EventLoop,
}

/// CoAP gateway section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoapGatewaySection {
    pub host: String,
    pub port: u16,
    /// Send confirmable requests by default
    pub enable_confirmed_msgs: bool,
    pub client_runtime: ClientRuntime,
    /// How long `run` keeps the server up when not interrupted (0 = forever)
    pub listen_timeout_secs: u64,
}

impl Default for CoapGatewaySection {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_COAP_PORT,
            enable_confirmed_msgs: false,
            client_runtime: ClientRuntime::default(),
            listen_timeout_secs: 30,
        }
    }
}

/// MQTT gateway section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqttGatewaySection {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
    /// Quality tier used when a caller passes an invalid one
    pub default_qos: u8,
    /// Generated when absent
    pub client_id: Option<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Bound on waiting for PUBACK/PUBCOMP
    pub ack_timeout_secs: u64,
}

impl Default for MqttGatewaySection {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_MQTT_PORT,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            default_qos: DEFAULT_QOS,
            client_id: None,
            username_env: None,
            password_env: None,
            ack_timeout_secs: 10,
        }
    }
}

impl MqttGatewaySection {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    /// Get MQTT username from environment variable
    pub fn username(&self) -> Option<String> {
        get_env_var_optional(self.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn password(&self) -> Option<String> {
        get_env_var_optional(self.password_env.as_ref())
    }
}

/// Device section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConstrainedDeviceSection {
    /// Poll-cycle count used as response max-age for observable resources
    pub poll_cycles: u32,
    pub location_id: String,
}

impl Default for ConstrainedDeviceSection {
    fn default() -> Self {
        Self {
            poll_cycles: DEFAULT_POLL_CYCLES,
            location_id: DEFAULT_LOCATION_ID.to_string(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize configuration: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CdaConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: CdaConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_host("coap_gateway", &self.coap_gateway.host)?;
        validate_port("coap_gateway", self.coap_gateway.port)?;
        validate_host("mqtt_gateway", &self.mqtt_gateway.host)?;
        validate_port("mqtt_gateway", self.mqtt_gateway.port)?;

        if self.mqtt_gateway.default_qos > 2 {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt_gateway.default_qos must be 0, 1 or 2, got {}",
                self.mqtt_gateway.default_qos
            )));
        }

        if self.mqtt_gateway.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt_gateway.keep_alive_secs must be at least {MIN_KEEP_ALIVE_SECS}, got {}",
                self.mqtt_gateway.keep_alive_secs
            )));
        }

        if self.constrained_device.poll_cycles == 0 {
            return Err(ConfigError::InvalidConfig(
                "constrained_device.poll_cycles must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

fn validate_host(section: &str, host: &str) -> Result<(), ConfigError> {
    if host.trim().is_empty() {
        return Err(ConfigError::InvalidConfig(format!(
            "{section}.host must not be empty"
        )));
    }
    Ok(())
}

fn validate_port(section: &str, port: u16) -> Result<(), ConfigError> {
    if port == 0 {
        return Err(ConfigError::InvalidConfig(format!(
            "{section}.port must not be 0"
        )));
    }
    Ok(())
}

fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}
