//! `mqtt:` section of `configuration.yaml`

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::{MqttError, MqttResult};

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_KEEPALIVE: u64 = 60;
pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";

/// Broker connection and discovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Keepalive in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,

    #[serde(default = "default_discovery")]
    pub discovery: bool,

    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_client_id() -> String {
    format!("ha-{}", ulid::Ulid::new().to_string().to_lowercase())
}

fn default_keepalive() -> u64 {
    DEFAULT_KEEPALIVE
}

fn default_discovery() -> bool {
    true
}

fn default_discovery_prefix() -> String {
    DEFAULT_DISCOVERY_PREFIX.to_string()
}

impl MqttConfig {
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            port: DEFAULT_PORT,
            client_id: default_client_id(),
            username: None,
            password: None,
            keepalive: DEFAULT_KEEPALIVE,
            discovery: true,
            discovery_prefix: default_discovery_prefix(),
        }
    }

    /// Read the `mqtt:` section of a configuration file
    pub async fn load(path: impl AsRef<Path>) -> MqttResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> MqttResult<Self> {
        let yaml: Value = serde_yaml::from_str(content)?;
        Self::from_yaml(&yaml)
    }

    pub fn from_yaml(yaml: &Value) -> MqttResult<Self> {
        let section = yaml
            .as_mapping()
            .and_then(|root| root.get("mqtt"))
            .cloned()
            .ok_or_else(|| MqttError::Config("missing `mqtt` section".to_string()))?;

        let config: MqttConfig = serde_yaml::from_value(section)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> MqttResult<()> {
        if self.broker.trim().is_empty() {
            return Err(MqttError::Config("broker must not be empty".to_string()));
        }
        validate_discovery_prefix(&self.discovery_prefix)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive)
    }
}

/// The prefix is the root of a subscription filter, so it must be a
/// non-empty topic without wildcards
pub fn validate_discovery_prefix(prefix: &str) -> MqttResult<()> {
    if prefix.is_empty() {
        return Err(MqttError::Config(
            "discovery_prefix must not be empty".to_string(),
        ));
    }
    if prefix.contains(['+', '#']) {
        return Err(MqttError::Config(format!(
            "discovery_prefix must not contain wildcards: {prefix}"
        )));
    }
    Ok(())
}
