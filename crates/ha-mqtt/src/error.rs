use ha_config_entries::FlowError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Invalid MQTT configuration: {0}")]
    Config(String),

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Invalid discovery payload: {0}")]
    InvalidPayload(String),

    #[error("Platform setup failed for {component}: {reason}")]
    PlatformSetup { component: String, reason: String },

    #[error("No trigger {discovery_id} on device {device_id}")]
    TriggerNotFound {
        device_id: String,
        discovery_id: String,
    },

    #[error("Discovery is already running")]
    AlreadyStarted,

    #[error(transparent)]
    Flow(#[from] FlowError),
}

pub type MqttResult<T> = Result<T, MqttError>;
