//! MQTT Discovery
//!
//! Devices announce themselves by publishing retained JSON configs below a
//! discovery prefix. This crate turns those messages into entities:
//!
//! - [`topic`] - parse `<prefix>/<component>/[<node_id>/]<object_id>/config`
//! - [`payload`] - expand abbreviations, resolve `~`, attach discovery metadata
//! - [`DiscoveryEngine`] - new/update/removal decisions, per-hash ordering,
//!   one-time platform setup, start/stop
//! - [`IntegrationDiscovery`] - config flows started from integration topics
//! - [`entity`], [`tag`], [`device_trigger`] - the platforms listening to
//!   discovery signals
//! - [`cleanup`] - removal of devices nothing refers to anymore
//!
//! The broker is reached through [`MqttTransport`]; [`MqttClient`] is the
//! `rumqttc` implementation.

pub mod abbreviations;
pub mod cleanup;
pub mod client;
pub mod config;
pub mod device_trigger;
pub mod discovery;
pub mod entity;
pub mod error;
pub mod integration_bridge;
pub mod payload;
pub mod router;
pub mod tag;
pub mod topic;

mod state;

pub use client::{MqttClient, MqttTransport, Subscription};
pub use config::{validate_discovery_prefix, MqttConfig};
pub use discovery::{
    discovery_done_signal, discovery_new_signal, discovery_updated_signal, platform_setup_strategy,
    DiscoveryEngine, PlatformSetupStrategy, RouteOutcome, INTEGRATION,
};
pub use entity::{
    device_info_from_config, register_platforms, setup_entry_helper, ConfigEntity,
    DiscoveryEntity, EntityContext, EntityFactory, MqttPlatform,
};
pub use error::{MqttError, MqttResult};
pub use integration_bridge::IntegrationDiscovery;
pub use payload::{normalize_payload, DiscoveryMetadata, NormalizedPayload};
pub use router::{message_callback, topic_matches, MessageCallback, ReceiveMessage, TopicRouter};
pub use topic::{parse_discovery_topic, DiscoveryHash, DiscoveryTopic, SUPPORTED_COMPONENTS};

pub use rumqttc::QoS;
