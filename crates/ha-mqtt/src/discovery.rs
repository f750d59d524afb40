//! MQTT discovery engine
//!
//! Devices announce entities by publishing a retained JSON config to
//! `<prefix>/<component>/[<node_id>/]<object_id>/config`, and retract them
//! by publishing an empty payload to the same topic.
//!
//! For every discovery hash the engine decides whether a payload is a new
//! entity, an update or a removal, sets up the component's platform the
//! first time the component is seen, and broadcasts the result on named
//! signals that platforms listen to:
//!
//! - `mqtt_discovery_new_{component}_mqtt`: a new entity
//! - `mqtt_discovery_updated_{component}_{discovery_id}`: new config for a
//!   known entity, or an empty payload when it was removed
//! - `mqtt_discovery_done_{component}_{discovery_id}`: the listener finished
//!   with the last payload
//!
//! Payloads for one hash are handled one at a time. A payload arriving
//! while another for the same hash is in flight is queued. Queued payloads
//! are replayed one per done signal in arrival order, so the latest config
//! is the one that sticks.

use std::sync::{Arc, RwLock, Weak};
use std::time::Instant;

use futures::future::BoxFuture;
use ha_config_entries::{ConfigEntries, ConfigEntry, FlowManager, Integrations};
use ha_event_bus::{Disconnect, Dispatcher, EventBus};
use ha_registries::Registries;
use rumqttc::QoS;
use tracing::{debug, error, info, instrument, warn};

use crate::cleanup::spawn_device_removal_listener;
use crate::client::MqttTransport;
use crate::config::validate_discovery_prefix;
use crate::device_trigger::{self, DeviceTriggerRegistry};
use crate::entity::MqttPlatform;
use crate::error::{MqttError, MqttResult};
use crate::integration_bridge::IntegrationDiscovery;
use crate::payload::{normalize_payload, NormalizedPayload};
use crate::router::{message_callback, ReceiveMessage};
use crate::state::{lock, Admission, DiscoveryState};
use crate::tag::{self, TagRegistry};
use crate::topic::{discovery_filters, is_supported_component, parse_discovery_topic, DiscoveryHash};

/// Integration that owns discovered platforms
pub const INTEGRATION: &str = "mqtt";

pub fn discovery_new_signal(component: &str, integration: &str) -> String {
    format!("mqtt_discovery_new_{component}_{integration}")
}

pub fn discovery_updated_signal(hash: &DiscoveryHash) -> String {
    format!(
        "mqtt_discovery_updated_{}_{}",
        hash.component, hash.discovery_id
    )
}

pub fn discovery_done_signal(hash: &DiscoveryHash) -> String {
    format!("mqtt_discovery_done_{}_{}", hash.component, hash.discovery_id)
}

/// Setup routine for a component that does not go through config entry
/// forwarding. Returns the listener to disconnect on stop.
pub type CustomSetup = fn(Arc<DiscoveryEngine>) -> BoxFuture<'static, MqttResult<Disconnect>>;

/// How a component's platform is set up the first time it is discovered
#[derive(Clone, Copy)]
pub enum PlatformSetupStrategy {
    /// Forward the config entry to the component's registered platform
    Forward,
    Custom(CustomSetup),
}

pub fn platform_setup_strategy(component: &str) -> PlatformSetupStrategy {
    match component {
        "tag" => PlatformSetupStrategy::Custom(tag::async_setup_entry),
        "device_automation" => PlatformSetupStrategy::Custom(device_trigger::async_setup_entry),
        _ => PlatformSetupStrategy::Forward,
    }
}

/// Result of routing one payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// First payload for the hash; the new signal was sent
    New,
    /// Known hash; the updated signal was sent
    Updated,
    /// Removal of an unknown hash; nothing to broadcast
    Unhandled,
}

pub struct DiscoveryEngine {
    me: Weak<DiscoveryEngine>,
    transport: Arc<dyn MqttTransport>,
    dispatcher: Arc<Dispatcher<NormalizedPayload>>,
    bus: Arc<EventBus>,
    registries: Arc<Registries>,
    config_entries: Arc<ConfigEntries>,
    bridge: IntegrationDiscovery,
    tags: TagRegistry,
    triggers: DeviceTriggerRegistry,
    state: RwLock<Option<Arc<DiscoveryState>>>,
    last_discovery: std::sync::Mutex<Option<Instant>>,
}

impl DiscoveryEngine {
    pub fn new(
        transport: Arc<dyn MqttTransport>,
        bus: Arc<EventBus>,
        registries: Arc<Registries>,
        config_entries: Arc<ConfigEntries>,
        flows: Arc<FlowManager>,
        integrations: Arc<Integrations>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            bridge: IntegrationDiscovery::new(transport.clone(), flows, integrations),
            transport,
            dispatcher: Dispatcher::new(),
            bus,
            registries,
            config_entries,
            tags: TagRegistry::new(),
            triggers: DeviceTriggerRegistry::new(),
            state: RwLock::new(None),
            last_discovery: std::sync::Mutex::new(None),
        })
    }

    /// Start listening below `prefix` on behalf of `entry`
    ///
    /// Fails with [`MqttError::AlreadyStarted`] while a previous start is
    /// still running.
    #[instrument(skip(self, entry), fields(entry_id = %entry.entry_id))]
    pub async fn async_start(&self, prefix: &str, entry: ConfigEntry) -> MqttResult<()> {
        validate_discovery_prefix(prefix)?;

        let state = {
            let mut slot = self.state.write().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() {
                return Err(MqttError::AlreadyStarted);
            }
            let state = Arc::new(DiscoveryState::new(prefix, entry));
            *slot = Some(state.clone());
            state
        };

        for filter in discovery_filters(prefix) {
            let me = self.me.clone();
            let callback = message_callback(move |msg: ReceiveMessage| {
                let me = me.clone();
                async move {
                    let Some(engine) = me.upgrade() else {
                        return;
                    };
                    if let Err(e) = engine.async_discovery_message_received(msg).await {
                        error!("Error handling discovery message: {}", e);
                    }
                }
            });
            match self.transport.subscribe(&filter, QoS::AtMostOnce, callback).await {
                Ok(subscription) => state.add_subscription(subscription),
                Err(e) => {
                    self.async_stop().await;
                    return Err(e);
                }
            }
        }

        state.set_cleanup_task(spawn_device_removal_listener(self.me.clone(), &self.bus));

        if let Err(e) = self.bridge.start().await {
            self.async_stop().await;
            return Err(e);
        }

        info!("MQTT discovery started below {}", prefix);
        Ok(())
    }

    /// Stop discovery and cancel every subscription. Does nothing if
    /// discovery is not running.
    pub async fn async_stop(&self) {
        let state = self
            .state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(state) = state else {
            debug!("MQTT discovery not running");
            return;
        };

        state.teardown();
        self.bridge.stop();
        self.tags.clear();
        self.triggers.clear();
        info!("MQTT discovery stopped");
    }

    pub fn is_running(&self) -> bool {
        self.current_state().is_some()
    }

    fn current_state(&self) -> Option<Arc<DiscoveryState>> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Handle one message from the discovery topics
    ///
    /// Malformed topics and payloads are logged and dropped. Errors are
    /// platform setup failures.
    pub async fn async_discovery_message_received(&self, msg: ReceiveMessage) -> MqttResult<()> {
        *lock(&self.last_discovery) = Some(Instant::now());

        let Some(state) = self.current_state() else {
            return Ok(());
        };
        let Some(topic) = parse_discovery_topic(&state.prefix, &msg.topic) else {
            return Ok(());
        };

        if !is_supported_component(&topic.component) {
            warn!("Integration {} is not supported", topic.component);
            return Ok(());
        }

        let hash = topic.hash();
        let payload = match normalize_payload(&msg.payload, &hash, &msg.topic) {
            Ok(payload) => payload,
            Err(_) => {
                warn!(
                    "Unable to parse JSON {}: '{}'",
                    topic.object_id,
                    String::from_utf8_lossy(&msg.payload)
                );
                return Ok(());
            }
        };

        let admission = state.admit(&hash, payload, || self.connect_done_listener(&hash));
        let payload = match admission {
            Admission::Queued => {
                info!(
                    "Component has already been discovered: {} {}, queuing update",
                    hash.component, hash.discovery_id
                );
                return Ok(());
            }
            Admission::Route(payload) => payload,
        };

        if self.route(&state, &hash, payload).await? == RouteOutcome::Unhandled {
            self.send_discovery_done(&hash);
        }
        Ok(())
    }

    /// Apply one payload for `hash`
    async fn route(
        &self,
        state: &DiscoveryState,
        hash: &DiscoveryHash,
        payload: NormalizedPayload,
    ) -> MqttResult<RouteOutcome> {
        if state.is_already_discovered(hash) {
            info!(
                "Component has already been discovered: {} {}, sending update",
                hash.component, hash.discovery_id
            );
            if payload.is_empty() {
                state.clear_discovered(hash);
            }
            self.dispatcher.send(&discovery_updated_signal(hash), payload);
            return Ok(RouteOutcome::Updated);
        }

        if payload.is_empty() {
            return Ok(RouteOutcome::Unhandled);
        }

        state.mark_discovered(hash.clone());
        info!(
            "Found new component: {} {}",
            hash.component, hash.discovery_id
        );
        self.ensure_platform_setup(state, &hash.component).await?;
        self.dispatcher
            .send(&discovery_new_signal(&hash.component, INTEGRATION), payload);
        Ok(RouteOutcome::New)
    }

    /// Set up `component`'s platform once per run
    async fn ensure_platform_setup(&self, state: &DiscoveryState, component: &str) -> MqttResult<()> {
        let key = format!("{component}.{INTEGRATION}");
        let mut set_up = state.setup_keys.lock().await;
        if set_up.contains(&key) {
            return Ok(());
        }

        let setup_error = |reason: String| MqttError::PlatformSetup {
            component: component.to_string(),
            reason,
        };
        match platform_setup_strategy(component) {
            PlatformSetupStrategy::Forward => {
                self.config_entries
                    .async_forward_entry_setup(&state.entry, component)
                    .await
                    .map_err(|e| setup_error(e.to_string()))?;
            }
            PlatformSetupStrategy::Custom(setup) => {
                let engine = self
                    .me
                    .upgrade()
                    .ok_or_else(|| setup_error("discovery engine dropped".to_string()))?;
                let listener = setup(engine).await.map_err(|e| setup_error(e.to_string()))?;
                state.add_listener(listener);
            }
        }

        debug!("Platform {} set up for discovery", key);
        set_up.insert(key);
        Ok(())
    }

    fn connect_done_listener(&self, hash: &DiscoveryHash) -> Disconnect {
        let me = self.me.clone();
        let done_hash = hash.clone();
        self.dispatcher
            .connect(discovery_done_signal(hash), move |_: NormalizedPayload| {
                let me = me.clone();
                let hash = done_hash.clone();
                async move {
                    if let Some(engine) = me.upgrade() {
                        engine.discovery_done(&hash).await;
                    }
                }
            })
    }

    /// Replay queued payloads for `hash` after the in-flight one finished
    async fn discovery_done(&self, hash: &DiscoveryHash) {
        let Some(state) = self.current_state() else {
            return;
        };
        while let Some(payload) = state.take_next(hash) {
            match self.route(&state, hash, payload).await {
                Ok(RouteOutcome::Unhandled) => continue,
                Ok(_) => break,
                Err(e) => {
                    error!("Error replaying discovery payload for {}: {}", hash, e);
                    break;
                }
            }
        }
    }

    /// Mark `hash` discovered outside the topic flow
    pub fn set_discovery_hash(&self, hash: DiscoveryHash) {
        if let Some(state) = self.current_state() {
            state.mark_discovered(hash);
        }
    }

    /// Forget `hash`, so its next payload is treated as new
    pub fn clear_discovery_hash(&self, hash: &DiscoveryHash) {
        if let Some(state) = self.current_state() {
            state.clear_discovered(hash);
        }
    }

    pub fn is_discovered(&self, hash: &DiscoveryHash) -> bool {
        self.current_state()
            .map(|state| state.is_already_discovered(hash))
            .unwrap_or(false)
    }

    pub fn discovered_count(&self) -> usize {
        self.current_state()
            .map(|state| state.discovered_count())
            .unwrap_or(0)
    }

    /// Whether payloads for `hash` are in flight or queued
    pub fn is_pending(&self, hash: &DiscoveryHash) -> bool {
        self.current_state()
            .map(|state| state.is_pending(hash))
            .unwrap_or(false)
    }

    pub fn send_discovery_done(&self, hash: &DiscoveryHash) {
        self.dispatcher
            .send(&discovery_done_signal(hash), NormalizedPayload::empty());
    }

    /// When the last discovery message arrived
    pub fn last_discovery(&self) -> Option<Instant> {
        *lock(&self.last_discovery)
    }

    /// Config entry discovery runs for
    pub fn config_entry(&self) -> Option<ConfigEntry> {
        self.current_state().map(|state| state.entry.clone())
    }

    pub(crate) fn track_platform(&self, platform: Arc<MqttPlatform>) {
        match self.current_state() {
            Some(state) => state.add_platform(platform),
            None => platform.shutdown(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<NormalizedPayload>> {
        &self.dispatcher
    }

    pub fn transport(&self) -> &Arc<dyn MqttTransport> {
        &self.transport
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registries(&self) -> &Arc<Registries> {
        &self.registries
    }

    pub fn config_entries(&self) -> &Arc<ConfigEntries> {
        &self.config_entries
    }

    pub fn integration_discovery(&self) -> &IntegrationDiscovery {
        &self.bridge
    }

    pub fn tags(&self) -> &TagRegistry {
        &self.tags
    }

    pub fn triggers(&self) -> &DeviceTriggerRegistry {
        &self.triggers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names() {
        let hash = DiscoveryHash::new("binary_sensor", "node bla");
        assert_eq!(
            discovery_new_signal("binary_sensor", INTEGRATION),
            "mqtt_discovery_new_binary_sensor_mqtt"
        );
        assert_eq!(
            discovery_updated_signal(&hash),
            "mqtt_discovery_updated_binary_sensor_node bla"
        );
        assert_eq!(
            discovery_done_signal(&hash),
            "mqtt_discovery_done_binary_sensor_node bla"
        );
    }

    #[test]
    fn test_setup_strategies() {
        assert!(matches!(platform_setup_strategy("tag"), PlatformSetupStrategy::Custom(_)));
        assert!(matches!(
            platform_setup_strategy("device_automation"),
            PlatformSetupStrategy::Custom(_)
        ));
        assert!(matches!(platform_setup_strategy("sensor"), PlatformSetupStrategy::Forward));
    }
}
