//! Entity side of discovery
//!
//! A platform calls [`setup_entry_helper`] once when its config entry is
//! forwarded. From then on every `discovery_new` payload for the component
//! becomes an entity, registered in the entity registry and linked to the
//! device described by the payload's `device` block. Each entity follows its
//! own `discovery_updated` signal until an empty payload removes it.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use ha_config_entries::setup_handler;
use ha_event_bus::Disconnect;
use ha_registries::{slugify, DeviceConnection, DeviceIdentifier, DeviceInfo};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::cleanup::cleanup_device_registry;
use crate::discovery::{
    discovery_new_signal, discovery_updated_signal, platform_setup_strategy, DiscoveryEngine,
    PlatformSetupStrategy, INTEGRATION,
};
use crate::error::{MqttError, MqttResult};
use crate::payload::NormalizedPayload;
use crate::state::lock;
use crate::topic::{DiscoveryHash, SUPPORTED_COMPONENTS};

/// An entity created from discovery
#[async_trait]
pub trait DiscoveryEntity: Send + Sync {
    /// New configuration for an existing entity
    async fn discovery_update(&self, payload: &NormalizedPayload);

    /// Called before the entity is removed
    async fn will_remove(&self) {}
}

/// Where a discovered entity lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityContext {
    pub entity_id: String,
    pub unique_id: Option<String>,
    pub device_id: Option<String>,
    pub hash: DiscoveryHash,
}

/// Builds the entity for a discovered payload
pub type EntityFactory =
    Arc<dyn Fn(EntityContext, &NormalizedPayload) -> Arc<dyn DiscoveryEntity> + Send + Sync>;

/// An entity that keeps its latest configuration
pub struct ConfigEntity {
    context: EntityContext,
    config: Mutex<NormalizedPayload>,
}

impl ConfigEntity {
    pub fn new(context: EntityContext, payload: &NormalizedPayload) -> Self {
        Self {
            context,
            config: Mutex::new(payload.clone()),
        }
    }

    pub fn factory() -> EntityFactory {
        Arc::new(
            |context: EntityContext, payload: &NormalizedPayload| -> Arc<dyn DiscoveryEntity> {
                Arc::new(ConfigEntity::new(context, payload))
            },
        )
    }

    pub fn context(&self) -> &EntityContext {
        &self.context
    }

    pub fn config(&self) -> NormalizedPayload {
        lock(&self.config).clone()
    }
}

#[async_trait]
impl DiscoveryEntity for ConfigEntity {
    async fn discovery_update(&self, payload: &NormalizedPayload) {
        *lock(&self.config) = payload.clone();
    }
}

struct PlatformEntity {
    entity: Arc<dyn DiscoveryEntity>,
    context: EntityContext,
    listener: Disconnect,
}

/// Entities discovered for one component
pub struct MqttPlatform {
    component: String,
    entities: DashMap<DiscoveryHash, PlatformEntity>,
    new_listener: Mutex<Disconnect>,
}

impl MqttPlatform {
    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn entity(&self, hash: &DiscoveryHash) -> Option<Arc<dyn DiscoveryEntity>> {
        self.entities.get(hash).map(|e| e.entity.clone())
    }

    pub fn entity_context(&self, hash: &DiscoveryHash) -> Option<EntityContext> {
        self.entities.get(hash).map(|e| e.context.clone())
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Stop listening for new and updated payloads
    pub fn shutdown(&self) {
        lock(&self.new_listener).disconnect();
        let hashes: Vec<DiscoveryHash> = self.entities.iter().map(|e| e.key().clone()).collect();
        for hash in hashes {
            if let Some((_, mut entry)) = self.entities.remove(&hash) {
                entry.listener.disconnect();
            }
        }
    }
}

/// Map a canonical `device` block to registry arguments
///
/// `identifiers` may be one string or a list; `connections` is a list of
/// `[type, id]` pairs.
pub fn device_info_from_config(device: &Value) -> DeviceInfo {
    let text = |key: &str| device.get(key).and_then(Value::as_str).map(str::to_string);

    let identifiers = match device.get("identifiers") {
        Some(Value::String(id)) => vec![DeviceIdentifier::new(INTEGRATION, id)],
        Some(Value::Array(ids)) => ids
            .iter()
            .filter_map(Value::as_str)
            .map(|id| DeviceIdentifier::new(INTEGRATION, id))
            .collect(),
        _ => Vec::new(),
    };

    let connections = device
        .get("connections")
        .and_then(Value::as_array)
        .map(|pairs| {
            pairs
                .iter()
                .filter_map(|pair| match pair.as_array().map(Vec::as_slice) {
                    Some([Value::String(kind), Value::String(id)]) => {
                        Some(DeviceConnection::new(kind, id))
                    }
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    DeviceInfo {
        identifiers,
        connections,
        name: text("name"),
        manufacturer: text("manufacturer"),
        model: text("model"),
        sw_version: text("sw_version"),
        suggested_area: text("suggested_area"),
        via_device: text("via_device").map(|via| DeviceIdentifier::new(INTEGRATION, via)),
    }
}

/// Device info from a payload's `device` block, if it names a device
pub fn payload_device_info(payload: &NormalizedPayload) -> Option<DeviceInfo> {
    payload
        .get("device")
        .map(device_info_from_config)
        .filter(|info| !info.is_empty())
}

/// Create or refresh the device a payload describes
pub(crate) fn update_device(engine: &DiscoveryEngine, payload: &NormalizedPayload) -> Option<String> {
    let info = payload_device_info(payload)?;
    let entry_id = engine.config_entry()?.entry_id;
    Some(engine.registries().devices.get_or_create(&entry_id, &info).id.clone())
}

/// Start creating entities of `component` from discovery
///
/// Every handled payload ends with the hash's done signal.
pub fn setup_entry_helper(
    engine: &Arc<DiscoveryEngine>,
    component: &str,
    factory: EntityFactory,
) -> Arc<MqttPlatform> {
    let platform = Arc::new_cyclic(|me: &Weak<MqttPlatform>| {
        let me = me.clone();
        let weak_engine = Arc::downgrade(engine);
        let new_listener = engine.dispatcher().connect(
            discovery_new_signal(component, INTEGRATION),
            move |payload: NormalizedPayload| {
                let platform = me.clone();
                let engine = weak_engine.clone();
                let factory = factory.clone();
                async move {
                    let (Some(platform), Some(engine)) = (platform.upgrade(), engine.upgrade())
                    else {
                        return;
                    };
                    let Some(hash) = payload.discovery_hash().cloned() else {
                        return;
                    };
                    if let Err(e) = platform.add_entity(&engine, &hash, &payload, &factory) {
                        error!("Failed to add discovered entity {}: {}", hash, e);
                        engine.clear_discovery_hash(&hash);
                    }
                    engine.send_discovery_done(&hash);
                }
            },
        );

        MqttPlatform {
            component: component.to_string(),
            entities: DashMap::new(),
            new_listener: Mutex::new(new_listener),
        }
    });

    engine.track_platform(platform.clone());
    debug!("Discovery platform {} ready", component);
    platform
}

impl MqttPlatform {
    fn add_entity(
        self: &Arc<Self>,
        engine: &Arc<DiscoveryEngine>,
        hash: &DiscoveryHash,
        payload: &NormalizedPayload,
        factory: &EntityFactory,
    ) -> MqttResult<()> {
        let entry_id = engine
            .config_entry()
            .map(|entry| entry.entry_id)
            .ok_or_else(|| MqttError::Config("discovery is not running".to_string()))?;
        let device_id = update_device(engine, payload);

        let name = payload.get_str("name");
        let unique_id = payload.get_str("unique_id").map(str::to_string);
        let entities = &engine.registries().entities;
        let entity_id = match &unique_id {
            Some(unique_id) => {
                entities
                    .get_or_create(
                        &self.component,
                        INTEGRATION,
                        unique_id,
                        name,
                        Some(&entry_id),
                        device_id.as_deref(),
                    )
                    .entity_id
                    .clone()
            }
            None => entities.generate_entity_id(
                &self.component,
                &slugify(name.unwrap_or(&hash.discovery_id)),
            ),
        };

        let context = EntityContext {
            entity_id,
            unique_id,
            device_id,
            hash: hash.clone(),
        };
        let entity = factory(context.clone(), payload);
        let listener = self.connect_update_listener(engine, hash);

        info!("Added discovered entity {} for {}", context.entity_id, hash);
        let replaced = self.entities.insert(
            hash.clone(),
            PlatformEntity {
                entity,
                context,
                listener,
            },
        );
        if let Some(mut previous) = replaced {
            previous.listener.disconnect();
        }
        Ok(())
    }

    fn connect_update_listener(
        self: &Arc<Self>,
        engine: &Arc<DiscoveryEngine>,
        hash: &DiscoveryHash,
    ) -> Disconnect {
        let platform = Arc::downgrade(self);
        let weak_engine = Arc::downgrade(engine);
        let hash = hash.clone();
        engine.dispatcher().connect(
            discovery_updated_signal(&hash),
            move |payload: NormalizedPayload| {
                let platform = platform.clone();
                let engine = weak_engine.clone();
                let hash = hash.clone();
                async move {
                    let (Some(platform), Some(engine)) = (platform.upgrade(), engine.upgrade())
                    else {
                        return;
                    };
                    if payload.is_empty() {
                        platform.remove_entity(&engine, &hash).await;
                    } else {
                        platform.update_entity(&engine, &hash, &payload).await;
                    }
                    engine.send_discovery_done(&hash);
                }
            },
        )
    }

    async fn update_entity(
        &self,
        engine: &DiscoveryEngine,
        hash: &DiscoveryHash,
        payload: &NormalizedPayload,
    ) {
        let Some((entity, entity_id)) = self
            .entities
            .get(hash)
            .map(|e| (e.entity.clone(), e.context.entity_id.clone()))
        else {
            return;
        };

        if let Some(device_id) = update_device(engine, payload) {
            let relinked = engine
                .registries()
                .entities
                .update(&entity_id, |entry| entry.device_id = Some(device_id.clone()));
            if relinked.is_ok() {
                if let Some(mut entry) = self.entities.get_mut(hash) {
                    entry.context.device_id = Some(device_id);
                }
            }
        }

        entity.discovery_update(payload).await;
        debug!("Updated discovered entity {}", entity_id);
    }

    async fn remove_entity(&self, engine: &DiscoveryEngine, hash: &DiscoveryHash) {
        let Some((_, mut entry)) = self.entities.remove(hash) else {
            return;
        };
        entry.listener.disconnect();
        entry.entity.discovery_update(&NormalizedPayload::empty()).await;
        entry.entity.will_remove().await;

        engine.registries().entities.remove(&entry.context.entity_id);
        engine.clear_discovery_hash(hash);
        if let Some(device_id) = &entry.context.device_id {
            cleanup_device_registry(engine, device_id);
        }
        info!("Removed discovered entity {}", entry.context.entity_id);
    }
}

/// Register the forwarded platform setup of every entity component
///
/// Components with a custom setup are skipped.
pub fn register_platforms(engine: &Arc<DiscoveryEngine>, factory: EntityFactory) {
    let mut registered = 0;
    for component in SUPPORTED_COMPONENTS {
        if !matches!(
            platform_setup_strategy(component),
            PlatformSetupStrategy::Forward
        ) {
            continue;
        }
        let weak_engine = Arc::downgrade(engine);
        let factory = factory.clone();
        let component_name = component.to_string();
        engine.config_entries().register_platform(
            component,
            setup_handler(move |_entry| {
                let engine = weak_engine.upgrade();
                let factory = factory.clone();
                let component = component_name.clone();
                async move {
                    let Some(engine) = engine else {
                        return Err("discovery engine dropped".to_string());
                    };
                    setup_entry_helper(&engine, &component, factory);
                    Ok(())
                }
            }),
        );
        registered += 1;
    }
    debug!("Registered {} discovery platforms", registered);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_device_info_from_config() {
        let info = device_info_from_config(&json!({
            "identifiers": ["0AFF", "0B00"],
            "connections": [["mac", "02:5B:26:A8:DC:12"], ["zigbee", "0x1"], ["bad"]],
            "name": "Beer fridge",
            "manufacturer": "Whirlpool",
            "model": "Glass",
            "sw_version": "0.1",
            "suggested_area": "Kitchen",
            "via_device": "hub-1"
        }));

        assert_eq!(
            info.identifiers,
            vec![
                DeviceIdentifier::new("mqtt", "0AFF"),
                DeviceIdentifier::new("mqtt", "0B00")
            ]
        );
        assert_eq!(info.connections.len(), 2);
        assert_eq!(info.connections[0].id(), "02:5b:26:a8:dc:12");
        assert_eq!(info.name.as_deref(), Some("Beer fridge"));
        assert_eq!(info.suggested_area.as_deref(), Some("Kitchen"));
        assert_eq!(info.via_device, Some(DeviceIdentifier::new("mqtt", "hub-1")));
    }

    #[test]
    fn test_single_identifier_and_empty_block() {
        let info = device_info_from_config(&json!({"identifiers": "abc"}));
        assert_eq!(info.identifiers, vec![DeviceIdentifier::new("mqtt", "abc")]);

        let mut payload = NormalizedPayload::empty();
        payload
            .fields
            .insert("device".to_string(), json!({"name": "no ids"}));
        assert!(payload_device_info(&payload).is_none());
    }
}
