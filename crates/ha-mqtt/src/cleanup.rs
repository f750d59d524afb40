//! Device registry cleanup
//!
//! A device created for discovered entities goes away with the last thing
//! that uses it. The reverse also holds: when a device is removed from the
//! registry, its tags and triggers are dropped and their retained discovery
//! messages cleared on the broker.

use std::sync::Weak;

use ha_core::events::{DeviceRegistryAction, DeviceRegistryUpdatedData};
use ha_event_bus::EventBus;
use rumqttc::QoS;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::discovery::DiscoveryEngine;
use crate::topic::DiscoveryHash;

/// A discovered tag or trigger dropped with its device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedDiscovery {
    pub hash: DiscoveryHash,
    pub discovery_topic: String,
}

/// Remove `device_id` if nothing discovered refers to it anymore
///
/// Disabled entities count as references. Returns whether the device was
/// removed; an unknown device id is not an error.
pub fn cleanup_device_registry(engine: &DiscoveryEngine, device_id: &str) -> bool {
    let registries = engine.registries();
    if registries.devices.get(device_id).is_none() {
        return false;
    }
    if !registries
        .entities
        .entries_for_device(device_id, true)
        .is_empty()
    {
        return false;
    }
    if engine.tags().has_tags(device_id) || engine.triggers().has_triggers(device_id) {
        return false;
    }

    debug!("Removing device {} with no discovered entities left", device_id);
    registries.devices.async_remove_device(device_id).is_some()
}

/// Drop tags and triggers of a removed device and clear their discovery
/// topics
pub async fn handle_device_removed(engine: &DiscoveryEngine, device_id: &str) {
    let mut removed = engine.tags().remove_for_device(device_id);
    removed.extend(engine.triggers().remove_for_device(device_id));

    for item in removed {
        engine.clear_discovery_hash(&item.hash);
        info!(
            "Device {} removed, clearing discovery topic {}",
            device_id, item.discovery_topic
        );
        if let Err(e) = engine
            .transport()
            .publish(&item.discovery_topic, Vec::new(), QoS::AtMostOnce, true)
            .await
        {
            warn!("Failed to clear {}: {}", item.discovery_topic, e);
        }
    }
}

/// Watch the bus for device removals until the engine is dropped
pub(crate) fn spawn_device_removal_listener(
    engine: Weak<DiscoveryEngine>,
    bus: &EventBus,
) -> JoinHandle<()> {
    let mut events = bus.subscribe_typed::<DeviceRegistryUpdatedData>();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.data.action == DeviceRegistryAction::Remove => {
                    let Some(engine) = engine.upgrade() else {
                        break;
                    };
                    handle_device_removed(&engine, &event.data.device_id).await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Device removal listener lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
