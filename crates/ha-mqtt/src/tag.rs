//! Tag scanners
//!
//! A discovered tag scanner names a topic it publishes scanned tag ids to.
//! Every non-empty message on that topic fires a `tag_scanned` event.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use ha_core::events::TagScannedData;
use ha_core::Context;
use ha_event_bus::Disconnect;
use ha_registries::DeviceInfo;
use rumqttc::QoS;
use tracing::{debug, error, info};

use crate::cleanup::{cleanup_device_registry, RemovedDiscovery};
use crate::client::Subscription;
use crate::discovery::{discovery_new_signal, discovery_updated_signal, DiscoveryEngine, INTEGRATION};
use crate::entity::payload_device_info;
use crate::error::{MqttError, MqttResult};
use crate::payload::NormalizedPayload;
use crate::router::{message_callback, ReceiveMessage};
use crate::topic::DiscoveryHash;

pub const COMPONENT: &str = "tag";

/// Configuration of a discovered tag scanner
#[derive(Debug, Clone, PartialEq)]
pub struct TagConfig {
    pub topic: String,
    pub device: DeviceInfo,
}

impl TagConfig {
    pub fn from_payload(payload: &NormalizedPayload) -> MqttResult<Self> {
        let topic = payload
            .get_str("topic")
            .filter(|t| !t.is_empty())
            .ok_or_else(|| MqttError::InvalidPayload("tag requires a topic".to_string()))?;
        let device = payload_device_info(payload).ok_or_else(|| {
            MqttError::InvalidPayload("tag requires a device with identifiers or connections".to_string())
        })?;
        Ok(Self {
            topic: topic.to_string(),
            device,
        })
    }
}

struct TagEntry {
    device_id: String,
    topic: String,
    discovery_topic: String,
    subscription: Subscription,
    listener: Disconnect,
}

impl TagEntry {
    fn cancel(&mut self) {
        self.subscription.unsubscribe();
        self.listener.disconnect();
    }
}

/// Discovered tag scanners
#[derive(Default)]
pub struct TagRegistry {
    tags: DashMap<DiscoveryHash, TagEntry>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_tags(&self, device_id: &str) -> bool {
        self.tags.iter().any(|t| t.device_id == device_id)
    }

    pub fn contains(&self, hash: &DiscoveryHash) -> bool {
        self.tags.contains_key(hash)
    }

    /// Scanner topic and device of a discovered tag
    pub fn get(&self, hash: &DiscoveryHash) -> Option<(String, String)> {
        self.tags
            .get(hash)
            .map(|t| (t.topic.clone(), t.device_id.clone()))
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    fn insert(&self, hash: DiscoveryHash, entry: TagEntry) {
        if let Some(mut previous) = self.tags.insert(hash, entry) {
            previous.cancel();
        }
    }

    fn remove(&self, hash: &DiscoveryHash) -> Option<String> {
        let (_, mut entry) = self.tags.remove(hash)?;
        entry.cancel();
        Some(entry.device_id)
    }

    /// Drop every tag bound to `device_id`
    pub fn remove_for_device(&self, device_id: &str) -> Vec<RemovedDiscovery> {
        let hashes: Vec<DiscoveryHash> = self
            .tags
            .iter()
            .filter(|t| t.device_id == device_id)
            .map(|t| t.key().clone())
            .collect();

        hashes
            .into_iter()
            .filter_map(|hash| {
                let (hash, mut entry) = self.tags.remove(&hash)?;
                entry.cancel();
                Some(RemovedDiscovery {
                    hash,
                    discovery_topic: entry.discovery_topic,
                })
            })
            .collect()
    }

    pub(crate) fn clear(&self) {
        let hashes: Vec<DiscoveryHash> = self.tags.iter().map(|t| t.key().clone()).collect();
        for hash in hashes {
            self.remove(&hash);
        }
    }
}

/// Custom platform setup for `tag`
pub fn async_setup_entry(engine: Arc<DiscoveryEngine>) -> BoxFuture<'static, MqttResult<Disconnect>> {
    async move {
        let weak_engine = Arc::downgrade(&engine);
        let listener = engine.dispatcher().connect(
            discovery_new_signal(COMPONENT, INTEGRATION),
            move |payload: NormalizedPayload| {
                let engine = weak_engine.clone();
                async move {
                    let Some(engine) = engine.upgrade() else {
                        return;
                    };
                    let Some(hash) = payload.discovery_hash().cloned() else {
                        return;
                    };
                    if let Err(e) = setup_tag(&engine, &hash, &payload).await {
                        error!("Failed to set up tag {}: {}", hash, e);
                        engine.clear_discovery_hash(&hash);
                    }
                    engine.send_discovery_done(&hash);
                }
            },
        );
        Ok(listener)
    }
    .boxed()
}

async fn setup_tag(
    engine: &Arc<DiscoveryEngine>,
    hash: &DiscoveryHash,
    payload: &NormalizedPayload,
) -> MqttResult<()> {
    let config = TagConfig::from_payload(payload)?;
    let device_id = register_device(engine, &config.device)?;
    let discovery_topic = payload.discovery_topic().unwrap_or_default().to_string();

    engine.set_discovery_hash(hash.clone());
    let subscription = subscribe_scans(engine, &config.topic, &device_id).await?;
    let listener = connect_update_listener(engine, hash);

    info!("Set up tag scanner {} on {}", hash, config.topic);
    engine.tags().insert(
        hash.clone(),
        TagEntry {
            device_id,
            topic: config.topic,
            discovery_topic,
            subscription,
            listener,
        },
    );
    Ok(())
}

fn register_device(engine: &DiscoveryEngine, device: &DeviceInfo) -> MqttResult<String> {
    let entry = engine
        .config_entry()
        .ok_or_else(|| MqttError::Config("discovery is not running".to_string()))?;
    Ok(engine
        .registries()
        .devices
        .get_or_create(&entry.entry_id, device)
        .id
        .clone())
}

async fn subscribe_scans(
    engine: &DiscoveryEngine,
    topic: &str,
    device_id: &str,
) -> MqttResult<Subscription> {
    let bus = engine.bus().clone();
    let device_id = device_id.to_string();
    let callback = message_callback(move |msg: ReceiveMessage| {
        let bus = bus.clone();
        let device_id = device_id.clone();
        async move {
            let tag_id = String::from_utf8_lossy(&msg.payload).trim().to_string();
            if tag_id.is_empty() {
                return;
            }
            debug!("Tag {} scanned by device {}", tag_id, device_id);
            bus.fire_typed(
                TagScannedData {
                    tag_id,
                    device_id: Some(device_id),
                },
                Context::new(),
            );
        }
    });
    engine
        .transport()
        .subscribe(topic, QoS::AtMostOnce, callback)
        .await
}

fn connect_update_listener(engine: &Arc<DiscoveryEngine>, hash: &DiscoveryHash) -> Disconnect {
    let weak_engine = Arc::downgrade(engine);
    let hash = hash.clone();
    engine.dispatcher().connect(
        discovery_updated_signal(&hash),
        move |payload: NormalizedPayload| {
            let engine = weak_engine.clone();
            let hash = hash.clone();
            async move {
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                if payload.is_empty() {
                    remove_tag(&engine, &hash);
                } else if let Err(e) = update_tag(&engine, &hash, &payload).await {
                    error!("Failed to update tag {}: {}", hash, e);
                }
                engine.send_discovery_done(&hash);
            }
        },
    )
}

fn remove_tag(engine: &DiscoveryEngine, hash: &DiscoveryHash) {
    let Some(device_id) = engine.tags().remove(hash) else {
        return;
    };
    engine.clear_discovery_hash(hash);
    cleanup_device_registry(engine, &device_id);
    info!("Removed tag scanner {}", hash);
}

async fn update_tag(
    engine: &DiscoveryEngine,
    hash: &DiscoveryHash,
    payload: &NormalizedPayload,
) -> MqttResult<()> {
    let config = TagConfig::from_payload(payload)?;
    let device_id = register_device(engine, &config.device)?;

    let Some((old_topic, old_device_id)) = engine.tags().get(hash) else {
        return Ok(());
    };
    if old_topic == config.topic && old_device_id == device_id {
        return Ok(());
    }

    let mut subscription = subscribe_scans(engine, &config.topic, &device_id).await?;
    if let Some(mut entry) = engine.tags().tags.get_mut(hash) {
        entry.topic = config.topic.clone();
        entry.device_id = device_id.clone();
        std::mem::swap(&mut entry.subscription, &mut subscription);
    }
    // Now the replaced subscription, or the new one if the tag went away
    subscription.unsubscribe();

    if old_device_id != device_id {
        cleanup_device_registry(engine, &old_device_id);
    }
    debug!("Tag scanner {} now listens on {}", hash, config.topic);
    Ok(())
}
