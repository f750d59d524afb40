//! Device triggers
//!
//! A `device_automation` discovery payload describes a trigger a device can
//! fire: a topic, an optional payload to match, and a `type`/`subtype` pair
//! (`button_short_press`/`button_1`). Automations attach actions to a
//! trigger; the trigger keeps one topic subscription and fans matching
//! messages out to them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
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

pub const COMPONENT: &str = "device_automation";

pub const AUTOMATION_TYPE_TRIGGER: &str = "trigger";

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerConfig {
    pub automation_type: String,
    pub topic: String,
    pub trigger_type: String,
    pub subtype: String,
    /// Only messages with exactly this payload fire the trigger
    pub payload: Option<String>,
    pub device: DeviceInfo,
}

impl TriggerConfig {
    pub fn from_payload(payload: &NormalizedPayload) -> MqttResult<Self> {
        let required = |key: &str| {
            payload
                .get_str(key)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or_else(|| MqttError::InvalidPayload(format!("device trigger requires `{key}`")))
        };

        let automation_type = required("automation_type")?;
        if automation_type != AUTOMATION_TYPE_TRIGGER {
            return Err(MqttError::InvalidPayload(format!(
                "unsupported automation_type {automation_type}"
            )));
        }
        let device = payload_device_info(payload).ok_or_else(|| {
            MqttError::InvalidPayload("device trigger requires a device".to_string())
        })?;

        Ok(Self {
            automation_type,
            topic: required("topic")?,
            trigger_type: required("type")?,
            subtype: required("subtype")?,
            payload: payload.get_str("payload").map(str::to_string),
            device,
        })
    }

    fn matches(&self, payload: &[u8]) -> bool {
        match &self.payload {
            Some(expected) => expected.as_bytes() == payload,
            None => true,
        }
    }
}

/// A discovered trigger
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTrigger {
    pub discovery_id: String,
    pub device_id: String,
    pub discovery_topic: String,
    pub config: TriggerConfig,
}

/// What an attached action receives when its trigger fires
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerFired {
    pub device_id: String,
    pub discovery_id: String,
    pub trigger_type: String,
    pub subtype: String,
    pub topic: String,
    pub payload: String,
}

pub type TriggerAction = Arc<dyn Fn(TriggerFired) -> BoxFuture<'static, ()> + Send + Sync>;

type Actions = Arc<DashMap<u64, TriggerAction>>;

struct TriggerEntry {
    trigger: DeviceTrigger,
    actions: Actions,
    subscription: Subscription,
    listener: Disconnect,
}

impl TriggerEntry {
    fn cancel(&mut self) {
        self.subscription.unsubscribe();
        self.listener.disconnect();
        self.actions.clear();
    }
}

/// Discovered device triggers
#[derive(Default)]
pub struct DeviceTriggerRegistry {
    triggers: DashMap<DiscoveryHash, TriggerEntry>,
    next_action_id: AtomicU64,
}

impl DeviceTriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn triggers_for_device(&self, device_id: &str) -> Vec<DeviceTrigger> {
        self.triggers
            .iter()
            .filter(|t| t.trigger.device_id == device_id)
            .map(|t| t.trigger.clone())
            .collect()
    }

    pub fn has_triggers(&self, device_id: &str) -> bool {
        self.triggers.iter().any(|t| t.trigger.device_id == device_id)
    }

    pub fn get(&self, hash: &DiscoveryHash) -> Option<DeviceTrigger> {
        self.triggers.get(hash).map(|t| t.trigger.clone())
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Run `action` whenever the trigger `discovery_id` of `device_id` fires
    ///
    /// The returned subscription detaches the action.
    pub fn attach(
        &self,
        device_id: &str,
        discovery_id: &str,
        action: TriggerAction,
    ) -> MqttResult<Subscription> {
        let hash = DiscoveryHash::new(COMPONENT, discovery_id);
        let (topic, actions) = self
            .triggers
            .get(&hash)
            .filter(|t| t.trigger.device_id == device_id)
            .map(|t| (t.trigger.config.topic.clone(), t.actions.clone()))
            .ok_or_else(|| MqttError::TriggerNotFound {
                device_id: device_id.to_string(),
                discovery_id: discovery_id.to_string(),
            })?;

        let id = self.next_action_id.fetch_add(1, Ordering::Relaxed);
        actions.insert(id, action);
        let actions = Arc::downgrade(&actions);
        Ok(Subscription::new(
            topic,
            Disconnect::new(move || {
                if let Some(actions) = actions.upgrade() {
                    actions.remove(&id);
                }
            }),
        ))
    }

    fn insert(&self, hash: DiscoveryHash, entry: TriggerEntry) {
        if let Some(mut previous) = self.triggers.insert(hash, entry) {
            previous.cancel();
        }
    }

    fn remove(&self, hash: &DiscoveryHash) -> Option<DeviceTrigger> {
        let (_, mut entry) = self.triggers.remove(hash)?;
        entry.cancel();
        Some(entry.trigger)
    }

    /// Drop every trigger of `device_id`
    pub fn remove_for_device(&self, device_id: &str) -> Vec<RemovedDiscovery> {
        let hashes: Vec<DiscoveryHash> = self
            .triggers
            .iter()
            .filter(|t| t.trigger.device_id == device_id)
            .map(|t| t.key().clone())
            .collect();

        hashes
            .into_iter()
            .filter_map(|hash| {
                let trigger = self.remove(&hash)?;
                Some(RemovedDiscovery {
                    hash,
                    discovery_topic: trigger.discovery_topic,
                })
            })
            .collect()
    }

    pub(crate) fn clear(&self) {
        let hashes: Vec<DiscoveryHash> = self.triggers.iter().map(|t| t.key().clone()).collect();
        for hash in hashes {
            self.remove(&hash);
        }
    }
}

/// Custom platform setup for `device_automation`
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
                    if let Err(e) = setup_trigger(&engine, &hash, &payload).await {
                        error!("Failed to set up device trigger {}: {}", hash, e);
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

async fn setup_trigger(
    engine: &Arc<DiscoveryEngine>,
    hash: &DiscoveryHash,
    payload: &NormalizedPayload,
) -> MqttResult<()> {
    let config = TriggerConfig::from_payload(payload)?;
    let device_id = register_device(engine, &config.device)?;
    let trigger = DeviceTrigger {
        discovery_id: hash.discovery_id.clone(),
        device_id,
        discovery_topic: payload.discovery_topic().unwrap_or_default().to_string(),
        config,
    };

    engine.set_discovery_hash(hash.clone());
    let actions: Actions = Arc::new(DashMap::new());
    let subscription = subscribe_trigger(engine, &trigger, &actions).await?;
    let listener = connect_update_listener(engine, hash);

    info!(
        "Set up device trigger {} ({} {})",
        hash, trigger.config.trigger_type, trigger.config.subtype
    );
    engine.triggers().insert(
        hash.clone(),
        TriggerEntry {
            trigger,
            actions,
            subscription,
            listener,
        },
    );
    Ok(())
}

async fn subscribe_trigger(
    engine: &DiscoveryEngine,
    trigger: &DeviceTrigger,
    actions: &Actions,
) -> MqttResult<Subscription> {
    let trigger = trigger.clone();
    let actions = Arc::downgrade(actions);
    let topic = trigger.config.topic.clone();
    let callback = message_callback(move |msg: ReceiveMessage| {
        let trigger = trigger.clone();
        let actions = actions.upgrade();
        async move {
            let Some(actions) = actions else {
                return;
            };
            if !trigger.config.matches(&msg.payload) {
                return;
            }
            let fired = TriggerFired {
                device_id: trigger.device_id.clone(),
                discovery_id: trigger.discovery_id.clone(),
                trigger_type: trigger.config.trigger_type.clone(),
                subtype: trigger.config.subtype.clone(),
                topic: msg.topic.clone(),
                payload: String::from_utf8_lossy(&msg.payload).into_owned(),
            };
            let callbacks: Vec<TriggerAction> = actions.iter().map(|a| a.value().clone()).collect();
            debug!(
                "Device trigger {} fired for {} actions",
                trigger.discovery_id,
                callbacks.len()
            );
            for action in callbacks {
                tokio::spawn(action(fired.clone()));
            }
        }
    });
    engine
        .transport()
        .subscribe(&topic, QoS::AtMostOnce, callback)
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
                    remove_trigger(&engine, &hash);
                } else if let Err(e) = update_trigger(&engine, &hash, &payload).await {
                    error!("Failed to update device trigger {}: {}", hash, e);
                }
                engine.send_discovery_done(&hash);
            }
        },
    )
}

fn remove_trigger(engine: &DiscoveryEngine, hash: &DiscoveryHash) {
    let Some(trigger) = engine.triggers().remove(hash) else {
        return;
    };
    engine.clear_discovery_hash(hash);
    cleanup_device_registry(engine, &trigger.device_id);
    info!("Removed device trigger {}", hash);
}

async fn update_trigger(
    engine: &DiscoveryEngine,
    hash: &DiscoveryHash,
    payload: &NormalizedPayload,
) -> MqttResult<()> {
    let config = TriggerConfig::from_payload(payload)?;
    let device_id = register_device(engine, &config.device)?;

    let Some((old, actions)) = engine
        .triggers()
        .triggers
        .get(hash)
        .map(|t| (t.trigger.clone(), t.actions.clone()))
    else {
        return Ok(());
    };

    let trigger = DeviceTrigger {
        device_id,
        config,
        ..old.clone()
    };
    if trigger == old {
        return Ok(());
    }

    // The topic callback holds a copy of the trigger, so any change resubscribes
    let mut subscription = subscribe_trigger(engine, &trigger, &actions).await?;
    if let Some(mut entry) = engine.triggers().triggers.get_mut(hash) {
        entry.trigger = trigger.clone();
        std::mem::swap(&mut entry.subscription, &mut subscription);
    }
    subscription.unsubscribe();

    if old.device_id != trigger.device_id {
        cleanup_device_registry(engine, &old.device_id);
    }
    debug!("Updated device trigger {}", hash);
    Ok(())
}
