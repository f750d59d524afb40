//! Shared fixtures for discovery integration tests
//!
//! [`LoopbackTransport`] stands in for the broker: it routes published
//! messages to in-process subscriptions and keeps retained messages for
//! late subscribers. [`Harness`] wires a discovery engine to it with
//! registries in a temporary directory and a platform hook that counts
//! setup calls.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use ha_config_entries::{setup_handler, ConfigEntries, ConfigEntry, FlowManager, Integrations};
use ha_event_bus::{Disconnect, EventBus};
use ha_mqtt::{
    platform_setup_strategy, setup_entry_helper, topic_matches, ConfigEntity, DiscoveryEngine,
    DiscoveryEntity, DiscoveryHash, EntityContext, EntityFactory, MessageCallback, MqttPlatform, MqttResult, MqttTransport,
    NormalizedPayload, PlatformSetupStrategy, QoS, ReceiveMessage, Subscription, TopicRouter,
    SUPPORTED_COMPONENTS,
};
use ha_registries::Registries;
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// In-process broker
#[derive(Default)]
pub struct LoopbackTransport {
    router: Arc<TopicRouter>,
    retained: DashMap<String, Vec<u8>>,
    published: Mutex<Vec<Published>>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.retained.get(topic).map(|p| p.clone())
    }

    pub fn route_count(&self, filter: &str) -> usize {
        self.router.route_count(filter)
    }

    pub fn filters(&self) -> Vec<String> {
        self.router.filters()
    }
}

#[async_trait]
impl MqttTransport for LoopbackTransport {
    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        callback: MessageCallback,
    ) -> MqttResult<Subscription> {
        let (id, _) = self.router.add(topic, callback.clone());

        let retained: Vec<(String, Vec<u8>)> = self
            .retained
            .iter()
            .filter(|r| topic_matches(topic, r.key()))
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        for (retained_topic, payload) in retained {
            tokio::spawn(callback(ReceiveMessage {
                topic: retained_topic,
                payload,
                qos,
                retain: true,
                subscribed_topic: topic.to_string(),
            }));
        }

        let router = Arc::downgrade(&self.router);
        let filter = topic.to_string();
        Ok(Subscription::new(
            topic,
            Disconnect::new(move || {
                if let Some(router) = router.upgrade() {
                    router.remove(&filter, id);
                }
            }),
        ))
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> MqttResult<()> {
        if retain {
            if payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained.insert(topic.to_string(), payload.clone());
            }
        }
        self.published.lock().unwrap().push(Published {
            topic: topic.to_string(),
            payload: payload.clone(),
            retain,
        });
        self.router.dispatch(topic, &payload, qos, retain);
        Ok(())
    }
}

pub struct Harness {
    pub transport: Arc<LoopbackTransport>,
    pub bus: Arc<EventBus>,
    pub registries: Arc<Registries>,
    pub config_entries: Arc<ConfigEntries>,
    pub flows: Arc<FlowManager>,
    pub integrations: Arc<Integrations>,
    pub engine: Arc<DiscoveryEngine>,
    pub entry: ConfigEntry,
    /// Platform setup calls per component
    pub setup_calls: Arc<DashMap<String, usize>>,
    pub platforms: Arc<DashMap<String, Arc<MqttPlatform>>>,
    /// Entities created by the recording platforms
    pub entities: Arc<DashMap<DiscoveryHash, Arc<ConfigEntity>>>,
    _temp_dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let bus = Arc::new(EventBus::new());
        let registries = Arc::new(Registries::new(temp_dir.path(), bus.clone()));
        let config_entries = Arc::new(ConfigEntries::new(registries.storage.clone()));
        let flows = Arc::new(FlowManager::new(config_entries.clone()));
        let integrations = Arc::new(Integrations::new());
        let transport = LoopbackTransport::new();

        let engine = DiscoveryEngine::new(
            transport.clone(),
            bus.clone(),
            registries.clone(),
            config_entries.clone(),
            flows.clone(),
            integrations.clone(),
        );
        let entry = config_entries
            .add(ConfigEntry::new("mqtt", "MQTT"))
            .await
            .unwrap();

        let harness = Self {
            transport,
            bus,
            registries,
            config_entries,
            flows,
            integrations,
            engine,
            entry,
            setup_calls: Arc::new(DashMap::new()),
            platforms: Arc::new(DashMap::new()),
            entities: Arc::new(DashMap::new()),
            _temp_dir: temp_dir,
        };
        harness.register_recording_platforms();
        harness
    }

    /// Forwarded platforms that count their setup calls
    fn register_recording_platforms(&self) {
        for component in SUPPORTED_COMPONENTS {
            if !matches!(
                platform_setup_strategy(component),
                PlatformSetupStrategy::Forward
            ) {
                continue;
            }
            let engine = Arc::downgrade(&self.engine);
            let setup_calls = self.setup_calls.clone();
            let platforms = self.platforms.clone();
            let entities = self.entities.clone();
            let component_name = component.to_string();
            self.config_entries.register_platform(
                component,
                setup_handler(move |_entry| {
                    let engine = engine.upgrade();
                    let setup_calls = setup_calls.clone();
                    let platforms = platforms.clone();
                    let factory = recording_factory(entities.clone());
                    let component = component_name.clone();
                    async move {
                        let Some(engine) = engine else {
                            return Err("engine dropped".to_string());
                        };
                        *setup_calls.entry(component.clone()).or_insert(0) += 1;
                        let platform =
                            setup_entry_helper(&engine, &component, factory);
                        platforms.insert(component, platform);
                        Ok(())
                    }
                }),
            );
        }
    }

    /// Make the platform setup of `component` fail, still counting calls
    pub fn fail_platform(&self, component: &str) {
        let setup_calls = self.setup_calls.clone();
        let component_name = component.to_string();
        self.config_entries.register_platform(
            component,
            setup_handler(move |_entry| {
                let setup_calls = setup_calls.clone();
                let component = component_name.clone();
                async move {
                    *setup_calls.entry(component).or_insert(0) += 1;
                    Err("boom".to_string())
                }
            }),
        );
    }

    pub async fn start(&self) {
        self.start_with_prefix("homeassistant").await;
    }

    pub async fn start_with_prefix(&self, prefix: &str) {
        self.engine
            .async_start(prefix, self.entry.clone())
            .await
            .unwrap();
    }

    /// Publish a retained message, as devices do for discovery configs
    pub async fn publish(&self, topic: &str, payload: &str) {
        self.transport
            .publish(topic, payload.as_bytes().to_vec(), QoS::AtMostOnce, true)
            .await
            .unwrap();
    }

    pub fn setup_count(&self, component: &str) -> usize {
        self.setup_calls.get(component).map(|c| *c).unwrap_or(0)
    }

    pub fn entity(&self, hash: &DiscoveryHash) -> Option<EntityContext> {
        self.platforms
            .get(&hash.component)
            .and_then(|platform| platform.entity_context(hash))
    }

    /// Configuration last applied to the entity of `hash`
    pub fn entity_config(&self, hash: &DiscoveryHash) -> Option<NormalizedPayload> {
        self.entities.get(hash).map(|entity| entity.config())
    }

    /// Count payloads sent on `signal`, and keep the last one
    pub fn record_signal(&self, signal: impl Into<String>) -> SignalRecorder {
        let recorder = SignalRecorder::default();
        let count = recorder.count.clone();
        let last = recorder.last.clone();
        self.engine
            .dispatcher()
            .connect(signal, move |payload: NormalizedPayload| {
                let count = count.clone();
                let last = last.clone();
                async move {
                    *last.lock().unwrap() = Some(payload);
                    count.fetch_add(1, Ordering::SeqCst);
                }
            });
        recorder
    }
}

fn recording_factory(entities: Arc<DashMap<DiscoveryHash, Arc<ConfigEntity>>>) -> EntityFactory {
    Arc::new(
        move |context: EntityContext, payload: &NormalizedPayload| -> Arc<dyn DiscoveryEntity> {
            let entity = Arc::new(ConfigEntity::new(context.clone(), payload));
            entities.insert(context.hash, entity.clone());
            entity
        },
    )
}

#[derive(Clone, Default)]
pub struct SignalRecorder {
    count: Arc<AtomicUsize>,
    last: Arc<Mutex<Option<NormalizedPayload>>>,
}

impl SignalRecorder {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Option<NormalizedPayload> {
        self.last.lock().unwrap().clone()
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Let spawned callbacks run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
