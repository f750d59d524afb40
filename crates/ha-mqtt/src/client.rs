//! MQTT transport
//!
//! Discovery only needs subscribe and publish. [`MqttTransport`] is that
//! seam; [`MqttClient`] implements it on top of `rumqttc`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use ha_event_bus::Disconnect;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MqttConfig;
use crate::error::MqttResult;
use crate::router::{MessageCallback, TopicRouter};

/// Capacity of the request channel between client and event loop
const REQUEST_CAPACITY: usize = 10;

/// Delay before polling again after a connection error
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Publish/subscribe transport used by discovery
#[async_trait]
pub trait MqttTransport: Send + Sync {
    /// Subscribe `callback` to `topic`, which may contain wildcards
    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        callback: MessageCallback,
    ) -> MqttResult<Subscription>;

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool)
        -> MqttResult<()>;
}

/// A live subscription
///
/// Must be cancelled with [`Subscription::unsubscribe`]; dropping it leaves
/// the callback connected.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    handle: Disconnect,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, handle: Disconnect) -> Self {
        Self {
            topic: topic.into(),
            handle,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Cancel the subscription. Repeated calls do nothing.
    pub fn unsubscribe(&mut self) {
        self.handle.disconnect();
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_connected()
    }
}

/// `rumqttc` backed transport
pub struct MqttClient {
    client: AsyncClient,
    router: Arc<TopicRouter>,
    filter_qos: Arc<DashMap<String, QoS>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttClient {
    /// Create the client and start polling the broker connection
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(config: &MqttConfig) -> Arc<Self> {
        let mut options = MqttOptions::new(&config.client_id, &config.broker, config.port);
        options.set_keep_alive(config.keepalive());
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let router = Arc::new(TopicRouter::new());
        let filter_qos = Arc::new(DashMap::new());

        info!(
            "Connecting to MQTT broker {}:{} as {}",
            config.broker, config.port, config.client_id
        );
        let handle = tokio::spawn(run_event_loop(
            event_loop,
            client.clone(),
            router.clone(),
            filter_qos.clone(),
        ));

        Arc::new(Self {
            client,
            router,
            filter_qos,
            event_loop: Mutex::new(Some(handle)),
        })
    }

    pub fn router(&self) -> &Arc<TopicRouter> {
        &self.router
    }

    /// Disconnect from the broker and stop the event loop
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect request failed: {}", e);
        }
        if let Some(handle) = self.event_loop.lock().await.take() {
            handle.abort();
        }
        info!("Disconnected from MQTT broker");
    }
}

#[async_trait]
impl MqttTransport for MqttClient {
    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        callback: MessageCallback,
    ) -> MqttResult<Subscription> {
        let (id, first) = self.router.add(topic, callback);
        if first {
            self.filter_qos.insert(topic.to_string(), qos);
            if let Err(e) = self.client.subscribe(topic, qos).await {
                if self.router.remove(topic, id) {
                    self.filter_qos.remove(topic);
                }
                return Err(e.into());
            }
            debug!("Subscribed to {}", topic);
        }

        let router = Arc::downgrade(&self.router);
        let filter_qos = Arc::downgrade(&self.filter_qos);
        let client = self.client.clone();
        let filter = topic.to_string();
        let handle = Disconnect::new(move || {
            let Some(router) = router.upgrade() else {
                return;
            };
            if !router.remove(&filter, id) {
                return;
            }
            if let Some(filter_qos) = filter_qos.upgrade() {
                filter_qos.remove(&filter);
            }
            match client.try_unsubscribe(filter.clone()) {
                Ok(()) => debug!("Unsubscribed from {}", filter),
                Err(e) => warn!("Failed to unsubscribe from {}: {}", filter, e),
            }
        });

        Ok(Subscription::new(topic, handle))
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> MqttResult<()> {
        self.client.publish(topic, qos, retain, payload).await?;
        Ok(())
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    router: Arc<TopicRouter>,
    filter_qos: Arc<DashMap<String, QoS>>,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let delivered =
                    router.dispatch(&publish.topic, &publish.payload, publish.qos, publish.retain);
                if delivered == 0 {
                    debug!("No subscriber for {}", publish.topic);
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker");
                // Requests go through the same channel this loop drains
                let client = client.clone();
                let filters: Vec<(String, QoS)> = filter_qos
                    .iter()
                    .map(|e| (e.key().clone(), *e.value()))
                    .collect();
                tokio::spawn(async move {
                    for (filter, qos) in filters {
                        if let Err(e) = client.subscribe(filter.clone(), qos).await {
                            warn!("Failed to resubscribe to {}: {}", filter, e);
                        }
                    }
                });
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
