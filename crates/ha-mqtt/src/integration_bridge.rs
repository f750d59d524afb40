//! Config flows started from integration-declared topics
//!
//! Integrations list MQTT topic filters in their manifest. Every message on
//! such a topic starts the integration's config flow. Once a flow aborts
//! because the device is already configured, the topic is no longer
//! interesting and its subscription is dropped.

use std::sync::Arc;

use dashmap::DashMap;
use ha_config_entries::{
    ConfigEntrySource, FlowContext, FlowManager, Integrations, ABORT_ALREADY_CONFIGURED,
    ABORT_SINGLE_INSTANCE_ALLOWED,
};
use rumqttc::QoS;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::client::{MqttTransport, Subscription};
use crate::error::MqttResult;
use crate::router::{message_callback, MessageCallback, ReceiveMessage};

fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

fn stops_watching(reason: Option<&str>) -> bool {
    matches!(
        reason,
        Some(ABORT_ALREADY_CONFIGURED) | Some(ABORT_SINGLE_INSTANCE_ALLOWED)
    )
}

pub struct IntegrationDiscovery {
    transport: Arc<dyn MqttTransport>,
    flows: Arc<FlowManager>,
    integrations: Arc<Integrations>,
    /// `"<integration>_<topic>"` -> subscription
    subscriptions: Arc<DashMap<String, Subscription>>,
    /// Throttles flow starts; held while subscribing
    flow_lock: Arc<Mutex<()>>,
}

impl IntegrationDiscovery {
    pub fn new(
        transport: Arc<dyn MqttTransport>,
        flows: Arc<FlowManager>,
        integrations: Arc<Integrations>,
    ) -> Self {
        Self {
            transport,
            flows,
            integrations,
            subscriptions: Arc::new(DashMap::new()),
            flow_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Subscribe to every topic integrations declared
    pub async fn start(&self) -> MqttResult<()> {
        // Retained messages arrive during subscribe; their flows wait here
        // until the key they check for exists
        let _guard = self.flow_lock.lock().await;

        for (integration, topics) in self.integrations.mqtt_topics() {
            for topic in topics {
                let key = format!("{integration}_{topic}");
                if self.subscriptions.contains_key(&key) {
                    continue;
                }
                let callback = self.flow_callback(&integration, &key);
                let subscription = self
                    .transport
                    .subscribe(&topic, QoS::AtMostOnce, callback)
                    .await?;
                debug!("Watching {} for integration {}", topic, integration);
                self.subscriptions.insert(key, subscription);
            }
        }

        if !self.subscriptions.is_empty() {
            info!(
                "Watching {} integration discovery topics",
                self.subscriptions.len()
            );
        }
        Ok(())
    }

    fn flow_callback(&self, integration: &str, key: &str) -> MessageCallback {
        let flows = self.flows.clone();
        let subscriptions = self.subscriptions.clone();
        let flow_lock = self.flow_lock.clone();
        let integration = integration.to_string();
        let key = key.to_string();

        message_callback(move |msg: ReceiveMessage| {
            let flows = flows.clone();
            let subscriptions = subscriptions.clone();
            let flow_lock = flow_lock.clone();
            let integration = integration.clone();
            let key = key.clone();
            async move {
                let _guard = flow_lock.lock().await;
                if !subscriptions.contains_key(&key) {
                    return;
                }

                let data = json!({
                    "topic": &msg.topic,
                    "payload": String::from_utf8_lossy(&msg.payload),
                    "qos": qos_level(msg.qos),
                    "retain": msg.retain,
                    "subscribed_topic": &msg.subscribed_topic,
                });
                let context = FlowContext::new(ConfigEntrySource::Mqtt);
                match flows.async_init(&integration, context, data).await {
                    Ok(result) if result.is_abort() && stops_watching(result.reason.as_deref()) => {
                        if let Some((_, mut subscription)) = subscriptions.remove(&key) {
                            subscription.unsubscribe();
                            debug!("Stopped watching {} for {}", msg.subscribed_topic, integration);
                        }
                    }
                    Ok(result) => {
                        debug!("Config flow for {} returned {:?}", integration, result.result_type)
                    }
                    Err(e) => error!("Config flow for {} failed: {}", integration, e),
                }
            }
        })
    }

    /// Cancel every subscription
    pub fn stop(&self) {
        let keys: Vec<String> = self.subscriptions.iter().map(|s| s.key().clone()).collect();
        for key in keys {
            if let Some((_, mut subscription)) = self.subscriptions.remove(&key) {
                subscription.unsubscribe();
            }
        }
    }

    pub fn is_watching(&self, integration: &str, topic: &str) -> bool {
        self.subscriptions
            .contains_key(&format!("{integration}_{topic}"))
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_watching_reasons() {
        assert!(stops_watching(Some("already_configured")));
        assert!(stops_watching(Some("single_instance_allowed")));
        assert!(!stops_watching(Some("cannot_connect")));
        assert!(!stops_watching(None));
    }

    #[test]
    fn test_qos_level() {
        assert_eq!(qos_level(QoS::AtLeastOnce), 1);
    }
}
