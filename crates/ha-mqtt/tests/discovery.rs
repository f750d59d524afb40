mod common;

use std::sync::Arc;

use common::{settle, wait_until, Harness};
use ha_mqtt::{
    discovery_done_signal, discovery_new_signal, discovery_updated_signal, DiscoveryHash,
    MqttError, QoS, ReceiveMessage, INTEGRATION,
};

fn message(topic: &str, payload: &str) -> ReceiveMessage {
    ReceiveMessage {
        topic: topic.to_string(),
        payload: payload.as_bytes().to_vec(),
        qos: QoS::AtMostOnce,
        retain: false,
        subscribed_topic: "homeassistant/+/+/config".to_string(),
    }
}

#[tokio::test]
async fn test_new_component_under_custom_prefix() {
    let harness = Harness::new().await;
    harness.start_with_prefix("openpeerpower").await;
    let new = harness.record_signal(discovery_new_signal("binary_sensor", INTEGRATION));
    let hash = DiscoveryHash::new("binary_sensor", "bla");

    harness
        .publish(
            "openpeerpower/binary_sensor/bla/config",
            r#"{"name": "Beer", "state_topic": "test-topic"}"#,
        )
        .await;

    assert!(wait_until(|| harness.entity(&hash).is_some()).await);
    assert_eq!(new.count(), 1);
    assert!(harness.engine.is_discovered(&hash));
    assert_eq!(harness.setup_count("binary_sensor"), 1);
    assert_eq!(harness.entity(&hash).unwrap().entity_id, "binary_sensor.beer");

    let payload = new.last().unwrap();
    assert_eq!(payload.get_str("state_topic"), Some("test-topic"));
    assert_eq!(payload.get_str("platform"), Some("mqtt"));
    assert_eq!(payload.discovery_hash(), Some(&hash));
    assert_eq!(
        payload.configuration_source.as_deref(),
        Some("MQTT (topic: 'openpeerpower/binary_sensor/bla/config')")
    );
    assert!(wait_until(|| !harness.engine.is_pending(&hash)).await);
    assert!(harness.engine.last_discovery().is_some());
}

#[tokio::test]
async fn test_repeated_config_is_an_update() {
    let harness = Harness::new().await;
    harness.start().await;
    let hash = DiscoveryHash::new("binary_sensor", "bla");
    let new = harness.record_signal(discovery_new_signal("binary_sensor", INTEGRATION));
    let updated = harness.record_signal(discovery_updated_signal(&hash));
    let config = r#"{"name": "Beer", "state_topic": "test-topic"}"#;

    harness.publish("homeassistant/binary_sensor/bla/config", config).await;
    assert!(wait_until(|| harness.entity(&hash).is_some()).await);
    assert!(wait_until(|| !harness.engine.is_pending(&hash)).await);

    harness.publish("homeassistant/binary_sensor/bla/config", config).await;
    assert!(wait_until(|| updated.count() == 1).await);

    assert_eq!(new.count(), 1);
    assert_eq!(harness.setup_count("binary_sensor"), 1);
    assert_eq!(updated.last().unwrap().get_str("name"), Some("Beer"));
}

#[tokio::test]
async fn test_removal_then_rediscovery() {
    let harness = Harness::new().await;
    harness.start().await;
    let hash = DiscoveryHash::new("binary_sensor", "bla");
    let new = harness.record_signal(discovery_new_signal("binary_sensor", INTEGRATION));
    let updated = harness.record_signal(discovery_updated_signal(&hash));
    let topic = "homeassistant/binary_sensor/bla/config";
    let config = r#"{"name": "Beer", "state_topic": "test-topic"}"#;

    harness.publish(topic, config).await;
    assert!(wait_until(|| harness.entity(&hash).is_some()).await);
    assert!(wait_until(|| !harness.engine.is_pending(&hash)).await);

    harness.publish(topic, "").await;
    assert!(wait_until(|| harness.entity(&hash).is_none()).await);
    assert!(wait_until(|| !harness.engine.is_pending(&hash)).await);

    assert_eq!(updated.count(), 1);
    assert!(updated.last().unwrap().is_empty());
    assert_eq!(new.count(), 1);
    assert!(!harness.engine.is_discovered(&hash));
    assert!(harness.transport.retained(topic).is_none());

    harness.publish(topic, config).await;
    assert!(wait_until(|| harness.entity(&hash).is_some()).await);
    assert_eq!(new.count(), 2);
    assert_eq!(harness.setup_count("binary_sensor"), 1);
}

#[tokio::test]
async fn test_removal_of_unknown_hash_only_signals_done() {
    let harness = Harness::new().await;
    harness.start().await;
    let hash = DiscoveryHash::new("sensor", "ghost");
    let updated = harness.record_signal(discovery_updated_signal(&hash));
    let done = harness.record_signal(discovery_done_signal(&hash));

    harness.publish("homeassistant/sensor/ghost/config", "").await;
    assert!(wait_until(|| done.count() == 1).await);

    assert_eq!(updated.count(), 0);
    assert!(!harness.engine.is_pending(&hash));
    assert_eq!(harness.setup_count("sensor"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_platform_set_up_once_under_concurrency() {
    let harness = Harness::new().await;
    harness.start().await;
    let new = harness.record_signal(discovery_new_signal("sensor", INTEGRATION));

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let engine = Arc::clone(&harness.engine);
            tokio::spawn(async move {
                engine
                    .async_discovery_message_received(message(
                        &format!("homeassistant/sensor/node{i}/config"),
                        &format!(r#"{{"name": "Sensor {i}"}}"#),
                    ))
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert!(wait_until(|| new.count() == 10).await);
    assert_eq!(harness.setup_count("sensor"), 1);
    assert_eq!(harness.engine.discovered_count(), 10);
    assert!(wait_until(|| harness.platforms.get("sensor").map(|p| p.len()) == Some(10)).await);
}

#[tokio::test]
async fn test_payloads_for_one_hash_apply_in_order() {
    let harness = Harness::new().await;
    harness.start().await;
    let hash = DiscoveryHash::new("switch", "relay");
    let new = harness.record_signal(discovery_new_signal("switch", INTEGRATION));
    let updated = harness.record_signal(discovery_updated_signal(&hash));
    let topic = "homeassistant/switch/relay/config";

    for name in ["first", "second", "third"] {
        harness
            .engine
            .async_discovery_message_received(message(
                topic,
                &format!(r#"{{"name": "{name}", "unique_id": "relay-1"}}"#),
            ))
            .await
            .unwrap();
    }

    assert!(wait_until(|| updated.count() == 2).await);
    assert!(wait_until(|| !harness.engine.is_pending(&hash)).await);

    assert_eq!(new.count(), 1);
    assert_eq!(new.last().unwrap().get_str("name"), Some("first"));
    assert_eq!(updated.last().unwrap().get_str("name"), Some("third"));
    assert_eq!(
        harness
            .registries
            .entities
            .get_entity_id("switch", "mqtt", "relay-1")
            .as_deref(),
        Some("switch.first")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_published_configs_apply_in_order() {
    let harness = Harness::new().await;
    harness.start().await;

    for round in 0..20 {
        let hash = DiscoveryHash::new("switch", format!("relay{round}"));
        let topic = format!("homeassistant/switch/relay{round}/config");
        for name in ["first", "second", "third"] {
            harness
                .publish(&topic, &format!(r#"{{"name": "{name}-{round}"}}"#))
                .await;
        }

        let last = format!("third-{round}");
        assert!(
            wait_until(|| {
                !harness.engine.is_pending(&hash)
                    && harness
                        .entity_config(&hash)
                        .map(|c| c.get_str("name") == Some(last.as_str()))
                        .unwrap_or(false)
            })
            .await
        );
        settle().await;
        assert_eq!(
            harness.entity_config(&hash).unwrap().get_str("name"),
            Some(last.as_str())
        );
    }
}

#[tokio::test]
async fn test_platform_setup_failure_is_returned_and_retried() {
    let harness = Harness::new().await;
    harness.fail_platform("fan");
    harness.start().await;
    let first = DiscoveryHash::new("fan", "ceiling");
    let second = DiscoveryHash::new("fan", "desk");

    let err = harness
        .engine
        .async_discovery_message_received(message(
            "homeassistant/fan/ceiling/config",
            r#"{"name": "Ceiling"}"#,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, MqttError::PlatformSetup { ref component, .. } if component == "fan"));
    assert_eq!(harness.setup_count("fan"), 1);
    assert!(harness.engine.is_pending(&first));

    // The component was never marked set up, so another hash tries again
    let err = harness
        .engine
        .async_discovery_message_received(message(
            "homeassistant/fan/desk/config",
            r#"{"name": "Desk"}"#,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, MqttError::PlatformSetup { .. }));
    assert_eq!(harness.setup_count("fan"), 2);
    assert!(harness.engine.is_pending(&second));

    // Later payloads for the failed hash wait behind it
    harness
        .engine
        .async_discovery_message_received(message(
            "homeassistant/fan/ceiling/config",
            r#"{"name": "Ceiling 2"}"#,
        ))
        .await
        .unwrap();
    assert!(harness.engine.is_pending(&first));
    assert_eq!(harness.setup_count("fan"), 2);
}

#[tokio::test]
async fn test_unsupported_component_is_inert() {
    let harness = Harness::new().await;
    harness.start().await;
    let new = harness.record_signal(discovery_new_signal("weird", INTEGRATION));

    harness
        .publish(
            "homeassistant/weird/bla/config",
            r#"{"name": "Beer", "device": {"identifiers": ["x"]}}"#,
        )
        .await;
    settle().await;

    assert_eq!(new.count(), 0);
    assert_eq!(harness.engine.discovered_count(), 0);
    assert!(!harness.engine.is_pending(&DiscoveryHash::new("weird", "bla")));
    assert!(harness.registries.devices.is_empty());
    assert!(harness.registries.entities.is_empty());
    assert!(harness.setup_calls.is_empty());
}

#[tokio::test]
async fn test_invalid_json_is_dropped() {
    let harness = Harness::new().await;
    harness.start().await;
    let hash = DiscoveryHash::new("sensor", "bla");

    harness.publish("homeassistant/sensor/bla/config", "not json").await;
    harness.publish("homeassistant/sensor/bla/config", "[1, 2]").await;
    settle().await;
    assert!(!harness.engine.is_discovered(&hash));

    harness
        .publish("homeassistant/sensor/bla/config", r#"{"name": "Beer"}"#)
        .await;
    assert!(wait_until(|| harness.entity(&hash).is_some()).await);
}

#[tokio::test]
async fn test_abbreviations_and_topic_base() {
    let harness = Harness::new().await;
    harness.start().await;
    let new = harness.record_signal(discovery_new_signal("switch", INTEGRATION));

    harness
        .publish(
            "homeassistant/switch/node1/relay/config",
            r#"{"~": "zone1", "name": "Relay", "stat_t": "~/state", "cmd_t": "cmd/~",
                "uniq_id": "relay-2", "dev": {"ids": ["0AFF"], "mf": "Acme"}}"#,
        )
        .await;
    assert!(wait_until(|| new.count() == 1).await);

    let payload = new.last().unwrap();
    assert_eq!(payload.get_str("state_topic"), Some("zone1/state"));
    assert_eq!(payload.get_str("command_topic"), Some("cmd/zone1"));
    assert_eq!(payload.get_str("unique_id"), Some("relay-2"));
    assert!(payload.get("~").is_none());
    assert_eq!(
        payload.discovery_hash(),
        Some(&DiscoveryHash::new("switch", "node1 relay"))
    );

    let hash = DiscoveryHash::new("switch", "node1 relay");
    assert!(wait_until(|| harness.entity(&hash).is_some()).await);
    let device_id = harness.entity(&hash).unwrap().device_id.unwrap();
    let device = harness.registries.devices.get(&device_id).unwrap();
    assert_eq!(device.manufacturer.as_deref(), Some("Acme"));
}

#[tokio::test]
async fn test_start_twice_and_restart() {
    let harness = Harness::new().await;
    harness.start().await;
    let hash = DiscoveryHash::new("light", "lamp");

    let err = harness
        .engine
        .async_start("homeassistant", harness.entry.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, MqttError::AlreadyStarted));

    harness
        .publish("homeassistant/light/lamp/config", r#"{"name": "Lamp"}"#)
        .await;
    assert!(wait_until(|| harness.entity(&hash).is_some()).await);

    harness.engine.async_stop().await;
    assert!(!harness.engine.is_running());
    assert_eq!(harness.engine.discovered_count(), 0);
    assert_eq!(harness.transport.route_count("homeassistant/+/+/config"), 0);
    assert_eq!(harness.transport.route_count("homeassistant/+/+/+/config"), 0);

    // Stopping again is a no-op
    harness.engine.async_stop().await;

    // The retained config is delivered again on the new subscription
    harness.start().await;
    assert!(wait_until(|| harness.setup_count("light") == 2).await);
    assert!(wait_until(|| harness.engine.is_discovered(&hash)).await);
}

#[tokio::test]
async fn test_invalid_prefix_is_rejected() {
    let harness = Harness::new().await;

    for prefix in ["", "home/#", "home/+/x"] {
        let err = harness
            .engine
            .async_start(prefix, harness.entry.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, MqttError::Config(_)));
    }
    assert!(!harness.engine.is_running());
}
