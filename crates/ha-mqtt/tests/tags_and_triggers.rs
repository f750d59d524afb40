mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{settle, wait_until, Harness};
use futures::FutureExt;
use ha_core::events::TagScannedData;
use ha_mqtt::device_trigger::{TriggerAction, TriggerFired};
use ha_mqtt::{discovery_done_signal, DiscoveryHash, MqttTransport, QoS};
use tokio::sync::mpsc;

async fn send(harness: &Harness, topic: &str, payload: &str) {
    harness
        .transport
        .publish(topic, payload.as_bytes().to_vec(), QoS::AtMostOnce, false)
        .await
        .unwrap();
}

const TAG_TOPIC: &str = "homeassistant/tag/reader1/config";
const TRIGGER_TOPIC: &str = "homeassistant/device_automation/bla/config";

fn trigger_config(payload: &str) -> String {
    format!(
        r#"{{"automation_type": "trigger", "topic": "foobar/triggers/button1",
            "payload": "{payload}", "type": "button_short_press", "subtype": "button_1",
            "device": {{"identifiers": ["0AFFD2"], "name": "Remote"}}}}"#
    )
}

#[tokio::test]
async fn test_tag_scans_fire_events() {
    let harness = Harness::new().await;
    harness.start().await;
    let hash = DiscoveryHash::new("tag", "reader1");
    let mut scans = harness.bus.subscribe_typed::<TagScannedData>();

    harness
        .publish(
            TAG_TOPIC,
            r#"{"topic": "reader1/scan", "dev": {"ids": ["reader-1"], "name": "Reader"}}"#,
        )
        .await;
    assert!(wait_until(|| harness.engine.tags().contains(&hash)).await);
    assert_eq!(harness.setup_count("tag"), 0);

    let (_, device_id) = harness.engine.tags().get(&hash).unwrap();
    send(&harness, "reader1/scan", "").await;
    send(&harness, "reader1/scan", " abc123 ").await;

    let event = tokio::time::timeout(Duration::from_secs(2), scans.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.data.tag_id, "abc123");
    assert_eq!(event.data.device_id, Some(device_id));
}

#[tokio::test]
async fn test_tag_update_and_removal() {
    let harness = Harness::new().await;
    harness.start().await;
    let hash = DiscoveryHash::new("tag", "reader1");
    let device = r#""device": {"identifiers": ["reader-1"]}"#;

    harness
        .publish(TAG_TOPIC, &format!(r#"{{"topic": "reader1/scan", {device}}}"#))
        .await;
    assert!(wait_until(|| harness.engine.tags().contains(&hash)).await);
    assert!(wait_until(|| !harness.engine.is_pending(&hash)).await);

    harness
        .publish(TAG_TOPIC, &format!(r#"{{"topic": "reader1/scan2", {device}}}"#))
        .await;
    assert!(wait_until(|| {
        harness.engine.tags().get(&hash).map(|(topic, _)| topic)
            == Some("reader1/scan2".to_string())
    })
    .await);
    assert_eq!(harness.transport.route_count("reader1/scan"), 0);
    assert_eq!(harness.transport.route_count("reader1/scan2"), 1);
    assert!(wait_until(|| !harness.engine.is_pending(&hash)).await);

    harness.publish(TAG_TOPIC, "").await;
    assert!(wait_until(|| !harness.engine.tags().contains(&hash)).await);
    assert!(wait_until(|| harness.registries.devices.is_empty()).await);
    assert!(!harness.engine.is_discovered(&hash));
    assert_eq!(harness.transport.route_count("reader1/scan2"), 0);
}

#[tokio::test]
async fn test_tag_without_device_is_not_set_up() {
    let harness = Harness::new().await;
    harness.start().await;
    let hash = DiscoveryHash::new("tag", "reader1");
    let done = harness.record_signal(discovery_done_signal(&hash));

    harness.publish(TAG_TOPIC, r#"{"topic": "reader1/scan"}"#).await;
    assert!(wait_until(|| done.count() == 1).await);

    assert!(!harness.engine.tags().contains(&hash));
    assert!(!harness.engine.is_discovered(&hash));
}

#[tokio::test]
async fn test_device_trigger_fires_attached_actions() {
    let harness = Harness::new().await;
    harness.start().await;
    let hash = DiscoveryHash::new("device_automation", "bla");

    harness.publish(TRIGGER_TOPIC, &trigger_config("short_press")).await;
    assert!(wait_until(|| harness.engine.triggers().len() == 1).await);

    let trigger = harness.engine.triggers().get(&hash).unwrap();
    assert_eq!(trigger.config.trigger_type, "button_short_press");
    assert_eq!(
        harness
            .engine
            .triggers()
            .triggers_for_device(&trigger.device_id)
            .len(),
        1
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let action: TriggerAction = Arc::new(move |fired: TriggerFired| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(fired);
        }
        .boxed()
    });
    let mut attached = harness
        .engine
        .triggers()
        .attach(&trigger.device_id, "bla", action)
        .unwrap();

    send(&harness, "foobar/triggers/button1", "long_press").await;
    send(&harness, "foobar/triggers/button1", "short_press").await;

    let fired = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fired.subtype, "button_1");
    assert_eq!(fired.payload, "short_press");
    settle().await;
    assert!(rx.try_recv().is_err());

    attached.unsubscribe();
    send(&harness, "foobar/triggers/button1", "short_press").await;
    settle().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_device_trigger_update_and_removal() {
    let harness = Harness::new().await;
    harness.start().await;
    let hash = DiscoveryHash::new("device_automation", "bla");

    harness.publish(TRIGGER_TOPIC, &trigger_config("short_press")).await;
    assert!(wait_until(|| harness.engine.triggers().len() == 1).await);
    assert!(wait_until(|| !harness.engine.is_pending(&hash)).await);

    harness.publish(TRIGGER_TOPIC, &trigger_config("double_press")).await;
    assert!(wait_until(|| {
        harness
            .engine
            .triggers()
            .get(&hash)
            .and_then(|t| t.config.payload)
            == Some("double_press".to_string())
    })
    .await);
    assert_eq!(harness.transport.route_count("foobar/triggers/button1"), 1);
    assert!(wait_until(|| !harness.engine.is_pending(&hash)).await);

    harness.publish(TRIGGER_TOPIC, "").await;
    assert!(wait_until(|| harness.engine.triggers().is_empty()).await);
    assert!(wait_until(|| harness.registries.devices.is_empty()).await);
    assert_eq!(harness.transport.route_count("foobar/triggers/button1"), 0);
    assert!(!harness.engine.is_discovered(&hash));
}
