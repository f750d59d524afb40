//! Event bus and signal dispatcher
//!
//! Two delivery mechanisms live here:
//!
//! - [`EventBus`]: typed broadcast of [`Event`]s such as device registry
//!   changes and scanned tags. Subscribers pull from a channel.
//! - [`Dispatcher`]: named in-process signals with push callbacks and
//!   explicit [`Disconnect`] handles. Discovery uses it for its
//!   new/updated/done signals.

mod dispatcher;

pub use dispatcher::{Disconnect, Dispatcher, SignalCallback, SignalFuture};

use dashmap::DashMap;
use ha_core::{Context, Event, EventData, EventType};
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Default channel capacity for event subscriptions
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Broadcast bus for [`Event`]s
pub struct EventBus {
    /// Per event type broadcast senders
    listeners: DashMap<EventType, broadcast::Sender<Event<serde_json::Value>>>,
    /// Sender for MATCH_ALL subscribers
    match_all_sender: broadcast::Sender<Event<serde_json::Value>>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (match_all_sender, _) = broadcast::channel(capacity);
        Self {
            listeners: DashMap::new(),
            match_all_sender,
            capacity,
        }
    }

    /// Subscribe to events of a specific type
    pub fn subscribe(
        &self,
        event_type: impl Into<EventType>,
    ) -> broadcast::Receiver<Event<serde_json::Value>> {
        let event_type = event_type.into();
        trace!(event_type = %event_type, "Subscribing to event type");

        if event_type.is_match_all() {
            return self.match_all_sender.subscribe();
        }

        self.listeners
            .entry(event_type)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Subscribe to a typed event; data that fails to parse is skipped
    pub fn subscribe_typed<T: EventData + serde::de::DeserializeOwned>(
        &self,
    ) -> TypedEventReceiver<T> {
        TypedEventReceiver::new(self.subscribe(T::event_type()))
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event<serde_json::Value>> {
        self.match_all_sender.subscribe()
    }

    /// Deliver an event to its type's subscribers and to MATCH_ALL subscribers
    pub fn fire(&self, event: Event<serde_json::Value>) {
        debug!(event_type = %event.event_type, "Firing event");

        if let Some(sender) = self.listeners.get(&event.event_type) {
            // Err only means there are no receivers right now
            let _ = sender.send(event.clone());
        }
        let _ = self.match_all_sender.send(event);
    }

    pub fn fire_typed<T: EventData + serde::Serialize>(&self, data: T, context: Context) {
        let data = serde_json::to_value(&data).unwrap_or_default();
        self.fire(Event::new(T::event_type(), data, context));
    }

    /// Number of event types with a channel
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A receiver that yields events with parsed data
pub struct TypedEventReceiver<T> {
    rx: broadcast::Receiver<Event<serde_json::Value>>,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: EventData + serde::de::DeserializeOwned> TypedEventReceiver<T> {
    fn new(rx: broadcast::Receiver<Event<serde_json::Value>>) -> Self {
        Self {
            rx,
            _phantom: std::marker::PhantomData,
        }
    }

    pub async fn recv(&mut self) -> Result<Event<T>, broadcast::error::RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if let Ok(data) = serde_json::from_value::<T>(event.data.clone()) {
                return Ok(Event {
                    event_type: event.event_type,
                    data,
                    origin: event.origin,
                    time_fired: event.time_fired,
                    context: event.context,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ha_core::events::{DeviceRegistryAction, DeviceRegistryUpdatedData, TagScannedData};
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribe_and_fire() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("test_event");

        bus.fire(Event::new("test_event", json!({"key": "value"}), Context::new()));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type.as_str(), "test_event");
        assert_eq!(received.data["key"], "value");
    }

    #[tokio::test]
    async fn test_match_all_subscription() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_all();

        let ctx = Context::new();
        bus.fire(Event::new("event_a", json!({}), ctx.clone()));
        bus.fire(Event::new("event_b", json!({}), ctx));

        assert_eq!(rx.recv().await.unwrap().event_type.as_str(), "event_a");
        assert_eq!(rx.recv().await.unwrap().event_type.as_str(), "event_b");
    }

    #[tokio::test]
    async fn test_typed_subscription_skips_other_shapes() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_typed::<DeviceRegistryUpdatedData>();

        // Same event type, wrong shape: skipped
        bus.fire(Event::new(
            "device_registry_updated",
            json!({"unexpected": true}),
            Context::new(),
        ));
        bus.fire_typed(
            DeviceRegistryUpdatedData {
                action: DeviceRegistryAction::Remove,
                device_id: "dev1".into(),
            },
            Context::new(),
        );

        let received = rx.recv().await.unwrap();
        assert_eq!(received.data.device_id, "dev1");
        assert_eq!(received.data.action, DeviceRegistryAction::Remove);
    }

    #[tokio::test]
    async fn test_no_cross_event_pollution() {
        let bus = EventBus::new();
        let mut rx_tags = bus.subscribe_typed::<TagScannedData>();
        let mut rx_other = bus.subscribe("event_b");

        bus.fire_typed(
            TagScannedData {
                tag_id: "tag1".into(),
                device_id: None,
            },
            Context::new(),
        );

        assert_eq!(rx_tags.recv().await.unwrap().data.tag_id, "tag1");
        assert!(rx_other.try_recv().is_err());
    }
}
