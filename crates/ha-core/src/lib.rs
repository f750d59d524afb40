//! Core types shared by the hub crates
//!
//! Events and their causality context. Everything that travels over the
//! [`EventBus`](../ha_event_bus/struct.EventBus.html) is an [`Event`].

mod context;
mod event;

pub use context::Context;
pub use event::{Event, EventData, EventOrigin, EventType};

/// Well-known event types and their payloads
pub mod events {
    use super::*;
    use serde::{Deserialize, Serialize};

    /// Fired whenever a device registry row is created, updated or removed
    pub const DEVICE_REGISTRY_UPDATED: &str = "device_registry_updated";

    /// Fired when a tag scanner reports a tag
    pub const TAG_SCANNED: &str = "tag_scanned";

    /// What happened to a device registry row
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum DeviceRegistryAction {
        Create,
        Update,
        Remove,
    }

    /// Data for DEVICE_REGISTRY_UPDATED events
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DeviceRegistryUpdatedData {
        pub action: DeviceRegistryAction,
        pub device_id: String,
    }

    impl EventData for DeviceRegistryUpdatedData {
        fn event_type() -> &'static str {
            DEVICE_REGISTRY_UPDATED
        }
    }

    /// Data for TAG_SCANNED events
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TagScannedData {
        pub tag_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub device_id: Option<String>,
    }

    impl EventData for TagScannedData {
        fn event_type() -> &'static str {
            TAG_SCANNED
        }
    }
}
