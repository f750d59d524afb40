//! Device Registry
//!
//! Tracks devices by identifier and connection. Discovered entities create
//! rows here from the `device` block of their discovery payload; rows with
//! nothing left pointing at them are removed again by the discovery cleanup.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ha_core::events::{DeviceRegistryAction, DeviceRegistryUpdatedData};
use ha_core::Context;
use ha_event_bus::EventBus;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::entity_registry::DisabledBy;
use crate::storage::{Storable, Storage, StorageFile, StorageResult};

/// Storage key for device registry
pub const STORAGE_KEY: &str = "core.device_registry";
/// Current storage version
pub const STORAGE_VERSION: u32 = 1;
/// Current minor version
pub const STORAGE_MINOR_VERSION: u32 = 3;

pub const CONNECTION_NETWORK_MAC: &str = "mac";

/// A device identifier (domain, id) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentifier(pub String, pub String);

impl DeviceIdentifier {
    pub fn new(domain: impl Into<String>, id: impl Into<String>) -> Self {
        Self(domain.into(), id.into())
    }

    pub fn domain(&self) -> &str {
        &self.0
    }

    pub fn id(&self) -> &str {
        &self.1
    }

    fn key(&self) -> String {
        format!("{}:{}", self.0, self.1)
    }
}

/// A device connection (type, id) pair, e.g. `("mac", "02:5b:26:a8:dc:12")`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceConnection(pub String, pub String);

impl DeviceConnection {
    /// Create a connection, normalizing MAC addresses
    pub fn new(conn_type: impl Into<String>, id: impl Into<String>) -> Self {
        let conn_type = conn_type.into();
        let id = id.into();
        let id = if conn_type == CONNECTION_NETWORK_MAC {
            format_mac(&id)
        } else {
            id
        };
        Self(conn_type, id)
    }

    pub fn connection_type(&self) -> &str {
        &self.0
    }

    pub fn id(&self) -> &str {
        &self.1
    }

    fn key(&self) -> String {
        format!("{}:{}", self.0, self.1)
    }
}

/// Normalize a MAC address to lowercase colon-separated form.
///
/// Unknown formats are returned unchanged.
pub fn format_mac(mac: &str) -> String {
    let count = |sep: char| mac.chars().filter(|c| *c == sep).count();

    if mac.len() == 17 && count(':') == 5 {
        return mac.to_lowercase();
    }

    let stripped = if mac.len() == 17 && count('-') == 5 {
        mac.replace('-', "")
    } else if mac.len() == 14 && count('.') == 2 {
        mac.replace('.', "")
    } else if mac.len() == 12 && mac.chars().all(|c| c.is_ascii_hexdigit()) {
        mac.to_string()
    } else {
        return mac.to_string();
    };

    stripped
        .to_lowercase()
        .as_bytes()
        .chunks(2)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or(""))
        .collect::<Vec<_>>()
        .join(":")
}

/// Device description supplied by an integration
///
/// Every `Some` field overwrites the stored value when the device already
/// exists; `None` leaves it alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub identifiers: Vec<DeviceIdentifier>,
    pub connections: Vec<DeviceConnection>,
    pub name: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub sw_version: Option<String>,
    pub suggested_area: Option<String>,
    /// Identifier of the parent device
    pub via_device: Option<DeviceIdentifier>,
}

impl DeviceInfo {
    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty() && self.connections.is_empty()
    }
}

/// A registered device entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: String,

    #[serde(default)]
    pub identifiers: Vec<DeviceIdentifier>,

    #[serde(default)]
    pub connections: Vec<DeviceConnection>,

    /// Config entries that reference this device
    #[serde(default)]
    pub config_entries: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_by_user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_area: Option<String>,

    /// Parent device (for devices behind a gateway)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via_device_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_by: Option<DisabledBy>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl DeviceEntry {
    pub fn new(name: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            identifiers: Vec::new(),
            connections: Vec::new(),
            config_entries: Vec::new(),
            name: name.map(str::to_string),
            name_by_user: None,
            manufacturer: None,
            model: None,
            sw_version: None,
            suggested_area: None,
            via_device_id: None,
            disabled_by: None,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }
}

/// Device registry data for storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRegistryData {
    pub devices: Vec<DeviceEntry>,
}

impl Storable for DeviceRegistryData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Device Registry with identifier and connection indexes
///
/// Entries are stored as `Arc<DeviceEntry>` so reads never clone the row.
/// When an event bus is attached, removals fire `device_registry_updated`.
pub struct DeviceRegistry {
    storage: Arc<Storage>,

    bus: Option<Arc<EventBus>>,

    /// Primary index: device_id -> DeviceEntry
    by_id: DashMap<String, Arc<DeviceEntry>>,

    /// Index: identifier key -> device_id
    by_identifier: DashMap<String, String>,

    /// Index: connection key -> device_id
    by_connection: DashMap<String, String>,

    /// Index: config_entry_id -> set of device_ids
    by_config_entry_id: DashMap<String, HashSet<String>>,
}

impl DeviceRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            bus: None,
            by_id: DashMap::new(),
            by_identifier: DashMap::new(),
            by_connection: DashMap::new(),
            by_config_entry_id: DashMap::new(),
        }
    }

    /// Fire `device_registry_updated` events on `bus`
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Load from storage
    pub async fn load(&self) -> StorageResult<()> {
        if let Some(storage_file) = self.storage.load::<DeviceRegistryData>(STORAGE_KEY).await? {
            info!(
                "Loading {} devices from storage (v{}.{})",
                storage_file.data.devices.len(),
                storage_file.version,
                storage_file.minor_version
            );
            for entry in storage_file.data.devices {
                self.index_entry(Arc::new(entry));
            }
        }
        Ok(())
    }

    /// Save to storage
    pub async fn save(&self) -> StorageResult<()> {
        let mut devices: Vec<DeviceEntry> =
            self.by_id.iter().map(|r| (**r.value()).clone()).collect();
        devices.sort_by_key(|d| d.created_at);

        let storage_file = StorageFile::new(
            STORAGE_KEY,
            DeviceRegistryData { devices },
            STORAGE_VERSION,
            STORAGE_MINOR_VERSION,
        );
        self.storage.save(&storage_file).await?;
        debug!("Saved {} devices to storage", self.by_id.len());
        Ok(())
    }

    fn index_entry(&self, entry: Arc<DeviceEntry>) {
        let device_id = entry.id.clone();

        for identifier in &entry.identifiers {
            self.by_identifier.insert(identifier.key(), device_id.clone());
        }
        for connection in &entry.connections {
            self.by_connection.insert(connection.key(), device_id.clone());
        }
        for config_entry_id in &entry.config_entries {
            self.by_config_entry_id
                .entry(config_entry_id.clone())
                .or_default()
                .insert(device_id.clone());
        }

        self.by_id.insert(device_id, entry);
    }

    fn unindex_entry(&self, entry: &DeviceEntry) {
        for identifier in &entry.identifiers {
            self.by_identifier.remove(&identifier.key());
        }
        for connection in &entry.connections {
            self.by_connection.remove(&connection.key());
        }
        for config_entry_id in &entry.config_entries {
            if let Some(mut ids) = self.by_config_entry_id.get_mut(config_entry_id) {
                ids.remove(&entry.id);
            }
        }
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        self.by_id.get(device_id).map(|r| Arc::clone(r.value()))
    }

    pub fn get_by_identifier(&self, identifier: &DeviceIdentifier) -> Option<Arc<DeviceEntry>> {
        self.by_identifier
            .get(&identifier.key())
            .and_then(|device_id| self.get(&device_id))
    }

    pub fn get_by_connection(&self, connection: &DeviceConnection) -> Option<Arc<DeviceEntry>> {
        self.by_connection
            .get(&connection.key())
            .and_then(|device_id| self.get(&device_id))
    }

    /// Find a device matching any identifier, then any connection
    pub fn get_device(
        &self,
        identifiers: &[DeviceIdentifier],
        connections: &[DeviceConnection],
    ) -> Option<Arc<DeviceEntry>> {
        identifiers
            .iter()
            .find_map(|i| self.get_by_identifier(i))
            .or_else(|| connections.iter().find_map(|c| self.get_by_connection(c)))
    }

    pub fn get_by_config_entry_id(&self, config_entry_id: &str) -> Vec<Arc<DeviceEntry>> {
        self.by_config_entry_id
            .get(config_entry_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// Get or create a device for `info`, attaching `config_entry_id`
    ///
    /// An existing device (matched by identifier, then connection) absorbs
    /// any new identifiers/connections and the metadata fields `info` sets.
    pub fn get_or_create(&self, config_entry_id: &str, info: &DeviceInfo) -> Arc<DeviceEntry> {
        let via_device_id = info
            .via_device
            .as_ref()
            .and_then(|via| self.get_by_identifier(via))
            .map(|via| via.id.clone());

        if let Some(existing) = self.get_device(&info.identifiers, &info.connections) {
            debug!("Found existing device: {}", existing.id);
            return self
                .update(&existing.id, |entry| {
                    merge_info(entry, config_entry_id, info, via_device_id.clone())
                })
                .unwrap_or(existing);
        }

        let mut entry = DeviceEntry::new(None);
        merge_info(&mut entry, config_entry_id, info, via_device_id);
        let entry = Arc::new(entry);
        self.index_entry(Arc::clone(&entry));

        info!("Registered new device: {:?} ({})", entry.name, entry.id);
        self.fire_updated(DeviceRegistryAction::Create, &entry.id);
        entry
    }

    /// Update a device entry in place
    ///
    /// `modified_at` is bumped only when the closure changed something.
    pub fn update<F>(&self, device_id: &str, f: F) -> Option<Arc<DeviceEntry>>
    where
        F: FnOnce(&mut DeviceEntry),
    {
        let (_, old) = self.by_id.remove(device_id)?;
        self.unindex_entry(&old);

        let mut entry = (*old).clone();
        f(&mut entry);
        let changed = entry_changed(&old, &entry);
        if changed {
            entry.modified_at = Utc::now();
        }

        let entry = Arc::new(entry);
        self.index_entry(Arc::clone(&entry));
        if changed {
            self.fire_updated(DeviceRegistryAction::Update, device_id);
        }
        Some(entry)
    }

    /// Remove a device and fire a `remove` update
    ///
    /// Removing an unknown id returns `None` and fires nothing.
    pub fn async_remove_device(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        let (_, entry) = self.by_id.remove(device_id)?;
        self.unindex_entry(&entry);

        // Children lose their parent link
        let children: Vec<String> = self
            .by_id
            .iter()
            .filter(|r| r.value().via_device_id.as_deref() == Some(device_id))
            .map(|r| r.key().clone())
            .collect();
        for child in children {
            self.update(&child, |e| e.via_device_id = None);
        }

        info!("Removed device: {}", device_id);
        self.fire_updated(DeviceRegistryAction::Remove, device_id);
        Some(entry)
    }

    fn fire_updated(&self, action: DeviceRegistryAction, device_id: &str) {
        if let Some(bus) = &self.bus {
            bus.fire_typed(
                DeviceRegistryUpdatedData {
                    action,
                    device_id: device_id.to_string(),
                },
                Context::new(),
            );
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Arc<DeviceEntry>> + '_ {
        self.by_id.iter().map(|r| Arc::clone(r.value()))
    }
}

fn merge_info(
    entry: &mut DeviceEntry,
    config_entry_id: &str,
    info: &DeviceInfo,
    via_device_id: Option<String>,
) {
    if !entry.config_entries.iter().any(|id| id == config_entry_id) {
        entry.config_entries.push(config_entry_id.to_string());
    }
    for identifier in &info.identifiers {
        if !entry.identifiers.contains(identifier) {
            entry.identifiers.push(identifier.clone());
        }
    }
    for connection in &info.connections {
        if !entry.connections.contains(connection) {
            entry.connections.push(connection.clone());
        }
    }

    let fields = [
        (&mut entry.name, &info.name),
        (&mut entry.manufacturer, &info.manufacturer),
        (&mut entry.model, &info.model),
        (&mut entry.sw_version, &info.sw_version),
        (&mut entry.suggested_area, &info.suggested_area),
    ];
    for (stored, given) in fields {
        if given.is_some() {
            stored.clone_from(given);
        }
    }
    if via_device_id.is_some() {
        entry.via_device_id = via_device_id;
    }
}

fn entry_changed(old: &DeviceEntry, new: &DeviceEntry) -> bool {
    old.identifiers != new.identifiers
        || old.connections != new.connections
        || old.config_entries != new.config_entries
        || old.name != new.name
        || old.name_by_user != new.name_by_user
        || old.manufacturer != new.manufacturer
        || old.model != new.model
        || old.sw_version != new.sw_version
        || old.suggested_area != new.suggested_area
        || old.via_device_id != new.via_device_id
        || old.disabled_by != new.disabled_by
}
