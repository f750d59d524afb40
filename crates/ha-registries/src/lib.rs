//! Persistent device and entity registries
//!
//! Both registries persist as versioned JSON in the `.storage/` directory.

pub mod storage;

pub mod device_registry;
pub mod entity_registry;

pub use storage::{Storable, Storage, StorageError, StorageFile, StorageResult};

pub use entity_registry::{
    slugify, DisabledBy, EntityEntry, EntityRegistry, EntityRegistryData, EntityRegistryError,
};

pub use device_registry::{
    format_mac, DeviceConnection, DeviceEntry, DeviceIdentifier, DeviceInfo, DeviceRegistry,
    DeviceRegistryData,
};

use std::sync::Arc;

use ha_event_bus::EventBus;

/// Device and entity registries sharing one storage directory
pub struct Registries {
    pub storage: Arc<Storage>,
    pub entities: EntityRegistry,
    pub devices: DeviceRegistry,
}

impl Registries {
    /// Registries persisted under `config_dir`, reporting device changes on `bus`
    pub fn new(config_dir: impl AsRef<std::path::Path>, bus: Arc<EventBus>) -> Self {
        let storage = Arc::new(Storage::new(config_dir));

        Self {
            entities: EntityRegistry::new(storage.clone()),
            devices: DeviceRegistry::new(storage.clone()).with_event_bus(bus),
            storage,
        }
    }

    pub async fn load_all(&self) -> StorageResult<()> {
        self.entities.load().await?;
        self.devices.load().await?;
        Ok(())
    }

    pub async fn save_all(&self) -> StorageResult<()> {
        self.entities.save().await?;
        self.devices.save().await?;
        Ok(())
    }
}
