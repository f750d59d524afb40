//! Entity Registry
//!
//! Tracks registered entities keyed by `(domain, platform, unique_id)` and
//! linked to the device they belong to.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::storage::{Storable, Storage, StorageFile, StorageResult};

#[derive(Debug, Error, Clone)]
pub enum EntityRegistryError {
    #[error("Entity not found: {0}")]
    NotFound(String),
}

/// Storage key for entity registry
pub const STORAGE_KEY: &str = "core.entity_registry";
/// Current storage version
pub const STORAGE_VERSION: u32 = 1;
/// Current minor version
pub const STORAGE_MINOR_VERSION: u32 = 19;

/// Reason an entity or device was disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisabledBy {
    ConfigEntry,
    Device,
    Hass,
    Integration,
    User,
}

/// A registered entity entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEntry {
    /// Internal id
    pub id: String,
    /// Full entity ID (domain.object_id)
    pub entity_id: String,
    pub unique_id: String,
    /// Integration that provides this entity
    pub platform: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_entry_id: Option<String>,

    /// User-set name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Name reported by the integration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_by: Option<DisabledBy>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl EntityEntry {
    pub fn new(
        entity_id: impl Into<String>,
        platform: impl Into<String>,
        unique_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            entity_id: entity_id.into(),
            unique_id: unique_id.into(),
            platform: platform.into(),
            device_id: None,
            config_entry_id: None,
            name: None,
            original_name: None,
            disabled_by: None,
            created_at: now,
            modified_at: now,
        }
    }

    /// Get the domain from entity_id
    pub fn domain(&self) -> &str {
        self.entity_id.split('.').next().unwrap_or(&self.entity_id)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }

    fn unique_key(&self) -> UniqueKey {
        (
            self.domain().to_string(),
            self.platform.clone(),
            self.unique_id.clone(),
        )
    }
}

type UniqueKey = (String, String, String);

/// Entity registry data for storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityRegistryData {
    pub entities: Vec<EntityEntry>,
}

impl Storable for EntityRegistryData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Entity Registry
///
/// Lookups by entity_id (primary, insertion ordered), by
/// `(domain, platform, unique_id)` and by device.
pub struct EntityRegistry {
    storage: Arc<Storage>,

    /// Primary index: entity_id -> EntityEntry
    by_entity_id: RwLock<IndexMap<String, Arc<EntityEntry>>>,

    /// Index: (domain, platform, unique_id) -> entity_id
    by_unique_key: DashMap<UniqueKey, String>,

    /// Index: device_id -> set of entity_ids
    by_device_id: DashMap<String, HashSet<String>>,
}

impl EntityRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            by_entity_id: RwLock::new(IndexMap::new()),
            by_unique_key: DashMap::new(),
            by_device_id: DashMap::new(),
        }
    }

    /// Load from storage
    pub async fn load(&self) -> StorageResult<()> {
        if let Some(storage_file) = self.storage.load::<EntityRegistryData>(STORAGE_KEY).await? {
            info!(
                "Loading {} entities from storage (v{}.{})",
                storage_file.data.entities.len(),
                storage_file.version,
                storage_file.minor_version
            );
            for entry in storage_file.data.entities {
                self.index_entry(Arc::new(entry));
            }
        }
        Ok(())
    }

    /// Save to storage
    pub async fn save(&self) -> StorageResult<()> {
        let entities: Vec<EntityEntry> = self.iter().iter().map(|e| (**e).clone()).collect();
        let count = entities.len();

        let storage_file = StorageFile::new(
            STORAGE_KEY,
            EntityRegistryData { entities },
            STORAGE_VERSION,
            STORAGE_MINOR_VERSION,
        );
        self.storage.save(&storage_file).await?;
        debug!("Saved {} entities to storage", count);
        Ok(())
    }

    fn index_entry(&self, entry: Arc<EntityEntry>) {
        let entity_id = entry.entity_id.clone();

        self.by_unique_key
            .insert(entry.unique_key(), entity_id.clone());
        if let Some(ref device_id) = entry.device_id {
            self.by_device_id
                .entry(device_id.clone())
                .or_default()
                .insert(entity_id.clone());
        }
        if let Ok(mut idx) = self.by_entity_id.write() {
            idx.insert(entity_id, entry);
        }
    }

    fn unindex_entry(&self, entry: &EntityEntry) {
        self.by_unique_key.remove(&entry.unique_key());
        if let Some(ref device_id) = entry.device_id {
            if let Some(mut ids) = self.by_device_id.get_mut(device_id) {
                ids.remove(&entry.entity_id);
            }
        }
        if let Ok(mut idx) = self.by_entity_id.write() {
            idx.shift_remove(&entry.entity_id);
        }
    }

    pub fn get(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        self.by_entity_id
            .read()
            .ok()
            .and_then(|idx| idx.get(entity_id).cloned())
    }

    /// Look up the entity_id registered for a unique_id
    pub fn get_entity_id(&self, domain: &str, platform: &str, unique_id: &str) -> Option<String> {
        let key = (domain.to_string(), platform.to_string(), unique_id.to_string());
        self.by_unique_key.get(&key).map(|r| r.value().clone())
    }

    /// Entities attached to `device_id`
    pub fn entries_for_device(
        &self,
        device_id: &str,
        include_disabled: bool,
    ) -> Vec<Arc<EntityEntry>> {
        self.by_device_id
            .get(device_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.get(id))
                    .filter(|e| include_disabled || !e.is_disabled())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get or create the entity for `(domain, platform, unique_id)`
    ///
    /// An existing entry has its device and config entry links refreshed.
    pub fn get_or_create(
        &self,
        domain: &str,
        platform: &str,
        unique_id: &str,
        suggested_object_id: Option<&str>,
        config_entry_id: Option<&str>,
        device_id: Option<&str>,
    ) -> Arc<EntityEntry> {
        if let Some(entity_id) = self.get_entity_id(domain, platform, unique_id) {
            debug!("Found existing entity by unique_id: {}", entity_id);
            let relinked = self.update(&entity_id, |entry| {
                if let Some(device_id) = device_id {
                    entry.device_id = Some(device_id.to_string());
                }
                if let Some(config_entry_id) = config_entry_id {
                    entry.config_entry_id = Some(config_entry_id.to_string());
                }
            });
            if let Ok(entry) = relinked {
                return entry;
            }
        }

        let object_id = slugify(suggested_object_id.unwrap_or(&format!("{platform}_{unique_id}")));
        let entity_id = self.generate_entity_id(domain, &object_id);

        let mut entry = EntityEntry::new(&entity_id, platform, unique_id);
        entry.config_entry_id = config_entry_id.map(String::from);
        entry.device_id = device_id.map(String::from);
        entry.original_name = suggested_object_id.map(String::from);

        let entry = Arc::new(entry);
        self.index_entry(Arc::clone(&entry));
        info!("Registered new entity: {}", entity_id);
        entry
    }

    /// Update an entity entry
    pub fn update<F>(&self, entity_id: &str, f: F) -> Result<Arc<EntityEntry>, EntityRegistryError>
    where
        F: FnOnce(&mut EntityEntry),
    {
        let old = self
            .get(entity_id)
            .ok_or_else(|| EntityRegistryError::NotFound(entity_id.to_string()))?;
        self.unindex_entry(&old);

        let mut entry = (*old).clone();
        f(&mut entry);
        entry.modified_at = Utc::now();

        let entry = Arc::new(entry);
        self.index_entry(Arc::clone(&entry));
        Ok(entry)
    }

    pub fn remove(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        let entry = self.get(entity_id)?;
        self.unindex_entry(&entry);
        info!("Removed entity: {}", entity_id);
        Some(entry)
    }

    /// Pick a free entity_id, suffixing `_2`, `_3`, ... on collision
    pub fn generate_entity_id(&self, domain: &str, suggested_object_id: &str) -> String {
        let preferred = format!("{}.{}", domain, suggested_object_id);
        if !self.is_registered(&preferred) {
            return preferred;
        }
        (2..)
            .map(|n| format!("{}_{}", preferred, n))
            .find(|candidate| !self.is_registered(candidate))
            .unwrap_or(preferred)
    }

    pub fn is_registered(&self, entity_id: &str) -> bool {
        self.by_entity_id
            .read()
            .map(|idx| idx.contains_key(entity_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.by_entity_id.read().map(|idx| idx.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entities in insertion order
    pub fn iter(&self) -> Vec<Arc<EntityEntry>> {
        self.by_entity_id
            .read()
            .map(|idx| idx.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// Lowercase, with every run of non-alphanumerics collapsed to `_`
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        "unnamed".to_string()
    } else {
        slug.to_string()
    }
}
