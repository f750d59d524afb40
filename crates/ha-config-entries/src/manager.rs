//! Config Entries Manager
//!
//! Owns the config entries, their setup handlers and the per-domain
//! platform handlers that entries are forwarded to.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use ha_registries::{Storable, Storage, StorageFile, StorageResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::entry::{ConfigEntry, ConfigEntryState};

/// Storage key for config entries
pub const STORAGE_KEY: &str = "core.config_entries";
/// Current storage version
pub const STORAGE_VERSION: u32 = 1;
/// Current minor version
pub const STORAGE_MINOR_VERSION: u32 = 5;

#[derive(Debug, Error)]
pub enum ConfigEntriesError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists for domain {domain} with unique_id {unique_id}")]
    AlreadyExists { domain: String, unique_id: String },

    #[error("Cannot unload entry in state {0:?}")]
    CannotUnload(ConfigEntryState),

    #[error("Setup failed: {0}")]
    SetupFailed(String),

    #[error("Storage error: {0}")]
    Storage(#[from] ha_registries::StorageError),
}

pub type ConfigEntriesResult<T> = Result<T, ConfigEntriesError>;

/// Config entries data for storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigEntriesData {
    pub entries: Vec<ConfigEntry>,
}

impl Storable for ConfigEntriesData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Future returned by setup handlers
pub type SetupFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// Async setup routine, used both for whole entries and for a single
/// platform of an entry
pub type SetupHandler = Arc<dyn Fn(ConfigEntry) -> SetupFuture + Send + Sync>;

/// Wrap an async closure as a [`SetupHandler`]
pub fn setup_handler<F, Fut>(f: F) -> SetupHandler
where
    F: Fn(ConfigEntry) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    Arc::new(move |entry| -> SetupFuture { Box::pin(f(entry)) })
}

pub struct ConfigEntries {
    storage: Arc<Storage>,

    /// Primary index: entry_id -> ConfigEntry
    entries: DashMap<String, ConfigEntry>,

    /// Index: domain -> set of entry_ids
    by_domain: DashMap<String, HashSet<String>>,

    /// Index: (domain, unique_id) -> entry_id
    by_unique_id: DashMap<(String, String), String>,

    /// Serializes setup/unload
    setup_lock: Mutex<()>,

    /// Entry setup handlers by integration domain
    setup_handlers: DashMap<String, SetupHandler>,

    /// Platform setup handlers by platform domain (`sensor`, `light`, ...)
    platforms: DashMap<String, SetupHandler>,
}

impl ConfigEntries {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            entries: DashMap::new(),
            by_domain: DashMap::new(),
            by_unique_id: DashMap::new(),
            setup_lock: Mutex::new(()),
            setup_handlers: DashMap::new(),
            platforms: DashMap::new(),
        }
    }

    /// Load entries from storage
    pub async fn load(&self) -> StorageResult<()> {
        if let Some(storage_file) = self.storage.load::<ConfigEntriesData>(STORAGE_KEY).await? {
            info!(
                "Loading {} config entries from storage (v{}.{})",
                storage_file.data.entries.len(),
                storage_file.version,
                storage_file.minor_version
            );
            for entry in storage_file.data.entries {
                self.index_entry(&entry);
            }
        }
        Ok(())
    }

    /// Save entries to storage
    pub async fn save(&self) -> StorageResult<()> {
        let data = ConfigEntriesData {
            entries: self.entries.iter().map(|r| r.value().clone()).collect(),
        };
        let storage_file =
            StorageFile::new(STORAGE_KEY, data, STORAGE_VERSION, STORAGE_MINOR_VERSION);

        self.storage.save(&storage_file).await?;
        debug!("Saved {} config entries to storage", self.entries.len());
        Ok(())
    }

    fn index_entry(&self, entry: &ConfigEntry) {
        let entry_id = entry.entry_id.clone();

        self.entries.insert(entry_id.clone(), entry.clone());
        self.by_domain
            .entry(entry.domain.clone())
            .or_default()
            .insert(entry_id.clone());
        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .insert((entry.domain.clone(), unique_id.clone()), entry_id);
        }
    }

    fn unindex_entry(&self, entry: &ConfigEntry) {
        if let Some(mut ids) = self.by_domain.get_mut(&entry.domain) {
            ids.remove(&entry.entry_id);
        }
        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .remove(&(entry.domain.clone(), unique_id.clone()));
        }
        self.entries.remove(&entry.entry_id);
    }

    pub fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.entries.get(entry_id).map(|r| r.value().clone())
    }

    pub fn get_by_domain(&self, domain: &str) -> Vec<ConfigEntry> {
        self.by_domain
            .get(domain)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn get_by_unique_id(&self, domain: &str, unique_id: &str) -> Option<ConfigEntry> {
        self.by_unique_id
            .get(&(domain.to_string(), unique_id.to_string()))
            .and_then(|entry_id| self.get(&entry_id))
    }

    /// Add a new config entry, rejecting duplicate unique ids per domain
    pub async fn add(&self, entry: ConfigEntry) -> ConfigEntriesResult<ConfigEntry> {
        if let Some(ref unique_id) = entry.unique_id {
            if self.get_by_unique_id(&entry.domain, unique_id).is_some() {
                return Err(ConfigEntriesError::AlreadyExists {
                    domain: entry.domain.clone(),
                    unique_id: unique_id.clone(),
                });
            }
        }

        self.index_entry(&entry);
        self.save().await?;

        info!(
            "Added config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry.entry_id
        );
        Ok(entry)
    }

    pub async fn remove(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntry> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        self.unindex_entry(&entry);
        self.save().await?;

        info!(
            "Removed config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry_id
        );
        Ok(entry)
    }

    pub fn set_state(&self, entry_id: &str, state: ConfigEntryState, reason: Option<String>) {
        if let Some(mut entry) = self.entries.get_mut(entry_id) {
            entry.state = state;
            entry.reason = reason;
            debug!("Entry {} state changed to {:?}", entry_id, state);
        }
    }

    /// Register the setup routine of an integration
    pub fn register_setup_handler(&self, domain: &str, handler: SetupHandler) {
        self.setup_handlers.insert(domain.to_string(), handler);
        debug!("Registered setup handler for domain: {}", domain);
    }

    /// Register the setup routine of a platform (`sensor`, `switch`, ...)
    pub fn register_platform(&self, domain: &str, handler: SetupHandler) {
        self.platforms.insert(domain.to_string(), handler);
        debug!("Registered platform: {}", domain);
    }

    /// Set up an entry with its integration's handler
    #[instrument(skip(self))]
    pub async fn setup(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        let _lock = self.setup_lock.lock().await;

        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        self.set_state(entry_id, ConfigEntryState::SetupInProgress, None);

        // Clone the handler out so the map guard is not held across await
        let handler = self.setup_handlers.get(&entry.domain).map(|h| h.clone());
        let Some(handler) = handler else {
            self.set_state(entry_id, ConfigEntryState::Loaded, None);
            debug!(
                "No setup handler for domain {}, marking as loaded",
                entry.domain
            );
            return Ok(());
        };

        match handler(entry.clone()).await {
            Ok(()) => {
                self.set_state(entry_id, ConfigEntryState::Loaded, None);
                info!("Setup completed for entry: {} ({})", entry.title, entry_id);
                Ok(())
            }
            Err(reason) => {
                warn!("Setup failed for entry {}: {}", entry_id, reason);
                self.set_state(entry_id, ConfigEntryState::SetupError, Some(reason.clone()));
                Err(ConfigEntriesError::SetupFailed(reason))
            }
        }
    }

    pub async fn unload(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        let _lock = self.setup_lock.lock().await;

        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        if entry.state == ConfigEntryState::SetupInProgress {
            return Err(ConfigEntriesError::CannotUnload(entry.state));
        }

        self.set_state(entry_id, ConfigEntryState::NotLoaded, None);
        info!("Unloaded entry: {} ({})", entry.title, entry_id);
        Ok(())
    }

    /// Forward the setup of `entry` to the platform `domain`
    ///
    /// A platform that never registered a handler has nothing to set up.
    #[instrument(skip(self, entry), fields(entry_id = %entry.entry_id))]
    pub async fn async_forward_entry_setup(
        &self,
        entry: &ConfigEntry,
        domain: &str,
    ) -> ConfigEntriesResult<()> {
        let handler = self.platforms.get(domain).map(|h| h.clone());
        let Some(handler) = handler else {
            debug!("No platform handler for {}, nothing to forward", domain);
            return Ok(());
        };

        handler(entry.clone()).await.map_err(|reason| {
            warn!("Platform {} setup failed for {}: {}", domain, entry.domain, reason);
            ConfigEntriesError::SetupFailed(format!("{domain}: {reason}"))
        })?;

        debug!("Forwarded entry {} to platform {}", entry.entry_id, domain);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ConfigEntrySource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    fn create_test_manager() -> (TempDir, ConfigEntries) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path()));
        (temp_dir, ConfigEntries::new(storage))
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> SetupHandler {
        setup_handler(move |_entry| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_duplicate_unique_id_rejected() {
        let (_dir, manager) = create_test_manager();

        let entry1 = ConfigEntry::new("hue", "Bridge 1").with_unique_id("same-id");
        let entry2 = ConfigEntry::new("hue", "Bridge 2").with_unique_id("same-id");

        manager.add(entry1).await.unwrap();
        let result = manager.add(entry2).await;

        assert!(matches!(
            result,
            Err(ConfigEntriesError::AlreadyExists { .. })
        ));
        assert_eq!(manager.get_by_domain("hue").len(), 1);
    }

    #[tokio::test]
    async fn test_remove_entry() {
        let (_dir, manager) = create_test_manager();

        let entry = manager.add(ConfigEntry::new("hue", "Test")).await.unwrap();
        manager.remove(&entry.entry_id).await.unwrap();
        assert!(manager.is_empty());
        assert!(matches!(
            manager.remove(&entry.entry_id).await,
            Err(ConfigEntriesError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_setup_and_unload() {
        let (_dir, manager) = create_test_manager();
        let calls = Arc::new(AtomicUsize::new(0));
        manager.register_setup_handler("mqtt", counting_handler(calls.clone()));

        let entry = manager.add(ConfigEntry::new("mqtt", "Broker")).await.unwrap();
        manager.setup(&entry.entry_id).await.unwrap();
        assert!(manager.get(&entry.entry_id).unwrap().is_loaded());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        manager.unload(&entry.entry_id).await.unwrap();
        assert_eq!(
            manager.get(&entry.entry_id).unwrap().state,
            ConfigEntryState::NotLoaded
        );
    }

    #[tokio::test]
    async fn test_setup_handler_failure() {
        let (_dir, manager) = create_test_manager();
        manager.register_setup_handler(
            "hue",
            setup_handler(|_entry| async { Err("Connection failed".to_string()) }),
        );

        let entry = manager.add(ConfigEntry::new("hue", "Test")).await.unwrap();
        let result = manager.setup(&entry.entry_id).await;

        assert!(matches!(result, Err(ConfigEntriesError::SetupFailed(_))));
        assert_eq!(
            manager.get(&entry.entry_id).unwrap().state,
            ConfigEntryState::SetupError
        );
    }

    #[tokio::test]
    async fn test_forward_entry_setup() {
        let (_dir, manager) = create_test_manager();
        let calls = Arc::new(AtomicUsize::new(0));
        manager.register_platform("sensor", counting_handler(calls.clone()));
        manager.register_platform(
            "light",
            setup_handler(|_entry| async { Err("boom".to_string()) }),
        );

        let entry = ConfigEntry::new("mqtt", "Broker");
        manager
            .async_forward_entry_setup(&entry, "sensor")
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Unknown platform is a no-op
        manager
            .async_forward_entry_setup(&entry, "vacuum")
            .await
            .unwrap();

        let err = manager
            .async_forward_entry_setup(&entry, "light")
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigEntriesError::SetupFailed(msg) if msg.contains("boom")));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path()));

        {
            let manager = ConfigEntries::new(storage.clone());
            manager
                .add(
                    ConfigEntry::new("hue", "Test")
                        .with_unique_id("test-123")
                        .with_source(ConfigEntrySource::Mqtt),
                )
                .await
                .unwrap();
        }

        let manager = ConfigEntries::new(storage);
        manager.load().await.unwrap();

        let entry = manager.get_by_unique_id("hue", "test-123").unwrap();
        assert_eq!(entry.title, "Test");
        assert_eq!(entry.source, ConfigEntrySource::Mqtt);
    }
}
