//! MQTT discovery hub
//!
//! Loads `configuration.yaml`, connects to the broker and turns discovery
//! announcements into devices and entities until interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use ha_config_entries::{
    setup_handler, ConfigEntries, ConfigEntry, ConfigEntrySource, FlowManager, Integrations,
};
use ha_event_bus::EventBus;
use ha_mqtt::{
    register_platforms, ConfigEntity, DiscoveryEngine, MqttClient, MqttConfig, INTEGRATION,
};
use ha_registries::Registries;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "configuration.yaml";

/// Shared services of a running hub
pub struct Hub {
    pub bus: Arc<EventBus>,
    pub registries: Arc<Registries>,
    pub config_entries: Arc<ConfigEntries>,
    pub flows: Arc<FlowManager>,
    pub integrations: Arc<Integrations>,
}

impl Hub {
    /// Load persisted registries and config entries from `config_dir`
    pub async fn load(config_dir: &Path) -> Result<Self> {
        let bus = Arc::new(EventBus::new());
        let registries = Arc::new(Registries::new(config_dir, bus.clone()));
        registries
            .load_all()
            .await
            .context("loading device and entity registries")?;

        let config_entries = Arc::new(ConfigEntries::new(registries.storage.clone()));
        config_entries
            .load()
            .await
            .context("loading config entries")?;

        let flows = Arc::new(FlowManager::new(config_entries.clone()));
        let integrations = Arc::new(Integrations::new());
        let components_dir = config_dir.join("custom_components");
        if components_dir.is_dir() {
            integrations.load_dir(&components_dir).await?;
        }

        Ok(Self {
            bus,
            registries,
            config_entries,
            flows,
            integrations,
        })
    }

    /// The config entry discovered platforms belong to
    async fn mqtt_entry(&self, config: &MqttConfig) -> Result<ConfigEntry> {
        if let Some(entry) = self.config_entries.get_by_domain(INTEGRATION).into_iter().next() {
            return Ok(entry);
        }
        let entry = ConfigEntry::new(INTEGRATION, config.broker.clone())
            .with_source(ConfigEntrySource::Import);
        Ok(self.config_entries.add(entry).await?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config_dir = config_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    info!("Starting MQTT discovery hub with {}", config_path.display());
    let config = MqttConfig::load(&config_path)
        .await
        .with_context(|| format!("reading {}", config_path.display()))?;

    let hub = Hub::load(&config_dir).await?;
    let client = MqttClient::connect(&config);
    let engine = DiscoveryEngine::new(
        client.clone(),
        hub.bus.clone(),
        hub.registries.clone(),
        hub.config_entries.clone(),
        hub.flows.clone(),
        hub.integrations.clone(),
    );
    register_platforms(&engine, ConfigEntity::factory());

    if config.discovery {
        let discovery = engine.clone();
        let prefix = config.discovery_prefix.clone();
        hub.config_entries.register_setup_handler(
            INTEGRATION,
            setup_handler(move |entry| {
                let engine = discovery.clone();
                let prefix = prefix.clone();
                async move {
                    engine
                        .async_start(&prefix, entry)
                        .await
                        .map_err(|e| e.to_string())
                }
            }),
        );
    } else {
        info!("MQTT discovery disabled");
    }

    let entry = hub.mqtt_entry(&config).await?;
    hub.config_entries
        .setup(&entry.entry_id)
        .await
        .context("setting up the mqtt entry")?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    engine.async_stop().await;
    if let Err(e) = hub.config_entries.unload(&entry.entry_id).await {
        warn!("Failed to unload the mqtt entry: {}", e);
    }
    client.disconnect().await;
    if let Err(e) = hub.registries.save_all().await {
        warn!("Failed to save registries: {}", e);
    }
    if let Err(e) = hub.config_entries.save().await {
        warn!("Failed to save config entries: {}", e);
    }

    Ok(())
}
