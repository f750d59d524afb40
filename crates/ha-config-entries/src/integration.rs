//! Integration manifests
//!
//! Each integration ships a `manifest.json`. The only field discovery cares
//! about is `mqtt`: topic filters whose messages should start the
//! integration's config flow.

use std::collections::HashMap;
use std::path::Path;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationManifest {
    pub domain: String,
    pub name: String,
    #[serde(default)]
    pub config_flow: bool,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// MQTT topic filters that trigger discovery flows
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mqtt: Vec<String>,
}

/// Loaded integration manifests
#[derive(Default)]
pub struct Integrations {
    manifests: DashMap<String, IntegrationManifest>,
}

impl Integrations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, manifest: IntegrationManifest) {
        debug!("Registered manifest for {}", manifest.domain);
        self.manifests.insert(manifest.domain.clone(), manifest);
    }

    /// Load every `<dir>/<domain>/manifest.json`
    ///
    /// Unreadable or invalid manifests are skipped. Returns how many loaded.
    pub async fn load_dir(&self, components_dir: &Path) -> std::io::Result<usize> {
        let mut loaded = 0;
        let mut dirs = fs::read_dir(components_dir).await?;

        while let Some(dir) = dirs.next_entry().await? {
            let manifest_path = dir.path().join("manifest.json");
            let content = match fs::read_to_string(&manifest_path).await {
                Ok(content) => content,
                Err(_) => continue,
            };
            match serde_json::from_str::<IntegrationManifest>(&content) {
                Ok(manifest) => {
                    self.register(manifest);
                    loaded += 1;
                }
                Err(e) => warn!("Failed to parse manifest {:?}: {}", manifest_path, e),
            }
        }

        info!("Loaded {} integration manifests", loaded);
        Ok(loaded)
    }

    pub fn get(&self, domain: &str) -> Option<IntegrationManifest> {
        self.manifests.get(domain).map(|m| m.value().clone())
    }

    /// Integration domain -> MQTT topics it wants to watch
    pub fn mqtt_topics(&self) -> HashMap<String, Vec<String>> {
        self.manifests
            .iter()
            .filter(|m| !m.mqtt.is_empty())
            .map(|m| (m.key().clone(), m.mqtt.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }
}
