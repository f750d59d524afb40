//! Config flows
//!
//! A flow is how an integration turns outside input (a user, a discovery
//! message) into a config entry. Handlers decide; the [`FlowManager`] turns a
//! `create_entry` result into a stored [`ConfigEntry`].

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::entry::{ConfigEntry, ConfigEntrySource};
use crate::manager::{ConfigEntries, ConfigEntriesError};

pub const ABORT_ALREADY_CONFIGURED: &str = "already_configured";
pub const ABORT_SINGLE_INSTANCE_ALLOWED: &str = "single_instance_allowed";

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("No config flow handler for {0}")]
    UnknownHandler(String),

    #[error("Flow handler {domain} failed: {reason}")]
    Handler { domain: String, reason: String },

    #[error(transparent)]
    ConfigEntries(#[from] ConfigEntriesError),
}

/// How a flow step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowResultType {
    Form,
    CreateEntry,
    Abort,
}

/// Result of a flow step
#[derive(Debug, Clone, Serialize)]
pub struct FlowResult {
    pub flow_id: String,
    /// Integration domain
    pub handler: String,
    #[serde(rename = "type")]
    pub result_type: FlowResultType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Abort reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
    /// Entry data (create_entry) or the created entry id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl FlowResult {
    fn new(result_type: FlowResultType) -> Self {
        Self {
            flow_id: ulid::Ulid::new().to_string().to_lowercase(),
            handler: String::new(),
            result_type,
            step_id: None,
            title: None,
            reason: None,
            unique_id: None,
            result: None,
        }
    }

    pub fn form(step_id: impl Into<String>) -> Self {
        Self {
            step_id: Some(step_id.into()),
            ..Self::new(FlowResultType::Form)
        }
    }

    pub fn create_entry(title: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            title: Some(title.into()),
            result: Some(data),
            ..Self::new(FlowResultType::CreateEntry)
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::new(FlowResultType::Abort)
        }
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn is_abort(&self) -> bool {
        self.result_type == FlowResultType::Abort
    }
}

/// Where a flow was started from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowContext {
    pub source: ConfigEntrySource,
}

impl FlowContext {
    pub fn new(source: ConfigEntrySource) -> Self {
        Self { source }
    }
}

/// An integration's config flow
#[async_trait]
pub trait FlowHandler: Send + Sync {
    /// Run the first step of a flow
    ///
    /// `data` carries the discovery payload for discovery sources.
    async fn async_step_init(
        &self,
        context: FlowContext,
        data: serde_json::Value,
    ) -> Result<FlowResult, String>;
}

pub struct FlowManager {
    entries: Arc<ConfigEntries>,
    handlers: DashMap<String, Arc<dyn FlowHandler>>,
}

impl FlowManager {
    pub fn new(entries: Arc<ConfigEntries>) -> Self {
        Self {
            entries,
            handlers: DashMap::new(),
        }
    }

    pub fn register(&self, domain: &str, handler: Arc<dyn FlowHandler>) {
        self.handlers.insert(domain.to_string(), handler);
        debug!("Registered config flow for {}", domain);
    }

    /// Start a flow for `domain`
    #[instrument(skip(self, data))]
    pub async fn async_init(
        &self,
        domain: &str,
        context: FlowContext,
        data: serde_json::Value,
    ) -> Result<FlowResult, FlowError> {
        let handler = self
            .handlers
            .get(domain)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| FlowError::UnknownHandler(domain.to_string()))?;

        let mut result = handler
            .async_step_init(context, data)
            .await
            .map_err(|reason| FlowError::Handler {
                domain: domain.to_string(),
                reason,
            })?;
        result.handler = domain.to_string();

        if result.result_type != FlowResultType::CreateEntry {
            return Ok(result);
        }

        let mut entry = ConfigEntry::new(domain, result.title.clone().unwrap_or_default())
            .with_source(context.source);
        entry.unique_id = result.unique_id.clone();
        if let Some(serde_json::Value::Object(map)) = &result.result {
            entry.data = map.clone().into_iter().collect();
        }

        match self.entries.add(entry).await {
            Ok(entry) => {
                info!("Config flow for {} created entry {}", domain, entry.entry_id);
                Ok(result)
            }
            Err(ConfigEntriesError::AlreadyExists { .. }) => {
                debug!("Config flow for {} aborted: already configured", domain);
                let mut abort = FlowResult::abort(ABORT_ALREADY_CONFIGURED);
                abort.flow_id = result.flow_id;
                abort.handler = result.handler;
                Ok(abort)
            }
            Err(e) => Err(e.into()),
        }
    }
}
