//! Config Entries
//!
//! Config entries represent individual integration instances. This crate
//! also holds what creates and sets them up:
//!
//! - [`ConfigEntries`] - storage, setup and forwarding of an entry to platforms
//! - [`FlowManager`] - config flows that turn discovery into entries
//! - [`Integrations`] - manifests, including the MQTT topics integrations watch
//!
//! Entries are persisted in `.storage/core.config_entries`.

pub mod entry;
pub mod flow;
pub mod integration;
pub mod manager;

pub use entry::{ConfigEntry, ConfigEntrySource, ConfigEntryState};

pub use flow::{
    FlowContext, FlowError, FlowHandler, FlowManager, FlowResult, FlowResultType,
    ABORT_ALREADY_CONFIGURED, ABORT_SINGLE_INSTANCE_ALLOWED,
};

pub use integration::{IntegrationManifest, Integrations};

pub use manager::{
    setup_handler, ConfigEntries, ConfigEntriesData, ConfigEntriesError, ConfigEntriesResult,
    SetupFuture, SetupHandler, STORAGE_KEY, STORAGE_MINOR_VERSION, STORAGE_VERSION,
};
