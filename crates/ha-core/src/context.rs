//! Causality context carried by every event

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Identifies what caused an event
///
/// A fresh context is minted for work that starts on its own (a message
/// arriving from the broker); work triggered by another event uses
/// [`Context::child`] so the chain can be followed in the logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// ULID of this context
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Context that caused this one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Context {
    pub fn new() -> Self {
        Self::with_id(Ulid::new().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: None,
            parent_id: None,
        }
    }

    /// Derive a context caused by this one
    pub fn child(&self) -> Self {
        Self {
            id: Ulid::new().to_string(),
            user_id: self.user_id.clone(),
            parent_id: Some(self.id.clone()),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
