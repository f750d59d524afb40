//! Discovery topics
//!
//! `<prefix>/<component>/[<node_id>/]<object_id>/config`

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Components that may be announced over discovery
pub const SUPPORTED_COMPONENTS: &[&str] = &[
    "alarm_control_panel",
    "binary_sensor",
    "camera",
    "climate",
    "cover",
    "device_automation",
    "fan",
    "light",
    "lock",
    "scene",
    "sensor",
    "switch",
    "tag",
    "vacuum",
];

pub fn is_supported_component(component: &str) -> bool {
    SUPPORTED_COMPONENTS.contains(&component)
}

/// Identity of one discovered entity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveryHash {
    pub component: String,
    /// `object_id`, or `"<node_id> <object_id>"`
    pub discovery_id: String,
}

impl DiscoveryHash {
    pub fn new(component: impl Into<String>, discovery_id: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            discovery_id: discovery_id.into(),
        }
    }
}

impl fmt::Display for DiscoveryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.component, self.discovery_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryTopic {
    pub component: String,
    pub node_id: Option<String>,
    pub object_id: String,
}

impl DiscoveryTopic {
    pub fn discovery_id(&self) -> String {
        match &self.node_id {
            Some(node_id) => format!("{} {}", node_id, self.object_id),
            None => self.object_id.clone(),
        }
    }

    pub fn hash(&self) -> DiscoveryHash {
        DiscoveryHash::new(&self.component, self.discovery_id())
    }
}

fn topic_matcher() -> Option<&'static Regex> {
    static MATCHER: OnceLock<Option<Regex>> = OnceLock::new();
    MATCHER
        .get_or_init(|| {
            Regex::new(
                r"^(?P<component>\w+)/(?:(?P<node_id>[a-zA-Z0-9_-]+)/)?(?P<object_id>[a-zA-Z0-9_-]+)/config$",
            )
            .ok()
        })
        .as_ref()
}

/// Split a topic received under `prefix` into its discovery parts
///
/// Returns `None` for anything that is not a discovery config topic.
pub fn parse_discovery_topic(prefix: &str, topic: &str) -> Option<DiscoveryTopic> {
    let trimmed = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let caps = topic_matcher()?.captures(trimmed)?;

    Some(DiscoveryTopic {
        component: caps["component"].to_string(),
        node_id: caps.name("node_id").map(|m| m.as_str().to_string()),
        object_id: caps["object_id"].to_string(),
    })
}

/// Subscription filters covering both topic shapes
pub fn discovery_filters(prefix: &str) -> [String; 2] {
    [
        format!("{prefix}/+/+/config"),
        format!("{prefix}/+/+/+/config"),
    ]
}
