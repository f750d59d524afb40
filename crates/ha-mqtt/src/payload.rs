//! Discovery payload normalization
//!
//! A raw discovery message becomes a [`NormalizedPayload`]: abbreviated keys
//! expanded, `~` topic base resolved, and the discovery hash and topic kept
//! next to the fields rather than inside them.

use serde_json::{Map, Value};

use crate::abbreviations::expand_abbreviations;
use crate::error::{MqttError, MqttResult};
use crate::topic::DiscoveryHash;

/// Key holding the topic base in a discovery payload
pub const TOPIC_BASE: &str = "~";

/// Where a discovered payload came from
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryMetadata {
    pub hash: DiscoveryHash,
    /// The payload as announced, after key expansion
    pub payload: Map<String, Value>,
    /// Topic the payload was received on
    pub topic: String,
}

/// A discovery payload with canonical keys
///
/// An empty payload is a removal. It carries no metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedPayload {
    pub fields: Map<String, Value>,
    pub discovery: Option<DiscoveryMetadata>,
    pub configuration_source: Option<String>,
}

impl NormalizedPayload {
    /// The removal payload
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn discovery_hash(&self) -> Option<&DiscoveryHash> {
        self.discovery.as_ref().map(|d| &d.hash)
    }

    pub fn discovery_topic(&self) -> Option<&str> {
        self.discovery.as_ref().map(|d| d.topic.as_str())
    }
}

/// Parse and normalize a raw discovery payload received on `topic`
///
/// An empty payload, or an empty JSON object, normalizes to the removal
/// payload. Anything that is not a JSON object is rejected.
pub fn normalize_payload(
    raw: &[u8],
    hash: &DiscoveryHash,
    topic: &str,
) -> MqttResult<NormalizedPayload> {
    if raw.is_empty() {
        return Ok(NormalizedPayload::empty());
    }

    let text = std::str::from_utf8(raw)
        .map_err(|e| MqttError::InvalidPayload(format!("payload is not UTF-8: {e}")))?;
    let map = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            return Err(MqttError::InvalidPayload(format!(
                "expected a JSON object, got {other}"
            )))
        }
        Err(e) => return Err(MqttError::InvalidPayload(e.to_string())),
    };
    if map.is_empty() {
        return Ok(NormalizedPayload::empty());
    }

    let mut fields = expand_abbreviations(map);
    substitute_topic_base(&mut fields);
    let announced = fields.clone();
    fields.insert("platform".to_string(), Value::String("mqtt".to_string()));

    Ok(NormalizedPayload {
        fields,
        discovery: Some(DiscoveryMetadata {
            hash: hash.clone(),
            payload: announced,
            topic: topic.to_string(),
        }),
        configuration_source: Some(format!("MQTT (topic: '{topic}')")),
    })
}

/// Replace a leading or trailing `~` in every `*topic` value with the base
///
/// Both ends are checked against the announced value. When both match, the
/// trailing substitution wins and the leading `~` is kept.
fn substitute_topic_base(fields: &mut Map<String, Value>) {
    let base = match fields.remove(TOPIC_BASE) {
        Some(Value::String(base)) => base,
        _ => return,
    };

    for (key, value) in fields.iter_mut() {
        if !key.ends_with("topic") {
            continue;
        }
        let Value::String(topic) = value else {
            continue;
        };
        if let Some(rest) = topic.strip_suffix(TOPIC_BASE) {
            *topic = format!("{rest}{base}");
        } else if let Some(rest) = topic.strip_prefix(TOPIC_BASE) {
            *topic = format!("{base}{rest}");
        }
    }
}
