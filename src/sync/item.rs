//! Sync items: the atomic pieces of cross-device state.
//!
//! An item is identified logically by `(item type, owner, key)`. Its
//! fingerprint is a SHA-256 over the canonical `{type, key, value}` and is
//! what equality, dedup and conflict checks compare; timestamps and
//! versions are deliberately not part of it.

use crate::envelope::{canonical_json, sha256_hex, DeviceClass, Priority};
use crate::registry::Capability;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Marker appended to truncated text.
const ELLIPSIS: char = '…';

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    ConversationTurn,
    Preference,
    ContextBlob,
    DeviceState,
    SkillData,
    HealthData,
}

impl ItemType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConversationTurn => "conversation_turn",
            Self::Preference => "preference",
            Self::ContextBlob => "context_blob",
            Self::DeviceState => "device_state",
            Self::SkillData => "skill_data",
            Self::HealthData => "health_data",
        }
    }

    /// Capability a device must declare to receive this type at all.
    pub fn required_capability(self) -> Option<Capability> {
        match self {
            Self::HealthData => Some(Capability::HealthData),
            _ => None,
        }
    }

    /// Whether a reduced variant may stand in for an oversized payload.
    pub fn summarizable(self) -> bool {
        matches!(
            self,
            Self::ConversationTurn | Self::ContextBlob | Self::DeviceState | Self::SkillData
        )
    }

    pub fn default_priority(self) -> Priority {
        match self {
            Self::ConversationTurn => Priority::High,
            Self::DeviceState => Priority::Low,
            _ => Priority::Normal,
        }
    }
}

impl std::fmt::Display for ItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_owned()))
            .map_err(|_| format!("unknown item type `{s}`"))
    }
}

/// What an operation does to the item it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Merge,
    ConflictResolution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncItem {
    pub id: String,
    pub item_type: ItemType,
    /// Logical key within the owner's namespace (turn id, preference name...).
    pub key: String,
    pub user_id: String,
    pub origin_device_id: String,
    pub origin_class: DeviceClass,
    pub value: Value,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub version: u64,
    pub fingerprint: String,
    /// Extra capability demanded by this particular item (skill data).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<Capability>,
    /// Set on reduced variants produced for constrained devices.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub summarized: bool,
}

impl SyncItem {
    pub fn new(
        item_type: ItemType,
        key: impl Into<String>,
        user_id: impl Into<String>,
        origin_device_id: impl Into<String>,
        origin_class: DeviceClass,
        value: Value,
    ) -> Self {
        let key = key.into();
        let fingerprint = fingerprint(item_type, &key, &value);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            item_type,
            key,
            user_id: user_id.into(),
            origin_device_id: origin_device_id.into(),
            origin_class,
            value,
            timestamp: now_ms(),
            version: 1,
            fingerprint,
            requires: None,
            summarized: false,
        }
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn requiring(mut self, capability: Capability) -> Self {
        self.requires = Some(capability);
        self
    }

    /// `type:owner:key`; operations sharing it are ordered per target.
    pub fn logical_key(&self) -> String {
        format!("{}:{}:{}", self.item_type, self.user_id, self.key)
    }

    pub fn required_capability(&self) -> Option<Capability> {
        self.requires.or_else(|| self.item_type.required_capability())
    }

    /// Size of the value in its canonical serialized form.
    pub fn payload_size(&self) -> usize {
        canonical_json(&self.value).map_or(0, |bytes| bytes.len())
    }

    /// Recompute the fingerprint from the current value.
    pub fn fingerprint_matches(&self) -> bool {
        fingerprint(self.item_type, &self.key, &self.value) == self.fingerprint
    }

    /// Reduced variant for devices that cannot take the full payload.
    ///
    /// Conversation text is truncated to `text_chars` characters; structured
    /// fields whose serialized size exceeds `field_bytes` are removed. The
    /// fingerprint of the original is kept so receivers can still compare
    /// against the canonical value.
    pub fn summarize(&self, text_chars: usize, field_bytes: usize) -> Option<SyncItem> {
        if !self.item_type.summarizable() {
            return None;
        }

        let value = match (&self.item_type, &self.value) {
            (ItemType::ConversationTurn, Value::String(text)) => {
                Value::String(truncate_chars(text, text_chars))
            }
            (ItemType::ConversationTurn, Value::Object(map)) => {
                let mut reduced = Map::new();
                for (k, v) in map {
                    match v {
                        Value::String(text) => {
                            reduced.insert(k.clone(), Value::String(truncate_chars(text, text_chars)));
                        }
                        other if serialized_len(other) <= field_bytes => {
                            reduced.insert(k.clone(), other.clone());
                        }
                        _ => {}
                    }
                }
                Value::Object(reduced)
            }
            (_, Value::Object(map)) => {
                let mut reduced = Map::new();
                let mut removed = Vec::new();
                for (k, v) in map {
                    if serialized_len(v) <= field_bytes {
                        reduced.insert(k.clone(), v.clone());
                    } else {
                        removed.push(Value::String(k.clone()));
                    }
                }
                if !removed.is_empty() {
                    reduced.insert("_removed".into(), Value::Array(removed));
                }
                Value::Object(reduced)
            }
            (_, Value::String(text)) => Value::String(truncate_chars(text, text_chars)),
            (_, other) if serialized_len(other) <= field_bytes => other.clone(),
            _ => json!({ "_removed": ["value"] }),
        };

        let mut summary = self.clone();
        summary.value = value;
        summary.summarized = true;
        Some(summary)
    }
}

fn fingerprint(item_type: ItemType, key: &str, value: &Value) -> String {
    let subject = json!({ "type": item_type, "key": key, "value": value });
    let bytes = canonical_json(&subject).unwrap_or_default();
    sha256_hex(&bytes)
}

fn serialized_len(value: &Value) -> usize {
    canonical_json(value).map_or(usize::MAX, |bytes| bytes.len())
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push(ELLIPSIS);
    out
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
