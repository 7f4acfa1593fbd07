//! Canonical wire envelope for every unit of device communication.
//!
//! An envelope carries user input, assistant output, sync updates,
//! heartbeats and control traffic. Its payload is sealed with a SHA-256
//! checksum over a canonical (sorted-key, compact) JSON serialization, and
//! receivers recompute that checksum before acting on it.
//!
//! ## Wire shape
//!
//! ```text
//! {id, type, device_id, device_type, user_id, session_id, timestamp,
//!  content: {text?, structured_data?, audio_ref?, context?, attachments?},
//!  priority, security: {checksum, encryption_method?, compression?},
//!  compressed_content?, correlation_id?, target_devices?, broadcast,
//!  requires_response}
//! ```
//!
//! Envelopes are immutable once sealed. Changing anything means building a
//! new envelope (and therefore a new id) through [`EnvelopeBuilder`].
//! Deflate compression only changes the transport form of the payload, so
//! validation decompresses before checking the checksum.

use crate::error::ValidationError;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

/// Compression tag for deflate + base64 payloads.
pub const DEFLATE: &str = "deflate";

// ── Vocabulary shared with the registry ─────────────────────────

/// Hardware class a device declares on registration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Mobile,
    Desktop,
    Watch,
    Tv,
    Car,
    Web,
    Iot,
}

impl DeviceClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mobile => "mobile",
            Self::Desktop => "desktop",
            Self::Watch => "watch",
            Self::Tv => "tv",
            Self::Car => "car",
            Self::Web => "web",
            Self::Iot => "iot",
        }
    }
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of message. Unrecognized wire values land in [`MessageType::Unknown`]
/// so they can be acknowledged instead of failing to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    UserInput,
    AssistantResponse,
    SyncUpdate,
    SystemEvent,
    Heartbeat,
    Error,
    Authentication,
    DeviceStatus,
    #[serde(other)]
    Unknown,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserInput => "user_input",
            Self::AssistantResponse => "assistant_response",
            Self::SyncUpdate => "sync_update",
            Self::SystemEvent => "system_event",
            Self::Heartbeat => "heartbeat",
            Self::Error => "error",
            Self::Authentication => "authentication",
            Self::DeviceStatus => "device_status",
            Self::Unknown => "unknown",
        }
    }
}

/// Delivery priority, lowest first so the derived `Ord` ranks urgency.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Background,
    Low,
    #[default]
    Normal,
    High,
    Urgent,
    Critical,
}

impl Priority {
    /// All priorities from most to least urgent.
    pub const DESCENDING: [Priority; 6] = [
        Priority::Critical,
        Priority::Urgent,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    /// Band index, 0 = most urgent.
    pub fn band(self) -> usize {
        Self::DESCENDING
            .iter()
            .position(|p| *p == self)
            .unwrap_or(Self::DESCENDING.len() - 1)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Background => "background",
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
            Self::Critical => "critical",
        }
    }
}

// ── Payload ─────────────────────────────────────────────────────

/// Reference to a binary blob held outside the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub id: String,
    pub mime_type: String,
    pub size_bytes: u64,
    /// Hex SHA-256 of the blob contents.
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<BlobRef>,
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn structured(data: Value) -> Self {
        Self {
            structured_data: Some(data),
            ..Self::default()
        }
    }

    /// Canonical bytes the checksum is computed over.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, ValidationError> {
        let value =
            serde_json::to_value(self).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        canonical_json(&value).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    pub fn checksum(&self) -> Result<String, ValidationError> {
        Ok(sha256_hex(&self.canonical_bytes()?))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Security {
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
}

// ── Envelope ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub device_id: String,
    pub device_type: DeviceClass,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub content: Content,
    #[serde(default)]
    pub priority: Priority,
    pub security: Security,
    /// Base64 deflate of the canonical payload when `security.compression`
    /// is set; `content` is empty in that case.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_devices: Option<Vec<String>>,
    #[serde(default)]
    pub broadcast: bool,
    #[serde(default)]
    pub requires_response: bool,
}

impl MessageEnvelope {
    pub fn builder(
        message_type: MessageType,
        device_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> EnvelopeBuilder {
        EnvelopeBuilder::new(message_type, device_id, user_id)
    }

    /// Start a reply correlated to this envelope, addressed back to its
    /// sender.
    pub fn reply(
        &self,
        message_type: MessageType,
        from_device_id: impl Into<String>,
        from_class: DeviceClass,
    ) -> EnvelopeBuilder {
        let mut builder = EnvelopeBuilder::new(message_type, from_device_id, self.user_id.clone())
            .device_type(from_class)
            .priority(self.priority)
            .correlation(self.id.clone())
            .targets(vec![self.device_id.clone()]);
        builder.session_id = self.session_id.clone();
        builder
    }

    /// Copy every field into a builder. `build()` produces a new id.
    pub fn rebuild(&self) -> Result<EnvelopeBuilder, ValidationError> {
        Ok(EnvelopeBuilder {
            message_type: self.message_type,
            device_id: self.device_id.clone(),
            device_type: self.device_type,
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            content: self.decoded_content()?,
            priority: self.priority,
            correlation_id: self.correlation_id.clone(),
            target_devices: self.target_devices.clone(),
            broadcast: self.broadcast,
            requires_response: self.requires_response,
            encryption_method: self.security.encryption_method.clone(),
        })
    }

    /// The payload, decompressed if it travelled compressed.
    pub fn decoded_content(&self) -> Result<Content, ValidationError> {
        match (self.security.compression.as_deref(), &self.compressed_content) {
            (None, None) => Ok(self.content.clone()),
            (Some(DEFLATE), Some(encoded)) => {
                let compressed = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| ValidationError::Malformed(format!("compressed payload: {e}")))?;
                let mut raw = Vec::new();
                flate2::read::DeflateDecoder::new(compressed.as_slice())
                    .read_to_end(&mut raw)
                    .map_err(|e| ValidationError::Malformed(format!("inflate: {e}")))?;
                serde_json::from_slice(&raw)
                    .map_err(|e| ValidationError::Malformed(format!("payload json: {e}")))
            }
            (Some(DEFLATE), None) => Err(ValidationError::Malformed(
                "compression declared without compressed_content".into(),
            )),
            (None, Some(_)) => Err(ValidationError::Malformed(
                "compressed_content without compression tag".into(),
            )),
            (Some(other), _) => Err(ValidationError::UnsupportedEncoding(other.to_owned())),
        }
    }

    /// Check required fields and the payload checksum.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::MissingField("id"));
        }
        if self.device_id.trim().is_empty() {
            return Err(ValidationError::MissingField("device_id"));
        }
        if self.user_id.trim().is_empty() {
            return Err(ValidationError::MissingField("user_id"));
        }
        if self.security.checksum.trim().is_empty() {
            return Err(ValidationError::MissingField("security.checksum"));
        }
        let computed = self.decoded_content()?.checksum()?;
        if computed != self.security.checksum {
            return Err(ValidationError::ChecksumMismatch {
                declared: self.security.checksum.clone(),
                computed,
            });
        }
        Ok(())
    }

    /// Same envelope with its payload deflated. Id and checksum are kept.
    pub fn compressed(&self) -> Result<Self, ValidationError> {
        if self.compressed_content.is_some() {
            return Ok(self.clone());
        }
        let raw = self.content.canonical_bytes()?;
        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(&raw)
            .map_err(|e| ValidationError::Malformed(format!("deflate: {e}")))?;
        let compressed = encoder
            .finish()
            .map_err(|e| ValidationError::Malformed(format!("deflate: {e}")))?;

        let mut out = self.clone();
        out.content = Content::default();
        out.compressed_content = Some(base64::engine::general_purpose::STANDARD.encode(compressed));
        out.security.compression = Some(DEFLATE.to_owned());
        Ok(out)
    }

    pub fn to_json(&self) -> Result<String, ValidationError> {
        serde_json::to_string(self).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(raw).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    /// Whether this envelope names explicit targets.
    pub fn explicit_targets(&self) -> Option<&[String]> {
        self.target_devices
            .as_deref()
            .filter(|targets| !targets.is_empty())
    }
}

// ── Builder ─────────────────────────────────────────────────────

/// Assembles an envelope and seals it with a fresh id and checksum.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    message_type: MessageType,
    device_id: String,
    device_type: DeviceClass,
    user_id: String,
    session_id: Option<String>,
    content: Content,
    priority: Priority,
    correlation_id: Option<String>,
    target_devices: Option<Vec<String>>,
    broadcast: bool,
    requires_response: bool,
    encryption_method: Option<String>,
}

impl EnvelopeBuilder {
    pub fn new(
        message_type: MessageType,
        device_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            message_type,
            device_id: device_id.into(),
            device_type: DeviceClass::Web,
            user_id: user_id.into(),
            session_id: None,
            content: Content::default(),
            priority: Priority::Normal,
            correlation_id: None,
            target_devices: None,
            broadcast: false,
            requires_response: false,
            encryption_method: None,
        }
    }

    pub fn device_type(mut self, class: DeviceClass) -> Self {
        self.device_type = class;
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn content(mut self, content: Content) -> Self {
        self.content = content;
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.content.text = Some(text.into());
        self
    }

    pub fn structured(mut self, data: Value) -> Self {
        self.content.structured_data = Some(data);
        self
    }

    pub fn audio_ref(mut self, audio_ref: impl Into<String>) -> Self {
        self.content.audio_ref = Some(audio_ref.into());
        self
    }

    pub fn context(mut self, context: Value) -> Self {
        self.content.context = Some(context);
        self
    }

    pub fn attachment(mut self, blob: BlobRef) -> Self {
        self.content.attachments.push(blob);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn targets(mut self, targets: Vec<String>) -> Self {
        self.target_devices = Some(targets);
        self
    }

    pub fn broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    pub fn requires_response(mut self, requires_response: bool) -> Self {
        self.requires_response = requires_response;
        self
    }

    pub fn encryption_method(mut self, method: impl Into<String>) -> Self {
        self.encryption_method = Some(method.into());
        self
    }

    pub fn build(self) -> Result<MessageEnvelope, ValidationError> {
        let checksum = self.content.checksum()?;
        Ok(MessageEnvelope {
            id: uuid::Uuid::new_v4().to_string(),
            message_type: self.message_type,
            device_id: self.device_id,
            device_type: self.device_type,
            user_id: self.user_id,
            session_id: self.session_id,
            timestamp: Utc::now(),
            content: self.content,
            priority: self.priority,
            security: Security {
                checksum,
                encryption_method: self.encryption_method,
                compression: None,
            },
            compressed_content: None,
            correlation_id: self.correlation_id,
            target_devices: self.target_devices,
            broadcast: self.broadcast,
            requires_response: self.requires_response,
        })
    }
}

// ── Canonical serialization ─────────────────────────────────────

/// Compact JSON with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&canonicalize(value))
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> MessageEnvelope {
        MessageEnvelope::builder(MessageType::UserInput, "dev_phone", "user_1")
            .device_type(DeviceClass::Mobile)
            .session("conv-42")
            .text("hello there")
            .structured(json!({"intent": "greet", "slots": {"b": 2, "a": 1}}))
            .attachment(BlobRef {
                id: "blob-1".into(),
                mime_type: "audio/ogg".into(),
                size_bytes: 18_432,
                sha256: sha256_hex(b"voice note"),
                uri: Some("blob://voice/1".into()),
            })
            .priority(Priority::High)
            .build()
            .unwrap()
    }

    #[test]
    fn roundtrip_preserves_every_field() {
        let env = sample();
        let json = env.to_json().unwrap();
        let parsed = MessageEnvelope::from_json(&json).unwrap();
        assert_eq!(parsed, env);
        assert_eq!(parsed.content.attachments[0].size_bytes, 18_432);
        parsed.validate().unwrap();
    }

    #[test]
    fn wire_uses_type_key_and_snake_case() {
        let json: Value = serde_json::from_str(&sample().to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "user_input");
        assert_eq!(json["device_type"], "mobile");
        assert_eq!(json["priority"], "high");
        assert!(json["security"]["checksum"].is_string());
    }

    #[test]
    fn tampered_payload_fails_checksum() {
        let json = sample().to_json().unwrap();
        let tampered = json.replace("hello there", "hello thera");
        let parsed = MessageEnvelope::from_json(&tampered).unwrap();
        assert!(matches!(
            parsed.validate(),
            Err(ValidationError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn checksum_ignores_key_order() {
        let a = Content::structured(json!({"x": 1, "y": {"b": true, "a": [1, 2]}}));
        let mut inner = Map::new();
        inner.insert("a".into(), json!([1, 2]));
        inner.insert("b".into(), json!(true));
        let mut outer = Map::new();
        outer.insert("y".into(), Value::Object(inner));
        outer.insert("x".into(), json!(1));
        let b = Content::structured(Value::Object(outer));
        assert_eq!(a.checksum().unwrap(), b.checksum().unwrap());
    }

    #[test]
    fn missing_fields_are_reported() {
        let mut env = sample();
        env.device_id.clear();
        assert_eq!(
            env.validate(),
            Err(ValidationError::MissingField("device_id"))
        );

        let mut env = sample();
        env.security.checksum.clear();
        assert_eq!(
            env.validate(),
            Err(ValidationError::MissingField("security.checksum"))
        );
    }

    #[test]
    fn compression_is_transparent_to_validation() {
        let env = sample();
        let packed = env.compressed().unwrap();
        assert_eq!(packed.id, env.id);
        assert_eq!(packed.content, Content::default());
        packed.validate().unwrap();
        assert_eq!(packed.decoded_content().unwrap(), env.content);

        let over_wire = MessageEnvelope::from_json(&packed.to_json().unwrap()).unwrap();
        over_wire.validate().unwrap();
    }

    #[test]
    fn unknown_compression_is_rejected() {
        let mut env = sample().compressed().unwrap();
        env.security.compression = Some("brotli".into());
        assert_eq!(
            env.validate(),
            Err(ValidationError::UnsupportedEncoding("brotli".into()))
        );
    }

    #[test]
    fn unknown_message_type_still_parses() {
        let mut json: Value = serde_json::from_str(&sample().to_json().unwrap()).unwrap();
        json["type"] = json!("hologram_projection");
        let parsed: MessageEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.message_type, MessageType::Unknown);
        parsed.validate().unwrap();
    }

    #[test]
    fn rebuild_issues_new_id_with_same_payload() {
        let env = sample();
        let copy = env.rebuild().unwrap().priority(Priority::Low).build().unwrap();
        assert_ne!(copy.id, env.id);
        assert_eq!(copy.security.checksum, env.security.checksum);
        assert_eq!(copy.priority, Priority::Low);
    }

    #[test]
    fn reply_is_correlated_and_targeted() {
        let env = sample();
        let reply = env
            .reply(MessageType::AssistantResponse, "hub", DeviceClass::Web)
            .text("hi")
            .build()
            .unwrap();
        assert_eq!(reply.correlation_id.as_deref(), Some(env.id.as_str()));
        assert_eq!(reply.session_id.as_deref(), Some("conv-42"));
        assert_eq!(reply.explicit_targets(), Some(&["dev_phone".to_string()][..]));
    }

    #[test]
    fn priority_bands_descend() {
        assert!(Priority::Critical > Priority::Urgent);
        assert!(Priority::Low > Priority::Background);
        assert_eq!(Priority::Critical.band(), 0);
        assert_eq!(Priority::Background.band(), 5);
    }
}
