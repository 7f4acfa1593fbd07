//! Per-type handling of authenticated inbound envelopes.

use super::{Hub, HUB_DEVICE_ID};
use crate::collab::ResponderRequest;
use crate::envelope::{Content, DeviceClass, MessageEnvelope, MessageType};
use crate::error::{HubError, HubResult, ValidationError};
use crate::registry::{Capability, ConnectionQuality};
use crate::sync::item::{ItemType, OperationKind, SyncItem};
use crate::sync::queue::Targeting;
use serde::Deserialize;
use serde_json::{json, Value};

/// Body of a device-originated `sync_update`.
#[derive(Debug, Deserialize)]
struct SyncUpdateBody {
    item_type: ItemType,
    key: String,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    kind: Option<OperationKind>,
    #[serde(default)]
    version: Option<u64>,
    /// Wall-clock ms of the change on the device; defaults to the
    /// envelope timestamp.
    #[serde(default)]
    timestamp: Option<u64>,
    #[serde(default)]
    requires: Option<Capability>,
}

/// Body of a device's `sync_conflict` system event.
#[derive(Debug, Deserialize)]
struct ConflictReport {
    operation_id: String,
    item: SyncItem,
}

#[derive(Debug, Default, Deserialize)]
struct DeviceStatusBody {
    #[serde(default)]
    quality: Option<ConnectionQuality>,
    #[serde(default)]
    context: Option<serde_json::Map<String, Value>>,
}

fn parse_body<T: serde::de::DeserializeOwned>(content: &Content, what: &str) -> HubResult<T> {
    let data = content
        .structured_data
        .clone()
        .ok_or(ValidationError::MissingField("content.structured_data"))?;
    serde_json::from_value(data)
        .map_err(|e| ValidationError::Malformed(format!("{what}: {e}")).into())
}

fn envelope_ms(envelope: &MessageEnvelope) -> u64 {
    u64::try_from(envelope.timestamp.timestamp_millis()).unwrap_or_default()
}

impl Hub {
    /// Validate and route one envelope from an authenticated device.
    pub(super) async fn dispatch(
        &self,
        envelope: MessageEnvelope,
    ) -> HubResult<Option<MessageEnvelope>> {
        if let Err(e) = envelope.validate() {
            self.reject("validation");
            tracing::warn!(message_id = %envelope.id, device_id = %envelope.device_id, "Rejected envelope: {e}");
            return Err(e.into());
        }
        let content = match envelope.decoded_content() {
            Ok(content) => content,
            Err(e) => {
                self.reject("validation");
                return Err(e.into());
            }
        };
        // Any traffic counts as liveness; this also rejects unknown senders.
        self.registry.heartbeat(&envelope.device_id)?;
        self.metrics
            .messages_received
            .with_label_values(&[envelope.message_type.as_str()])
            .inc();
        tracing::debug!(
            message_id = %envelope.id,
            message_type = envelope.message_type.as_str(),
            device_id = %envelope.device_id,
            "Dispatching envelope"
        );

        match envelope.message_type {
            MessageType::UserInput => self.handle_user_input(&envelope, content).await.map(Some),
            MessageType::SyncUpdate => self.handle_sync_update(&envelope, &content).await.map(Some),
            MessageType::DeviceStatus => self.handle_device_status(&envelope, &content),
            MessageType::Heartbeat => Ok(None),
            MessageType::SystemEvent => self.handle_system_event(&envelope, &content),
            MessageType::Authentication => {
                self.ack(&envelope, json!({"status": "already_authenticated"}))
                    .map(Some)
            }
            MessageType::AssistantResponse | MessageType::Error | MessageType::Unknown => {
                tracing::warn!(
                    message_id = %envelope.id,
                    message_type = envelope.message_type.as_str(),
                    "Ignoring envelope type the hub does not handle"
                );
                self.ack(
                    &envelope,
                    json!({"status": "ignored", "reason": "unsupported message type"}),
                )
                .map(Some)
            }
        }
    }

    fn ack(&self, envelope: &MessageEnvelope, mut body: Value) -> HubResult<MessageEnvelope> {
        if let Some(map) = body.as_object_mut() {
            map.insert("event".into(), json!("ack"));
        }
        Ok(envelope
            .reply(MessageType::SystemEvent, HUB_DEVICE_ID, DeviceClass::Web)
            .structured(body)
            .build()?)
    }

    async fn persist(&self, item: &SyncItem) {
        if let Err(e) = self.services.store.save(item).await {
            self.metrics.store_failures.with_label_values(&["item"]).inc();
            tracing::warn!(
                item_id = %item.id,
                store = self.services.store.name(),
                "Failed to persist sync item: {e}"
            );
        }
    }

    // ── user_input ──────────────────────────────────────────────

    async fn handle_user_input(
        &self,
        envelope: &MessageEnvelope,
        content: Content,
    ) -> HubResult<MessageEnvelope> {
        let typed = content
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_owned);
        let (text, spoken) = match (typed, content.audio_ref.as_deref()) {
            (Some(text), _) => (text, false),
            (None, Some(audio_ref)) => {
                let text = self
                    .services
                    .transcriber
                    .transcribe(audio_ref)
                    .await
                    .map_err(|e| HubError::Collaborator {
                        service: "transcriber",
                        reason: e.to_string(),
                    })?;
                (text, true)
            }
            (None, None) => return Err(ValidationError::MissingField("content.text").into()),
        };

        let reply = self
            .services
            .responder
            .respond(&ResponderRequest {
                user_id: envelope.user_id.clone(),
                device_id: envelope.device_id.clone(),
                session_id: envelope.session_id.clone(),
                text: text.clone(),
                context: content.context.clone(),
            })
            .await
            .map_err(|e| HubError::Collaborator {
                service: "responder",
                reason: e.to_string(),
            })?;

        let mut builder = envelope
            .reply(
                MessageType::AssistantResponse,
                HUB_DEVICE_ID,
                DeviceClass::Web,
            )
            .text(reply.clone());
        if spoken {
            match self.services.transcriber.synthesize(&reply).await {
                Ok(audio_ref) => builder = builder.audio_ref(audio_ref),
                Err(e) => tracing::debug!("Speech synthesis unavailable: {e}"),
            }
        }
        let response = builder.build()?;

        // The finished turn goes to the user's other devices.
        let turn = SyncItem::new(
            ItemType::ConversationTurn,
            envelope.id.clone(),
            envelope.user_id.clone(),
            envelope.device_id.clone(),
            envelope.device_type,
            json!({
                "session_id": envelope.session_id,
                "request_id": envelope.id,
                "response_id": response.id,
                "user": text,
                "assistant": reply,
            }),
        )
        .with_timestamp(envelope_ms(envelope));
        self.persist(&turn).await;
        let priority = turn.item_type.default_priority().max(envelope.priority);
        self.queue
            .enqueue_with(turn, OperationKind::Create, priority, Targeting::Auto)?;

        Ok(response)
    }

    // ── sync_update ─────────────────────────────────────────────

    async fn handle_sync_update(
        &self,
        envelope: &MessageEnvelope,
        content: &Content,
    ) -> HubResult<MessageEnvelope> {
        let body: SyncUpdateBody = parse_body(content, "sync_update body")?;
        if body.key.trim().is_empty() {
            return Err(ValidationError::MissingField("key").into());
        }

        let mut item = SyncItem::new(
            body.item_type,
            body.key,
            envelope.user_id.clone(),
            envelope.device_id.clone(),
            envelope.device_type,
            body.value,
        )
        .with_timestamp(body.timestamp.unwrap_or_else(|| envelope_ms(envelope)));
        if let Some(version) = body.version {
            item = item.with_version(version);
        }
        if let Some(capability) = body.requires {
            item = item.requiring(capability);
        }

        let targeting = match envelope.explicit_targets() {
            Some(targets) => Targeting::Explicit(targets.to_vec()),
            None => Targeting::Auto,
        };
        let priority = item.item_type.default_priority().max(envelope.priority);
        let kind = body.kind.unwrap_or(OperationKind::Update);

        self.persist(&item).await;
        let item_id = item.id.clone();
        let operation_id = self.queue.enqueue_with(item, kind, priority, targeting)?;
        let targets = self
            .queue
            .operation(&operation_id)
            .map(|r| r.targets.len())
            .unwrap_or_default();

        self.ack(
            envelope,
            json!({
                "status": "queued",
                "operation_id": operation_id,
                "item_id": item_id,
                "targets": targets,
            }),
        )
    }

    // ── device_status ───────────────────────────────────────────

    fn handle_device_status(
        &self,
        envelope: &MessageEnvelope,
        content: &Content,
    ) -> HubResult<Option<MessageEnvelope>> {
        let body: DeviceStatusBody = match &content.structured_data {
            Some(data) => serde_json::from_value(data.clone())
                .map_err(|e| ValidationError::Malformed(format!("device_status body: {e}")))?,
            None => DeviceStatusBody::default(),
        };

        let mut context = body.context.unwrap_or_default();
        if let Some(Value::Object(extra)) = &content.context {
            context.extend(extra.clone());
        }
        if !context.is_empty() {
            self.registry.merge_context(&envelope.device_id, context)?;
        }
        if let Some(quality) = body.quality {
            self.registry.set_quality(&envelope.device_id, quality)?;
        }

        if envelope.requires_response {
            self.ack(envelope, json!({"status": "updated"})).map(Some)
        } else {
            Ok(None)
        }
    }

    // ── system_event ────────────────────────────────────────────

    fn handle_system_event(
        &self,
        envelope: &MessageEnvelope,
        content: &Content,
    ) -> HubResult<Option<MessageEnvelope>> {
        let event = content
            .structured_data
            .as_ref()
            .and_then(|d| d.get("event"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        match event {
            "sync_conflict" => {
                let report: ConflictReport = parse_body(content, "sync_conflict body")?;
                let Some(record) = self.queue.operation(&report.operation_id) else {
                    return Err(ValidationError::Malformed(format!(
                        "unknown operation {}",
                        report.operation_id
                    ))
                    .into());
                };
                let current = report.item;
                if current.user_id != envelope.user_id
                    || current.logical_key() != record.item.logical_key()
                    || !current.fingerprint_matches()
                {
                    self.reject("conflict_report");
                    return Err(ValidationError::Malformed(
                        "conflict report does not match the operation".into(),
                    )
                    .into());
                }
                let status = match self
                    .resolver
                    .report(&report.operation_id, &record.item, current)
                {
                    Some(conflict) => {
                        tracing::info!(
                            conflict_id = %conflict.id,
                            device_id = %envelope.device_id,
                            "Device reported sync conflict"
                        );
                        "conflict_recorded"
                    }
                    None => "no_conflict",
                };
                self.ack(envelope, json!({"status": status})).map(Some)
            }
            "ack" => Ok(None),
            other => {
                tracing::debug!(event = other, device_id = %envelope.device_id, "Unhandled system event");
                if envelope.requires_response {
                    self.ack(envelope, json!({"status": "ignored"})).map(Some)
                } else {
                    Ok(None)
                }
            }
        }
    }
}
