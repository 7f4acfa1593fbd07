//! Routing of outbound envelopes to devices.
//!
//! A device with a live connection gets the envelope on its channel. A
//! registered device without one gets it parked in its offline queue (and
//! a push notification when it has a push token). A device the registry
//! no longer knows cannot be reached at all.
//!
//! A connection that is still replaying its offline backlog has no routable
//! sender, so envelopes keep queueing behind the backlog until it is empty.

use super::connection::ConnectionTable;
use super::HUB_DEVICE_ID;
use crate::collab::Notifier;
use crate::envelope::{DeviceClass, MessageEnvelope, MessageType};
use crate::metrics::HubMetrics;
use crate::registry::{ConnectionRegistry, Device};
use crate::sync::coordinator::{Deliverer, DeliveryOutcome};
use crate::sync::item::SyncItem;
use crate::sync::offline::{OfflineQueue, Parked, Route};
use crate::sync::queue::SyncOperation;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

pub struct Router {
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) connections: Arc<ConnectionTable>,
    pub(crate) offline: Arc<OfflineQueue>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) metrics: Arc<HubMetrics>,
}

impl Router {
    /// Deliver to a device, parking it when the device is unreachable.
    pub async fn route(&self, device_id: &str, envelope: MessageEnvelope) -> DeliveryOutcome {
        let Some(device) = self.registry.get(device_id) else {
            return DeliveryOutcome::Failed(format!("device {device_id} is not registered"));
        };
        let message_id = envelope.id.clone();
        let kind = envelope.message_type;

        let routed = self
            .offline
            .park_unless(device_id, envelope, || self.connections.sender_for(device_id));
        let parked = match routed {
            Route::Live(tx, envelope) => match tx.send(envelope).await {
                Ok(()) => return DeliveryOutcome::Delivered,
                Err(err) => {
                    tracing::debug!(device_id, "Connection channel closed; parking envelope");
                    self.connections.mark_stale(device_id);
                    self.offline.push(device_id, err.0)
                }
            },
            Route::Parked(parked) => parked,
        };
        self.parked(&device, parked, &message_id, kind).await
    }

    async fn parked(
        &self,
        device: &Device,
        parked: Parked,
        message_id: &str,
        kind: MessageType,
    ) -> DeliveryOutcome {
        if let Parked::DroppedOldest { .. } = parked {
            self.metrics.offline_dropped.inc();
        }
        self.metrics.offline_parked.inc();

        if let Some(token) = &device.descriptor.push_token {
            let payload = json!({
                "kind": "sync_pending",
                "message_id": message_id,
                "message_type": kind,
                "pending": self.offline.depth(device.id()),
            });
            if let Err(e) = self.notifier.notify(token, &payload).await {
                tracing::warn!(device_id = %device.id(), "Push notification failed: {e}");
            }
        }
        DeliveryOutcome::Deferred
    }

    /// Wrap a sync payload in the envelope a device receives.
    pub fn sync_envelope(
        op: &SyncOperation,
        device_id: &str,
        payload: &SyncItem,
    ) -> Result<MessageEnvelope, crate::error::ValidationError> {
        MessageEnvelope::builder(MessageType::SyncUpdate, HUB_DEVICE_ID, payload.user_id.clone())
            .device_type(DeviceClass::Web)
            .priority(op.priority)
            .targets(vec![device_id.to_owned()])
            .structured(json!({
                "operation_id": op.id,
                "kind": op.kind,
                "item": payload,
            }))
            .build()
    }
}

#[async_trait]
impl Deliverer for Router {
    async fn deliver(
        &self,
        device_id: &str,
        operation: &SyncOperation,
        payload: &SyncItem,
    ) -> DeliveryOutcome {
        match Self::sync_envelope(operation, device_id, payload) {
            Ok(envelope) => self.route(device_id, envelope).await,
            Err(e) => DeliveryOutcome::Failed(format!("cannot build sync envelope: {e}")),
        }
    }
}
