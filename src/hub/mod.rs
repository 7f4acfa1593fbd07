//! The hub facade.
//!
//! Owns the registry, sync queue, conflict resolver, offline queues and
//! connection table, and runs their background loops. Transports (the
//! WebSocket and REST gateway) only talk to [`Hub`].

pub mod connection;
pub mod delivery;
mod dispatch;

use crate::auth::{IssuedToken, TokenClaims, TokenStore};
use crate::collab::Services;
use crate::config::HubConfig;
use crate::envelope::{DeviceClass, MessageEnvelope, MessageType, Priority};
use crate::error::{HubError, HubResult};
use crate::metrics::HubMetrics;
use crate::registry::{
    spawn_health_sweep, ConnectionRegistry, Device, DeviceDescriptor, DeviceHandle, RegistryEvent,
};
use crate::sync::conflict::{ConflictRecord, ConflictResolver, ConflictStats};
use crate::sync::coordinator::{spawn_conflict_loop, DeliveryOutcome, SyncCoordinator};
use crate::sync::item::{OperationKind, SyncItem};
use crate::sync::offline::{OfflineQueue, OfflineStats};
use crate::sync::queue::{DeviceSyncState, QueueStats, SyncQueue, Targeting};
use anyhow::Result;
use connection::{ConnectionHandle, ConnectionInfo, ConnectionState, ConnectionTable};
use delivery::Router;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Device id the hub uses as the sender of its own envelopes.
pub const HUB_DEVICE_ID: &str = "hub";

/// Upper bound on waiting for background tasks at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct DeviceCounts {
    pub registered: usize,
    pub active: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub accepting: bool,
    pub devices: DeviceCounts,
    pub connections: usize,
    pub queue: QueueStats,
    pub conflicts: ConflictStats,
    pub offline: OfflineStats,
    pub sessions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatusReport {
    pub device: Device,
    pub active: bool,
    pub connection: Option<ConnectionState>,
    /// Every connection still bound to the device, closing ones included.
    pub connections: Vec<ConnectionInfo>,
    pub offline_queue_depth: usize,
    pub sync: DeviceSyncState,
}

/// Result of registering a device.
#[derive(Debug, Clone, Serialize)]
pub struct Enrollment {
    #[serde(flatten)]
    pub handle: DeviceHandle,
    /// Exchanged for session tokens. Only its hash is kept.
    pub device_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub deferred: usize,
    pub failed: usize,
}

pub struct Hub {
    config: HubConfig,
    registry: Arc<ConnectionRegistry>,
    queue: Arc<SyncQueue>,
    resolver: Arc<ConflictResolver>,
    offline: Arc<OfflineQueue>,
    connections: Arc<ConnectionTable>,
    tokens: TokenStore,
    router: Arc<Router>,
    coordinator: Arc<SyncCoordinator>,
    services: Services,
    metrics: Arc<HubMetrics>,
    accepting: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    pub fn new(config: HubConfig, services: Services) -> Result<Arc<Self>> {
        config.validate()?;
        let metrics = Arc::new(HubMetrics::new()?);
        let registry = Arc::new(ConnectionRegistry::new(config.registry.clone()));
        let queue = Arc::new(
            SyncQueue::new(
                registry.clone(),
                config.queue.clone(),
                config.filters.clone(),
            )
            .with_metrics(metrics.clone()),
        );
        let resolver =
            Arc::new(ConflictResolver::new(config.conflict.clone()).with_metrics(metrics.clone()));
        let offline = Arc::new(OfflineQueue::new(config.offline.capacity));
        let connections = Arc::new(ConnectionTable::new());
        let router = Arc::new(Router {
            registry: registry.clone(),
            connections: connections.clone(),
            offline: offline.clone(),
            notifier: services.notifier.clone(),
            metrics: metrics.clone(),
        });
        let coordinator = Arc::new(SyncCoordinator::new(
            queue.clone(),
            resolver.clone(),
            router.clone(),
            &config.queue,
        ));

        Ok(Arc::new(Self {
            tokens: TokenStore::new(&config.auth),
            config,
            registry,
            queue,
            resolver,
            offline,
            connections,
            router,
            coordinator,
            services,
            metrics,
            accepting: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    // ── Accessors ───────────────────────────────────────────────

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    pub fn offline(&self) -> &Arc<OfflineQueue> {
        &self.offline
    }

    pub fn connections(&self) -> &Arc<ConnectionTable> {
        &self.connections
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn metrics(&self) -> &Arc<HubMetrics> {
        &self.metrics
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn ensure_accepting(&self) -> HubResult<()> {
        if self.is_accepting() {
            Ok(())
        } else {
            Err(HubError::NotAccepting)
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Re-register devices the store remembers. They start offline.
    pub async fn restore_devices(&self) -> Result<usize> {
        let descriptors = self.services.store.load_devices().await?;
        let restored = self.registry.restore(descriptors);
        if restored > 0 {
            tracing::info!(restored, store = self.services.store.name(), "Restored devices");
        }
        Ok(restored)
    }

    /// Spawn the background loops: liveness sweep, queue drain, conflict
    /// resolution, registry event handling and housekeeping.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            tracing::warn!("Hub already started");
            return;
        }

        tasks.push(spawn_health_sweep(
            self.registry.clone(),
            self.cancel.child_token(),
        ));

        tasks.push(tokio::spawn(
            self.coordinator.clone().run(self.cancel.child_token()),
        ));

        let weak = Arc::downgrade(self);
        tasks.push(spawn_conflict_loop(
            self.resolver.clone(),
            self.queue.clone(),
            Duration::from_millis(self.config.conflict.poll_interval_ms),
            self.cancel.child_token(),
            move |record| {
                if let Some(hub) = weak.upgrade() {
                    tokio::spawn(async move { hub.announce_conflict(record).await });
                }
            },
        ));

        tasks.push(self.spawn_registry_listener());
        tasks.push(self.spawn_housekeeping());
        tracing::info!("Hub started");
    }

    fn spawn_registry_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.registry.subscribe();
        let cancel = self.cancel.child_token();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    () = cancel.cancelled() => break,
                };
                let Some(hub) = weak.upgrade() else { break };
                match event {
                    Ok(event) => hub.on_registry_event(event),
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Registry listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn on_registry_event(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::Offline { device_id, .. } => {
                if self.connections.mark_stale(&device_id) {
                    tracing::info!(device_id = %device_id, "Closed stale connection");
                }
            }
            RegistryEvent::Evicted { device_id, .. } => {
                self.connections.mark_stale(&device_id);
                let purged = self.offline.purge(&device_id);
                let revoked = self.tokens.revoke_device(&device_id);
                tracing::info!(device_id = %device_id, purged, revoked, "Evicted device cleaned up");
            }
            RegistryEvent::Registered { .. } | RegistryEvent::Online { .. } => {}
        }
    }

    fn spawn_housekeeping(self: &Arc<Self>) -> JoinHandle<()> {
        let cancel = self.cancel.child_token();
        let weak = Arc::downgrade(self);
        let auth_timeout = self.config.auth.auth_timeout();
        let period = auth_timeout
            .min(self.config.registry.sweep_interval())
            .max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(hub) = weak.upgrade() else { break };
                        hub.tokens.sweep_expired();
                        hub.connections.expire_unauthenticated(auth_timeout);
                        hub.connections.reap_closing(auth_timeout);
                        hub.refresh_gauges();
                    }
                    () = cancel.cancelled() => break,
                }
            }
        })
    }

    fn refresh_gauges(&self) {
        self.metrics
            .active_devices
            .set(self.registry.active_count(Instant::now()) as i64);
        self.metrics
            .connections
            .set(self.connections.connected_count() as i64);
        self.metrics.queue_depth.set(self.queue.pending_len() as i64);
    }

    /// Stop accepting work, stop the background loops, give every queued
    /// operation one last attempt while connections are still up, then
    /// close the connections.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Hub draining");

        // The drain loop finishes its current round before it exits, so no
        // operation is left in flight when the final flush starts.
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                tracing::warn!("Background task did not stop in time");
            }
        }

        let flushed = self.coordinator.flush().await;
        let closed = self.connections.drain_all();
        tracing::info!(
            flushed,
            closed,
            pending = self.queue.pending_len(),
            "Hub stopped"
        );
    }

    // ── Devices & sessions ──────────────────────────────────────

    /// Code that enrolls devices when no `device_secret` is configured.
    pub fn pairing_code(&self) -> Option<&str> {
        self.tokens.pairing_code()
    }

    /// Register (or re-register) a device. Requires the device secret or
    /// pairing code; the returned device key replaces any earlier one.
    pub async fn register_device(
        &self,
        descriptor: DeviceDescriptor,
        secret: Option<&str>,
    ) -> HubResult<Enrollment> {
        self.ensure_accepting()?;
        self.tokens.verify_secret(secret)?;
        let handle = self.registry.register(descriptor.clone())?;
        if let Err(e) = self.services.store.save_device(&descriptor).await {
            self.metrics.store_failures.with_label_values(&["device"]).inc();
            tracing::warn!(device_id = %descriptor.device_id, "Failed to persist device: {e}");
        }
        let device_key = self.tokens.enroll(&descriptor.device_id);
        Ok(Enrollment { handle, device_key })
    }

    pub fn issue_token(
        &self,
        user_id: &str,
        device_id: &str,
        device_key: Option<&str>,
    ) -> HubResult<IssuedToken> {
        self.ensure_accepting()?;
        match self.registry.get(device_id) {
            Some(device) if device.user_id() == user_id => {
                self.tokens.verify_device_key(device_id, device_key)?;
                Ok(self.tokens.issue(user_id, device_id))
            }
            _ => Err(HubError::auth("device is not registered for this user")),
        }
    }

    pub fn authenticate_token(&self, token: &str) -> HubResult<TokenClaims> {
        self.tokens
            .validate(token)
            .ok_or_else(|| HubError::auth("invalid or expired token"))
    }

    pub fn device_status(&self, user_id: &str, device_id: &str) -> HubResult<DeviceStatusReport> {
        let device = self
            .registry
            .get(device_id)
            .filter(|d| d.user_id() == user_id)
            .ok_or_else(|| HubError::UnknownDevice(device_id.to_owned()))?;
        let offline_queue_depth = self.offline.depth(device_id);
        let mut sync = self.queue.device_sync_state(device_id);
        // Parked updates have not reached the device yet.
        sync.in_sync &= offline_queue_depth == 0;
        Ok(DeviceStatusReport {
            active: self.registry.is_active(device_id, Instant::now()),
            connection: self.connections.device_state(device_id),
            connections: self.connections.device_connections(device_id),
            offline_queue_depth,
            sync,
            device,
        })
    }

    pub fn devices_for_user(&self, user_id: &str) -> Vec<DeviceStatusReport> {
        self.registry
            .devices_for_user(user_id)
            .into_iter()
            .filter_map(|d| self.device_status(user_id, d.id()).ok())
            .collect()
    }

    // ── Connections ─────────────────────────────────────────────

    /// A transport came up. The connection waits for an authentication
    /// envelope before anything else is accepted.
    pub fn open_connection(&self) -> HubResult<ConnectionHandle> {
        self.ensure_accepting()?;
        let handle = self.connections.open();
        self.connections
            .transition(&handle.id, ConnectionState::Authenticating)?;
        Ok(handle)
    }

    pub fn close_connection(&self, conn_id: &str) {
        if let Some(device_id) = self.connections.close(conn_id) {
            tracing::info!(device_id = %device_id, "Device disconnected");
        }
        self.metrics
            .connections
            .set(self.connections.connected_count() as i64);
    }

    pub fn auth_timeout(&self) -> Duration {
        self.config.auth.auth_timeout()
    }

    // ── Inbound ─────────────────────────────────────────────────

    /// Envelope arriving on a persistent connection.
    pub async fn accept_on(
        &self,
        conn_id: &str,
        envelope: MessageEnvelope,
    ) -> HubResult<Option<MessageEnvelope>> {
        self.ensure_accepting()?;
        let info = self
            .connections
            .info(conn_id)
            .ok_or_else(|| HubError::auth("connection is closed"))?;

        match info.state {
            ConnectionState::Connected => {
                let bound_device = info.device_id.as_deref().unwrap_or_default();
                let bound_user = info.user_id.as_deref().unwrap_or_default();
                if envelope.device_id != bound_device || envelope.user_id != bound_user {
                    self.reject("identity_mismatch");
                    return Err(HubError::auth(
                        "envelope identity does not match the authenticated device",
                    ));
                }
                self.dispatch(envelope).await
            }
            ConnectionState::Authenticating
                if envelope.message_type == MessageType::Authentication =>
            {
                self.authenticate_connection(conn_id, envelope).await
            }
            ConnectionState::Authenticating => {
                self.reject("unauthenticated");
                Err(HubError::auth("connection is not authenticated"))
            }
            _ => Err(HubError::auth("connection is closed")),
        }
    }

    /// Envelope from a device with a live authenticated connection,
    /// identified by the envelope's own device id.
    pub async fn accept(&self, envelope: MessageEnvelope) -> HubResult<Option<MessageEnvelope>> {
        self.ensure_accepting()?;
        if !self.connections.is_connected(&envelope.device_id) {
            self.reject("unauthenticated");
            return Err(HubError::auth("device has no authenticated connection"));
        }
        self.dispatch(envelope).await
    }

    /// Envelope submitted over REST with a bearer token.
    pub async fn accept_with_token(
        &self,
        token: &str,
        envelope: MessageEnvelope,
    ) -> HubResult<Option<MessageEnvelope>> {
        self.ensure_accepting()?;
        let claims = self.authenticate_token(token)?;
        if claims.device_id != envelope.device_id || claims.user_id != envelope.user_id {
            self.reject("identity_mismatch");
            return Err(HubError::auth("token does not match envelope identity"));
        }
        self.dispatch(envelope).await
    }

    async fn authenticate_connection(
        &self,
        conn_id: &str,
        envelope: MessageEnvelope,
    ) -> HubResult<Option<MessageEnvelope>> {
        let result = self.verify_auth_envelope(&envelope);
        let claims = match result {
            Ok(claims) => claims,
            Err(e) => {
                self.reject("auth_failed");
                tracing::warn!(device_id = %envelope.device_id, "Connection authentication failed: {e}");
                if let Err(close_err) = self.connections.finish(conn_id) {
                    tracing::debug!(connection = %conn_id, "Connection already gone: {close_err}");
                }
                return Err(e);
            }
        };

        self.connections
            .bind(conn_id, &claims.device_id, &claims.user_id)?;
        self.registry.heartbeat(&claims.device_id)?;
        self.refresh_gauges();
        tracing::info!(device_id = %claims.device_id, connection = %conn_id, "Device authenticated");

        let ack = envelope
            .reply(MessageType::SystemEvent, HUB_DEVICE_ID, DeviceClass::Web)
            .structured(json!({
                "event": "authenticated",
                "connection_id": conn_id,
                "pending": self.offline.depth(&claims.device_id),
            }))
            .build()?;
        let flushed = self
            .flush_offline(conn_id, &claims.device_id, Some(ack))
            .await;
        if flushed > 0 {
            tracing::info!(device_id = %claims.device_id, flushed, "Flushed offline queue");
        }
        Ok(None)
    }

    fn verify_auth_envelope(&self, envelope: &MessageEnvelope) -> HubResult<TokenClaims> {
        envelope.validate()?;
        let content = envelope.decoded_content()?;
        let token = content
            .structured_data
            .as_ref()
            .and_then(|d| d.get("token"))
            .and_then(|t| t.as_str())
            .map(str::to_owned)
            .or(content.text)
            .ok_or_else(|| HubError::auth("authentication envelope carries no token"))?;
        let claims = self.authenticate_token(&token)?;
        if claims.device_id != envelope.device_id || claims.user_id != envelope.user_id {
            return Err(HubError::auth("token does not match envelope identity"));
        }
        if self.registry.get(&claims.device_id).is_none() {
            return Err(HubError::auth("device is no longer registered"));
        }
        Ok(claims)
    }

    /// Send `first` (if any) and then everything parked for the device,
    /// oldest first, on the freshly bound connection. Envelopes routed while
    /// this runs are parked behind the backlog; the connection only opens to
    /// routing once a drain comes back empty. Undelivered entries go back
    /// to the front of the queue.
    async fn flush_offline(
        &self,
        conn_id: &str,
        device_id: &str,
        first: Option<MessageEnvelope>,
    ) -> usize {
        let Some(tx) = self.connections.connection_sender(conn_id) else {
            return 0;
        };
        if let Some(first) = first {
            if tx.send(first).await.is_err() {
                return 0;
            }
        }

        let mut sent = 0;
        loop {
            let batch = self.offline.drain_or_else(device_id, || {
                self.connections.release(conn_id);
            });
            if batch.is_empty() {
                return sent;
            }
            let mut pending = batch.into_iter();
            while let Some(envelope) = pending.next() {
                if let Err(err) = tx.send(envelope).await {
                    let mut rest = vec![err.0];
                    rest.extend(pending);
                    self.offline.restore_front(device_id, rest);
                    return sent;
                }
                sent += 1;
            }
        }
    }

    fn reject(&self, reason: &str) {
        self.metrics
            .messages_rejected
            .with_label_values(&[reason])
            .inc();
    }

    // ── Outbound ────────────────────────────────────────────────

    /// Send an envelope to every registered device of a user. Devices
    /// without a live connection get it through their offline queue.
    pub async fn broadcast(
        &self,
        user_id: &str,
        envelope: MessageEnvelope,
        exclude_device: Option<&str>,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for device in self.registry.devices_for_user(user_id) {
            if Some(device.id()) == exclude_device {
                continue;
            }
            match self.router.route(device.id(), envelope.clone()).await {
                DeliveryOutcome::Delivered => report.delivered += 1,
                DeliveryOutcome::Deferred => report.deferred += 1,
                DeliveryOutcome::Conflict { .. } | DeliveryOutcome::Failed(_) => {
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Enqueue a sync item on behalf of the hub itself.
    pub fn sync(
        &self,
        item: SyncItem,
        kind: OperationKind,
        priority: Priority,
        targeting: Targeting,
    ) -> HubResult<String> {
        self.ensure_accepting()?;
        self.queue.enqueue_with(item, kind, priority, targeting)
    }

    /// Tell the owner's devices a conflict needs a human decision.
    async fn announce_conflict(&self, record: ConflictRecord) {
        let envelope = MessageEnvelope::builder(
            MessageType::SystemEvent,
            HUB_DEVICE_ID,
            record.user_id.clone(),
        )
        .priority(Priority::High)
        .broadcast(true)
        .structured(json!({
            "event": "conflict_pending",
            "conflict_id": record.id,
            "key": record.logical_key,
            "competing": record.competing,
        }))
        .build();
        match envelope {
            Ok(envelope) => {
                let report = self.broadcast(&record.user_id, envelope, None).await;
                tracing::info!(
                    conflict_id = %record.id,
                    delivered = report.delivered,
                    deferred = report.deferred,
                    "Conflict announced"
                );
            }
            Err(e) => tracing::warn!(conflict_id = %record.id, "Cannot announce conflict: {e}"),
        }
    }

    pub fn conflicts_awaiting_review(&self, user_id: &str) -> Vec<ConflictRecord> {
        self.resolver.awaiting_review(user_id)
    }

    pub fn decide_conflict(
        &self,
        user_id: &str,
        conflict_id: &str,
        winning_item_id: &str,
    ) -> HubResult<String> {
        self.ensure_accepting()?;
        if !self
            .resolver
            .awaiting_review(user_id)
            .iter()
            .any(|r| r.id == conflict_id)
        {
            return Err(crate::error::ValidationError::Malformed(format!(
                "no conflict awaiting review with id {conflict_id}"
            ))
            .into());
        }
        self.resolver
            .decide(conflict_id, winning_item_id, &self.queue)
    }

    /// Run the coordinator until nothing is eligible. The background loop
    /// does this continuously; callers use it to settle deterministically.
    pub async fn process_ready(&self) -> usize {
        self.coordinator.drain_ready().await
    }

    /// Resolve pending conflicts now and announce escalations.
    pub async fn resolve_conflicts(&self) -> usize {
        let escalated = self.resolver.process_pending(&self.queue);
        let count = escalated.len();
        for record in escalated {
            self.announce_conflict(record).await;
        }
        count
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            accepting: self.is_accepting(),
            devices: DeviceCounts {
                registered: self.registry.len(),
                active: self.registry.active_count(Instant::now()),
            },
            connections: self.connections.connected_count(),
            queue: self.queue.statistics(),
            conflicts: self.resolver.stats(),
            offline: self.offline.stats(),
            sessions: self.tokens.len(),
        }
    }

    /// Error envelope sent back to a peer whose message was rejected.
    pub fn error_envelope(
        &self,
        user_id: &str,
        correlation_id: Option<&str>,
        err: &HubError,
    ) -> Option<MessageEnvelope> {
        let user_id = if user_id.is_empty() { "unknown" } else { user_id };
        let mut builder = MessageEnvelope::builder(MessageType::Error, HUB_DEVICE_ID, user_id)
            .priority(Priority::High)
            .structured(json!({
                "error": err.to_string(),
                "kind": error_kind(err),
                "recoverable": err.is_recoverable(),
            }));
        if let Some(id) = correlation_id {
            builder = builder.correlation(id);
        }
        builder.build().ok()
    }
}

/// Stable machine-readable tag for an error.
pub fn error_kind(err: &HubError) -> &'static str {
    match err {
        HubError::Validation(_) => "validation",
        HubError::Authentication(_) => "authentication",
        HubError::Delivery { .. } => "delivery",
        HubError::RetryExhausted { .. } => "retry_exhausted",
        HubError::CapacityExceeded { .. } => "capacity_exceeded",
        HubError::NotAccepting => "not_accepting",
        HubError::UnknownDevice(_) => "unknown_device",
        HubError::Store(_) => "store",
        HubError::Collaborator { .. } => "collaborator",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;

    #[test]
    fn error_envelope_carries_kind_and_correlation() {
        let hub = Hub::new(HubConfig::default(), Services::default()).unwrap();
        let err = HubError::from(ValidationError::MissingField("device_id"));
        let env = hub.error_envelope("user_1", Some("msg_1"), &err).unwrap();
        assert_eq!(env.message_type, MessageType::Error);
        assert_eq!(env.device_id, HUB_DEVICE_ID);
        assert_eq!(env.correlation_id.as_deref(), Some("msg_1"));
        let body = env.decoded_content().unwrap().structured_data.unwrap();
        assert_eq!(body["kind"], "validation");
        assert_eq!(body["recoverable"], false);

        let anonymous = hub.error_envelope("", None, &HubError::auth("nope")).unwrap();
        assert_eq!(anonymous.user_id, "unknown");
    }

    const SECRET: &str = "s3cret";

    fn guarded_hub() -> Arc<Hub> {
        let mut config = HubConfig::default();
        config.auth.device_secret = Some(SECRET.into());
        Hub::new(config, Services::default()).unwrap()
    }

    #[tokio::test]
    async fn token_issue_checks_device_owner_and_key() {
        let hub = guarded_hub();
        let key = hub
            .register_device(
                DeviceDescriptor::new("dev_phone", "user_1", DeviceClass::Mobile),
                Some(SECRET),
            )
            .await
            .unwrap()
            .device_key;
        assert!(hub.issue_token("user_1", "dev_phone", Some(&key)).is_ok());
        assert!(matches!(
            hub.issue_token("user_2", "dev_phone", Some(&key)),
            Err(HubError::Authentication(_))
        ));
        assert!(matches!(
            hub.issue_token("user_1", "dev_phone", None),
            Err(HubError::Authentication(_))
        ));
        assert!(hub.issue_token("user_1", "dev_phone", Some("guess")).is_err());
    }

    #[tokio::test]
    async fn device_secret_guards_registration() {
        let hub = guarded_hub();
        let desc = DeviceDescriptor::new("dev_phone", "user_1", DeviceClass::Mobile);
        assert!(hub.register_device(desc.clone(), None).await.is_err());
        assert!(hub.register_device(desc.clone(), Some("wrong")).await.is_err());
        assert!(hub.registry.get("dev_phone").is_none());
        assert!(hub.register_device(desc, Some(SECRET)).await.is_ok());
    }

    #[tokio::test]
    async fn without_a_secret_only_the_pairing_code_enrolls() {
        let hub = Hub::new(HubConfig::default(), Services::default()).unwrap();
        let code = hub.pairing_code().unwrap().to_owned();
        let desc = DeviceDescriptor::new("dev_phone", "user_1", DeviceClass::Mobile);

        assert!(matches!(
            hub.register_device(desc.clone(), None).await,
            Err(HubError::Authentication(_))
        ));
        assert!(hub.registry.get("dev_phone").is_none());

        let enrollment = hub.register_device(desc, Some(&code)).await.unwrap();
        assert!(enrollment.handle.created);
        assert!(hub.issue_token("user_1", "dev_phone", None).is_err());
        assert!(hub
            .issue_token("user_1", "dev_phone", Some(&enrollment.device_key))
            .is_ok());
    }

    #[tokio::test]
    async fn re_registration_rotates_the_device_key() {
        let hub = guarded_hub();
        let desc = DeviceDescriptor::new("dev_phone", "user_1", DeviceClass::Mobile);
        let old = hub.register_device(desc.clone(), Some(SECRET)).await.unwrap();
        let new = hub.register_device(desc, Some(SECRET)).await.unwrap();
        assert!(!new.handle.created);
        assert!(hub.issue_token("user_1", "dev_phone", Some(&old.device_key)).is_err());
        assert!(hub.issue_token("user_1", "dev_phone", Some(&new.device_key)).is_ok());
    }

    fn note(n: u32) -> MessageEnvelope {
        MessageEnvelope::builder(MessageType::SystemEvent, HUB_DEVICE_ID, "user_1")
            .text(format!("note {n}"))
            .build()
            .unwrap()
    }

    fn inbox(handle: &mut ConnectionHandle) -> Vec<MessageEnvelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = handle.inbound.try_recv() {
            out.push(envelope);
        }
        out
    }

    async fn bound_tv(hub: &Hub) -> ConnectionHandle {
        hub.register_device(
            DeviceDescriptor::new("dev_tv", "user_1", DeviceClass::Tv),
            Some(SECRET),
        )
        .await
        .unwrap();
        let handle = hub.open_connection().unwrap();
        hub.connections.bind(&handle.id, "dev_tv", "user_1").unwrap();
        handle
    }

    #[tokio::test]
    async fn envelopes_routed_during_flush_queue_behind_the_backlog() {
        let hub = guarded_hub();
        let backlog: Vec<MessageEnvelope> = (0..3).map(note).collect();
        for envelope in &backlog {
            hub.offline.push("dev_tv", envelope.clone());
        }
        let mut handle = bound_tv(&hub).await;

        // Bound, but the backlog has not been replayed yet.
        let late = note(9);
        assert_eq!(
            hub.router.route("dev_tv", late.clone()).await,
            DeliveryOutcome::Deferred
        );
        assert_eq!(hub.offline.depth("dev_tv"), 4);

        assert_eq!(hub.flush_offline(&handle.id, "dev_tv", None).await, 4);
        let mut expected = backlog;
        expected.push(late);
        assert_eq!(inbox(&mut handle), expected);
        assert_eq!(hub.offline.depth("dev_tv"), 0);

        let live = note(10);
        assert_eq!(
            hub.router.route("dev_tv", live.clone()).await,
            DeliveryOutcome::Delivered
        );
        assert_eq!(inbox(&mut handle), vec![live]);
    }

    #[tokio::test]
    async fn stale_connection_is_visible_in_device_status_until_closed() {
        let hub = guarded_hub();
        let handle = bound_tv(&hub).await;
        hub.connections.release(&handle.id);

        hub.on_registry_event(RegistryEvent::Offline {
            device_id: "dev_tv".into(),
            user_id: "user_1".into(),
        });
        assert!(handle.closed.is_cancelled());
        let status = hub.device_status("user_1", "dev_tv").unwrap();
        assert_eq!(status.connection, Some(ConnectionState::Stale));
        assert_eq!(status.connections.len(), 1);
        assert_eq!(status.connections[0].state, ConnectionState::Stale);
        assert_eq!(hub.stats().connections, 0);

        // Nothing routes to a stale connection.
        assert_eq!(
            hub.router.route("dev_tv", note(1)).await,
            DeliveryOutcome::Deferred
        );
        assert!(!hub.device_status("user_1", "dev_tv").unwrap().sync.in_sync);

        hub.close_connection(&handle.id);
        let status = hub.device_status("user_1", "dev_tv").unwrap();
        assert_eq!(status.connection, None);
        assert!(status.connections.is_empty());
    }

    #[tokio::test]
    async fn evicted_device_loses_tokens_and_parked_messages() {
        let hub = guarded_hub();
        let key = hub
            .register_device(
                DeviceDescriptor::new("dev_tv", "user_1", DeviceClass::Tv),
                Some(SECRET),
            )
            .await
            .unwrap()
            .device_key;
        let token = hub.issue_token("user_1", "dev_tv", Some(&key)).unwrap().token;
        let env = MessageEnvelope::builder(MessageType::SystemEvent, HUB_DEVICE_ID, "user_1")
            .build()
            .unwrap();
        hub.offline.push("dev_tv", env);

        hub.on_registry_event(RegistryEvent::Evicted {
            device_id: "dev_tv".into(),
            user_id: "user_1".into(),
        });
        assert_eq!(hub.offline.depth("dev_tv"), 0);
        assert!(hub.authenticate_token(&token).is_err());
        assert!(hub.issue_token("user_1", "dev_tv", Some(&key)).is_err());
    }
}
