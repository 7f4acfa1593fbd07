//! Connection registry: every known device, what it can do, and whether it
//! is alive.
//!
//! The registry is the single writer of device liveness. A device is
//! *active* while `now - last_seen < activity_timeout`. A periodic sweep
//! flips stale devices offline and, once they have been offline for the
//! retention window, evicts them from the live map. Sync history that
//! references an evicted device stays addressable in the queue; it simply
//! no longer resolves to a live target.

use crate::config::RegistryConfig;
use crate::error::{HubError, HubResult};
use crate::sync::item::ItemType;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub use crate::envelope::DeviceClass;

/// Capacity of the registry event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something a device declares it can handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Voice,
    Location,
    HealthData,
    Camera,
    Display,
    Notifications,
}

pub type CapabilitySet = BTreeSet<Capability>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
}

/// What a device sends when it registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub device_id: String,
    pub user_id: String,
    pub device_class: DeviceClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default)]
    pub capabilities: CapabilitySet,
    /// Per-item-type opt-in/opt-out. Types not listed are synced.
    #[serde(default)]
    pub sync_preferences: BTreeMap<ItemType, bool>,
    /// Token handed to the notification collaborator while offline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_token: Option<String>,
}

impl DeviceDescriptor {
    pub fn new(
        device_id: impl Into<String>,
        user_id: impl Into<String>,
        device_class: DeviceClass,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            user_id: user_id.into(),
            device_class,
            name: None,
            platform: None,
            capabilities: CapabilitySet::new(),
            sync_preferences: BTreeMap::new(),
            push_token: None,
        }
    }

    pub fn with_capabilities(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities.extend(caps);
        self
    }

    pub fn with_preference(mut self, item_type: ItemType, enabled: bool) -> Self {
        self.sync_preferences.insert(item_type, enabled);
        self
    }
}

/// A live registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    #[serde(flatten)]
    pub descriptor: DeviceDescriptor,
    pub status: DeviceStatus,
    pub quality: ConnectionQuality,
    pub last_seen_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    /// Context most recently reported through device-status messages.
    pub context: Map<String, Value>,
    #[serde(skip)]
    last_seen: Instant,
    #[serde(skip)]
    offline_since: Option<Instant>,
}

impl Device {
    fn new(descriptor: DeviceDescriptor, now: Instant) -> Self {
        let wall = Utc::now();
        Self {
            descriptor,
            status: DeviceStatus::Online,
            quality: ConnectionQuality::Unknown,
            last_seen_at: wall,
            registered_at: wall,
            context: Map::new(),
            last_seen: now,
            offline_since: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.device_id
    }

    pub fn user_id(&self) -> &str {
        &self.descriptor.user_id
    }

    pub fn class(&self) -> DeviceClass {
        self.descriptor.device_class
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.descriptor.capabilities.contains(&cap)
    }

    /// Whether the device opted in to items of this type.
    pub fn wants(&self, item_type: ItemType) -> bool {
        self.descriptor
            .sync_preferences
            .get(&item_type)
            .copied()
            .unwrap_or(true)
    }

    pub fn is_active_at(&self, now: Instant, timeout: std::time::Duration) -> bool {
        self.status == DeviceStatus::Online && now.saturating_duration_since(self.last_seen) < timeout
    }

    fn touch(&mut self, now: Instant) {
        self.last_seen = now;
        self.last_seen_at = Utc::now();
        self.status = DeviceStatus::Online;
        self.offline_since = None;
    }
}

/// Returned by [`ConnectionRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceHandle {
    pub device_id: String,
    pub user_id: String,
    /// `false` when an existing entry was updated in place.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered {
        device_id: String,
        user_id: String,
        created: bool,
    },
    Online {
        device_id: String,
        user_id: String,
    },
    Offline {
        device_id: String,
        user_id: String,
    },
    Evicted {
        device_id: String,
        user_id: String,
    },
}

pub struct ConnectionRegistry {
    devices: Mutex<HashMap<String, Device>>,
    config: RegistryConfig,
    events: broadcast::Sender<RegistryEvent>,
}

impl ConnectionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            devices: Mutex::new(HashMap::new()),
            config,
            events,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Register a device, or refresh the descriptor and liveness of an
    /// existing one. Never creates a second entry for the same id.
    pub fn register(&self, descriptor: DeviceDescriptor) -> HubResult<DeviceHandle> {
        self.register_at(descriptor, Instant::now())
    }

    pub fn register_at(&self, descriptor: DeviceDescriptor, now: Instant) -> HubResult<DeviceHandle> {
        if descriptor.device_id.trim().is_empty() {
            return Err(crate::error::ValidationError::MissingField("device_id").into());
        }
        if descriptor.user_id.trim().is_empty() {
            return Err(crate::error::ValidationError::MissingField("user_id").into());
        }

        let device_id = descriptor.device_id.clone();
        let user_id = descriptor.user_id.clone();

        let created = {
            let mut devices = self.devices.lock();
            match devices.get_mut(&device_id) {
                Some(existing) => {
                    if existing.user_id() != user_id {
                        return Err(HubError::auth(format!(
                            "device {device_id} is bound to another user"
                        )));
                    }
                    existing.descriptor = descriptor;
                    existing.touch(now);
                    false
                }
                None => {
                    devices.insert(device_id.clone(), Device::new(descriptor, now));
                    true
                }
            }
        };

        tracing::info!(device_id = %device_id, user_id = %user_id, created, "Device registered");
        self.emit(RegistryEvent::Registered {
            device_id: device_id.clone(),
            user_id: user_id.clone(),
            created,
        });

        Ok(DeviceHandle {
            device_id,
            user_id,
            created,
        })
    }

    /// Put previously persisted devices back into the map as offline
    /// entries. Devices already present are left alone.
    pub fn restore(&self, descriptors: Vec<DeviceDescriptor>) -> usize {
        let now = Instant::now();
        let mut devices = self.devices.lock();
        let mut restored = 0;
        for descriptor in descriptors {
            if devices.contains_key(&descriptor.device_id) {
                continue;
            }
            let mut device = Device::new(descriptor, now);
            device.status = DeviceStatus::Offline;
            device.offline_since = Some(now);
            devices.insert(device.id().to_owned(), device);
            restored += 1;
        }
        restored
    }

    pub fn heartbeat(&self, device_id: &str) -> HubResult<()> {
        self.heartbeat_at(device_id, Instant::now())
    }

    pub fn heartbeat_at(&self, device_id: &str, now: Instant) -> HubResult<()> {
        let came_online = {
            let mut devices = self.devices.lock();
            let device = devices
                .get_mut(device_id)
                .ok_or_else(|| HubError::UnknownDevice(device_id.to_owned()))?;
            let was_offline = device.status == DeviceStatus::Offline;
            device.touch(now);
            was_offline.then(|| device.user_id().to_owned())
        };

        if let Some(user_id) = came_online {
            tracing::debug!(device_id, "Device back online");
            self.emit(RegistryEvent::Online {
                device_id: device_id.to_owned(),
                user_id,
            });
        }
        Ok(())
    }

    /// Flip every online device whose liveness has lapsed to offline.
    /// Returns the ids that changed state.
    pub fn mark_offline_if_stale(&self, now: Instant) -> Vec<String> {
        let timeout = self.config.activity_timeout();
        let mut flipped = Vec::new();
        {
            let mut devices = self.devices.lock();
            for device in devices.values_mut() {
                if device.status == DeviceStatus::Online
                    && now.saturating_duration_since(device.last_seen) >= timeout
                {
                    device.status = DeviceStatus::Offline;
                    device.offline_since = Some(now);
                    flipped.push((device.id().to_owned(), device.user_id().to_owned()));
                }
            }
        }

        flipped.sort();
        for (device_id, user_id) in &flipped {
            tracing::info!(device_id = %device_id, "Device marked offline (liveness timeout)");
            self.emit(RegistryEvent::Offline {
                device_id: device_id.clone(),
                user_id: user_id.clone(),
            });
        }
        flipped.into_iter().map(|(id, _)| id).collect()
    }

    /// Remove devices that have been offline longer than the retention
    /// window.
    pub fn evict_expired(&self, now: Instant) -> Vec<String> {
        let retention = self.config.retention();
        let mut evicted = Vec::new();
        {
            let mut devices = self.devices.lock();
            devices.retain(|id, device| {
                let expired = device
                    .offline_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= retention);
                if expired {
                    evicted.push((id.clone(), device.user_id().to_owned()));
                }
                !expired
            });
        }

        evicted.sort();
        for (device_id, user_id) in &evicted {
            tracing::info!(device_id = %device_id, "Device evicted from live registry");
            self.emit(RegistryEvent::Evicted {
                device_id: device_id.clone(),
                user_id: user_id.clone(),
            });
        }
        evicted.into_iter().map(|(id, _)| id).collect()
    }

    /// All registry entries for a user, online or not, ordered by id.
    pub fn devices_for_user(&self, user_id: &str) -> Vec<Device> {
        let devices = self.devices.lock();
        let mut out: Vec<Device> = devices
            .values()
            .filter(|d| d.user_id() == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id().cmp(b.id()));
        out
    }

    pub fn active_devices_for_user(&self, user_id: &str, now: Instant) -> Vec<Device> {
        let timeout = self.config.activity_timeout();
        self.devices_for_user(user_id)
            .into_iter()
            .filter(|d| d.is_active_at(now, timeout))
            .collect()
    }

    pub fn capabilities(&self, device_id: &str) -> HubResult<CapabilitySet> {
        self.devices
            .lock()
            .get(device_id)
            .map(|d| d.descriptor.capabilities.clone())
            .ok_or_else(|| HubError::UnknownDevice(device_id.to_owned()))
    }

    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.devices.lock().get(device_id).cloned()
    }

    pub fn is_active(&self, device_id: &str, now: Instant) -> bool {
        let timeout = self.config.activity_timeout();
        self.devices
            .lock()
            .get(device_id)
            .is_some_and(|d| d.is_active_at(now, timeout))
    }

    /// Merge reported context keys into the device entry.
    pub fn merge_context(&self, device_id: &str, context: Map<String, Value>) -> HubResult<()> {
        let mut devices = self.devices.lock();
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| HubError::UnknownDevice(device_id.to_owned()))?;
        device.context.extend(context);
        Ok(())
    }

    pub fn set_quality(&self, device_id: &str, quality: ConnectionQuality) -> HubResult<()> {
        let mut devices = self.devices.lock();
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| HubError::UnknownDevice(device_id.to_owned()))?;
        device.quality = quality;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    pub fn active_count(&self, now: Instant) -> usize {
        let timeout = self.config.activity_timeout();
        self.devices
            .lock()
            .values()
            .filter(|d| d.is_active_at(now, timeout))
            .count()
    }
}

/// Run the liveness sweep on its fixed cadence until cancelled.
pub fn spawn_health_sweep(
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(registry.config().sweep_interval());
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Instant::now();
                    let stale = registry.mark_offline_if_stale(now);
                    let evicted = registry.evict_expired(now);
                    if !stale.is_empty() || !evicted.is_empty() {
                        tracing::debug!(
                            stale = stale.len(),
                            evicted = evicted.len(),
                            "Registry sweep"
                        );
                    }
                }
                () = cancel.cancelled() => {
                    tracing::debug!("Registry sweep stopped");
                    break;
                }
            }
        }
    })
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(RegistryConfig::default())
    }

    fn phone() -> DeviceDescriptor {
        DeviceDescriptor::new("dev_phone", "user_1", DeviceClass::Mobile)
            .with_capabilities([Capability::Voice, Capability::Location])
    }

    #[test]
    fn register_twice_keeps_one_entry() {
        let reg = registry();
        let first = reg.register(phone()).unwrap();
        assert!(first.created);

        let updated = phone().with_capabilities([Capability::HealthData]);
        let second = reg.register(updated).unwrap();
        assert!(!second.created);

        assert_eq!(reg.len(), 1);
        let caps = reg.capabilities("dev_phone").unwrap();
        assert!(caps.contains(&Capability::HealthData));
    }

    #[test]
    fn reregistration_resets_liveness() {
        let reg = registry();
        let t0 = Instant::now();
        reg.register_at(phone(), t0).unwrap();

        let later = t0 + Duration::from_secs(301);
        assert_eq!(reg.mark_offline_if_stale(later), vec!["dev_phone"]);
        assert!(!reg.is_active("dev_phone", later));

        reg.register_at(phone(), later).unwrap();
        assert!(reg.is_active("dev_phone", later));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn register_rejects_device_owned_by_other_user() {
        let reg = registry();
        reg.register(phone()).unwrap();
        let hijack = DeviceDescriptor::new("dev_phone", "user_2", DeviceClass::Mobile);
        assert!(matches!(
            reg.register(hijack),
            Err(HubError::Authentication(_))
        ));
    }

    #[test]
    fn liveness_timeout_is_exclusive_of_earlier_sweeps() {
        let reg = registry();
        let t0 = Instant::now();
        reg.register_at(phone(), t0).unwrap();

        assert!(reg
            .mark_offline_if_stale(t0 + Duration::from_secs(299))
            .is_empty());
        assert!(reg.is_active("dev_phone", t0 + Duration::from_secs(299)));

        let stale = reg.mark_offline_if_stale(t0 + Duration::from_secs(300));
        assert_eq!(stale, vec!["dev_phone".to_string()]);

        // Already offline: not reported twice.
        assert!(reg
            .mark_offline_if_stale(t0 + Duration::from_secs(400))
            .is_empty());
    }

    #[test]
    fn heartbeat_refreshes_liveness() {
        let reg = registry();
        let t0 = Instant::now();
        reg.register_at(phone(), t0).unwrap();
        reg.heartbeat_at("dev_phone", t0 + Duration::from_secs(200))
            .unwrap();
        assert!(reg
            .mark_offline_if_stale(t0 + Duration::from_secs(450))
            .is_empty());
    }

    #[test]
    fn heartbeat_for_unknown_device_fails() {
        let reg = registry();
        assert!(matches!(
            reg.heartbeat("ghost"),
            Err(HubError::UnknownDevice(_))
        ));
    }

    #[test]
    fn offline_devices_are_evicted_after_retention() {
        let reg = registry();
        let t0 = Instant::now();
        reg.register_at(phone(), t0).unwrap();
        let offline_at = t0 + Duration::from_secs(300);
        reg.mark_offline_if_stale(offline_at);

        assert!(reg
            .evict_expired(offline_at + Duration::from_secs(3599))
            .is_empty());
        assert_eq!(
            reg.evict_expired(offline_at + Duration::from_secs(3600)),
            vec!["dev_phone".to_string()]
        );
        assert!(reg.get("dev_phone").is_none());
    }

    #[test]
    fn events_are_emitted_for_state_changes() {
        let reg = registry();
        let mut rx = reg.subscribe();
        let t0 = Instant::now();
        reg.register_at(phone(), t0).unwrap();
        reg.mark_offline_if_stale(t0 + Duration::from_secs(300));
        reg.heartbeat_at("dev_phone", t0 + Duration::from_secs(301))
            .unwrap();

        assert!(matches!(
            rx.try_recv().unwrap(),
            RegistryEvent::Registered { created: true, .. }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            RegistryEvent::Offline { .. }
        ));
        assert!(matches!(rx.try_recv().unwrap(), RegistryEvent::Online { .. }));
    }

    #[test]
    fn devices_for_user_filters_by_owner() {
        let reg = registry();
        reg.register(phone()).unwrap();
        reg.register(DeviceDescriptor::new("dev_desk", "user_1", DeviceClass::Desktop))
            .unwrap();
        reg.register(DeviceDescriptor::new("dev_other", "user_2", DeviceClass::Desktop))
            .unwrap();

        let ids: Vec<String> = reg
            .devices_for_user("user_1")
            .iter()
            .map(|d| d.id().to_owned())
            .collect();
        assert_eq!(ids, vec!["dev_desk", "dev_phone"]);
    }

    #[test]
    fn preferences_default_to_enabled() {
        let reg = registry();
        reg.register(phone().with_preference(ItemType::Preference, false))
            .unwrap();
        let device = reg.get("dev_phone").unwrap();
        assert!(!device.wants(ItemType::Preference));
        assert!(device.wants(ItemType::ConversationTurn));
    }

    #[test]
    fn restored_devices_start_offline() {
        let reg = registry();
        assert_eq!(reg.restore(vec![phone()]), 1);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.active_count(Instant::now()), 0);
        reg.heartbeat("dev_phone").unwrap();
        assert_eq!(reg.active_count(Instant::now()), 1);
    }

    #[test]
    fn merge_context_extends_existing_keys() {
        let reg = registry();
        reg.register(phone()).unwrap();
        let mut ctx = Map::new();
        ctx.insert("battery".into(), Value::from(80));
        reg.merge_context("dev_phone", ctx).unwrap();
        let mut ctx = Map::new();
        ctx.insert("locale".into(), Value::from("en-US"));
        reg.merge_context("dev_phone", ctx).unwrap();

        let device = reg.get("dev_phone").unwrap();
        assert_eq!(device.context.len(), 2);
    }
}
