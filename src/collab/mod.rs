//! External collaborators the hub talks to.
//!
//! The hub only depends on these traits. Production deployments plug in
//! real speech, model and push services; the defaults here are enough for
//! local runs and tests.

pub mod sqlite;

use crate::config::{StoreBackend, StoreConfig};
use crate::registry::DeviceDescriptor;
use crate::sync::item::{ItemType, SyncItem};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub use sqlite::SqliteStore;

/// Default page size for history queries.
const DEFAULT_QUERY_LIMIT: usize = 100;

// ── Persistent store ────────────────────────────────────────────

/// Filter for [`PersistentStore::query`]. Results are newest first.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreQuery {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub item_type: Option<ItemType>,
    #[serde(default)]
    pub key: Option<String>,
    /// Only items with `timestamp >= since` (ms).
    #[serde(default)]
    pub since: Option<u64>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_QUERY_LIMIT
}

impl Default for StoreQuery {
    fn default() -> Self {
        Self {
            user_id: None,
            item_type: None,
            key: None,
            since: None,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

impl StoreQuery {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    fn matches(&self, item: &SyncItem) -> bool {
        self.user_id.as_ref().map_or(true, |u| *u == item.user_id)
            && self.item_type.map_or(true, |t| t == item.item_type)
            && self.key.as_ref().map_or(true, |k| *k == item.key)
            && self.since.map_or(true, |since| item.timestamp >= since)
    }
}

/// Durable record of sync items and registered devices.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    fn name(&self) -> &str;

    /// Upsert by item id.
    async fn save(&self, item: &SyncItem) -> Result<()>;

    async fn query(&self, query: &StoreQuery) -> Result<Vec<SyncItem>>;

    async fn save_device(&self, descriptor: &DeviceDescriptor) -> Result<()>;

    async fn load_devices(&self) -> Result<Vec<DeviceDescriptor>>;
}

/// Volatile store used by default and in tests. Items are keyed by id.
#[derive(Default)]
pub struct MemoryStore {
    items: Mutex<HashMap<String, SyncItem>>,
    devices: Mutex<HashMap<String, DeviceDescriptor>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn save(&self, item: &SyncItem) -> Result<()> {
        self.items.lock().insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn query(&self, query: &StoreQuery) -> Result<Vec<SyncItem>> {
        let items = self.items.lock();
        let mut out: Vec<SyncItem> = items.values().filter(|i| query.matches(i)).cloned().collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        out.truncate(query.limit);
        Ok(out)
    }

    async fn save_device(&self, descriptor: &DeviceDescriptor) -> Result<()> {
        self.devices
            .lock()
            .insert(descriptor.device_id.clone(), descriptor.clone());
        Ok(())
    }

    async fn load_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut out: Vec<DeviceDescriptor> = self.devices.lock().values().cloned().collect();
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(out)
    }
}

/// Store selected by `[store]` config.
pub fn create_store(config: &StoreConfig) -> Result<Arc<dyn PersistentStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Sqlite => {
            let path = config
                .path
                .as_deref()
                .context("[store] path is required for the sqlite backend")?;
            Ok(Arc::new(SqliteStore::open(path)?))
        }
    }
}

// ── Notifier ────────────────────────────────────────────────────

/// Push notification service for devices without a live connection.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, push_token: &str, payload: &Value) -> Result<()>;
}

/// Writes notifications to the log instead of sending them.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, push_token: &str, payload: &Value) -> Result<()> {
        let kind = payload.get("kind").and_then(Value::as_str).unwrap_or("unknown");
        tracing::info!(push_token_len = push_token.len(), kind, "Push notification (log only)");
        Ok(())
    }
}

// ── Speech ──────────────────────────────────────────────────────

/// Speech-to-text and text-to-speech.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Text for the audio behind `audio_ref`.
    async fn transcribe(&self, audio_ref: &str) -> Result<String>;

    /// Reference to synthesized audio for `text`.
    async fn synthesize(&self, text: &str) -> Result<String>;
}

/// Rejects audio; text input still works.
pub struct NoopTranscriber;

#[async_trait]
impl Transcriber for NoopTranscriber {
    async fn transcribe(&self, audio_ref: &str) -> Result<String> {
        bail!("no speech service configured (audio_ref {audio_ref})")
    }

    async fn synthesize(&self, _text: &str) -> Result<String> {
        bail!("no speech service configured")
    }
}

// ── Responder ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ResponderRequest {
    pub user_id: String,
    pub device_id: String,
    pub session_id: Option<String>,
    pub text: String,
    /// Context the device attached to the input.
    pub context: Option<Value>,
}

/// Produces the assistant's reply to a user input.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, request: &ResponderRequest) -> Result<String>;
}

/// Echoes the input back. Useful for wiring checks.
pub struct EchoResponder;

#[async_trait]
impl Responder for EchoResponder {
    async fn respond(&self, request: &ResponderRequest) -> Result<String> {
        Ok(format!("You said: {}", request.text))
    }
}

// ── Bundle ──────────────────────────────────────────────────────

/// Everything the hub needs from the outside world.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn PersistentStore>,
    pub notifier: Arc<dyn Notifier>,
    pub transcriber: Arc<dyn Transcriber>,
    pub responder: Arc<dyn Responder>,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            notifier: Arc::new(LogNotifier),
            transcriber: Arc::new(NoopTranscriber),
            responder: Arc::new(EchoResponder),
        }
    }
}

impl Services {
    pub fn with_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = transcriber;
        self
    }

    pub fn with_responder(mut self, responder: Arc<dyn Responder>) -> Self {
        self.responder = responder;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::DeviceClass;
    use serde_json::json;

    fn item(key: &str, ts: u64) -> SyncItem {
        SyncItem::new(
            ItemType::Preference,
            key,
            "user_1",
            "dev_phone",
            DeviceClass::Mobile,
            json!(ts),
        )
        .with_timestamp(ts)
    }

    #[tokio::test]
    async fn memory_store_queries_newest_first() {
        let store = MemoryStore::new();
        store.save(&item("a", 10)).await.unwrap();
        store.save(&item("b", 30)).await.unwrap();
        store.save(&item("a", 20)).await.unwrap();

        let all = store.query(&StoreQuery::for_user("user_1")).await.unwrap();
        let stamps: Vec<u64> = all.iter().map(|i| i.timestamp).collect();
        assert_eq!(stamps, vec![30, 20, 10]);

        let only_a = store
            .query(&StoreQuery {
                key: Some("a".into()),
                since: Some(15),
                ..StoreQuery::for_user("user_1")
            })
            .await
            .unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].timestamp, 20);

        assert!(store
            .query(&StoreQuery::for_user("user_2"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn memory_store_upserts_by_id() {
        let store = MemoryStore::new();
        let mut it = item("a", 1);
        store.save(&it).await.unwrap();
        it.version = 2;
        store.save(&it).await.unwrap();
        let all = store.query(&StoreQuery::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].version, 2);
    }

    #[tokio::test]
    async fn memory_store_holds_one_entry_per_id_across_many_saves() {
        let store = MemoryStore::new();
        let mut it = item("a", 1);
        for version in 1..=500 {
            it.version = version;
            store.save(&it).await.unwrap();
        }
        store.save(&item("b", 2)).await.unwrap();
        assert_eq!(store.items.lock().len(), 2);
        let latest = store
            .query(&StoreQuery {
                key: Some("a".into()),
                ..StoreQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].version, 500);
    }

    #[tokio::test]
    async fn memory_store_round_trips_devices() {
        let store = MemoryStore::new();
        let desc = DeviceDescriptor::new("dev_phone", "user_1", DeviceClass::Mobile);
        store.save_device(&desc).await.unwrap();
        store.save_device(&desc).await.unwrap();
        assert_eq!(store.load_devices().await.unwrap(), vec![desc]);
    }

    #[test]
    fn create_store_follows_backend() {
        let memory = create_store(&StoreConfig::default()).unwrap();
        assert_eq!(memory.name(), "memory");

        let tmp = tempfile::TempDir::new().unwrap();
        let sqlite = create_store(&StoreConfig {
            backend: StoreBackend::Sqlite,
            path: Some(tmp.path().join("hub.db")),
        })
        .unwrap();
        assert_eq!(sqlite.name(), "sqlite");

        assert!(create_store(&StoreConfig {
            backend: StoreBackend::Sqlite,
            path: None,
        })
        .is_err());
    }

    #[tokio::test]
    async fn noop_transcriber_rejects_audio() {
        assert!(NoopTranscriber.transcribe("blob://a").await.is_err());
    }

    #[tokio::test]
    async fn echo_responder_echoes() {
        let reply = EchoResponder
            .respond(&ResponderRequest {
                user_id: "user_1".into(),
                device_id: "dev_phone".into(),
                session_id: None,
                text: "hi".into(),
                context: None,
            })
            .await
            .unwrap();
        assert_eq!(reply, "You said: hi");
    }
}
