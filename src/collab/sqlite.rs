//! SQLite-backed persistent store.
//!
//! Tables:
//! - `sync_items`: one row per item id, full item as JSON plus indexed columns
//! - `devices`: one row per registered device descriptor

use super::{PersistentStore, StoreQuery};
use crate::registry::DeviceDescriptor;
use crate::sync::item::SyncItem;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;

pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let conn = rusqlite::Connection::open(db_path)
            .with_context(|| format!("opening {}", db_path.display()))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(rusqlite::Connection::open_in_memory()?)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self> {
        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sync_items (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                item_type TEXT NOT NULL,
                item_key TEXT NOT NULL,
                origin_device_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                version INTEGER NOT NULL,
                fingerprint TEXT NOT NULL,
                body TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_items_user_ts ON sync_items(user_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_items_key ON sync_items(user_id, item_type, item_key);

            CREATE TABLE IF NOT EXISTS devices (
                device_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_devices_user ON devices(user_id);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl PersistentStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn save(&self, item: &SyncItem) -> Result<()> {
        let body = serde_json::to_string(item)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_items
                (id, user_id, item_type, item_key, origin_device_id, timestamp, version, fingerprint, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                timestamp = excluded.timestamp,
                version = excluded.version,
                fingerprint = excluded.fingerprint,
                body = excluded.body",
            rusqlite::params![
                item.id,
                item.user_id,
                item.item_type.as_str(),
                item.key,
                item.origin_device_id,
                item.timestamp as i64,
                item.version as i64,
                item.fingerprint,
                body,
            ],
        )?;
        Ok(())
    }

    async fn query(&self, query: &StoreQuery) -> Result<Vec<SyncItem>> {
        use rusqlite::types::Value as SqlValue;

        let mut clauses = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();
        if let Some(user_id) = &query.user_id {
            params.push(SqlValue::Text(user_id.clone()));
            clauses.push(format!("user_id = ?{}", params.len()));
        }
        if let Some(item_type) = query.item_type {
            params.push(SqlValue::Text(item_type.as_str().to_owned()));
            clauses.push(format!("item_type = ?{}", params.len()));
        }
        if let Some(key) = &query.key {
            params.push(SqlValue::Text(key.clone()));
            clauses.push(format!("item_key = ?{}", params.len()));
        }
        if let Some(since) = query.since {
            params.push(SqlValue::Integer(since as i64));
            clauses.push(format!("timestamp >= ?{}", params.len()));
        }
        params.push(SqlValue::Integer(query.limit as i64));
        let limit_idx = params.len();

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT body FROM sync_items {where_sql}
             ORDER BY timestamp DESC, id DESC LIMIT ?{limit_idx}"
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |row| {
            row.get::<_, String>(0)
        })?;

        let mut items = Vec::new();
        for body in rows {
            let body = body?;
            match serde_json::from_str::<SyncItem>(&body) {
                Ok(item) => items.push(item),
                Err(e) => tracing::warn!("Skipping unreadable sync item row: {e}"),
            }
        }
        Ok(items)
    }

    async fn save_device(&self, descriptor: &DeviceDescriptor) -> Result<()> {
        let body = serde_json::to_string(descriptor)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO devices (device_id, user_id, body, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(device_id) DO UPDATE SET
                user_id = excluded.user_id,
                body = excluded.body,
                updated_at = excluded.updated_at",
            rusqlite::params![
                descriptor.device_id,
                descriptor.user_id,
                body,
                chrono::Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    async fn load_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT body FROM devices ORDER BY device_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for body in rows {
            let body = body?;
            match serde_json::from_str::<DeviceDescriptor>(&body) {
                Ok(desc) => out.push(desc),
                Err(e) => tracing::warn!("Skipping unreadable device row: {e}"),
            }
        }
        Ok(out)
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::DeviceClass;
    use crate::registry::Capability;
    use crate::sync::item::ItemType;
    use serde_json::json;
    use tempfile::TempDir;

    fn item(key: &str, ts: u64) -> SyncItem {
        SyncItem::new(
            ItemType::Preference,
            key,
            "user_1",
            "dev_phone",
            DeviceClass::Mobile,
            json!({"v": ts}),
        )
        .with_timestamp(ts)
    }

    #[tokio::test]
    async fn save_and_query_filters() {
        let store = SqliteStore::in_memory().unwrap();
        store.save(&item("theme", 10)).await.unwrap();
        store.save(&item("font", 20)).await.unwrap();
        store.save(&item("theme", 30)).await.unwrap();

        let all = store.query(&StoreQuery::for_user("user_1")).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].timestamp, 30);

        let themes = store
            .query(&StoreQuery {
                item_type: Some(ItemType::Preference),
                key: Some("theme".into()),
                ..StoreQuery::for_user("user_1")
            })
            .await
            .unwrap();
        assert_eq!(themes.len(), 2);

        let recent = store
            .query(&StoreQuery {
                since: Some(15),
                limit: 1,
                ..StoreQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].timestamp, 30);
    }

    #[tokio::test]
    async fn save_is_an_upsert() {
        let store = SqliteStore::in_memory().unwrap();
        let mut it = item("theme", 10);
        store.save(&it).await.unwrap();
        it.version = 5;
        store.save(&it).await.unwrap();
        let all = store.query(&StoreQuery::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].version, 5);
    }

    #[tokio::test]
    async fn devices_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("hub.db");
        let desc = DeviceDescriptor::new("dev_watch", "user_1", DeviceClass::Watch)
            .with_capabilities([Capability::HealthData]);
        {
            let store = SqliteStore::open(&path).unwrap();
            store.save_device(&desc).await.unwrap();
            store.save(&item("theme", 1)).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.load_devices().await.unwrap(), vec![desc]);
        assert_eq!(
            store
                .query(&StoreQuery::for_user("user_1"))
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
