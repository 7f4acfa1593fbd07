//! Hub configuration.
//!
//! Loaded from `config.toml` (explicit path or the platform config dir).
//! Every field has a default so an empty file, or no file at all, yields a
//! working hub bound to localhost.

use crate::registry::DeviceClass;
use crate::sync::conflict::ConflictStrategy;
use anyhow::{bail, Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `[gateway] host`.
pub const HOST_ENV: &str = "ZEROCLAW_SYNC_HOST";
/// Environment variable overriding `[gateway] port`.
pub const PORT_ENV: &str = "ZEROCLAW_SYNC_PORT";

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct HubConfig {
    pub gateway: GatewayConfig,
    pub registry: RegistryConfig,
    pub queue: QueueConfig,
    pub conflict: ConflictConfig,
    pub offline: OfflineConfig,
    pub auth: AuthConfig,
    pub store: StoreConfig,
    pub filters: FilterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Maximum HTTP request body (and WebSocket frame) size in bytes.
    pub max_body_bytes: usize,
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3030,
            max_body_bytes: 65_536,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RegistryConfig {
    /// A device is active while `now - last_seen` is below this.
    pub activity_timeout_secs: u64,
    /// Cadence of the liveness sweep.
    pub sweep_interval_secs: u64,
    /// Offline devices older than this are evicted from the live map.
    pub retention_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            activity_timeout_secs: 300,
            sweep_interval_secs: 60,
            retention_secs: 3600,
        }
    }
}

impl RegistryConfig {
    pub fn activity_timeout(&self) -> Duration {
        Duration::from_secs(self.activity_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct QueueConfig {
    /// Retries after the first delivery attempt before an operation is failed.
    pub max_attempts: u32,
    /// Base backoff; attempt `n` waits `base * 2^(n-1)`.
    pub retry_backoff_ms: u64,
    /// Sleep of the drain loop when nothing is eligible.
    pub idle_sleep_ms: u64,
    /// Upper bound for a single per-target delivery attempt.
    pub delivery_timeout_ms: u64,
    /// Finished operations kept addressable by id.
    pub history_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff_ms: 500,
            idle_sleep_ms: 50,
            delivery_timeout_ms: 5_000,
            history_limit: 10_000,
        }
    }
}

impl QueueConfig {
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms.max(1))
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ConflictConfig {
    pub strategy: ConflictStrategy,
    /// Items whose timestamps differ by less than this have no confirmed
    /// causal order.
    pub concurrency_window_ms: u64,
    /// Device classes from highest to lowest rank for `device_priority`.
    pub device_priority: Vec<DeviceClass>,
    /// Cap on conflicts parked for manual review.
    pub manual_review_limit: usize,
    pub poll_interval_ms: u64,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            strategy: ConflictStrategy::LastWriteWins,
            concurrency_window_ms: 5_000,
            device_priority: vec![
                DeviceClass::Desktop,
                DeviceClass::Mobile,
                DeviceClass::Web,
                DeviceClass::Car,
                DeviceClass::Tv,
                DeviceClass::Watch,
                DeviceClass::Iot,
            ],
            manual_review_limit: 256,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct OfflineConfig {
    /// Per-device bound; the oldest entry is dropped on overflow.
    pub capacity: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AuthConfig {
    pub token_ttl_secs: u64,
    /// Connections that do not authenticate within this window are closed.
    pub auth_timeout_secs: u64,
    /// Shared secret required to register a device. When unset the hub
    /// generates a pairing code at startup and requires that instead.
    pub device_secret: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: 3600,
            auth_timeout_secs: 10,
            device_secret: None,
        }
    }
}

impl AuthConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Database path for the sqlite backend.
    pub path: Option<PathBuf>,
}

/// Payload ceiling for one device class.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PayloadLimit {
    pub class: DeviceClass,
    pub max_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct FilterConfig {
    pub payload_limits: Vec<PayloadLimit>,
    /// Conversation text is cut to this many characters when summarized.
    pub summary_text_chars: usize,
    /// Structured fields whose serialized size exceeds this are removed
    /// when summarized.
    pub summary_field_bytes: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            payload_limits: vec![PayloadLimit {
                class: DeviceClass::Watch,
                max_bytes: 2_048,
            }],
            summary_text_chars: 160,
            summary_field_bytes: 256,
        }
    }
}

impl FilterConfig {
    pub fn limit_for(&self, class: DeviceClass) -> Option<usize> {
        self.payload_limits
            .iter()
            .find(|l| l.class == class)
            .map(|l| l.max_bytes)
    }
}

impl HubConfig {
    /// Load configuration from `path`, or from the platform config dir when
    /// `path` is `None`. A missing default file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match default_config_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var(HOST_ENV) {
            let host = host.trim();
            if !host.is_empty() {
                self.gateway.host = host.to_owned();
            }
        }
        if let Ok(port) = std::env::var(PORT_ENV) {
            self.gateway.port = port
                .trim()
                .parse()
                .with_context(|| format!("{PORT_ENV} must be a port number"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.max_attempts == 0 {
            bail!("[queue] max_attempts must be at least 1");
        }
        if self.offline.capacity == 0 {
            bail!("[offline] capacity must be at least 1");
        }
        if self.registry.retention_secs < self.registry.activity_timeout_secs {
            bail!("[registry] retention_secs must not be shorter than activity_timeout_secs");
        }
        if self.store.backend == StoreBackend::Sqlite && self.store.path.is_none() {
            bail!("[store] path is required for the sqlite backend");
        }
        Ok(())
    }

    /// JSON schema of the config file, for editor integration.
    pub fn schema_json() -> Result<String> {
        let schema = schemars::schema_for!(HubConfig);
        Ok(serde_json::to_string_pretty(&schema)?)
    }
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("ai", "zeroclaw", "zeroclaw-sync")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_recommended_values() {
        let config = HubConfig::default();
        assert_eq!(config.registry.activity_timeout_secs, 300);
        assert_eq!(config.registry.sweep_interval_secs, 60);
        assert_eq!(config.registry.retention_secs, 3600);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.offline.capacity, 100);
        assert_eq!(config.auth.auth_timeout_secs, 10);
        assert_eq!(config.conflict.strategy, ConflictStrategy::LastWriteWins);
        assert_eq!(config.filters.limit_for(DeviceClass::Watch), Some(2_048));
        assert_eq!(config.filters.limit_for(DeviceClass::Desktop), None);
        config.validate().unwrap();
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config = HubConfig::from_toml("").unwrap();
        assert_eq!(config.gateway.port, 3030);
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config = HubConfig::from_toml(
            r#"
            [queue]
            max_attempts = 5

            [conflict]
            strategy = "device_priority"

            [[filters.payload_limits]]
            class = "tv"
            max_bytes = 512
            "#,
        )
        .unwrap();
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.queue.retry_backoff_ms, 500);
        assert_eq!(config.conflict.strategy, ConflictStrategy::DevicePriority);
        assert_eq!(config.filters.limit_for(DeviceClass::Tv), Some(512));
        assert_eq!(config.filters.limit_for(DeviceClass::Watch), None);
    }

    #[test]
    fn validate_rejects_zero_attempts_and_sqlite_without_path() {
        let mut config = HubConfig::default();
        config.queue.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = HubConfig::default();
        config.store.backend = StoreBackend::Sqlite;
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[offline]\ncapacity = 7").unwrap();
        let config = HubConfig::from_file(file.path()).unwrap();
        assert_eq!(config.offline.capacity, 7);
    }

    #[test]
    fn schema_export_mentions_sections() {
        let schema = HubConfig::schema_json().unwrap();
        assert!(schema.contains("registry"));
        assert!(schema.contains("offline"));
    }
}
