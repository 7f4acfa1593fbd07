//! In-memory session tokens and device enrollment.
//!
//! Registering a device always takes the enrollment secret: the configured
//! `device_secret`, or a pairing code generated at startup when none is
//! configured. Registration hands back a per-device key, and only that key
//! can mint session tokens for the device.
//!
//! Tokens are opaque hex strings handed to a registered device. Only their
//! SHA-256 is stored; lookup hashes the presented token and compares the
//! claims. Tokens expire after the configured TTL and are dropped on
//! lookup or sweep.

use crate::config::AuthConfig;
use crate::error::{HubError, HubResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Who a token speaks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenClaims {
    pub user_id: String,
    pub device_id: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip)]
    expires: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub user_id: String,
    pub device_id: String,
    pub expires_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

/// Length of a generated pairing code.
const PAIRING_CODE_LEN: usize = 12;

pub struct TokenStore {
    /// token hash -> claims
    sessions: Mutex<HashMap<String, TokenClaims>>,
    /// device id -> hash of its enrollment key
    device_keys: Mutex<HashMap<String, String>>,
    ttl: Duration,
    secret_hash: String,
    /// Set when no secret is configured; shown to the operator at startup.
    pairing_code: Option<String>,
}

impl TokenStore {
    pub fn new(config: &AuthConfig) -> Self {
        let (secret_hash, pairing_code) = match config.device_secret.as_deref() {
            Some(secret) => (hash_token(secret), None),
            None => {
                let code = generate_pairing_code();
                (hash_token(&code), Some(code))
            }
        };
        Self {
            sessions: Mutex::new(HashMap::new()),
            device_keys: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(config.token_ttl_secs.max(1)),
            secret_hash,
            pairing_code,
        }
    }

    /// One-time code that stands in for an unconfigured device secret.
    pub fn pairing_code(&self) -> Option<&str> {
        self.pairing_code.as_deref()
    }

    /// Check the enrollment secret (or pairing code).
    pub fn verify_secret(&self, presented: Option<&str>) -> HubResult<()> {
        let presented = presented.ok_or_else(|| HubError::auth("device secret required"))?;
        if constant_time_eq(hash_token(presented).as_bytes(), self.secret_hash.as_bytes()) {
            Ok(())
        } else {
            Err(HubError::auth("invalid device secret"))
        }
    }

    /// New enrollment key for a device. Any earlier key stops working.
    pub fn enroll(&self, device_id: &str) -> String {
        let key = generate_token();
        self.device_keys
            .lock()
            .insert(device_id.to_owned(), hash_token(&key));
        tracing::debug!(device_id, "Device key issued");
        key
    }

    pub fn verify_device_key(&self, device_id: &str, presented: Option<&str>) -> HubResult<()> {
        let presented = presented.ok_or_else(|| HubError::auth("device key required"))?;
        let keys = self.device_keys.lock();
        match keys.get(device_id) {
            Some(expected)
                if constant_time_eq(hash_token(presented).as_bytes(), expected.as_bytes()) =>
            {
                Ok(())
            }
            _ => Err(HubError::auth("invalid device key")),
        }
    }

    pub fn issue(&self, user_id: &str, device_id: &str) -> IssuedToken {
        let token = generate_token();
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::hours(1));
        let claims = TokenClaims {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            expires_at,
            expires: Instant::now() + self.ttl,
        };
        self.sessions.lock().insert(hash_token(&token), claims);
        tracing::debug!(device_id, "Session token issued");

        IssuedToken {
            token,
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            expires_at,
            ttl_secs: self.ttl.as_secs(),
        }
    }

    /// Claims for a live token. Expired tokens are removed.
    pub fn validate(&self, token: &str) -> Option<TokenClaims> {
        let key = hash_token(token);
        let mut sessions = self.sessions.lock();
        let claims = sessions.get(&key)?;
        if claims.expires <= Instant::now() {
            sessions.remove(&key);
            return None;
        }
        Some(claims.clone())
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.sessions.lock().remove(&hash_token(token)).is_some()
    }

    /// Drop every token bound to a device, and its enrollment key.
    pub fn revoke_device(&self, device_id: &str) -> usize {
        self.device_keys.lock().remove(device_id);
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, c| c.device_id != device_id);
        before - sessions.len()
    }

    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, c| c.expires > now);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

/// 256 random bits, hex-encoded.
fn generate_token() -> String {
    let a = uuid::Uuid::new_v4();
    let b = uuid::Uuid::new_v4();
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(a.as_bytes());
    bytes.extend_from_slice(b.as_bytes());
    hex::encode(bytes)
}

fn generate_pairing_code() -> String {
    let mut code = generate_token();
    code.truncate(PAIRING_CODE_LEN);
    code
}

fn hash_token(token: &str) -> String {
    let mut h = Sha256::new();
    h.update(token.as_bytes());
    hex::encode(h.finalize())
}

/// Constant-time byte comparison.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ── Tests ───────────────────────────────────────────────────────
