//! Persistent connection table and its lifecycle state machine.
//!
//! ```text
//! Connecting -> Authenticating -> Connected -> Draining -> Closed
//!                      |              |
//!                      +--> Closed    +--> Stale -> Closed
//! ```
//!
//! A device has at most one `Connected` connection; binding a new one
//! drains the old. A freshly bound connection is held back from routing
//! until the hub has replayed the device's offline backlog on it.
//!
//! `Draining` and `Stale` are kept in the table (and reported in device
//! status) until the transport finishes or the housekeeping loop reaps
//! them. Neither receives routed traffic.

use crate::envelope::MessageEnvelope;
use crate::error::{HubError, HubResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outbound buffer per connection.
pub const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Connected,
    Draining,
    Stale,
    Closed,
}

impl ConnectionState {
    pub fn can_transition(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Connecting, Authenticating)
                | (Connecting, Closed)
                | (Authenticating, Connected)
                | (Authenticating, Closed)
                | (Connected, Draining)
                | (Connected, Stale)
                | (Draining, Closed)
                | (Stale, Closed)
        )
    }

    fn is_closing(self) -> bool {
        matches!(self, ConnectionState::Draining | ConnectionState::Stale)
    }
}

/// Handed to the transport when a connection is opened.
pub struct ConnectionHandle {
    pub id: String,
    /// Sender for replies produced by the transport itself.
    pub outbound: mpsc::Sender<MessageEnvelope>,
    pub inbound: mpsc::Receiver<MessageEnvelope>,
    /// Cancelled when the hub starts closing the connection.
    pub closed: CancellationToken,
}

struct Connection {
    state: ConnectionState,
    device_id: Option<String>,
    user_id: Option<String>,
    tx: mpsc::Sender<MessageEnvelope>,
    closed: CancellationToken,
    opened_at: Instant,
    /// Bound but still replaying the offline backlog.
    held: bool,
    closing_since: Option<Instant>,
}

impl Connection {
    fn info(&self, id: &str) -> ConnectionInfo {
        ConnectionInfo {
            id: id.to_owned(),
            state: self.state,
            device_id: self.device_id.clone(),
            user_id: self.user_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub state: ConnectionState,
    pub device_id: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Default)]
struct Table {
    by_id: HashMap<String, Connection>,
    /// device_id -> id of its Connected connection
    by_device: HashMap<String, String>,
}

impl Table {
    fn unbind(&mut self, device_id: &str, conn_id: &str) {
        if self.by_device.get(device_id).is_some_and(|id| id == conn_id) {
            self.by_device.remove(device_id);
        }
    }

    fn bound(&self, device_id: &str) -> Option<&Connection> {
        self.by_device
            .get(device_id)
            .and_then(|id| self.by_id.get(id))
            .filter(|c| c.state == ConnectionState::Connected)
    }
}

fn refused(from: ConnectionState, to: ConnectionState) -> HubError {
    HubError::auth(format!("connection cannot move from {from:?} to {to:?}"))
}

#[derive(Default)]
pub struct ConnectionTable {
    inner: Mutex<Table>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh transport. It starts in `Connecting`.
    pub fn open(&self) -> ConnectionHandle {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let id = uuid::Uuid::new_v4().to_string();
        let closed = CancellationToken::new();
        self.inner.lock().by_id.insert(
            id.clone(),
            Connection {
                state: ConnectionState::Connecting,
                device_id: None,
                user_id: None,
                tx: tx.clone(),
                closed: closed.clone(),
                opened_at: Instant::now(),
                held: false,
                closing_since: None,
            },
        );
        ConnectionHandle {
            id,
            outbound: tx,
            inbound: rx,
            closed,
        }
    }

    pub fn state(&self, conn_id: &str) -> Option<ConnectionState> {
        self.inner.lock().by_id.get(conn_id).map(|c| c.state)
    }

    /// Plain state change for the pre-authentication steps. Closing goes
    /// through [`close_with`](Self::close_with) and [`finish`](Self::finish).
    pub fn transition(&self, conn_id: &str, to: ConnectionState) -> HubResult<()> {
        if to == ConnectionState::Closed || to.is_closing() {
            return self.close_with(conn_id, to).map(|_| ());
        }
        let mut table = self.inner.lock();
        let conn = table
            .by_id
            .get_mut(conn_id)
            .ok_or_else(|| HubError::auth("unknown connection"))?;
        if !conn.state.can_transition(to) {
            return Err(refused(conn.state, to));
        }
        conn.state = to;
        Ok(())
    }

    /// `Authenticating -> Connected`, binding the device. The connection is
    /// held from routing until [`release`](Self::release). An older
    /// connection for the same device is moved to `Draining`.
    pub fn bind(&self, conn_id: &str, device_id: &str, user_id: &str) -> HubResult<()> {
        let replaced = {
            let mut table = self.inner.lock();
            let conn = table
                .by_id
                .get_mut(conn_id)
                .ok_or_else(|| HubError::auth("unknown connection"))?;
            if !conn.state.can_transition(ConnectionState::Connected) {
                return Err(HubError::auth("connection is not authenticating"));
            }
            conn.state = ConnectionState::Connected;
            conn.held = true;
            conn.device_id = Some(device_id.to_owned());
            conn.user_id = Some(user_id.to_owned());
            table
                .by_device
                .insert(device_id.to_owned(), conn_id.to_owned())
                .filter(|old| old != conn_id)
        };

        if let Some(old) = replaced {
            tracing::info!(device_id, old_connection = %old, "Replacing existing connection");
            if let Err(e) = self.close_with(&old, ConnectionState::Draining) {
                tracing::debug!(connection = %old, "Old connection not drained: {e}");
            }
        }
        Ok(())
    }

    /// Open a held connection to routed traffic.
    pub fn release(&self, conn_id: &str) -> bool {
        let mut table = self.inner.lock();
        match table.by_id.get_mut(conn_id) {
            Some(conn) if conn.state == ConnectionState::Connected && conn.held => {
                conn.held = false;
                true
            }
            _ => false,
        }
    }

    /// Sender for routed traffic to the device's live connection.
    pub fn sender_for(&self, device_id: &str) -> Option<mpsc::Sender<MessageEnvelope>> {
        self.inner
            .lock()
            .bound(device_id)
            .filter(|c| !c.held)
            .map(|c| c.tx.clone())
    }

    /// Sender of one connection while it is `Connected`, held or not.
    pub fn connection_sender(&self, conn_id: &str) -> Option<mpsc::Sender<MessageEnvelope>> {
        self.inner
            .lock()
            .by_id
            .get(conn_id)
            .filter(|c| c.state == ConnectionState::Connected)
            .map(|c| c.tx.clone())
    }

    /// The device has an authenticated connection.
    pub fn is_connected(&self, device_id: &str) -> bool {
        self.inner.lock().bound(device_id).is_some()
    }

    pub fn info(&self, conn_id: &str) -> Option<ConnectionInfo> {
        self.inner.lock().by_id.get(conn_id).map(|c| c.info(conn_id))
    }

    /// State of the device's live connection, or else of its most recent
    /// one that is still closing.
    pub fn device_state(&self, device_id: &str) -> Option<ConnectionState> {
        let table = self.inner.lock();
        if let Some(conn) = table.bound(device_id) {
            return Some(conn.state);
        }
        table
            .by_id
            .values()
            .filter(|c| c.device_id.as_deref() == Some(device_id))
            .max_by_key(|c| c.opened_at)
            .map(|c| c.state)
    }

    /// Every connection bound to a device, oldest first.
    pub fn device_connections(&self, device_id: &str) -> Vec<ConnectionInfo> {
        let table = self.inner.lock();
        let mut conns: Vec<(&String, &Connection)> = table
            .by_id
            .iter()
            .filter(|(_, c)| c.device_id.as_deref() == Some(device_id))
            .collect();
        conns.sort_by_key(|(_, c)| c.opened_at);
        conns.into_iter().map(|(id, c)| c.info(id)).collect()
    }

    /// Start closing a connection. `Draining` (orderly) and `Stale`
    /// (liveness lost) stop routing and cancel the handle but keep the
    /// entry until [`finish`](Self::finish); `Closed` removes it at once.
    /// Refused transitions leave the connection untouched. Returns the
    /// device that was bound, if any.
    pub fn close_with(&self, conn_id: &str, via: ConnectionState) -> HubResult<Option<String>> {
        if via == ConnectionState::Closed {
            return self.finish(conn_id);
        }
        let (device_id, closed) = {
            let mut table = self.inner.lock();
            let conn = table
                .by_id
                .get_mut(conn_id)
                .ok_or_else(|| HubError::auth("unknown connection"))?;
            let from = conn.state;
            if !from.can_transition(via) {
                return Err(refused(from, via));
            }
            conn.state = via;
            conn.closing_since = Some(Instant::now());
            let device_id = conn.device_id.clone();
            let closed = conn.closed.clone();
            if let Some(device) = &device_id {
                table.unbind(device, conn_id);
            }
            tracing::debug!(connection = %conn_id, ?from, to = ?via, "Connection closing");
            (device_id, closed)
        };
        closed.cancel();
        Ok(device_id)
    }

    /// `-> Closed`: remove the entry. Refused for a `Connected` connection,
    /// which has to drain or go stale first.
    pub fn finish(&self, conn_id: &str) -> HubResult<Option<String>> {
        let conn = {
            let mut table = self.inner.lock();
            let from = table
                .by_id
                .get(conn_id)
                .map(|c| c.state)
                .ok_or_else(|| HubError::auth("unknown connection"))?;
            if !from.can_transition(ConnectionState::Closed) {
                return Err(refused(from, ConnectionState::Closed));
            }
            let Some(conn) = table.by_id.remove(conn_id) else {
                return Ok(None);
            };
            if let Some(device) = &conn.device_id {
                table.unbind(device, conn_id);
            }
            conn
        };

        conn.closed.cancel();
        tracing::debug!(
            connection = %conn_id,
            device_id = conn.device_id.as_deref().unwrap_or("-"),
            lifetime_ms = conn.opened_at.elapsed().as_millis() as u64,
            "Connection closed"
        );
        Ok(conn.device_id)
    }

    /// Drain a live connection or close one that never authenticated.
    /// Connections already closing are left alone.
    fn shut(&self, conn_id: &str) -> HubResult<Option<String>> {
        match self.state(conn_id) {
            Some(ConnectionState::Connected) => self.close_with(conn_id, ConnectionState::Draining),
            Some(state) if state.is_closing() => Ok(None),
            _ => self.finish(conn_id),
        }
    }

    /// The transport is gone: drain if still live, then close.
    pub fn close(&self, conn_id: &str) -> Option<String> {
        if let Err(e) = self.shut(conn_id) {
            tracing::trace!(connection = %conn_id, "Close: {e}");
        }
        self.finish(conn_id).ok().flatten()
    }

    /// Liveness loss reported by the registry.
    pub fn mark_stale(&self, device_id: &str) -> bool {
        let conn_id = self.inner.lock().by_device.get(device_id).cloned();
        conn_id.is_some_and(|id| self.close_with(&id, ConnectionState::Stale).is_ok())
    }

    /// Begin closing every connection. Used at shutdown.
    pub fn drain_all(&self) -> usize {
        let ids: Vec<String> = self.inner.lock().by_id.keys().cloned().collect();
        ids.iter().filter(|id| self.shut(id).is_ok()).count()
    }

    /// Close connections stuck before authentication longer than `timeout`.
    pub fn expire_unauthenticated(&self, timeout: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .inner
            .lock()
            .by_id
            .iter()
            .filter(|(_, c)| {
                matches!(
                    c.state,
                    ConnectionState::Connecting | ConnectionState::Authenticating
                ) && c.opened_at.elapsed() >= timeout
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            tracing::warn!(connection = %id, "Authentication timed out");
            if let Err(e) = self.finish(id) {
                tracing::debug!(connection = %id, "Expired connection already gone: {e}");
            }
        }
        expired
    }

    /// Close `Draining`/`Stale` connections whose transport has not
    /// finished them within `grace`.
    pub fn reap_closing(&self, grace: Duration) -> usize {
        let due: Vec<String> = self
            .inner
            .lock()
            .by_id
            .iter()
            .filter(|(_, c)| {
                c.state.is_closing() && c.closing_since.is_some_and(|t| t.elapsed() >= grace)
            })
            .map(|(id, _)| id.clone())
            .collect();
        due.iter().filter(|id| self.finish(id).is_ok()).count()
    }

    pub fn connected_count(&self) -> usize {
        self.inner.lock().by_device.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().by_id.is_empty()
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    fn authenticated(table: &ConnectionTable, device: &str) -> ConnectionHandle {
        let handle = table.open();
        table.transition(&handle.id, Authenticating).unwrap();
        table.bind(&handle.id, device, "user_1").unwrap();
        table.release(&handle.id);
        handle
    }

    #[test]
    fn lifecycle_follows_allowed_transitions() {
        assert!(Connecting.can_transition(Authenticating));
        assert!(Authenticating.can_transition(Connected));
        assert!(Connected.can_transition(Stale));
        assert!(!Connecting.can_transition(Connected));
        assert!(!Closed.can_transition(Connecting));
        assert!(!Stale.can_transition(Connected));
    }

    #[test]
    fn only_connected_devices_get_a_sender() {
        let table = ConnectionTable::new();
        let handle = table.open();
        table.transition(&handle.id, Authenticating).unwrap();
        assert!(table.bind(&handle.id, "dev_a", "user_1").is_ok());
        assert!(table.is_connected("dev_a"));
        assert!(!table.is_connected("dev_b"));
    }

    #[test]
    fn bound_connection_is_held_until_released() {
        let table = ConnectionTable::new();
        let handle = table.open();
        table.transition(&handle.id, Authenticating).unwrap();
        table.bind(&handle.id, "dev_a", "user_1").unwrap();

        assert!(table.sender_for("dev_a").is_none());
        assert!(table.connection_sender(&handle.id).is_some());
        assert!(table.release(&handle.id));
        assert!(table.sender_for("dev_a").is_some());
        assert!(!table.release(&handle.id));
    }

    #[test]
    fn bind_requires_authenticating_state() {
        let table = ConnectionTable::new();
        let handle = table.open();
        assert!(matches!(
            table.bind(&handle.id, "dev_a", "user_1"),
            Err(HubError::Authentication(_))
        ));
        assert!(!table.is_connected("dev_a"));
    }

    #[test]
    fn rebinding_device_drains_previous_connection() {
        let table = ConnectionTable::new();
        let first = authenticated(&table, "dev_a");
        let second = authenticated(&table, "dev_a");

        assert!(first.closed.is_cancelled());
        assert!(!second.closed.is_cancelled());
        assert_eq!(table.state(&first.id), Some(Draining));
        assert_eq!(table.device_state("dev_a"), Some(Connected));
        assert_eq!(table.connected_count(), 1);

        let conns = table.device_connections("dev_a");
        assert_eq!(conns.len(), 2);
        let state_of = |id: &str| conns.iter().find(|c| c.id == id).map(|c| c.state);
        assert_eq!(state_of(&first.id), Some(Draining));
        assert_eq!(state_of(&second.id), Some(Connected));

        assert_eq!(table.close(&first.id).as_deref(), Some("dev_a"));
        assert_eq!(table.state(&first.id), None);
        assert!(table.is_connected("dev_a"));
    }

    #[test]
    fn stale_device_is_reported_until_the_transport_finishes() {
        let table = ConnectionTable::new();
        let handle = authenticated(&table, "dev_a");
        assert!(table.mark_stale("dev_a"));
        assert!(handle.closed.is_cancelled());
        assert!(!table.is_connected("dev_a"));
        assert!(table.sender_for("dev_a").is_none());
        assert_eq!(table.state(&handle.id), Some(Stale));
        assert_eq!(table.device_state("dev_a"), Some(Stale));
        assert!(!table.mark_stale("dev_a"));

        assert_eq!(table.close(&handle.id).as_deref(), Some("dev_a"));
        assert_eq!(table.device_state("dev_a"), None);
        assert!(table.is_empty());
    }

    #[test]
    fn refused_transitions_leave_state_unchanged() {
        let table = ConnectionTable::new();
        let pending = table.open();
        assert!(matches!(
            table.close_with(&pending.id, Draining),
            Err(HubError::Authentication(_))
        ));
        assert!(table.transition(&pending.id, Connected).is_err());
        assert_eq!(table.state(&pending.id), Some(Connecting));
        assert!(!pending.closed.is_cancelled());

        let live = authenticated(&table, "dev_a");
        assert!(table.finish(&live.id).is_err());
        assert_eq!(table.state(&live.id), Some(Connected));

        table.close_with(&live.id, Stale).unwrap();
        assert!(table.close_with(&live.id, Draining).is_err());
        assert!(table.transition(&live.id, Connected).is_err());
        assert_eq!(table.state(&live.id), Some(Stale));

        assert!(table.close_with("nope", Draining).is_err());
    }

    #[test]
    fn unauthenticated_connections_expire() {
        let table = ConnectionTable::new();
        let pending = table.open();
        let _done = authenticated(&table, "dev_a");

        let expired = table.expire_unauthenticated(Duration::ZERO);
        assert_eq!(expired, vec![pending.id.clone()]);
        assert!(pending.closed.is_cancelled());
        assert_eq!(table.state(&pending.id), None);
        assert!(table.is_connected("dev_a"));
    }

    #[test]
    fn closing_connections_are_reaped_after_grace() {
        let table = ConnectionTable::new();
        let live = authenticated(&table, "dev_a");
        let stale = authenticated(&table, "dev_b");
        table.mark_stale("dev_b");

        assert_eq!(table.reap_closing(Duration::from_secs(60)), 0);
        assert_eq!(table.reap_closing(Duration::ZERO), 1);
        assert_eq!(table.state(&stale.id), None);
        assert_eq!(table.state(&live.id), Some(Connected));
    }

    #[tokio::test]
    async fn sender_reaches_handle_inbound() {
        let table = ConnectionTable::new();
        let mut handle = authenticated(&table, "dev_a");
        let env = MessageEnvelope::builder(crate::envelope::MessageType::Heartbeat, "hub", "user_1")
            .build()
            .unwrap();
        table.sender_for("dev_a").unwrap().send(env.clone()).await.unwrap();
        assert_eq!(handle.inbound.recv().await.unwrap(), env);
    }

    #[test]
    fn drain_all_drains_live_and_closes_pending() {
        let table = ConnectionTable::new();
        let a = authenticated(&table, "dev_a");
        let b = table.open();
        assert_eq!(table.drain_all(), 2);
        assert!(a.closed.is_cancelled() && b.closed.is_cancelled());
        assert_eq!(table.state(&a.id), Some(Draining));
        assert_eq!(table.state(&b.id), None);
        assert_eq!(table.connected_count(), 0);

        table.close(&a.id);
        assert!(table.is_empty());
    }
}
