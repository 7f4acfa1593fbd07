//! Per-device offline queue.
//!
//! Envelopes addressed to a registered device that has no live connection
//! are parked here and flushed, oldest first, once the device
//! authenticates again. Each device gets a fixed capacity; on overflow the
//! oldest entry is dropped and counted. Entries are purged when the
//! registry evicts the device.
//!
//! [`OfflineQueue::park_unless`] and [`OfflineQueue::drain_or_else`] run
//! their callbacks under the queue lock. Routing and the reconnect flush
//! use them so a device only goes live once its backlog is empty.

use crate::envelope::MessageEnvelope;
use crate::error::HubError;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// Result of parking one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parked {
    Queued { depth: usize },
    /// The queue was full; the id of the dropped (oldest) envelope.
    DroppedOldest { dropped_id: String },
}

/// Outcome of [`OfflineQueue::park_unless`].
#[derive(Debug)]
pub enum Route<T> {
    /// A live channel was found; the caller sends the envelope on it.
    Live(T, MessageEnvelope),
    Parked(Parked),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OfflineStats {
    pub devices: usize,
    pub queued: usize,
    pub dropped: u64,
}

/// device_id -> envelopes in arrival order
type Slots = HashMap<String, VecDeque<MessageEnvelope>>;

pub struct OfflineQueue {
    slots: Mutex<Slots>,
    capacity: usize,
    dropped: AtomicU64,
}

impl OfflineQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, device_id: &str, envelope: MessageEnvelope) -> Parked {
        let mut slots = self.slots.lock();
        let (depth, dropped) = self.push_locked(&mut slots, device_id, envelope);
        drop(slots);
        self.parked(device_id, depth, dropped)
    }

    /// Park `envelope` unless `live` yields a channel for the device.
    pub fn park_unless<T>(
        &self,
        device_id: &str,
        envelope: MessageEnvelope,
        live: impl FnOnce() -> Option<T>,
    ) -> Route<T> {
        let mut slots = self.slots.lock();
        if let Some(channel) = live() {
            return Route::Live(channel, envelope);
        }
        let (depth, dropped) = self.push_locked(&mut slots, device_id, envelope);
        drop(slots);
        Route::Parked(self.parked(device_id, depth, dropped))
    }

    fn push_locked(
        &self,
        slots: &mut Slots,
        device_id: &str,
        envelope: MessageEnvelope,
    ) -> (usize, Option<MessageEnvelope>) {
        let queue = slots.entry(device_id.to_owned()).or_default();
        let dropped = if queue.len() >= self.capacity {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(envelope);
        (queue.len(), dropped)
    }

    fn parked(&self, device_id: &str, depth: usize, dropped: Option<MessageEnvelope>) -> Parked {
        match dropped {
            Some(old) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                let err = HubError::CapacityExceeded {
                    device_id: device_id.to_owned(),
                    capacity: self.capacity,
                };
                tracing::warn!(dropped_id = %old.id, "{err}; dropped oldest entry");
                Parked::DroppedOldest { dropped_id: old.id }
            }
            None => Parked::Queued { depth },
        }
    }

    /// Take everything queued for a device, oldest first.
    pub fn drain(&self, device_id: &str) -> Vec<MessageEnvelope> {
        self.slots
            .lock()
            .remove(device_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Like [`drain`](Self::drain), but when nothing is queued `on_empty`
    /// runs before the lock is released.
    pub fn drain_or_else(&self, device_id: &str, on_empty: impl FnOnce()) -> Vec<MessageEnvelope> {
        let mut slots = self.slots.lock();
        match slots.remove(device_id) {
            Some(queue) if !queue.is_empty() => Vec::from(queue),
            _ => {
                on_empty();
                Vec::new()
            }
        }
    }

    /// Put undelivered entries back at the front, keeping their order.
    pub fn restore_front(&self, device_id: &str, envelopes: Vec<MessageEnvelope>) {
        if envelopes.is_empty() {
            return;
        }
        let mut slots = self.slots.lock();
        let queue = slots.entry(device_id.to_owned()).or_default();
        for envelope in envelopes.into_iter().rev() {
            queue.push_front(envelope);
        }
        while queue.len() > self.capacity {
            queue.pop_back();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Discard a device's queue. Returns how many entries were removed.
    pub fn purge(&self, device_id: &str) -> usize {
        self.slots
            .lock()
            .remove(device_id)
            .map_or(0, |q| q.len())
    }

    pub fn depth(&self, device_id: &str) -> usize {
        self.slots.lock().get(device_id).map_or(0, VecDeque::len)
    }

    pub fn stats(&self) -> OfflineStats {
        let slots = self.slots.lock();
        OfflineStats {
            devices: slots.len(),
            queued: slots.values().map(VecDeque::len).sum(),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageType;

    fn envelope(n: usize) -> MessageEnvelope {
        MessageEnvelope::builder(MessageType::SyncUpdate, "hub", "user_1")
            .text(format!("update {n}"))
            .build()
            .unwrap()
    }

    #[test]
    fn drain_returns_entries_in_arrival_order() {
        let queue = OfflineQueue::new(10);
        let sent: Vec<MessageEnvelope> = (0..5).map(envelope).collect();
        for env in &sent {
            queue.push("dev_watch", env.clone());
        }

        let drained = queue.drain("dev_watch");
        assert_eq!(drained, sent);
        assert_eq!(queue.depth("dev_watch"), 0);
        assert!(queue.drain("dev_watch").is_empty());
    }

    #[test]
    fn overflow_drops_oldest() {
        let queue = OfflineQueue::new(3);
        let sent: Vec<MessageEnvelope> = (0..4).map(envelope).collect();
        for env in &sent[..3] {
            assert!(matches!(
                queue.push("dev_watch", env.clone()),
                Parked::Queued { .. }
            ));
        }
        assert_eq!(
            queue.push("dev_watch", sent[3].clone()),
            Parked::DroppedOldest {
                dropped_id: sent[0].id.clone()
            }
        );

        let drained = queue.drain("dev_watch");
        assert_eq!(drained, sent[1..].to_vec());
        assert_eq!(queue.stats().dropped, 1);
    }

    #[test]
    fn queues_are_per_device() {
        let queue = OfflineQueue::new(10);
        queue.push("dev_a", envelope(1));
        queue.push("dev_b", envelope(2));
        queue.push("dev_b", envelope(3));

        let stats = queue.stats();
        assert_eq!(stats.devices, 2);
        assert_eq!(stats.queued, 3);
        assert_eq!(queue.purge("dev_b"), 2);
        assert_eq!(queue.depth("dev_a"), 1);
    }

    #[test]
    fn park_unless_prefers_a_live_channel() {
        let queue = OfflineQueue::new(10);
        let env = envelope(1);
        match queue.park_unless("dev_a", env.clone(), || Some("tx")) {
            Route::Live(channel, returned) => {
                assert_eq!(channel, "tx");
                assert_eq!(returned, env);
            }
            Route::Parked(p) => panic!("expected live route, got {p:?}"),
        }
        assert_eq!(queue.depth("dev_a"), 0);

        let parked = queue.park_unless("dev_a", env, || None::<&str>);
        assert!(matches!(parked, Route::Parked(Parked::Queued { depth: 1 })));
        assert_eq!(queue.depth("dev_a"), 1);
    }

    #[test]
    fn drain_or_else_runs_callback_only_when_empty() {
        let queue = OfflineQueue::new(10);
        queue.push("dev_a", envelope(1));

        let mut released = false;
        assert_eq!(queue.drain_or_else("dev_a", || released = true).len(), 1);
        assert!(!released);
        assert!(queue.drain_or_else("dev_a", || released = true).is_empty());
        assert!(released);
    }

    #[test]
    fn restore_front_keeps_order_ahead_of_newer_entries() {
        let queue = OfflineQueue::new(10);
        let early: Vec<MessageEnvelope> = (0..2).map(envelope).collect();
        let late = envelope(9);
        queue.push("dev_a", late.clone());
        queue.restore_front("dev_a", early.clone());

        let drained = queue.drain("dev_a");
        assert_eq!(drained, vec![early[0].clone(), early[1].clone(), late]);
    }
}
