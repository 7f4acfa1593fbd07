//! Conflict detection and resolution.
//!
//! Two items conflict when they share a logical key, carry different
//! fingerprints and were written within the concurrency window of each
//! other (no confirmed causal order). Records for the same key are merged
//! so a device cannot see two different resolutions for one key.
//!
//! Resolution picks a winner with the configured strategy and re-enqueues
//! it as a fresh item to every active device of the owner, origin
//! included. `manual` parks the record for review instead.

use crate::config::ConflictConfig;
use crate::envelope::{DeviceClass, Priority};
use crate::error::{HubError, HubResult};
use crate::metrics::HubMetrics;
use crate::sync::coordinator::{DeliveryOutcome, DeliveryResult};
use crate::sync::item::{OperationKind, SyncItem};
use crate::sync::queue::{SyncOperation, SyncQueue, Targeting};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Greatest timestamp wins; ties go to the greater item id.
    #[default]
    LastWriteWins,
    /// The origin device class ranked highest wins; ties fall back to LWW.
    DevicePriority,
    /// Park for review.
    Manual,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictRecord {
    pub id: String,
    pub logical_key: String,
    pub user_id: String,
    /// Operations whose delivery surfaced this conflict.
    pub operation_ids: Vec<String>,
    /// Distinct competing values, deduplicated by fingerprint.
    pub competing: Vec<SyncItem>,
    pub detected_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ConflictStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<SyncItem>,
}

impl ConflictRecord {
    fn new(operation_id: &str, items: Vec<SyncItem>) -> Option<Self> {
        let first = items.first()?;
        let mut record = Self {
            id: uuid::Uuid::new_v4().to_string(),
            logical_key: first.logical_key(),
            user_id: first.user_id.clone(),
            operation_ids: vec![operation_id.to_owned()],
            competing: Vec::new(),
            detected_at: Utc::now(),
            strategy: None,
            winner: None,
        };
        for item in items {
            record.add(item);
        }
        Some(record)
    }

    fn add(&mut self, item: SyncItem) {
        if !self
            .competing
            .iter()
            .any(|c| c.fingerprint == item.fingerprint)
        {
            self.competing.push(item);
        }
    }

    fn absorb(&mut self, other: ConflictRecord) {
        for op_id in other.operation_ids {
            if !self.operation_ids.contains(&op_id) {
                self.operation_ids.push(op_id);
            }
        }
        for item in other.competing {
            self.add(item);
        }
    }
}

pub enum Resolution {
    /// Winner chosen; `item` is the fresh copy to broadcast.
    Resolved {
        record: ConflictRecord,
        item: SyncItem,
    },
    Escalated(ConflictRecord),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConflictStats {
    pub detected: u64,
    pub resolved: u64,
    pub escalated: u64,
    pub pending: usize,
    pub awaiting_review: usize,
}

/// Whether `incoming` beats `current` under last-write-wins.
pub fn lww_resolve(current: &SyncItem, incoming: &SyncItem) -> bool {
    if incoming.timestamp != current.timestamp {
        return incoming.timestamp > current.timestamp;
    }
    incoming.id > current.id
}

/// Same key, different content, written without a confirmed order.
pub fn items_conflict(a: &SyncItem, b: &SyncItem, window_ms: u64) -> bool {
    a.logical_key() == b.logical_key()
        && a.fingerprint != b.fingerprint
        && a.timestamp.abs_diff(b.timestamp) < window_ms
}

fn lww_winner(items: &[SyncItem]) -> Option<&SyncItem> {
    items
        .iter()
        .reduce(|best, item| if lww_resolve(best, item) { item } else { best })
}

fn priority_winner<'a>(items: &'a [SyncItem], ranking: &[DeviceClass]) -> Option<&'a SyncItem> {
    let rank = |class: DeviceClass| {
        ranking
            .iter()
            .position(|c| *c == class)
            .unwrap_or(ranking.len())
    };
    let best = items.iter().map(|i| rank(i.origin_class)).min()?;
    let top: Vec<SyncItem> = items
        .iter()
        .filter(|i| rank(i.origin_class) == best)
        .cloned()
        .collect();
    let chosen = lww_winner(&top)?;
    items.iter().find(|i| i.id == chosen.id)
}

pub struct ConflictResolver {
    config: ConflictConfig,
    /// logical key -> open record
    pending: Mutex<BTreeMap<String, ConflictRecord>>,
    review: Mutex<VecDeque<ConflictRecord>>,
    detected: AtomicU64,
    resolved: AtomicU64,
    escalated: AtomicU64,
    metrics: Option<Arc<HubMetrics>>,
}

impl ConflictResolver {
    pub fn new(config: ConflictConfig) -> Self {
        Self {
            config,
            pending: Mutex::new(BTreeMap::new()),
            review: Mutex::new(VecDeque::new()),
            detected: AtomicU64::new(0),
            resolved: AtomicU64::new(0),
            escalated: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HubMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ConflictConfig {
        &self.config
    }

    /// Inspect the per-target results of one delivery round.
    pub fn detect(&self, op: &SyncOperation, results: &[DeliveryResult]) -> Option<ConflictRecord> {
        let mut competing = vec![op.item.clone()];
        for result in results {
            if let DeliveryOutcome::Conflict { current } = &result.outcome {
                if items_conflict(&op.item, current, self.config.concurrency_window_ms) {
                    competing.push(current.clone());
                } else {
                    tracing::debug!(
                        operation_id = %op.id,
                        device_id = %result.device_id,
                        "Reported conflict has a causal order; ignored"
                    );
                }
            }
        }
        if competing.len() < 2 {
            return None;
        }
        self.submit(ConflictRecord::new(&op.id, competing)?)
    }

    /// A device told us its current value disagrees with one we sent.
    pub fn report(
        &self,
        operation_id: &str,
        sent: &SyncItem,
        current: SyncItem,
    ) -> Option<ConflictRecord> {
        if !items_conflict(sent, &current, self.config.concurrency_window_ms) {
            return None;
        }
        self.submit(ConflictRecord::new(
            operation_id,
            vec![sent.clone(), current],
        )?)
    }

    fn submit(&self, record: ConflictRecord) -> Option<ConflictRecord> {
        if record.competing.len() < 2 {
            return None;
        }
        let mut pending = self.pending.lock();
        let merged = match pending.remove(&record.logical_key) {
            Some(mut existing) => {
                existing.absorb(record);
                existing
            }
            None => {
                self.detected.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.conflicts_detected.inc();
                }
                record
            }
        };
        tracing::info!(
            conflict_id = %merged.id,
            key = %merged.logical_key,
            competing = merged.competing.len(),
            "Sync conflict detected"
        );
        pending.insert(merged.logical_key.clone(), merged.clone());
        Some(merged)
    }

    pub fn take_pending(&self) -> Vec<ConflictRecord> {
        std::mem::take(&mut *self.pending.lock())
            .into_values()
            .collect()
    }

    /// Pick a winner under the configured strategy.
    pub fn resolve(&self, record: ConflictRecord) -> Resolution {
        let strategy = self.config.strategy;
        let winner = match strategy {
            ConflictStrategy::Manual => None,
            ConflictStrategy::LastWriteWins => lww_winner(&record.competing).cloned(),
            ConflictStrategy::DevicePriority => {
                priority_winner(&record.competing, &self.config.device_priority).cloned()
            }
        };

        match winner {
            Some(winner) => self.settle(record, winner, strategy),
            None => self.escalate(record),
        }
    }

    fn settle(
        &self,
        mut record: ConflictRecord,
        winner: SyncItem,
        strategy: ConflictStrategy,
    ) -> Resolution {
        let version = record
            .competing
            .iter()
            .map(|i| i.version)
            .max()
            .unwrap_or(winner.version);
        let mut item = winner.clone();
        item.id = uuid::Uuid::new_v4().to_string();
        item.version = version + 1;
        item.summarized = false;

        record.strategy = Some(strategy);
        record.winner = Some(winner);
        self.resolved.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.conflicts_resolved.inc();
        }
        tracing::info!(
            conflict_id = %record.id,
            key = %record.logical_key,
            strategy = ?strategy,
            winner_device = %item.origin_device_id,
            "Conflict resolved"
        );
        Resolution::Resolved { record, item }
    }

    fn escalate(&self, record: ConflictRecord) -> Resolution {
        let mut review = self.review.lock();
        review.retain(|r| r.logical_key != record.logical_key);
        review.push_back(record.clone());
        while review.len() > self.config.manual_review_limit.max(1) {
            if let Some(dropped) = review.pop_front() {
                tracing::warn!(conflict_id = %dropped.id, "Manual review list full; oldest conflict dropped");
            }
        }
        drop(review);

        self.escalated.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.conflicts_escalated.inc();
        }
        tracing::info!(conflict_id = %record.id, key = %record.logical_key, "Conflict parked for manual review");
        Resolution::Escalated(record)
    }

    /// Resolve everything pending. Winners go back on the queue at urgent
    /// priority; escalated records are returned for notification.
    pub fn process_pending(&self, queue: &SyncQueue) -> Vec<ConflictRecord> {
        let mut escalated = Vec::new();
        for record in self.take_pending() {
            match self.resolve(record) {
                Resolution::Resolved { record, item } => {
                    if let Err(e) = queue.enqueue_with(
                        item,
                        OperationKind::ConflictResolution,
                        Priority::Urgent,
                        Targeting::AutoIncludingOrigin,
                    ) {
                        tracing::warn!(conflict_id = %record.id, "Failed to enqueue resolution: {e}");
                    }
                }
                Resolution::Escalated(record) => escalated.push(record),
            }
        }
        escalated
    }

    /// Settle a parked conflict with the value a user picked.
    pub fn decide(
        &self,
        conflict_id: &str,
        winning_item_id: &str,
        queue: &SyncQueue,
    ) -> HubResult<String> {
        let record = {
            let mut review = self.review.lock();
            let pos = review
                .iter()
                .position(|r| r.id == conflict_id)
                .ok_or_else(|| {
                    HubError::Validation(crate::error::ValidationError::Malformed(format!(
                        "no conflict awaiting review with id {conflict_id}"
                    )))
                })?;
            let Some(winner) = review[pos]
                .competing
                .iter()
                .find(|i| i.id == winning_item_id)
                .cloned()
            else {
                return Err(crate::error::ValidationError::Malformed(format!(
                    "item {winning_item_id} is not part of conflict {conflict_id}"
                ))
                .into());
            };
            review.remove(pos).map(|record| (record, winner))
        };
        let Some((record, winner)) = record else {
            return Err(HubError::Store("review list changed concurrently".into()));
        };

        match self.settle(record, winner, ConflictStrategy::Manual) {
            Resolution::Resolved { item, .. } => queue.enqueue_with(
                item,
                OperationKind::ConflictResolution,
                Priority::Urgent,
                Targeting::AutoIncludingOrigin,
            ),
            Resolution::Escalated(_) => Err(HubError::Store("conflict could not be settled".into())),
        }
    }

    pub fn awaiting_review(&self, user_id: &str) -> Vec<ConflictRecord> {
        self.review
            .lock()
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> ConflictStats {
        ConflictStats {
            detected: self.detected.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            escalated: self.escalated.load(Ordering::Relaxed),
            pending: self.pending.lock().len(),
            awaiting_review: self.review.lock().len(),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────
