//! Priority sync queue.
//!
//! Operations wait in one FIFO band per [`Priority`]. `drain_next` hands
//! out the oldest eligible operation of the most urgent non-empty band.
//! An operation is ineligible while it is backing off, while another
//! operation for its logical key is in flight, and while an older operation
//! for that key is still pending. Per-key order therefore holds for every
//! target even across retries.
//!
//! Failed attempts are requeued at the tail of their band with exponential
//! backoff. Once `max_attempts` retries have failed too, the operation is
//! failed, counted, and the targets it never reached are flagged out of
//! sync until a later operation for the same key lands on them.

use crate::config::{FilterConfig, QueueConfig};
use crate::envelope::Priority;
use crate::error::{HubError, HubResult};
use crate::metrics::HubMetrics;
use crate::registry::{ConnectionRegistry, Device};
use crate::sync::item::{OperationKind, SyncItem};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cap on the exponent so the backoff cannot overflow.
const MAX_BACKOFF_SHIFT: u32 = 16;

// ── Operation types ─────────────────────────────────────────────

/// How targets are chosen for a new operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targeting {
    /// Every registered device of the owner except the origin. Offline
    /// devices are included so delivery can park the update for them.
    Auto,
    /// Every registered device of the owner, origin included. Used when the
    /// hub re-broadcasts a resolved value.
    AutoIncludingOrigin,
    /// The listed devices, still subject to filtering.
    Explicit(Vec<String>),
}

/// One device an operation still has to reach.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationTarget {
    pub device_id: String,
    /// Reduced variant chosen for a constrained device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<SyncItem>,
}

impl OperationTarget {
    pub fn full(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            summary: None,
        }
    }

    /// The payload this target receives.
    pub fn payload<'a>(&'a self, item: &'a SyncItem) -> &'a SyncItem {
        self.summary.as_ref().unwrap_or(item)
    }
}

#[derive(Debug, Clone)]
pub struct SyncOperation {
    pub id: String,
    pub kind: OperationKind,
    pub item: SyncItem,
    pub priority: Priority,
    /// Targets not yet reached. Shrinks to the failed ones on retry.
    pub targets: Vec<OperationTarget>,
    /// Failed attempts so far.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Enqueue order; never changes across retries.
    seq: u64,
    enqueued: Instant,
    not_before: Option<Instant>,
}

impl SyncOperation {
    pub fn logical_key(&self) -> String {
        self.item.logical_key()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Queued,
    InFlight,
    Completed,
    Failed,
    Superseded,
}

impl OperationStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Superseded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum TargetState {
    Pending,
    Delivered,
    /// Parked in the device's offline queue.
    Deferred,
    Conflict,
    Failed(String),
}

/// Addressable history entry for an operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationRecord {
    pub id: String,
    pub kind: OperationKind,
    pub item: SyncItem,
    pub priority: Priority,
    pub status: OperationStatus,
    pub attempts: u32,
    pub targets: BTreeMap<String, TargetState>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// What happened to an operation handed back after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requeue {
    Scheduled { attempt: u32, backoff: Duration },
    Exhausted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub in_flight: usize,
    pub enqueued: u64,
    pub processed: u64,
    pub failed: u64,
    pub superseded: u64,
    pub zero_target: u64,
    pub retries: u64,
    pub avg_latency_ms: f64,
}

/// Per-device view for status endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceSyncState {
    pub pending_operations: usize,
    pub out_of_sync_keys: Vec<String>,
    pub in_sync: bool,
}

// ── Internal state ──────────────────────────────────────────────

#[derive(Default)]
struct Counters {
    enqueued: u64,
    processed: u64,
    failed: u64,
    superseded: u64,
    zero_target: u64,
    retries: u64,
    latency_total_ms: u128,
    latency_samples: u64,
}

#[derive(Default)]
struct QueueState {
    bands: [VecDeque<String>; 6],
    pending: HashMap<String, SyncOperation>,
    /// op id -> logical key
    in_flight: HashMap<String, String>,
    history: HashMap<String, OperationRecord>,
    history_order: VecDeque<String>,
    /// device -> logical key -> failed op id
    out_of_sync: HashMap<String, BTreeMap<String, String>>,
    counters: Counters,
    next_seq: u64,
}

impl QueueState {
    fn record_mut(&mut self, op_id: &str) -> Option<&mut OperationRecord> {
        self.history.get_mut(op_id)
    }

    fn push_record(&mut self, record: OperationRecord, limit: usize) {
        self.history_order.push_back(record.id.clone());
        self.history.insert(record.id.clone(), record);

        // Drop the oldest finished records; active ones rotate to the back.
        let mut budget = self.history_order.len();
        while self.history_order.len() > limit && budget > 0 {
            budget -= 1;
            let Some(id) = self.history_order.pop_front() else {
                break;
            };
            let finished = self
                .history
                .get(&id)
                .map_or(true, |r| r.status.is_finished());
            if finished {
                self.history.remove(&id);
            } else {
                self.history_order.push_back(id);
            }
        }
    }

    fn finish(&mut self, op_id: &str, status: OperationStatus, attempts: u32) {
        if let Some(record) = self.record_mut(op_id) {
            record.status = status;
            record.attempts = attempts;
            record.finished_at = Some(Utc::now());
        }
    }

    fn observe_latency(&mut self, since: Instant) {
        self.counters.latency_total_ms += since.elapsed().as_millis();
        self.counters.latency_samples += 1;
    }
}

// ── Queue ───────────────────────────────────────────────────────

pub struct SyncQueue {
    state: Mutex<QueueState>,
    registry: Arc<ConnectionRegistry>,
    config: QueueConfig,
    filters: FilterConfig,
    metrics: Option<Arc<HubMetrics>>,
}

impl SyncQueue {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        config: QueueConfig,
        filters: FilterConfig,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            registry,
            config,
            filters,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HubMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue with the item type's default priority. `targets` narrows
    /// the fan-out to the listed devices.
    pub fn enqueue(&self, item: SyncItem, targets: Option<Vec<String>>) -> HubResult<String> {
        let priority = item.item_type.default_priority();
        let targeting = targets.map_or(Targeting::Auto, Targeting::Explicit);
        self.enqueue_with(item, OperationKind::Update, priority, targeting)
    }

    pub fn enqueue_with(
        &self,
        item: SyncItem,
        kind: OperationKind,
        priority: Priority,
        targeting: Targeting,
    ) -> HubResult<String> {
        if item.user_id.is_empty() {
            return Err(crate::error::ValidationError::MissingField("user_id").into());
        }
        if item.key.is_empty() {
            return Err(crate::error::ValidationError::MissingField("key").into());
        }

        let targets = self.resolve_targets(&item, &targeting);
        let op_id = uuid::Uuid::new_v4().to_string();
        let logical_key = item.logical_key();
        let now_wall = Utc::now();

        let record = OperationRecord {
            id: op_id.clone(),
            kind,
            item: item.clone(),
            priority,
            status: OperationStatus::Queued,
            attempts: 0,
            targets: targets
                .iter()
                .map(|t| (t.device_id.clone(), TargetState::Pending))
                .collect(),
            created_at: now_wall,
            finished_at: None,
        };

        let mut state = self.state.lock();
        state.push_record(record, self.config.history_limit.max(1));

        if targets.is_empty() {
            state.counters.zero_target += 1;
            state.counters.processed += 1;
            state.finish(&op_id, OperationStatus::Completed, 0);
            tracing::debug!(operation_id = %op_id, key = %logical_key, "No eligible targets; operation complete");
            return Ok(op_id);
        }

        // A newer value replaces untouched pending values for the key, but
        // only where it reaches every device the older one would have.
        let new_targets: HashSet<&str> = targets.iter().map(|t| t.device_id.as_str()).collect();
        let superseded: Vec<String> = state
            .pending
            .values()
            .filter(|op| {
                op.attempts == 0
                    && op.item.logical_key() == logical_key
                    && op.item.timestamp <= item.timestamp
                    && op
                        .targets
                        .iter()
                        .all(|t| new_targets.contains(t.device_id.as_str()))
            })
            .map(|op| op.id.clone())
            .collect();
        for old_id in &superseded {
            if let Some(old) = state.pending.remove(old_id) {
                state.bands[old.priority.band()].retain(|id| id != old_id);
                state.finish(old_id, OperationStatus::Superseded, 0);
                state.counters.superseded += 1;
                tracing::debug!(operation_id = %old_id, by = %op_id, "Operation superseded");
            }
        }

        state.next_seq += 1;
        let operation = SyncOperation {
            id: op_id.clone(),
            kind,
            item,
            priority,
            targets,
            attempts: 0,
            created_at: now_wall,
            seq: state.next_seq,
            enqueued: Instant::now(),
            not_before: None,
        };
        state.bands[priority.band()].push_back(op_id.clone());
        state.pending.insert(op_id.clone(), operation);
        state.counters.enqueued += 1;
        let depth = state.pending.len();
        drop(state);

        if let Some(metrics) = &self.metrics {
            metrics.operations_enqueued.inc();
            metrics.operations_superseded.inc_by(superseded.len() as u64);
            metrics.queue_depth.set(depth as i64);
        }
        tracing::debug!(operation_id = %op_id, priority = priority.as_str(), "Operation enqueued");
        Ok(op_id)
    }

    /// Filter candidates by capability, preference and payload size.
    pub fn resolve_targets(&self, item: &SyncItem, targeting: &Targeting) -> Vec<OperationTarget> {
        let candidates: Vec<Device> = match targeting {
            Targeting::Auto => self
                .registry
                .devices_for_user(&item.user_id)
                .into_iter()
                .filter(|d| d.id() != item.origin_device_id)
                .collect(),
            Targeting::AutoIncludingOrigin => self.registry.devices_for_user(&item.user_id),
            Targeting::Explicit(ids) => {
                let mut seen = HashSet::new();
                ids.iter()
                    .filter(|id| seen.insert(id.as_str()))
                    .filter_map(|id| match self.registry.get(id) {
                        Some(device) if device.user_id() == item.user_id => Some(device),
                        Some(_) => {
                            tracing::warn!(device_id = %id, "Explicit target belongs to another user; skipped");
                            None
                        }
                        None => {
                            tracing::warn!(device_id = %id, "Explicit target is not registered; skipped");
                            None
                        }
                    })
                    .collect()
            }
        };

        candidates
            .iter()
            .filter_map(|device| self.filter_for(item, device))
            .collect()
    }

    fn filter_for(&self, item: &SyncItem, device: &Device) -> Option<OperationTarget> {
        if let Some(cap) = item.required_capability() {
            if !device.has_capability(cap) {
                tracing::debug!(device_id = %device.id(), item_type = %item.item_type, "Target lacks capability");
                return None;
            }
        }
        if !device.wants(item.item_type) {
            tracing::debug!(device_id = %device.id(), item_type = %item.item_type, "Target opted out");
            return None;
        }

        let Some(limit) = self.filters.limit_for(device.class()) else {
            return Some(OperationTarget::full(device.id()));
        };
        if item.payload_size() <= limit {
            return Some(OperationTarget::full(device.id()));
        }

        match item.summarize(
            self.filters.summary_text_chars,
            self.filters.summary_field_bytes,
        ) {
            Some(summary) if summary.payload_size() <= limit => Some(OperationTarget {
                device_id: device.id().to_owned(),
                summary: Some(summary),
            }),
            Some(_) => {
                tracing::warn!(device_id = %device.id(), limit, "Summary still exceeds payload limit; target skipped");
                None
            }
            None => {
                tracing::debug!(device_id = %device.id(), item_type = %item.item_type, "Payload too large and not summarizable");
                None
            }
        }
    }

    /// Highest-priority eligible operation, oldest first within its band.
    pub fn drain_next(&self) -> Option<SyncOperation> {
        self.drain_next_at(Instant::now())
    }

    pub fn drain_next_at(&self, now: Instant) -> Option<SyncOperation> {
        let mut state = self.state.lock();
        let blocked: HashSet<String> = state.in_flight.values().cloned().collect();
        // Only the oldest pending operation of a key may go out.
        let mut head_of_key: HashMap<String, u64> = HashMap::new();
        for op in state.pending.values() {
            head_of_key
                .entry(op.logical_key())
                .and_modify(|seq| *seq = (*seq).min(op.seq))
                .or_insert(op.seq);
        }

        let mut chosen = None;
        'bands: for (band, ids) in state.bands.iter().enumerate() {
            for (pos, op_id) in ids.iter().enumerate() {
                let Some(op) = state.pending.get(op_id) else {
                    continue;
                };
                let key = op.logical_key();
                if blocked.contains(&key)
                    || head_of_key.get(&key) != Some(&op.seq)
                    || op.not_before.is_some_and(|t| t > now)
                {
                    continue;
                }
                chosen = Some((band, pos, key));
                break 'bands;
            }
        }

        let (band, pos, key) = chosen?;
        let op_id = state.bands[band].remove(pos)?;
        let op = state.pending.remove(&op_id)?;
        state.in_flight.insert(op_id.clone(), key);
        if let Some(record) = state.record_mut(&op_id) {
            record.status = OperationStatus::InFlight;
        }
        Some(op)
    }

    /// Record the outcome for one target of an operation.
    pub fn record_target_state(&self, op_id: &str, device_id: &str, target_state: TargetState) {
        let mut state = self.state.lock();
        let reached = matches!(
            target_state,
            TargetState::Delivered | TargetState::Deferred | TargetState::Conflict
        );
        let key = state.record_mut(op_id).map(|record| {
            record
                .targets
                .insert(device_id.to_owned(), target_state);
            record.item.logical_key()
        });
        if let (true, Some(key)) = (reached, key) {
            if let Some(keys) = state.out_of_sync.get_mut(device_id) {
                keys.remove(&key);
                if keys.is_empty() {
                    state.out_of_sync.remove(device_id);
                }
            }
        }
    }

    /// Every target was reached.
    pub fn complete(&self, op: SyncOperation) {
        let mut state = self.state.lock();
        state.in_flight.remove(&op.id);
        state.finish(&op.id, OperationStatus::Completed, op.attempts);
        state.counters.processed += 1;
        state.observe_latency(op.enqueued);
        let depth = state.pending.len();
        drop(state);

        if let Some(metrics) = &self.metrics {
            metrics.operations_processed.inc();
            metrics
                .delivery_latency
                .observe(op.enqueued.elapsed().as_secs_f64());
            metrics.queue_depth.set(depth as i64);
        }
    }

    /// Hand back an operation whose remaining targets failed. It goes to the
    /// tail of its band after `base * 2^(attempts-1)`, or is failed once it
    /// has used up its attempts.
    pub fn requeue_with_backoff(&self, op: SyncOperation) -> Requeue {
        self.requeue_at(op, Instant::now())
    }

    pub fn requeue_at(&self, mut op: SyncOperation, now: Instant) -> Requeue {
        op.attempts += 1;
        if op.attempts > self.config.max_attempts {
            self.mark_failed(op);
            return Requeue::Exhausted;
        }

        let backoff = self.backoff_for(op.attempts);
        op.not_before = Some(now + backoff);
        let attempt = op.attempts;

        let mut state = self.state.lock();
        state.in_flight.remove(&op.id);
        if let Some(record) = state.record_mut(&op.id) {
            record.status = OperationStatus::Queued;
            record.attempts = attempt;
        }
        state.counters.retries += 1;
        state.bands[op.priority.band()].push_back(op.id.clone());
        tracing::debug!(operation_id = %op.id, attempt, backoff_ms = backoff.as_millis() as u64, "Operation requeued");
        state.pending.insert(op.id.clone(), op);
        drop(state);

        if let Some(metrics) = &self.metrics {
            metrics.delivery_retries.inc();
        }
        Requeue::Scheduled { attempt, backoff }
    }

    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let shift = attempts.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        Duration::from_millis(self.config.retry_backoff_ms.saturating_mul(1u64 << shift))
    }

    /// Fail an operation permanently and flag its unreached targets.
    pub fn mark_failed(&self, op: SyncOperation) {
        let key = op.logical_key();
        let mut state = self.state.lock();
        state.in_flight.remove(&op.id);
        state.finish(&op.id, OperationStatus::Failed, op.attempts);
        state.counters.failed += 1;
        for target in &op.targets {
            state
                .out_of_sync
                .entry(target.device_id.clone())
                .or_default()
                .insert(key.clone(), op.id.clone());
        }
        drop(state);

        let err = HubError::RetryExhausted {
            operation_id: op.id.clone(),
            attempts: op.attempts,
        };
        tracing::warn!(
            key = %key,
            targets = op.targets.len(),
            "{err}"
        );
        if let Some(metrics) = &self.metrics {
            metrics.operations_failed.inc();
        }
    }

    /// Clear every backoff so a final flush can attempt everything once.
    pub fn expedite_all(&self) {
        let mut state = self.state.lock();
        for op in state.pending.values_mut() {
            op.not_before = None;
        }
    }

    pub fn operation(&self, op_id: &str) -> Option<OperationRecord> {
        self.state.lock().history.get(op_id).cloned()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty() && state.in_flight.is_empty()
    }

    pub fn device_sync_state(&self, device_id: &str) -> DeviceSyncState {
        let state = self.state.lock();
        let pending_operations = state
            .pending
            .values()
            .filter(|op| op.targets.iter().any(|t| t.device_id == device_id))
            .count();
        let out_of_sync_keys: Vec<String> = state
            .out_of_sync
            .get(device_id)
            .map(|keys| keys.keys().cloned().collect())
            .unwrap_or_default();
        DeviceSyncState {
            in_sync: pending_operations == 0 && out_of_sync_keys.is_empty(),
            pending_operations,
            out_of_sync_keys,
        }
    }

    pub fn statistics(&self) -> QueueStats {
        let state = self.state.lock();
        let c = &state.counters;
        QueueStats {
            queued: state.pending.len(),
            in_flight: state.in_flight.len(),
            enqueued: c.enqueued,
            processed: c.processed,
            failed: c.failed,
            superseded: c.superseded,
            zero_target: c.zero_target,
            retries: c.retries,
            avg_latency_ms: if c.latency_samples == 0 {
                0.0
            } else {
                c.latency_total_ms as f64 / c.latency_samples as f64
            },
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────
