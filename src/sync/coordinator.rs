//! Sync coordinator: drains the queue and fans operations out to targets.
//!
//! Each target of an operation is attempted independently under the
//! per-delivery timeout. Targets that were reached (delivered, parked in
//! the offline queue, or answered with a conflict) are done; the rest are
//! retried together with backoff until the operation exhausts its
//! attempts.

use crate::config::QueueConfig;
use crate::sync::conflict::ConflictResolver;
use crate::sync::item::SyncItem;
use crate::sync::queue::{Requeue, SyncOperation, SyncQueue, TargetState};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What one delivery attempt to one device produced.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The device is registered but unreachable; the payload was parked.
    Deferred,
    /// The device holds a different value for the key.
    Conflict { current: SyncItem },
    Failed(String),
}

impl DeliveryOutcome {
    fn target_state(&self) -> TargetState {
        match self {
            Self::Delivered => TargetState::Delivered,
            Self::Deferred => TargetState::Deferred,
            Self::Conflict { .. } => TargetState::Conflict,
            Self::Failed(reason) => TargetState::Failed(reason.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryResult {
    pub device_id: String,
    pub outcome: DeliveryOutcome,
}

/// Transport seam between the coordinator and connected devices.
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(
        &self,
        device_id: &str,
        operation: &SyncOperation,
        payload: &SyncItem,
    ) -> DeliveryOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    Completed,
    Retrying { attempt: u32 },
    Failed,
}

/// Summary of one drained operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundReport {
    pub operation_id: String,
    pub delivered: usize,
    pub deferred: usize,
    pub conflicts: usize,
    pub failed: usize,
    pub outcome: RoundOutcome,
}

pub struct SyncCoordinator {
    queue: Arc<SyncQueue>,
    resolver: Arc<ConflictResolver>,
    deliverer: Arc<dyn Deliverer>,
    delivery_timeout: Duration,
    idle_sleep: Duration,
}

impl SyncCoordinator {
    pub fn new(
        queue: Arc<SyncQueue>,
        resolver: Arc<ConflictResolver>,
        deliverer: Arc<dyn Deliverer>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            queue,
            resolver,
            deliverer,
            delivery_timeout: config.delivery_timeout(),
            idle_sleep: config.idle_sleep(),
        }
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    /// Take one eligible operation and attempt all of its targets.
    pub async fn process_next(&self) -> Option<RoundReport> {
        let mut op = self.queue.drain_next()?;

        let mut results = Vec::with_capacity(op.targets.len());
        for target in &op.targets {
            let payload = target.payload(&op.item);
            let outcome = match tokio::time::timeout(
                self.delivery_timeout,
                self.deliverer.deliver(&target.device_id, &op, payload),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => DeliveryOutcome::Failed("delivery timed out".into()),
            };
            if let DeliveryOutcome::Failed(reason) = &outcome {
                tracing::debug!(
                    operation_id = %op.id,
                    device_id = %target.device_id,
                    "Delivery failed: {reason}"
                );
            }
            self.queue
                .record_target_state(&op.id, &target.device_id, outcome.target_state());
            results.push(DeliveryResult {
                device_id: target.device_id.clone(),
                outcome,
            });
        }

        if self.resolver.detect(&op, &results).is_some() {
            tracing::debug!(operation_id = %op.id, "Conflict handed to resolver");
        }

        let count = |pred: fn(&DeliveryOutcome) -> bool| {
            results.iter().filter(|r| pred(&r.outcome)).count()
        };
        let delivered = count(|o| matches!(o, DeliveryOutcome::Delivered));
        let deferred = count(|o| matches!(o, DeliveryOutcome::Deferred));
        let conflicts = count(|o| matches!(o, DeliveryOutcome::Conflict { .. }));
        let failed_ids: Vec<&str> = results
            .iter()
            .filter(|r| matches!(r.outcome, DeliveryOutcome::Failed(_)))
            .map(|r| r.device_id.as_str())
            .collect();
        let failed = failed_ids.len();
        let operation_id = op.id.clone();

        let outcome = if failed_ids.is_empty() {
            self.queue.complete(op);
            RoundOutcome::Completed
        } else {
            op.targets.retain(|t| failed_ids.contains(&t.device_id.as_str()));
            match self.queue.requeue_with_backoff(op) {
                Requeue::Scheduled { attempt, .. } => RoundOutcome::Retrying { attempt },
                Requeue::Exhausted => RoundOutcome::Failed,
            }
        };

        Some(RoundReport {
            operation_id,
            delivered,
            deferred,
            conflicts,
            failed,
            outcome,
        })
    }

    /// Process until nothing is eligible right now.
    pub async fn drain_ready(&self) -> usize {
        let mut rounds = 0;
        while self.process_next().await.is_some() {
            rounds += 1;
        }
        rounds
    }

    /// One final pass at shutdown: backoffs are waived so every queued
    /// operation gets attempted, then whatever remains is left as is.
    pub async fn flush(&self) -> usize {
        self.queue.expedite_all();
        let mut rounds = 0;
        let budget = self.queue.pending_len();
        while rounds < budget {
            if self.process_next().await.is_none() {
                break;
            }
            rounds += 1;
        }
        rounds
    }

    /// Drain loop. Sleeps for `idle_sleep` whenever nothing is eligible.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!("Sync coordinator started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            if self.process_next().await.is_some() {
                continue;
            }
            tokio::select! {
                () = tokio::time::sleep(self.idle_sleep) => {}
                () = cancel.cancelled() => break,
            }
        }
        tracing::info!("Sync coordinator stopped");
    }
}

/// Periodically resolve pending conflicts; escalations go to `on_escalated`.
pub fn spawn_conflict_loop<F>(
    resolver: Arc<ConflictResolver>,
    queue: Arc<SyncQueue>,
    poll: Duration,
    cancel: CancellationToken,
    on_escalated: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(crate::sync::conflict::ConflictRecord) + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for record in resolver.process_pending(&queue) {
                        on_escalated(record);
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    })
}

// ── Tests ───────────────────────────────────────────────────────
