//! Persistent offline action queue.
//!
//! Mutating operations that fail during an outage (or short-circuit against
//! a queue-fallback breaker) are persisted here and replayed when
//! connectivity or the circuit recovers. The queue is the single writer of
//! its own state; UI reads go through immutable snapshots. Replay order is
//! priority-first, FIFO within a priority tier. Actions past their maximum
//! age expire without replay; replay failures are re-enqueued up to a
//! bounded attempt count and then surfaced for manual resolution.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::AegisResult;
use crate::store::{KvStore, ResilientStore};

/// Replay priority. Variant order is replay order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ActionPriority {
    Critical,
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Syncing,
    Failed,
    Expired,
}

/// A deferred mutating action, durable across reloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedAction {
    pub id: Uuid,
    /// Action kind; selects the registered replay handler.
    pub kind: String,
    /// Breaker name the replay is guarded against.
    pub dependency: String,
    pub payload: Value,
    pub priority: ActionPriority,
    pub created_at: DateTime<Utc>,
    /// Earliest time the next replay attempt may run; a sync pass skips
    /// actions that are not due yet.
    pub retry_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    pub status: ActionStatus,
    pub attempts: u32,
}

impl QueuedAction {
    /// An action past its maximum age is meaningless to replay.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.max_age) {
            Ok(age) => now.signed_duration_since(self.created_at) > age,
            Err(_) => false,
        }
    }
}

/// What the caller supplies when deferring an action.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub kind: String,
    pub payload: Value,
    pub priority: ActionPriority,
}

impl ActionRequest {
    pub fn new(kind: impl Into<String>, payload: Value, priority: ActionPriority) -> Self {
        Self {
            kind: kind.into(),
            payload,
            priority,
        }
    }
}

/// Optimistic receipt returned to the caller without blocking.
#[derive(Debug, Clone, Serialize)]
pub struct EnqueueReceipt {
    pub id: Uuid,
    pub retry_at: DateTime<Utc>,
}

/// Outcome summary of one `sync` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub replayed: usize,
    pub requeued: usize,
    pub expired: usize,
    pub failed: usize,
}

/// Durable queue of deferred mutations. Persists a JSON snapshot through a
/// [`ResilientStore`] after every mutation; storage trouble degrades to
/// in-memory operation without surfacing errors here.
pub struct OfflineActionQueue {
    config: QueueConfig,
    store: ResilientStore,
    actions: Mutex<Vec<QueuedAction>>,
}

impl OfflineActionQueue {
    pub fn new(store: ResilientStore, config: QueueConfig) -> Self {
        let actions = Self::load(&store, &config.storage_key);
        if !actions.is_empty() {
            info!(count = actions.len(), "loaded persisted offline actions");
        }
        Self {
            config,
            store,
            actions: Mutex::new(actions),
        }
    }

    fn load(store: &ResilientStore, key: &str) -> Vec<QueuedAction> {
        let raw = match store.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(error = %e, "could not read persisted queue, starting empty");
                return Vec::new();
            }
        };
        match serde_json::from_str::<Vec<QueuedAction>>(&raw) {
            Ok(mut actions) => {
                // A reload interrupted a sync pass; those entries are due again.
                for action in &mut actions {
                    if action.status == ActionStatus::Syncing {
                        action.status = ActionStatus::Pending;
                    }
                }
                actions
            }
            Err(e) => {
                warn!(error = %e, "persisted queue snapshot unreadable, starting empty");
                Vec::new()
            }
        }
    }

    fn persist(&self, actions: &[QueuedAction]) {
        match serde_json::to_string(actions) {
            Ok(raw) => {
                if let Err(e) = self.store.set(&self.config.storage_key, &raw) {
                    warn!(error = %e, "failed to persist queue snapshot");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize queue snapshot"),
        }
    }

    /// Persist a deferred action and return an optimistic receipt. The
    /// action is eligible for the next sync pass immediately; the replay
    /// delay only spaces out attempts after a replay failure.
    pub fn enqueue(&self, dependency: &str, request: ActionRequest) -> EnqueueReceipt {
        let now = Utc::now();
        let retry_at = now;
        let action = QueuedAction {
            id: Uuid::new_v4(),
            kind: request.kind,
            dependency: dependency.to_string(),
            payload: request.payload,
            priority: request.priority,
            created_at: now,
            retry_at,
            max_age: self.config.max_age,
            status: ActionStatus::Pending,
            attempts: 0,
        };
        let receipt = EnqueueReceipt {
            id: action.id,
            retry_at,
        };

        let mut actions = self.actions.lock();
        debug!(
            id = %action.id,
            kind = %action.kind,
            dependency = %action.dependency,
            priority = ?action.priority,
            "queued action for later replay"
        );
        actions.push(action);
        self.persist(&actions);
        receipt
    }

    /// Number of actions awaiting replay.
    pub fn pending_count(&self) -> usize {
        self.actions
            .lock()
            .iter()
            .filter(|a| a.status == ActionStatus::Pending)
            .count()
    }

    /// Immutable snapshot of actions awaiting replay, in replay order.
    pub fn pending_snapshot(&self) -> Vec<QueuedAction> {
        let mut pending: Vec<QueuedAction> = self
            .actions
            .lock()
            .iter()
            .filter(|a| a.status == ActionStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(replay_order);
        pending
    }

    /// Actions that exhausted their replay budget and need manual resolution.
    pub fn failed_snapshot(&self) -> Vec<QueuedAction> {
        self.actions
            .lock()
            .iter()
            .filter(|a| a.status == ActionStatus::Failed)
            .cloned()
            .collect()
    }

    /// Actions that aged out before they could be replayed. Kept for
    /// inspection until discarded.
    pub fn expired_snapshot(&self) -> Vec<QueuedAction> {
        self.actions
            .lock()
            .iter()
            .filter(|a| a.status == ActionStatus::Expired)
            .cloned()
            .collect()
    }

    /// Put failed actions back in play with a fresh attempt budget
    /// (explicit user "retry all").
    pub fn retry_failed(&self) -> usize {
        let mut actions = self.actions.lock();
        let mut revived = 0;
        for action in actions.iter_mut() {
            if action.status == ActionStatus::Failed {
                action.status = ActionStatus::Pending;
                action.attempts = 0;
                // Explicit user action: due immediately.
                action.retry_at = Utc::now();
                revived += 1;
            }
        }
        if revived > 0 {
            self.persist(&actions);
        }
        revived
    }

    /// Discard one action (manual resolution).
    pub fn discard(&self, id: Uuid) -> bool {
        let mut actions = self.actions.lock();
        let before = actions.len();
        actions.retain(|a| a.id != id);
        let removed = actions.len() != before;
        if removed {
            self.persist(&actions);
        }
        removed
    }

    /// Replay pending actions through `replay`, priority-first and FIFO
    /// within a tier. Expired actions are dropped without replay. The
    /// replayer is expected to route through the same guarded execution
    /// path as live calls.
    pub async fn sync<F, Fut>(&self, mut replay: F) -> SyncReport
    where
        F: FnMut(QueuedAction) -> Fut,
        Fut: Future<Output = AegisResult<()>>,
    {
        let mut report = SyncReport::default();
        let now = Utc::now();

        // Take a sorted batch under the lock, marking entries as syncing;
        // the lock is never held across a replay await.
        let batch: Vec<QueuedAction> = {
            let mut actions = self.actions.lock();
            for action in actions.iter_mut() {
                if action.status == ActionStatus::Pending && action.is_expired(now) {
                    warn!(id = %action.id, kind = %action.kind, "action expired without replay");
                    action.status = ActionStatus::Expired;
                    report.expired += 1;
                }
            }

            // Actions requeued after a replay failure are not due until
            // their retry_at passes; a back-to-back sync trigger skips them.
            let mut batch: Vec<QueuedAction> = actions
                .iter()
                .filter(|a| a.status == ActionStatus::Pending && a.retry_at <= now)
                .cloned()
                .collect();
            batch.sort_by(replay_order);

            for action in actions.iter_mut() {
                if action.status == ActionStatus::Pending && action.retry_at <= now {
                    action.status = ActionStatus::Syncing;
                }
            }
            self.persist(&actions);
            batch
        };

        for action in batch {
            let id = action.id;
            let kind = action.kind.clone();
            match replay(action).await {
                Ok(()) => {
                    debug!(id = %id, kind = %kind, "replayed queued action");
                    report.replayed += 1;
                    let mut actions = self.actions.lock();
                    actions.retain(|a| a.id != id);
                    self.persist(&actions);
                }
                Err(error) => {
                    let mut actions = self.actions.lock();
                    if let Some(entry) = actions.iter_mut().find(|a| a.id == id) {
                        entry.attempts += 1;
                        if entry.attempts >= self.config.max_replay_attempts {
                            warn!(
                                id = %id,
                                kind = %kind,
                                attempts = entry.attempts,
                                error = %error,
                                "action exhausted replay attempts, needs manual resolution"
                            );
                            entry.status = ActionStatus::Failed;
                            report.failed += 1;
                        } else {
                            debug!(
                                id = %id,
                                kind = %kind,
                                attempts = entry.attempts,
                                error = %error,
                                "replay failed, re-enqueueing"
                            );
                            entry.status = ActionStatus::Pending;
                            entry.retry_at = Utc::now()
                                + chrono::Duration::from_std(self.config.replay_delay)
                                    .unwrap_or_else(|_| chrono::Duration::zero());
                            report.requeued += 1;
                        }
                    }
                    self.persist(&actions);
                }
            }
        }

        report
    }
}

fn replay_order(a: &QueuedAction, b: &QueuedAction) -> std::cmp::Ordering {
    a.priority
        .cmp(&b.priority)
        .then(a.created_at.cmp(&b.created_at))
}
