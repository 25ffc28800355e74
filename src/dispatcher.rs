//! Exactly-once side effects for qualifying transitions.
//!
//! Every committed change is observed here. A notification fires only when a
//! `(workflow_id, key)` pair is seen for the first time, so a completion that
//! is reported by both push and poll (or replayed after a reconciler restart)
//! notifies once.

use crate::domain::{
    CanonicalStatus, Connectivity, StateChange, TimestampUtc, WorkflowId, WorkflowState,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Completed,
    Failed,
    Milestone(CanonicalStatus),
    ConnectivityLost,
    UpdatesDelayed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub workflow_id: WorkflowId,
    pub kind: NotificationKind,
    /// Ledger key, e.g. `status:completed` or `connectivity_lost#2`.
    pub key: String,
    pub status: CanonicalStatus,
    pub message: Option<String>,
    pub at: TimestampUtc,
}

/// Receiver of fired notifications.
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, notification: &Notification);
}

/// Logs notifications. Used when nothing else is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: &Notification) {
        tracing::info!(
            workflow_id = %notification.workflow_id,
            key = %notification.key,
            status = %notification.status,
            message = notification.message.as_deref().unwrap_or(""),
            "Workflow notification"
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Record of transitions that already produced a side effect.
#[derive(Debug, Default)]
pub struct TransitionLedger {
    seen: Mutex<HashSet<(WorkflowId, String)>>,
}

impl TransitionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time a pair is recorded.
    pub fn record(&self, workflow_id: &WorkflowId, key: &str) -> bool {
        lock(&self.seen).insert((workflow_id.clone(), key.to_string()))
    }

    pub fn contains(&self, workflow_id: &WorkflowId, key: &str) -> bool {
        lock(&self.seen).contains(&(workflow_id.clone(), key.to_string()))
    }

    pub fn forget(&self, workflow_id: &WorkflowId) {
        lock(&self.seen).retain(|(id, _)| id != workflow_id);
    }

    pub fn len(&self) -> usize {
        lock(&self.seen).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Episodes {
    connectivity_lost: u32,
    updates_delayed: u32,
}

pub struct Dispatcher {
    ledger: TransitionLedger,
    notifier: Arc<dyn Notifier>,
    milestones: Vec<CanonicalStatus>,
    episodes: Mutex<HashMap<WorkflowId, Episodes>>,
}

impl Dispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, milestones: Vec<CanonicalStatus>) -> Self {
        Self {
            ledger: TransitionLedger::new(),
            notifier,
            milestones,
            episodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn ledger(&self) -> &TransitionLedger {
        &self.ledger
    }

    pub fn observe_change(&self, change: &StateChange) -> Vec<Notification> {
        self.observe(&change.workflow_id, &change.previous, &change.current)
    }

    /// Fires whatever notifications the transition qualifies for and returns
    /// them.
    pub fn observe(
        &self,
        workflow_id: &WorkflowId,
        previous: &WorkflowState,
        current: &WorkflowState,
    ) -> Vec<Notification> {
        let mut candidates = Vec::new();
        let at = current.last_updated_at.unwrap_or_else(chrono::Utc::now);

        if current.canonical_status != previous.canonical_status {
            match current.canonical_status {
                CanonicalStatus::Completed => candidates.push((
                    NotificationKind::Completed,
                    "status:completed".to_string(),
                    None,
                )),
                CanonicalStatus::Failed => candidates.push((
                    NotificationKind::Failed,
                    "status:failed".to_string(),
                    current.last_error.clone(),
                )),
                _ => {}
            }
            if self.milestones.contains(&current.canonical_status) {
                candidates.push((
                    NotificationKind::Milestone(current.canonical_status),
                    format!("milestone:{}", current.canonical_status),
                    None,
                ));
            }
        }

        let lost = previous.connectivity == Connectivity::Connected
            && current.connectivity == Connectivity::Reconnecting;
        let delayed = !previous.degraded && current.degraded;
        if lost || delayed {
            let mut episodes = lock(&self.episodes);
            let counters = episodes.entry(workflow_id.clone()).or_default();
            if lost {
                counters.connectivity_lost += 1;
                candidates.push((
                    NotificationKind::ConnectivityLost,
                    format!("connectivity_lost#{}", counters.connectivity_lost),
                    Some("live updates interrupted, reconnecting".to_string()),
                ));
            }
            if delayed {
                counters.updates_delayed += 1;
                candidates.push((
                    NotificationKind::UpdatesDelayed,
                    format!("updates_delayed#{}", counters.updates_delayed),
                    Some("updates may be delayed".to_string()),
                ));
            }
        }

        let mut fired = Vec::new();
        for (kind, key, message) in candidates {
            if !self.ledger.record(workflow_id, &key) {
                tracing::debug!(workflow_id = %workflow_id, key = %key, "Transition already notified");
                continue;
            }
            let notification = Notification {
                workflow_id: workflow_id.clone(),
                kind,
                key,
                status: current.canonical_status,
                message,
                at,
            };
            self.notifier.notify(&notification);
            fired.push(notification);
        }
        fired
    }

    /// Drops ledger entries and episode counters for an untracked workflow.
    pub fn forget(&self, workflow_id: &WorkflowId) {
        self.ledger.forget(workflow_id);
        lock(&self.episodes).remove(workflow_id);
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
