//! The committed state of one tracked workflow.
//!
//! A `WorkflowState` is owned by exactly one reconciler. Everyone else only
//! sees cloned snapshots, delivered through a watch channel or a
//! `StateChange` broadcast.

use crate::domain::types::{
    CanonicalStatus, Connectivity, StageRecord, TimestampUtc, UpdateSource, WorkflowId,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: WorkflowId,
    pub canonical_status: CanonicalStatus,
    pub stages: Vec<StageRecord>,
    pub progress_percent: u8,
    pub connectivity: Connectivity,
    /// Polling has failed repeatedly; updates may be delayed.
    pub degraded: bool,
    /// Incremented on every committed update.
    pub sequence: u64,
    pub terminal: bool,
    pub last_error: Option<String>,
    pub last_updated_at: Option<TimestampUtc>,
    pub created_at: TimestampUtc,
}

impl WorkflowState {
    /// The state a workflow has before anything has been heard about it.
    pub fn pending(id: WorkflowId, now: TimestampUtc) -> Self {
        Self {
            id,
            canonical_status: CanonicalStatus::Pending,
            stages: StageRecord::initial_stages(),
            progress_percent: 0,
            connectivity: Connectivity::Disconnected,
            degraded: false,
            sequence: 0,
            terminal: false,
            last_error: None,
            last_updated_at: None,
            created_at: now,
        }
    }

    /// True if `other` differs in anything a consumer can observe,
    /// ignoring bookkeeping (`sequence`, `last_updated_at`).
    pub fn differs_from(&self, other: &WorkflowState) -> bool {
        self.canonical_status != other.canonical_status
            || self.stages != other.stages
            || self.progress_percent != other.progress_percent
            || self.connectivity != other.connectivity
            || self.degraded != other.degraded
            || self.last_error != other.last_error
    }
}

/// What caused a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCause {
    Update(UpdateSource),
    Connectivity,
    Degraded,
}

/// A committed transition, published to the dispatcher and consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub workflow_id: WorkflowId,
    pub cause: ChangeCause,
    pub previous: WorkflowState,
    pub current: WorkflowState,
}
