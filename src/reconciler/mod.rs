//! Merging of push and poll reports into one authoritative state.
//!
//! # Architecture
//!
//! - **Reconciler** (this file): synchronous merge rules over a single
//!   `WorkflowState`. No I/O. Commits are stamped with the receipt time they
//!   are handed; an update that carries none is stamped with the current time.
//! - **ReconcilerActor** (`actor.rs`): owns one `Reconciler` and serializes
//!   every push, poll and connectivity event for a workflow through its
//!   mailbox, then publishes committed changes.
//! - **WorkflowSupervisor** (`supervisor.rs`): restarts a reconciler actor that
//!   panicked, seeded with its last published state.
//!
//! # Rules
//!
//! 1. Once terminal, every update is discarded.
//! 2. A candidate whose stage ordinal is at least the committed one is
//!    accepted. A lower one is accepted only from push, and only when it
//!    carries a marker strictly newer than the last applied push marker.
//! 3. A candidate identical to the committed state is not a commit.
//! 4. Each commit bumps `sequence` and `last_updated_at`.

pub mod actor;
pub mod supervisor;

use crate::connection::PushConnectivity;
use crate::domain::{
    Anomaly, CanonicalStatus, ChangeCause, Connectivity, StageId, StateChange, TimestampUtc,
    UpdateSource, WorkflowId, WorkflowState,
};
use crate::payload::{self, PushEvent, PushMarker, RawUpdate};
use crate::stage_mapper::{self, MapRequest, StageMapper};
use serde_json::Value;

/// Result of feeding one event to the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Committed(Box<StateChange>),
    /// Accepted, but nothing observable changed.
    Unchanged,
    /// Refused as a protocol anomaly.
    Rejected(Anomaly),
    /// The workflow is terminal.
    Discarded,
}

impl ApplyOutcome {
    pub fn change(&self) -> Option<&StateChange> {
        match self {
            ApplyOutcome::Committed(change) => Some(change),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    state: WorkflowState,
    mapper: StageMapper,
    last_push_marker: Option<PushMarker>,
    push: PushConnectivity,
    polling_active: bool,
}

impl Reconciler {
    pub fn new(workflow_id: WorkflowId, mapper: StageMapper, now: TimestampUtc) -> Self {
        Self::from_state(WorkflowState::pending(workflow_id, now), mapper)
    }

    /// Resumes from a previously committed state. Push marker history is not
    /// part of the state, so the next push is compared by stage only.
    pub fn from_state(state: WorkflowState, mapper: StageMapper) -> Self {
        let push = match state.connectivity {
            Connectivity::Connected => PushConnectivity::Connected,
            Connectivity::Reconnecting => PushConnectivity::Reconnecting,
            Connectivity::Disconnected | Connectivity::PollingOnly => {
                PushConnectivity::Disconnected
            }
        };
        // Polling runs for as long as a workflow is tracked, so any state
        // other than the initial one was reached with polling active.
        let polling_active = state.connectivity != Connectivity::Disconnected;
        Self {
            state,
            mapper,
            last_push_marker: None,
            push,
            polling_active,
        }
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.state.id
    }

    /// Decodes and applies one push message.
    pub fn apply_push_message(&mut self, text: &str, received_at: TimestampUtc) -> ApplyOutcome {
        if self.state.terminal {
            return ApplyOutcome::Discarded;
        }
        match payload::parse_push_message(text, received_at) {
            Ok(PushEvent::Update(update)) => self.apply(update, UpdateSource::Push),
            Ok(PushEvent::Keepalive) => ApplyOutcome::Unchanged,
            Err(anomaly) => ApplyOutcome::Rejected(anomaly),
        }
    }

    /// Decodes and applies one poll snapshot.
    pub fn apply_poll_snapshot(&mut self, body: &Value, received_at: TimestampUtc) -> ApplyOutcome {
        if self.state.terminal {
            return ApplyOutcome::Discarded;
        }
        match payload::parse_poll_snapshot(body, received_at) {
            Ok(update) => self.apply(update, UpdateSource::Poll),
            Err(anomaly) => ApplyOutcome::Rejected(anomaly),
        }
    }

    pub fn apply(&mut self, update: RawUpdate, source: UpdateSource) -> ApplyOutcome {
        if self.state.terminal {
            return ApplyOutcome::Discarded;
        }
        let now = update.received_at.unwrap_or_else(chrono::Utc::now);
        let current = self.state.canonical_status;

        let (target, _) = self.mapper.resolve(
            update.status.as_deref(),
            update.current_stage.as_deref(),
            current,
        );

        let newer_push = source == UpdateSource::Push
            && match (update.marker, self.last_push_marker) {
                (Some(marker), Some(last)) => marker.is_newer_than(&last),
                _ => false,
            };

        // Stages and progress floor the candidate is built from.
        let (base_stages, floor) = if target.ordinal() < current.ordinal() {
            if !newer_push {
                return ApplyOutcome::Rejected(Anomaly::Regression {
                    source,
                    from: current,
                    to: target,
                });
            }
            let reopen_at = target.stage().unwrap_or(StageId::Planning);
            (
                stage_mapper::reopen_from(&self.state.stages, reopen_at),
                0,
            )
        } else {
            if let (UpdateSource::Push, Some(marker), Some(last)) =
                (source, update.marker, self.last_push_marker)
            {
                if last.is_newer_than(&marker) {
                    return ApplyOutcome::Rejected(Anomaly::StalePush);
                }
            }
            (self.state.stages.clone(), self.state.progress_percent)
        };

        let mapping = self.mapper.map_status(MapRequest {
            raw_status: Some(target.as_str()),
            stage_hint: update.current_stage.as_deref(),
            current_status: current,
            current_stages: &base_stages,
            previous_progress: floor,
            reported_progress: update.progress,
            error: update.error.as_deref(),
            now,
        });

        if source == UpdateSource::Push {
            if let Some(marker) = update.marker {
                let advances = self
                    .last_push_marker
                    .is_none_or(|last| marker.is_newer_than(&last));
                if advances {
                    self.last_push_marker = Some(marker);
                }
            }
        }

        let last_error = match (mapping.status, update.error) {
            (_, Some(error)) => Some(error),
            (CanonicalStatus::Failed, None) => self
                .state
                .last_error
                .clone()
                .or_else(|| Some("workflow failed".to_string())),
            (status, None) if status == current => self.state.last_error.clone(),
            _ => None,
        };

        let mut candidate = self.state.clone();
        candidate.canonical_status = mapping.status;
        candidate.stages = mapping.stages;
        candidate.progress_percent = mapping.progress_percent;
        candidate.last_error = last_error;

        if !candidate.differs_from(&self.state) {
            return ApplyOutcome::Unchanged;
        }
        self.commit(candidate, ChangeCause::Update(source), now)
    }

    /// Records a push channel transition.
    pub fn set_push_connectivity(
        &mut self,
        push: PushConnectivity,
        now: TimestampUtc,
    ) -> ApplyOutcome {
        if self.state.terminal {
            return ApplyOutcome::Discarded;
        }
        self.push = push;
        self.refresh_connectivity(now)
    }

    /// Records whether a poll loop is running for this workflow.
    pub fn set_polling_active(&mut self, active: bool, now: TimestampUtc) -> ApplyOutcome {
        if self.state.terminal {
            return ApplyOutcome::Discarded;
        }
        self.polling_active = active;
        self.refresh_connectivity(now)
    }

    pub fn set_degraded(&mut self, degraded: bool, now: TimestampUtc) -> ApplyOutcome {
        if self.state.terminal {
            return ApplyOutcome::Discarded;
        }
        if self.state.degraded == degraded {
            return ApplyOutcome::Unchanged;
        }
        let mut candidate = self.state.clone();
        candidate.degraded = degraded;
        self.commit(candidate, ChangeCause::Degraded, now)
    }

    fn derived_connectivity(&self) -> Connectivity {
        match self.push {
            PushConnectivity::Connected => Connectivity::Connected,
            PushConnectivity::Reconnecting => Connectivity::Reconnecting,
            PushConnectivity::Disconnected if self.polling_active => Connectivity::PollingOnly,
            PushConnectivity::Disconnected => Connectivity::Disconnected,
        }
    }

    fn refresh_connectivity(&mut self, now: TimestampUtc) -> ApplyOutcome {
        let connectivity = self.derived_connectivity();
        if connectivity == self.state.connectivity {
            return ApplyOutcome::Unchanged;
        }
        let mut candidate = self.state.clone();
        candidate.connectivity = connectivity;
        self.commit(candidate, ChangeCause::Connectivity, now)
    }

    fn commit(
        &mut self,
        mut next: WorkflowState,
        cause: ChangeCause,
        now: TimestampUtc,
    ) -> ApplyOutcome {
        next.sequence = self.state.sequence + 1;
        next.last_updated_at = Some(now);
        next.terminal = next.canonical_status.is_terminal();

        let previous = std::mem::replace(&mut self.state, next);
        ApplyOutcome::Committed(Box::new(StateChange {
            workflow_id: self.state.id.clone(),
            cause,
            previous,
            current: self.state.clone(),
        }))
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
