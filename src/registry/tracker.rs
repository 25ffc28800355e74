//! Consumer-facing views over the registry.
//!
//! `WorkflowTracker` follows a single workflow; `MultiTracker` follows a set
//! of them. Both only hold subscription handles, so dropping them does not
//! untrack anything; call `release` for that.

use super::{Registry, SubscriptionHandle};
use crate::config::TrackOptions;
use crate::domain::{TrackerError, WorkflowId, WorkflowState};
use std::collections::HashMap;
use tokio::sync::watch;

pub struct WorkflowTracker {
    registry: Registry,
    handle: SubscriptionHandle,
    snapshot: watch::Receiver<WorkflowState>,
}

impl WorkflowTracker {
    pub async fn track(
        registry: &Registry,
        workflow_id: WorkflowId,
        options: TrackOptions,
    ) -> Result<Self, TrackerError> {
        let handle = registry.track_with(workflow_id.clone(), options).await?;
        let snapshot = registry
            .watch(&workflow_id)
            .ok_or(TrackerError::RegistryClosed)?;
        Ok(Self {
            registry: registry.clone(),
            handle,
            snapshot,
        })
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        self.handle.workflow_id()
    }

    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    /// Latest committed state. Still readable after the registry dropped the
    /// workflow.
    pub fn state(&self) -> WorkflowState {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<WorkflowState> {
        self.snapshot.clone()
    }

    /// Waits for a terminal state, or returns the last state seen if the
    /// workflow stops being reconciled first.
    pub async fn wait_until_terminal(&mut self) -> WorkflowState {
        if self.snapshot.wait_for(|state| state.terminal).await.is_err() {
            tracing::debug!(workflow_id = %self.workflow_id(), "Reconciler gone before terminal state");
        }
        self.snapshot.borrow().clone()
    }

    pub fn connect(&self) -> bool {
        self.registry.connect(self.workflow_id())
    }

    pub fn disconnect(&self) -> bool {
        self.registry.disconnect(self.workflow_id())
    }

    pub fn reconnect(&self) -> bool {
        self.registry.reconnect(self.workflow_id())
    }

    pub async fn release(self) -> bool {
        self.registry.untrack(&self.handle).await
    }
}

pub struct MultiTracker {
    registry: Registry,
    handles: Vec<SubscriptionHandle>,
}

impl MultiTracker {
    /// Tracks every id with the same options. Duplicates collapse into one
    /// subscription.
    pub async fn track_many<I>(
        registry: &Registry,
        workflow_ids: I,
        options: TrackOptions,
    ) -> Result<Self, TrackerError>
    where
        I: IntoIterator<Item = WorkflowId>,
    {
        let mut handles: Vec<SubscriptionHandle> = Vec::new();
        for workflow_id in workflow_ids {
            let handle = registry.track_with(workflow_id, options.clone()).await?;
            if !handles.contains(&handle) {
                handles.push(handle);
            }
        }
        Ok(Self {
            registry: registry.clone(),
            handles,
        })
    }

    pub fn workflow_ids(&self) -> Vec<WorkflowId> {
        self.handles
            .iter()
            .map(|h| h.workflow_id().clone())
            .collect()
    }

    /// States of this tracker's workflows that are still in the registry.
    pub fn states_by_id(&self) -> HashMap<WorkflowId, WorkflowState> {
        self.handles
            .iter()
            .filter_map(|h| {
                self.registry
                    .get(h.workflow_id())
                    .map(|state| (h.workflow_id().clone(), state))
            })
            .collect()
    }

    fn owns(&self, workflow_id: &WorkflowId) -> bool {
        self.handles.iter().any(|h| h.workflow_id() == workflow_id)
    }

    pub fn connect_to_one(&self, workflow_id: &WorkflowId) -> bool {
        self.owns(workflow_id) && self.registry.connect(workflow_id)
    }

    pub fn disconnect_one(&self, workflow_id: &WorkflowId) -> bool {
        self.owns(workflow_id) && self.registry.disconnect(workflow_id)
    }

    /// Closes every push channel. Polling continues.
    pub fn disconnect_all(&self) {
        for handle in &self.handles {
            self.registry.disconnect(handle.workflow_id());
        }
    }

    pub async fn release(self) {
        for handle in &self.handles {
            self.registry.untrack(handle).await;
        }
    }
}
