//! Reconciler actor.
//!
//! One actor per tracked workflow. Push messages, poll snapshots and
//! connectivity changes all arrive through the same mailbox, so they are
//! applied strictly one at a time. Committed changes are published to the
//! watch channel (latest state), the broadcast channel (every change), the
//! dispatcher and the optional transition callback, in that order.

use crate::connection::{PushConnectivity, PushMessage};
use crate::dispatcher::Dispatcher;
use crate::domain::{StateChange, TimestampUtc, WorkflowId, WorkflowState};
use crate::reconciler::{ApplyOutcome, Reconciler};
use crate::stage_mapper::StageMapper;
use async_trait::async_trait;
use ractor::concurrency::JoinHandle;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, oneshot, watch};

/// Invoked after every committed transition.
pub type TransitionCallback = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Messages that can be sent to a reconciler actor.
pub enum ReconcilerMsg {
    Push(PushMessage),
    Poll {
        body: Value,
        received_at: TimestampUtc,
    },
    PushConnectivity(PushConnectivity),
    PollingActive(bool),
    Degraded(bool),
    /// Get the committed state.
    GetState(oneshot::Sender<WorkflowState>),
}

/// Arguments for spawning (and re-spawning) a reconciler actor.
#[derive(Clone)]
pub struct ReconcilerArgs {
    pub workflow_id: WorkflowId,
    pub mapper: StageMapper,
    /// Holds the latest committed state; a restarted actor resumes from it.
    pub snapshot_tx: watch::Sender<WorkflowState>,
    pub change_tx: broadcast::Sender<StateChange>,
    pub dispatcher: Arc<Dispatcher>,
    pub on_transition: Option<TransitionCallback>,
    /// Where the supervisor installs the live actor.
    pub slot: ReconcilerSlot,
}

pub struct ReconcilerState {
    reconciler: Reconciler,
    snapshot_tx: watch::Sender<WorkflowState>,
    change_tx: broadcast::Sender<StateChange>,
    dispatcher: Arc<Dispatcher>,
    on_transition: Option<TransitionCallback>,
}

impl ReconcilerState {
    fn publish(&self, outcome: ApplyOutcome) {
        let workflow_id = self.reconciler.workflow_id();
        match outcome {
            ApplyOutcome::Committed(change) => {
                let change = *change;
                tracing::debug!(
                    workflow_id = %workflow_id,
                    sequence = change.current.sequence,
                    status = %change.current.canonical_status,
                    progress = change.current.progress_percent,
                    connectivity = %change.current.connectivity,
                    "Committed workflow state"
                );
                self.snapshot_tx.send_replace(change.current.clone());
                // No subscribers is fine.
                let _ = self.change_tx.send(change.clone());
                self.dispatcher.observe_change(&change);

                if let Some(callback) = &self.on_transition {
                    let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&change)));
                    if result.is_err() {
                        tracing::error!(workflow_id = %workflow_id, "Transition callback panicked");
                    }
                }
            }
            ApplyOutcome::Unchanged => {
                tracing::debug!(workflow_id = %workflow_id, "Update changed nothing");
            }
            ApplyOutcome::Rejected(anomaly) => {
                tracing::warn!(workflow_id = %workflow_id, anomaly = %anomaly, "Discarded update");
            }
            ApplyOutcome::Discarded => {
                tracing::debug!(workflow_id = %workflow_id, "Workflow is terminal, update discarded");
            }
        }
    }
}

/// The reconciler actor.
pub struct ReconcilerActor;

#[async_trait]
impl Actor for ReconcilerActor {
    type Msg = ReconcilerMsg;
    type State = ReconcilerState;
    type Arguments = ReconcilerArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let resumed = args.snapshot_tx.borrow().clone();
        if resumed.sequence > 0 {
            tracing::info!(
                workflow_id = %args.workflow_id,
                sequence = resumed.sequence,
                "Reconciler resuming from last committed state"
            );
        }

        Ok(ReconcilerState {
            reconciler: Reconciler::from_state(resumed, args.mapper),
            snapshot_tx: args.snapshot_tx,
            change_tx: args.change_tx,
            dispatcher: args.dispatcher,
            on_transition: args.on_transition,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let now = chrono::Utc::now();
        let outcome = match message {
            ReconcilerMsg::Push(message) => state
                .reconciler
                .apply_push_message(&message.text, message.received_at),
            ReconcilerMsg::Poll { body, received_at } => {
                state.reconciler.apply_poll_snapshot(&body, received_at)
            }
            ReconcilerMsg::PushConnectivity(push) => {
                state.reconciler.set_push_connectivity(push, now)
            }
            ReconcilerMsg::PollingActive(active) => state.reconciler.set_polling_active(active, now),
            ReconcilerMsg::Degraded(degraded) => state.reconciler.set_degraded(degraded, now),
            ReconcilerMsg::GetState(reply) => {
                if reply.send(state.reconciler.state().clone()).is_err() {
                    tracing::debug!("State reply channel closed");
                }
                return Ok(());
            }
        };

        state.publish(outcome);
        Ok(())
    }
}

struct SlotInner {
    actor: Option<ActorRef<ReconcilerMsg>>,
    join: Option<JoinHandle<()>>,
    retired: bool,
}

/// Shared pointer to whichever actor currently reconciles a workflow.
///
/// Channel callbacks send through the slot, so they keep working across
/// supervisor restarts. Once retired, the slot refuses every message and
/// stops any actor installed later.
#[derive(Clone)]
pub struct ReconcilerSlot {
    inner: Arc<Mutex<SlotInner>>,
}

impl Default for ReconcilerSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconcilerSlot {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SlotInner {
                actor: None,
                join: None,
                retired: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns false when the message was not delivered.
    pub fn send(&self, message: ReconcilerMsg) -> bool {
        let inner = self.lock();
        if inner.retired {
            return false;
        }
        match &inner.actor {
            Some(actor) => actor.send_message(message).is_ok(),
            None => false,
        }
    }

    pub fn install(&self, actor: ActorRef<ReconcilerMsg>, join: JoinHandle<()>) {
        let mut inner = self.lock();
        if inner.retired {
            actor.stop(None);
            return;
        }
        inner.actor = Some(actor);
        inner.join = Some(join);
    }

    /// Forgets the current actor without stopping it (it already died).
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.actor = None;
        inner.join = None;
    }

    pub fn is_retired(&self) -> bool {
        self.lock().retired
    }

    pub fn is_live(&self) -> bool {
        let inner = self.lock();
        !inner.retired && inner.actor.is_some()
    }

    /// Asks the live actor for its state.
    pub async fn query(&self) -> Option<WorkflowState> {
        let (tx, rx) = oneshot::channel();
        if !self.send(ReconcilerMsg::GetState(tx)) {
            return None;
        }
        rx.await.ok()
    }

    /// Stops the actor and waits for it to exit. Idempotent.
    pub async fn retire(&self) {
        let (actor, join) = {
            let mut inner = self.lock();
            inner.retired = true;
            (inner.actor.take(), inner.join.take())
        };
        if let Some(actor) = actor {
            actor.stop(None);
        }
        if let Some(join) = join {
            if join.await.is_err() {
                tracing::debug!("Reconciler task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/actor_tests.rs"]
mod tests;
