//! Supervisor for reconciler actors.
//!
//! Spawns one linked reconciler per workflow and restarts it when it fails,
//! up to `max_restarts` times. A restarted reconciler resumes from the last
//! state it published. Normal stops (untrack) are not restarted.

use crate::domain::TrackerError;
use crate::reconciler::actor::{ReconcilerActor, ReconcilerArgs};
use async_trait::async_trait;
use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef, SupervisionEvent};
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Messages for the workflow supervisor.
pub enum SupervisorMsg {
    /// Spawn a reconciler and install it into `args.slot`.
    Spawn(
        Box<ReconcilerArgs>,
        oneshot::Sender<Result<(), TrackerError>>,
    ),
}

struct Child {
    args: ReconcilerArgs,
    restarts: u32,
}

pub struct SupervisorState {
    children: HashMap<ActorId, Child>,
    max_restarts: u32,
}

/// The workflow supervisor actor.
pub struct WorkflowSupervisor;

impl WorkflowSupervisor {
    async fn spawn_child(
        myself: &ActorRef<SupervisorMsg>,
        state: &mut SupervisorState,
        args: ReconcilerArgs,
        restarts: u32,
    ) -> Result<(), TrackerError> {
        let (actor, join) = ReconcilerActor::spawn_linked(
            None,
            ReconcilerActor,
            args.clone(),
            myself.get_cell(),
        )
        .await
        .map_err(|e| TrackerError::SpawnFailed {
            message: e.to_string(),
        })?;

        state.children.insert(actor.get_id(), Child {
            args: args.clone(),
            restarts,
        });
        args.slot.install(actor, join);
        Ok(())
    }
}

#[async_trait]
impl Actor for WorkflowSupervisor {
    type Msg = SupervisorMsg;
    type State = SupervisorState;
    type Arguments = u32;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        max_restarts: u32,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(SupervisorState {
            children: HashMap::new(),
            max_restarts,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        msg: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match msg {
            SupervisorMsg::Spawn(args, reply) => {
                let result = Self::spawn_child(&myself, state, *args, 0).await;
                if reply.send(result).is_err() {
                    tracing::debug!("Spawn reply channel closed");
                }
            }
        }
        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        evt: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match evt {
            SupervisionEvent::ActorFailed(cell, error) => {
                let Some(child) = state.children.remove(&cell.get_id()) else {
                    return Ok(());
                };
                let workflow_id = child.args.workflow_id.clone();
                if child.args.slot.is_retired() {
                    return Ok(());
                }
                child.args.slot.clear();

                if child.restarts >= state.max_restarts {
                    tracing::error!(
                        workflow_id = %workflow_id,
                        restarts = child.restarts,
                        error = %error,
                        "Reconciler failed too often, giving up"
                    );
                    return Ok(());
                }

                tracing::error!(
                    workflow_id = %workflow_id,
                    restart = child.restarts + 1,
                    error = %error,
                    "Reconciler failed, restarting"
                );
                if let Err(e) =
                    Self::spawn_child(&myself, state, child.args, child.restarts + 1).await
                {
                    tracing::error!(workflow_id = %workflow_id, error = %e, "Reconciler restart failed");
                }
            }
            SupervisionEvent::ActorTerminated(cell, _, _) => {
                state.children.remove(&cell.get_id());
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/supervisor_tests.rs"]
mod tests;
