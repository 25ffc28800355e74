//! Push channel management.
//!
//! One persistent channel per tracked workflow. The manager:
//! - Connects through a `PushTransport` with a connect timeout
//! - Forwards every inbound message, stamped with its receipt time
//! - Reports `Connected` / `Reconnecting` transitions
//! - Reconnects with capped, jittered exponential backoff until closed
//!
//! Message content is not interpreted here; that is the reconciler's job.

pub mod websocket;

use crate::backoff::{Backoff, BackoffPolicy};
use crate::domain::{TimestampUtc, TransportError, WorkflowId};
use crate::gate::{Callback, CallbackGate};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use websocket::WebSocketTransport;

/// Uptime after which a dropped channel reconnects at the base delay again.
const STABLE_CONNECTION: Duration = Duration::from_secs(10);

/// Inbound text messages from an established channel.
pub type MessageStream = BoxStream<'static, Result<String, TransportError>>;

/// Something that can open a push channel for a workflow.
#[async_trait]
pub trait PushTransport: Send + Sync + 'static {
    async fn connect(&self, workflow_id: &WorkflowId) -> Result<MessageStream, TransportError>;
}

/// An inbound message, uninterpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    pub text: String,
    pub received_at: TimestampUtc,
}

/// Push channel state as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushConnectivity {
    Connected,
    /// Closed by the caller.
    Disconnected,
    /// Dropped or not yet established; a retry is pending.
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Message(PushMessage),
    Connectivity(PushConnectivity),
}

pub type ConnectionCallback = Callback<ConnectionEvent>;

/// Opens push channels sharing one transport and backoff policy.
#[derive(Clone)]
pub struct ConnectionManager {
    transport: Arc<dyn PushTransport>,
    backoff: BackoffPolicy,
    connect_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        backoff: BackoffPolicy,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            backoff,
            connect_timeout,
        }
    }

    /// Starts connecting in the background. Events and connectivity changes
    /// go to `callback` until the handle is closed.
    pub fn open(
        &self,
        workflow_id: WorkflowId,
        callback: ConnectionCallback,
        parent: &CancellationToken,
    ) -> ConnectionHandle {
        let token = parent.child_token();
        let gate = CallbackGate::new(callback);

        let task = tokio::spawn(run_connection(
            self.transport.clone(),
            workflow_id.clone(),
            self.backoff.clone(),
            self.connect_timeout,
            gate.clone(),
            token.clone(),
        ));

        ConnectionHandle {
            workflow_id,
            token,
            gate,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn close(&self, handle: &ConnectionHandle) {
        handle.close();
    }
}

/// A live push channel. Closing (or dropping) it stops delivery for good.
pub struct ConnectionHandle {
    workflow_id: WorkflowId,
    token: CancellationToken,
    gate: CallbackGate<ConnectionEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHandle {
    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    /// Idempotent. No callback runs after this returns.
    pub fn close(&self) {
        self.token.cancel();
        self.gate.shut();
        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
            tracing::debug!(workflow_id = %self.workflow_id, "Push channel closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.gate.is_shut()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_connection(
    transport: Arc<dyn PushTransport>,
    workflow_id: WorkflowId,
    policy: BackoffPolicy,
    connect_timeout: Duration,
    gate: CallbackGate<ConnectionEvent>,
    token: CancellationToken,
) {
    let mut backoff = Backoff::new(policy);
    let mut consecutive_failures = 0u32;

    loop {
        let attempt = tokio::select! {
            _ = token.cancelled() => break,
            result = tokio::time::timeout(connect_timeout, transport.connect(&workflow_id)) => {
                result.unwrap_or(Err(TransportError::Timeout))
            }
        };

        match attempt {
            Ok(mut stream) => {
                consecutive_failures = 0;
                tracing::info!(workflow_id = %workflow_id, "Push channel connected");
                gate.deliver(ConnectionEvent::Connectivity(PushConnectivity::Connected));
                let connected_at = tokio::time::Instant::now();
                let mut delivered = false;

                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        next = stream.next() => match next {
                            Some(Ok(text)) => {
                                if !delivered {
                                    delivered = true;
                                    backoff.reset();
                                }
                                gate.deliver(ConnectionEvent::Message(PushMessage {
                                    text,
                                    received_at: chrono::Utc::now(),
                                }));
                            }
                            Some(Err(e)) => {
                                tracing::warn!(workflow_id = %workflow_id, error = %e, "Push channel dropped");
                                break;
                            }
                            None => {
                                tracing::info!(workflow_id = %workflow_id, "Push channel ended by server");
                                break;
                            }
                        }
                    }
                }
                // Short-lived channels keep backing off.
                if connected_at.elapsed() >= STABLE_CONNECTION {
                    backoff.reset();
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                // Log the first failure and then every tenth, not every retry.
                if consecutive_failures == 1 || consecutive_failures.is_multiple_of(10) {
                    tracing::warn!(
                        workflow_id = %workflow_id,
                        attempt = consecutive_failures,
                        error = %e,
                        "Push channel connect failed"
                    );
                }
            }
        }

        if token.is_cancelled() {
            break;
        }
        gate.deliver(ConnectionEvent::Connectivity(PushConnectivity::Reconnecting));

        let delay = backoff.next_delay();
        tracing::debug!(workflow_id = %workflow_id, ?delay, "Reconnecting push channel");
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
