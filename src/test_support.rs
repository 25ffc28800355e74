//! Scriptable transports, fetchers and notifiers for tests.

use crate::connection::{MessageStream, PushTransport};
use crate::dispatcher::{Notification, Notifier};
use crate::domain::{FetchError, TransportError, WorkflowId};
use crate::poll::StatusFetcher;
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Polls `condition` every 10ms until it holds or `timeout` passes.
pub(crate) async fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[derive(Default)]
struct ChannelState {
    senders: HashMap<WorkflowId, UnboundedSender<Result<String, TransportError>>>,
    failing: HashSet<WorkflowId>,
    fail_all: bool,
    connects: HashMap<WorkflowId, usize>,
}

/// Push transport whose channels are fed by the test.
#[derive(Default)]
pub(crate) struct ChannelTransport {
    state: Mutex<ChannelState>,
}

impl ChannelTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.state.lock().unwrap().fail_all = fail;
    }

    pub fn set_failing(&self, workflow_id: &str, fail: bool) {
        let mut state = self.state.lock().unwrap();
        if fail {
            state.failing.insert(WorkflowId::from(workflow_id));
        } else {
            state.failing.remove(&WorkflowId::from(workflow_id));
        }
    }

    /// Sends a text frame on the live channel. False when none is open.
    pub fn send(&self, workflow_id: &str, text: &str) -> bool {
        let state = self.state.lock().unwrap();
        match state.senders.get(&WorkflowId::from(workflow_id)) {
            Some(sender) => sender.unbounded_send(Ok(text.to_string())).is_ok(),
            None => false,
        }
    }

    pub fn send_json(&self, workflow_id: &str, value: Value) -> bool {
        self.send(workflow_id, &value.to_string())
    }

    /// Ends the live channel as if the server went away.
    pub fn drop_connection(&self, workflow_id: &str) {
        self.state
            .lock()
            .unwrap()
            .senders
            .remove(&WorkflowId::from(workflow_id));
    }

    pub fn is_open(&self, workflow_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .senders
            .get(&WorkflowId::from(workflow_id))
            .is_some_and(|sender| !sender.is_closed())
    }

    pub fn connect_count(&self, workflow_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .connects
            .get(&WorkflowId::from(workflow_id))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl PushTransport for ChannelTransport {
    async fn connect(&self, workflow_id: &WorkflowId) -> Result<MessageStream, TransportError> {
        let mut state = self.state.lock().unwrap();
        *state.connects.entry(workflow_id.clone()).or_insert(0) += 1;
        if state.fail_all || state.failing.contains(workflow_id) {
            return Err(TransportError::Refused("scripted failure".to_string()));
        }
        let (tx, rx) = unbounded();
        state.senders.insert(workflow_id.clone(), tx);
        Ok(rx.boxed())
    }
}

#[derive(Default)]
struct FetcherState {
    responses: HashMap<WorkflowId, Result<Value, FetchError>>,
    calls: HashMap<WorkflowId, usize>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Status fetcher answering from a per-workflow script.
#[derive(Default)]
pub(crate) struct ScriptedFetcher {
    state: Arc<Mutex<FetcherState>>,
    delay: Duration,
}

struct InFlight(Arc<Mutex<FetcherState>>);

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut state) = self.0.lock() {
            state.in_flight = state.in_flight.saturating_sub(1);
        }
    }
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn set_response(&self, workflow_id: &str, response: Result<Value, FetchError>) {
        self.state
            .lock()
            .unwrap()
            .responses
            .insert(WorkflowId::from(workflow_id), response);
    }

    pub fn set_status(&self, workflow_id: &str, status: &str) {
        self.set_response(workflow_id, Ok(json!({ "status": status })));
    }

    pub fn calls(&self, workflow_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(&WorkflowId::from(workflow_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }
}

#[async_trait]
impl StatusFetcher for ScriptedFetcher {
    async fn fetch(&self, workflow_id: &WorkflowId) -> Result<Value, FetchError> {
        let _guard = {
            let mut state = self.state.lock().unwrap();
            *state.calls.entry(workflow_id.clone()).or_insert(0) += 1;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            InFlight(self.state.clone())
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.state
            .lock()
            .unwrap()
            .responses
            .get(workflow_id)
            .cloned()
            .unwrap_or(Err(FetchError::NotFound))
    }
}

/// Notifier that keeps everything it is handed.
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn keys_for(&self, workflow_id: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.workflow_id.as_str() == workflow_id)
            .map(|n| n.key.clone())
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) {
        self.sent.lock().unwrap().push(notification.clone());
    }
}
