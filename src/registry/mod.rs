//! Registry of tracked workflows.
//!
//! Owns, per distinct workflow id, exactly one reconciler actor, one poll
//! loop and at most one push channel, all tied to one cancellation token.
//! Tracking the same id again returns the existing subscription.
//!
//! Teardown order for a workflow is always: cancel token, stop polling,
//! close push, retire the reconciler. Once `untrack` returns, nothing can
//! commit to that workflow's state again.

pub mod tracker;

use crate::config::{TrackOptions, TrackerConfig};
use crate::connection::{
    ConnectionCallback, ConnectionEvent, ConnectionHandle, ConnectionManager, PushTransport,
    WebSocketTransport,
};
use crate::dispatcher::{Dispatcher, Notifier, TracingNotifier};
use crate::domain::{StateChange, TrackerError, WorkflowId, WorkflowState};
use crate::poll::{
    HttpStatusFetcher, PollCallback, PollEvent, PollHandle, PollScheduler, StatusFetcher,
};
use crate::reconciler::actor::{ReconcilerArgs, ReconcilerMsg, ReconcilerSlot};
use crate::reconciler::supervisor::{SupervisorMsg, WorkflowSupervisor};
use crate::stage_mapper::StageMapper;
use ractor::{Actor, ActorRef};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use tracker::{MultiTracker, WorkflowTracker};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Identifies one subscription. Re-tracking an id hands back the same one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    workflow_id: WorkflowId,
    id: Uuid,
}

impl SubscriptionHandle {
    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Entry {
    handle: SubscriptionHandle,
    token: CancellationToken,
    slot: ReconcilerSlot,
    snapshot: watch::Receiver<WorkflowState>,
    push: Mutex<Option<ConnectionHandle>>,
    poll: Mutex<Option<PollHandle>>,
}

impl Entry {
    fn workflow_id(&self) -> &WorkflowId {
        &self.handle.workflow_id
    }

    fn is_terminal(&self) -> bool {
        self.snapshot.borrow().terminal
    }

    fn start_polling(&self, polls: &PollScheduler, interval: Duration) {
        let slot = self.slot.clone();
        let callback: PollCallback = Arc::new(move |event| {
            let message = match event {
                PollEvent::Snapshot { body, received_at } => ReconcilerMsg::Poll { body, received_at },
                PollEvent::Degraded(degraded) => ReconcilerMsg::Degraded(degraded),
            };
            slot.send(message);
        });
        let handle = polls.start(self.workflow_id().clone(), interval, callback, &self.token);
        *lock(&self.poll) = Some(handle);
        self.slot.send(ReconcilerMsg::PollingActive(true));
    }

    /// Returns false when already open or when the workflow is finished.
    fn open_push(&self, connections: &ConnectionManager) -> bool {
        if self.token.is_cancelled() || self.is_terminal() {
            return false;
        }
        let mut push = lock(&self.push);
        if push.is_some() {
            return false;
        }
        let slot = self.slot.clone();
        let callback: ConnectionCallback = Arc::new(move |event| {
            let message = match event {
                ConnectionEvent::Message(message) => ReconcilerMsg::Push(message),
                ConnectionEvent::Connectivity(connectivity) => {
                    ReconcilerMsg::PushConnectivity(connectivity)
                }
            };
            slot.send(message);
        });
        *push = Some(connections.open(self.workflow_id().clone(), callback, &self.token));
        true
    }

    /// Returns false when no push channel was open.
    fn close_push(&self) -> bool {
        let Some(handle) = lock(&self.push).take() else {
            return false;
        };
        handle.close();
        self.slot.send(ReconcilerMsg::PushConnectivity(
            crate::connection::PushConnectivity::Disconnected,
        ));
        true
    }

    /// Stops both channels. The reconciler stays up so state is readable.
    fn release_channels(&self) {
        if let Some(poll) = lock(&self.poll).take() {
            poll.stop();
        }
        if let Some(push) = lock(&self.push).take() {
            push.close();
        }
    }

    async fn teardown(&self) {
        self.token.cancel();
        self.release_channels();
        self.slot.retire().await;
        tracing::debug!(workflow_id = %self.workflow_id(), "Workflow torn down");
    }
}

struct Inner {
    config: TrackerConfig,
    mapper: StageMapper,
    connections: ConnectionManager,
    polls: PollScheduler,
    dispatcher: Arc<Dispatcher>,
    supervisor: ActorRef<SupervisorMsg>,
    changes: broadcast::Sender<StateChange>,
    root: CancellationToken,
    entries: RwLock<HashMap<WorkflowId, Arc<Entry>>>,
    /// Serializes `track` so the same id cannot be spawned twice.
    tracking: tokio::sync::Mutex<()>,
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<WorkflowId, Arc<Entry>>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<WorkflowId, Arc<Entry>>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Removes the entry only if it still belongs to `handle`.
    fn remove(&self, handle: &SubscriptionHandle) -> Option<Arc<Entry>> {
        let mut entries = self.write();
        match entries.get(&handle.workflow_id) {
            Some(entry) if entry.handle == *handle => entries.remove(&handle.workflow_id),
            _ => None,
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.root.cancel();
        self.supervisor.stop(None);
    }
}

/// Cheaply cloneable handle to the shared registry.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    /// Builds a registry over the given transports.
    pub async fn new(
        config: TrackerConfig,
        transport: Arc<dyn PushTransport>,
        fetcher: Arc<dyn StatusFetcher>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, TrackerError> {
        config
            .validate()
            .map_err(|e| TrackerError::InvalidConfig {
                message: format!("{:#}", e),
            })?;
        let (supervisor, _handle) =
            WorkflowSupervisor::spawn(None, WorkflowSupervisor, config.max_restarts)
                .await
                .map_err(|e| TrackerError::SpawnFailed {
                    message: e.to_string(),
                })?;

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let inner = Inner {
            mapper: StageMapper::new(config.partial_credit),
            connections: ConnectionManager::new(
                transport,
                config.backoff.clone(),
                config.connect_timeout(),
            ),
            polls: PollScheduler::new(
                fetcher,
                config.request_timeout(),
                config.degraded_after_failures,
            ),
            dispatcher: Arc::new(Dispatcher::new(notifier, config.milestones.clone())),
            supervisor,
            changes,
            root: CancellationToken::new(),
            entries: RwLock::new(HashMap::new()),
            tracking: tokio::sync::Mutex::new(()),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Builds a registry with the WebSocket and HTTP transports named in
    /// `config`, logging notifications.
    pub async fn from_config(config: TrackerConfig) -> Result<Self, TrackerError> {
        let transport = Arc::new(WebSocketTransport::new(config.events_url.clone()));
        let fetcher = Arc::new(HttpStatusFetcher::new(
            config.status_url.clone(),
            config.request_timeout(),
        ));
        Self::new(config, transport, fetcher, Arc::new(TracingNotifier)).await
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub async fn track(&self, workflow_id: WorkflowId) -> Result<SubscriptionHandle, TrackerError> {
        self.track_with(workflow_id, TrackOptions::default()).await
    }

    /// Starts tracking `workflow_id`. If it is already tracked, returns the
    /// existing subscription and ignores `options`.
    pub async fn track_with(
        &self,
        workflow_id: WorkflowId,
        options: TrackOptions,
    ) -> Result<SubscriptionHandle, TrackerError> {
        let _tracking = self.inner.tracking.lock().await;
        if self.inner.root.is_cancelled() {
            return Err(TrackerError::RegistryClosed);
        }
        if options.poll_interval == Some(Duration::ZERO) {
            return Err(TrackerError::InvalidOptions {
                message: "poll_interval must be greater than zero".to_string(),
            });
        }
        if let Some(entry) = self.inner.read().get(&workflow_id) {
            tracing::debug!(workflow_id = %workflow_id, "Already tracked, reusing subscription");
            return Ok(entry.handle.clone());
        }

        let initial = WorkflowState::pending(workflow_id.clone(), chrono::Utc::now());
        let (snapshot_tx, snapshot) = watch::channel(initial);
        let slot = ReconcilerSlot::new();
        let args = ReconcilerArgs {
            workflow_id: workflow_id.clone(),
            mapper: self.inner.mapper,
            snapshot_tx,
            change_tx: self.inner.changes.clone(),
            dispatcher: self.inner.dispatcher.clone(),
            on_transition: options.on_transition.clone(),
            slot: slot.clone(),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .supervisor
            .send_message(SupervisorMsg::Spawn(Box::new(args), reply_tx))
            .map_err(|_| TrackerError::RegistryClosed)?;
        reply_rx.await.map_err(|_| TrackerError::RegistryClosed)??;

        let entry = Arc::new(Entry {
            handle: SubscriptionHandle {
                workflow_id: workflow_id.clone(),
                id: Uuid::new_v4(),
            },
            token: self.inner.root.child_token(),
            slot,
            snapshot,
            push: Mutex::new(None),
            poll: Mutex::new(None),
        });

        let interval = options
            .poll_interval
            .unwrap_or_else(|| self.inner.config.poll_interval());
        entry.start_polling(&self.inner.polls, interval);
        if options.auto_connect.unwrap_or(self.inner.config.auto_connect) {
            entry.open_push(&self.inner.connections);
        }
        let handle = entry.handle.clone();
        self.inner.write().insert(workflow_id.clone(), entry.clone());
        spawn_reaper(Arc::downgrade(&self.inner), entry);
        tracing::info!(workflow_id = %workflow_id, ?interval, "Tracking workflow");
        Ok(handle)
    }

    /// Stops tracking. Returns false (and does nothing) for an unknown or
    /// already released subscription.
    pub async fn untrack(&self, handle: &SubscriptionHandle) -> bool {
        let Some(entry) = self.inner.remove(handle) else {
            tracing::debug!(workflow_id = %handle.workflow_id, "Untrack of unknown subscription");
            return false;
        };
        entry.teardown().await;
        self.inner.dispatcher.forget(entry.workflow_id());
        tracing::info!(workflow_id = %entry.workflow_id(), "Stopped tracking workflow");
        true
    }

    /// Tears down every subscription. Every channel is closed and every poll
    /// loop is stopped before this returns.
    pub async fn untrack_all(&self) {
        let entries: Vec<Arc<Entry>> = self.inner.write().drain().map(|(_, e)| e).collect();
        if entries.is_empty() {
            return;
        }
        let count = entries.len();
        futures::future::join_all(entries.iter().map(|entry| entry.teardown())).await;
        for entry in &entries {
            self.inner.dispatcher.forget(entry.workflow_id());
        }
        tracing::info!(count, "Stopped tracking all workflows");
    }

    /// Untracks everything and refuses further `track` calls.
    pub async fn shutdown(&self) {
        let _tracking = self.inner.tracking.lock().await;
        self.inner.root.cancel();
        self.untrack_all().await;
        self.inner.supervisor.stop(None);
    }

    pub fn get(&self, workflow_id: &WorkflowId) -> Option<WorkflowState> {
        self.inner
            .read()
            .get(workflow_id)
            .map(|entry| entry.snapshot.borrow().clone())
    }

    pub fn watch(&self, workflow_id: &WorkflowId) -> Option<watch::Receiver<WorkflowState>> {
        self.inner
            .read()
            .get(workflow_id)
            .map(|entry| entry.snapshot.clone())
    }

    pub fn handle(&self, workflow_id: &WorkflowId) -> Option<SubscriptionHandle> {
        self.inner
            .read()
            .get(workflow_id)
            .map(|entry| entry.handle.clone())
    }

    pub fn states(&self) -> HashMap<WorkflowId, WorkflowState> {
        self.inner
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.snapshot.borrow().clone()))
            .collect()
    }

    pub fn tracked_ids(&self) -> Vec<WorkflowId> {
        let mut ids: Vec<WorkflowId> = self.inner.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every committed change across all workflows.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StateChange> {
        self.inner.changes.subscribe()
    }

    fn entry(&self, workflow_id: &WorkflowId) -> Option<Arc<Entry>> {
        self.inner.read().get(workflow_id).cloned()
    }

    /// Opens the push channel. False if untracked, terminal or already open.
    pub fn connect(&self, workflow_id: &WorkflowId) -> bool {
        self.entry(workflow_id)
            .is_some_and(|entry| entry.open_push(&self.inner.connections))
    }

    /// Closes the push channel; polling continues. False if none was open.
    pub fn disconnect(&self, workflow_id: &WorkflowId) -> bool {
        self.entry(workflow_id)
            .is_some_and(|entry| entry.close_push())
    }

    /// Drops and re-opens the push channel with a fresh backoff.
    pub fn reconnect(&self, workflow_id: &WorkflowId) -> bool {
        let Some(entry) = self.entry(workflow_id) else {
            return false;
        };
        entry.close_push();
        entry.open_push(&self.inner.connections)
    }
}

/// Releases channels once the workflow turns terminal, then drops the entry
/// after the configured grace period.
fn spawn_reaper(inner: Weak<Inner>, entry: Arc<Entry>) {
    let grace = match inner.upgrade() {
        Some(inner) => inner.config.terminal_grace(),
        None => return,
    };
    let mut snapshot = entry.snapshot.clone();
    let token = entry.token.clone();

    tokio::spawn(async move {
        let reached = tokio::select! {
            _ = token.cancelled() => false,
            reached = async { snapshot.wait_for(|state| state.terminal).await.is_ok() } => reached,
        };
        if !reached || token.is_cancelled() {
            return;
        }

        entry.release_channels();
        tracing::info!(
            workflow_id = %entry.workflow_id(),
            status = %entry.snapshot.borrow().canonical_status,
            "Workflow finished, channels released"
        );

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(grace) => {}
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };
        if let Some(entry) = inner.remove(&entry.handle) {
            entry.teardown().await;
            inner.dispatcher.forget(entry.workflow_id());
            tracing::debug!(workflow_id = %entry.workflow_id(), "Finished workflow dropped from registry");
        }
    });
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
