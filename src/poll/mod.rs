//! Fixed-interval status polling.
//!
//! Each tracked workflow gets one poll loop. The loop never lets two fetches
//! for the same workflow overlap: a tick that arrives while a fetch is still
//! running is skipped. Fetch failures are retried on the next tick and, after
//! enough of them in a row, reported as `Degraded(true)`.

pub mod http;

use crate::domain::{FetchError, TimestampUtc, WorkflowId};
use crate::gate::{Callback, CallbackGate};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub use http::HttpStatusFetcher;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Something that can fetch the backend's snapshot for a workflow.
#[async_trait]
pub trait StatusFetcher: Send + Sync + 'static {
    async fn fetch(&self, workflow_id: &WorkflowId) -> Result<Value, FetchError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    Snapshot {
        body: Value,
        received_at: TimestampUtc,
    },
    /// Entered (`true`) or left (`false`) the degraded state.
    Degraded(bool),
}

pub type PollCallback = Callback<PollEvent>;

/// Starts poll loops that share a fetcher and failure policy.
#[derive(Clone)]
pub struct PollScheduler {
    fetcher: Arc<dyn StatusFetcher>,
    request_timeout: Duration,
    degraded_after_failures: u32,
}

impl PollScheduler {
    pub fn new(
        fetcher: Arc<dyn StatusFetcher>,
        request_timeout: Duration,
        degraded_after_failures: u32,
    ) -> Self {
        Self {
            fetcher,
            request_timeout,
            degraded_after_failures: degraded_after_failures.max(1),
        }
    }

    /// Polls immediately, then every `interval`, until stopped or until
    /// `parent` is cancelled.
    pub fn start(
        &self,
        workflow_id: WorkflowId,
        interval: Duration,
        callback: PollCallback,
        parent: &CancellationToken,
    ) -> PollHandle {
        let token = parent.child_token();
        let gate = CallbackGate::new(callback);
        // The ticker cannot run with a zero period.
        let interval = interval.max(MIN_POLL_INTERVAL);

        let task = tokio::spawn(run_poll_loop(PollLoop {
            workflow_id: workflow_id.clone(),
            interval,
            request_timeout: self.request_timeout,
            degraded_after_failures: self.degraded_after_failures,
            fetcher: self.fetcher.clone(),
            gate: gate.clone(),
            token: token.clone(),
        }));

        tracing::debug!(workflow_id = %workflow_id, ?interval, "Polling started");
        PollHandle {
            workflow_id,
            token,
            gate,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn stop(&self, handle: &PollHandle) {
        handle.stop();
    }
}

/// A running poll loop.
pub struct PollHandle {
    workflow_id: WorkflowId,
    token: CancellationToken,
    gate: CallbackGate<PollEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollHandle {
    /// Idempotent. A response still in flight is discarded and no callback
    /// runs after this returns.
    pub fn stop(&self) {
        self.token.cancel();
        self.gate.shut();
        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
            tracing::debug!(workflow_id = %self.workflow_id, "Polling stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.gate.is_shut()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PollLoop {
    workflow_id: WorkflowId,
    interval: Duration,
    request_timeout: Duration,
    degraded_after_failures: u32,
    fetcher: Arc<dyn StatusFetcher>,
    gate: CallbackGate<PollEvent>,
    token: CancellationToken,
}

async fn run_poll_loop(poll: PollLoop) {
    let PollLoop {
        workflow_id,
        interval,
        request_timeout,
        degraded_after_failures,
        fetcher,
        gate,
        token,
    } = poll;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let (done_tx, mut done_rx) = mpsc::channel::<Result<Value, FetchError>>(1);
    let mut in_flight: Option<JoinHandle<()>> = None;
    let mut consecutive_failures = 0u32;
    let mut degraded = false;

    loop {
        tokio::select! {
            biased;

            _ = token.cancelled() => break,

            Some(result) = done_rx.recv() => {
                in_flight = None;
                if token.is_cancelled() {
                    break;
                }
                match result {
                    Ok(body) => {
                        consecutive_failures = 0;
                        gate.deliver(PollEvent::Snapshot {
                            body,
                            received_at: chrono::Utc::now(),
                        });
                        if degraded {
                            degraded = false;
                            tracing::info!(workflow_id = %workflow_id, "Polling recovered");
                            gate.deliver(PollEvent::Degraded(false));
                        }
                    }
                    Err(e) => {
                        consecutive_failures = consecutive_failures.saturating_add(1);
                        if consecutive_failures == 1 || consecutive_failures.is_multiple_of(degraded_after_failures) {
                            tracing::warn!(
                                workflow_id = %workflow_id,
                                failures = consecutive_failures,
                                error = %e,
                                "Status fetch failed"
                            );
                        }
                        if !degraded && consecutive_failures >= degraded_after_failures {
                            degraded = true;
                            gate.deliver(PollEvent::Degraded(true));
                        }
                    }
                }
            }

            _ = ticker.tick() => {
                if in_flight.is_some() {
                    tracing::debug!(workflow_id = %workflow_id, "Fetch still in flight, skipping tick");
                } else {
                    let fetcher = fetcher.clone();
                    let id = workflow_id.clone();
                    let done = done_tx.clone();
                    in_flight = Some(tokio::spawn(async move {
                        let result = tokio::time::timeout(request_timeout, fetcher.fetch(&id))
                            .await
                            .unwrap_or(Err(FetchError::Timeout));
                        let _ = done.send(result).await;
                    }));
                }
            }
        }
    }

    if let Some(task) = in_flight.take() {
        task.abort();
    }
}

#[cfg(test)]
#[path = "tests/poll_tests.rs"]
mod tests;
