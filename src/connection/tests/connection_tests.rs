//! Tests for the push connection manager.

use super::*;
use crate::test_support::{wait_for, ChannelTransport};
use std::sync::atomic::{AtomicUsize, Ordering};

fn fast_policy() -> BackoffPolicy {
    BackoffPolicy::new(
        Duration::from_millis(10),
        2.0,
        Duration::from_millis(40),
        0.0,
    )
}

fn recorder() -> (Arc<Mutex<Vec<ConnectionEvent>>>, ConnectionCallback) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let callback: ConnectionCallback =
        Arc::new(move |event: ConnectionEvent| sink.lock().unwrap().push(event));
    (events, callback)
}

fn connectivity(events: &Mutex<Vec<ConnectionEvent>>) -> Vec<PushConnectivity> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            ConnectionEvent::Connectivity(c) => Some(*c),
            _ => None,
        })
        .collect()
}

fn texts(events: &Mutex<Vec<ConnectionEvent>>) -> Vec<String> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            ConnectionEvent::Message(m) => Some(m.text.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_connects_and_forwards_messages_in_order() {
    let transport = ChannelTransport::new();
    let manager = ConnectionManager::new(transport.clone(), fast_policy(), Duration::from_secs(1));
    let (events, callback) = recorder();
    let root = CancellationToken::new();

    let handle = manager.open(WorkflowId::from("wf_1"), callback, &root);
    assert!(wait_for(Duration::from_secs(2), || transport.is_open("wf_1")).await);

    assert!(transport.send("wf_1", "first"));
    assert!(transport.send("wf_1", "second"));
    assert!(wait_for(Duration::from_secs(2), || texts(&events).len() == 2).await);

    assert_eq!(texts(&events), vec!["first", "second"]);
    assert_eq!(connectivity(&events), vec![PushConnectivity::Connected]);
    handle.close();
}

#[tokio::test]
async fn test_failed_connects_report_reconnecting_and_retry() {
    let transport = ChannelTransport::new();
    transport.set_fail_all(true);
    let manager = ConnectionManager::new(transport.clone(), fast_policy(), Duration::from_secs(1));
    let (events, callback) = recorder();
    let root = CancellationToken::new();

    let handle = manager.open(WorkflowId::from("wf_1"), callback, &root);
    assert!(wait_for(Duration::from_secs(2), || transport.connect_count("wf_1") >= 3).await);
    assert!(connectivity(&events)
        .iter()
        .all(|c| *c == PushConnectivity::Reconnecting));

    transport.set_fail_all(false);
    assert!(
        wait_for(Duration::from_secs(2), || connectivity(&events)
            .contains(&PushConnectivity::Connected))
        .await
    );
    handle.close();
}

#[tokio::test]
async fn test_dropped_channel_reconnects() {
    let transport = ChannelTransport::new();
    let manager = ConnectionManager::new(transport.clone(), fast_policy(), Duration::from_secs(1));
    let (events, callback) = recorder();
    let root = CancellationToken::new();

    let handle = manager.open(WorkflowId::from("wf_1"), callback, &root);
    assert!(wait_for(Duration::from_secs(2), || transport.is_open("wf_1")).await);

    transport.drop_connection("wf_1");
    assert!(wait_for(Duration::from_secs(2), || transport.connect_count("wf_1") == 2).await);
    assert!(wait_for(Duration::from_secs(2), || connectivity(&events).len() == 3).await);
    assert_eq!(
        connectivity(&events),
        vec![
            PushConnectivity::Connected,
            PushConnectivity::Reconnecting,
            PushConnectivity::Connected
        ]
    );
    handle.close();
}

#[tokio::test]
async fn test_close_is_idempotent_and_silences_callback() {
    let transport = ChannelTransport::new();
    let manager = ConnectionManager::new(transport.clone(), fast_policy(), Duration::from_secs(1));
    let (events, callback) = recorder();
    let root = CancellationToken::new();

    let handle = manager.open(WorkflowId::from("wf_1"), callback, &root);
    assert!(wait_for(Duration::from_secs(2), || transport.is_open("wf_1")).await);

    manager.close(&handle);
    handle.close();
    assert!(handle.is_closed());
    let seen = events.lock().unwrap().len();

    transport.send("wf_1", "late");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(events.lock().unwrap().len(), seen);
    assert_eq!(transport.connect_count("wf_1"), 1);
}

#[tokio::test]
async fn test_parent_cancellation_stops_retries() {
    let transport = ChannelTransport::new();
    transport.set_fail_all(true);
    let manager = ConnectionManager::new(transport.clone(), fast_policy(), Duration::from_secs(1));
    let (_events, callback) = recorder();
    let root = CancellationToken::new();

    let _handle = manager.open(WorkflowId::from("wf_1"), callback, &root);
    assert!(wait_for(Duration::from_secs(2), || transport.connect_count("wf_1") >= 1).await);

    root.cancel();
    tokio::time::sleep(Duration::from_millis(60)).await;
    let attempts = transport.connect_count("wf_1");
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(transport.connect_count("wf_1"), attempts);
}

/// Accepts every connect and hands back a channel that ends at once.
struct EmptyStreamTransport {
    connects: AtomicUsize,
}

#[async_trait]
impl PushTransport for EmptyStreamTransport {
    async fn connect(&self, _workflow_id: &WorkflowId) -> Result<MessageStream, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(futures::stream::empty().boxed())
    }
}

/// Never completes a connect.
struct PendingTransport {
    connects: AtomicUsize,
}

#[async_trait]
impl PushTransport for PendingTransport {
    async fn connect(&self, _workflow_id: &WorkflowId) -> Result<MessageStream, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        futures::future::pending().await
    }
}

#[tokio::test]
async fn test_channel_that_drops_immediately_keeps_backing_off() {
    let transport = Arc::new(EmptyStreamTransport {
        connects: AtomicUsize::new(0),
    });
    let policy = BackoffPolicy::new(
        Duration::from_millis(20),
        2.0,
        Duration::from_secs(1),
        0.0,
    );
    let manager = ConnectionManager::new(transport.clone(), policy, Duration::from_secs(1));
    let (events, callback) = recorder();
    let root = CancellationToken::new();

    let handle = manager.open(WorkflowId::from("wf_1"), callback, &root);
    tokio::time::sleep(Duration::from_millis(600)).await;
    handle.close();

    // Delays of 20, 40, 80, 160, 320ms fit about five connects in the window.
    // Resetting on every accept would retry every 20ms instead.
    let connects = transport.connects.load(Ordering::SeqCst);
    assert!(connects >= 3, "connects: {}", connects);
    assert!(connects <= 8, "connects: {}", connects);

    let connected = connectivity(&events)
        .iter()
        .filter(|c| **c == PushConnectivity::Connected)
        .count();
    assert!(connected <= connects && connected + 1 >= connects);
}

#[tokio::test]
async fn test_message_resets_backoff_after_reconnect() {
    let transport = ChannelTransport::new();
    let manager = ConnectionManager::new(transport.clone(), fast_policy(), Duration::from_secs(1));
    let (events, callback) = recorder();
    let root = CancellationToken::new();

    let handle = manager.open(WorkflowId::from("wf_1"), callback, &root);
    for round in 1..=3 {
        assert!(wait_for(Duration::from_secs(2), || transport.is_open("wf_1")).await);
        assert!(transport.send("wf_1", "tick"));
        assert!(wait_for(Duration::from_secs(2), || texts(&events).len() == round).await);
        transport.drop_connection("wf_1");
        assert!(
            wait_for(Duration::from_secs(2), || transport.connect_count("wf_1") == round + 1)
                .await
        );
    }
    handle.close();
}

#[tokio::test]
async fn test_connect_that_never_completes_times_out_and_retries() {
    let transport = Arc::new(PendingTransport {
        connects: AtomicUsize::new(0),
    });
    let manager = ConnectionManager::new(
        transport.clone(),
        fast_policy(),
        Duration::from_millis(30),
    );
    let (events, callback) = recorder();
    let root = CancellationToken::new();

    let handle = manager.open(WorkflowId::from("wf_1"), callback, &root);
    assert!(
        wait_for(Duration::from_secs(2), || transport
            .connects
            .load(Ordering::SeqCst)
            >= 3)
        .await
    );
    handle.close();

    let seen = connectivity(&events);
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|c| *c == PushConnectivity::Reconnecting));
}
