//! Tests for the reconciler actor and its slot.

use super::*;
use crate::dispatcher::Dispatcher;
use crate::domain::{CanonicalStatus, ChangeCause, Connectivity, UpdateSource};
use crate::test_support::RecordingNotifier;
use chrono::Utc;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Harness {
    args: ReconcilerArgs,
    snapshot_rx: watch::Receiver<WorkflowState>,
    change_rx: broadcast::Receiver<StateChange>,
    notifier: Arc<RecordingNotifier>,
}

fn harness(on_transition: Option<TransitionCallback>) -> Harness {
    let id = WorkflowId::from("wf_1");
    let (snapshot_tx, snapshot_rx) = watch::channel(WorkflowState::pending(id.clone(), Utc::now()));
    let (change_tx, change_rx) = broadcast::channel(64);
    let notifier = RecordingNotifier::new();
    let args = ReconcilerArgs {
        workflow_id: id,
        mapper: StageMapper::default(),
        snapshot_tx,
        change_tx,
        dispatcher: Arc::new(Dispatcher::new(notifier.clone(), vec![])),
        on_transition,
        slot: ReconcilerSlot::new(),
    };
    Harness {
        args,
        snapshot_rx,
        change_rx,
        notifier,
    }
}

async fn spawn(args: &ReconcilerArgs) -> ReconcilerSlot {
    let (actor, join) = ReconcilerActor::spawn(None, ReconcilerActor, args.clone())
        .await
        .expect("spawn failed");
    args.slot.install(actor, join);
    args.slot.clone()
}

fn poll(status: &str) -> ReconcilerMsg {
    ReconcilerMsg::Poll {
        body: json!({ "status": status }),
        received_at: Utc::now(),
    }
}

fn push(value: serde_json::Value) -> ReconcilerMsg {
    ReconcilerMsg::Push(PushMessage {
        text: value.to_string(),
        received_at: Utc::now(),
    })
}

#[tokio::test]
async fn test_updates_are_applied_in_mailbox_order_and_published() {
    let mut h = harness(None);
    let slot = spawn(&h.args).await;

    assert!(slot.send(poll("planning")));
    assert!(slot.send(push(json!({
        "event": "status_change",
        "data": { "status": "content_creation" }
    }))));
    assert!(slot.send(poll("planning")));

    let state = slot.query().await.expect("state");
    assert_eq!(state.canonical_status, CanonicalStatus::ContentCreation);
    assert_eq!(state.sequence, 2);
    assert_eq!(h.snapshot_rx.borrow_and_update().sequence, 2);

    let first = h.change_rx.recv().await.expect("first change");
    let second = h.change_rx.recv().await.expect("second change");
    assert_eq!(first.cause, ChangeCause::Update(UpdateSource::Poll));
    assert_eq!(second.cause, ChangeCause::Update(UpdateSource::Push));
    assert_eq!(second.previous.canonical_status, CanonicalStatus::Planning);

    slot.retire().await;
}

#[tokio::test]
async fn test_completion_reaches_dispatcher_once() {
    let h = harness(None);
    let slot = spawn(&h.args).await;

    slot.send(push(json!({
        "event": "generation_complete",
        "data": { "status": "completed" }
    })));
    slot.send(poll("completed"));
    let state = slot.query().await.expect("state");

    assert!(state.terminal);
    assert_eq!(h.notifier.keys_for("wf_1"), vec!["status:completed"]);
    slot.retire().await;
}

#[tokio::test]
async fn test_panicking_callback_does_not_stop_reconciliation() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let callback: TransitionCallback = Arc::new(move |_change: &StateChange| {
        counter.fetch_add(1, Ordering::SeqCst);
        panic!("consumer bug");
    });
    let h = harness(Some(callback));
    let slot = spawn(&h.args).await;

    slot.send(poll("planning"));
    slot.send(poll("quality_review"));
    let state = slot.query().await.expect("actor should still be alive");

    assert_eq!(state.canonical_status, CanonicalStatus::QualityReview);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    slot.retire().await;
}

#[tokio::test]
async fn test_actor_resumes_from_published_snapshot() {
    let h = harness(None);
    let mut resumed = WorkflowState::pending(WorkflowId::from("wf_1"), Utc::now());
    resumed.canonical_status = CanonicalStatus::QualityReview;
    resumed.connectivity = Connectivity::PollingOnly;
    resumed.sequence = 7;
    h.args.snapshot_tx.send_replace(resumed);

    let slot = spawn(&h.args).await;
    slot.send(poll("planning"));
    let state = slot.query().await.expect("state");

    assert_eq!(state.canonical_status, CanonicalStatus::QualityReview);
    assert_eq!(state.sequence, 7);
    slot.retire().await;
}

#[tokio::test]
async fn test_retired_slot_refuses_messages_and_stops_late_actors() {
    let h = harness(None);
    let slot = spawn(&h.args).await;

    slot.retire().await;
    slot.retire().await;
    assert!(slot.is_retired());
    assert!(!slot.is_live());
    assert!(!slot.send(poll("planning")));
    assert!(slot.query().await.is_none());

    // An actor installed after retirement is stopped straight away.
    let (actor, join) = ReconcilerActor::spawn(None, ReconcilerActor, h.args.clone())
        .await
        .expect("spawn failed");
    slot.install(actor, join);
    assert!(!slot.is_live());

    assert_eq!(h.snapshot_rx.borrow().sequence, 0);
}
