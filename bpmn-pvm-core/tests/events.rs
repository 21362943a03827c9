//! Boundary events, message correlation, signal broadcast, terminate end
//! events and cancellation.

mod common;

use bpmn_pvm_core::{EngineError, EventKind, ExecutionId, ProcessState, SubscriptionId};
use common::{vars, Rig};
use serde_json::json;

// ---------------------------------------------------------------------------
// Boundary timers
// ---------------------------------------------------------------------------

const SLA: &str = r#"
id: sla
nodes:
  - { kind: Start, id: start }
  - { kind: UserTask, id: work }
  - { kind: BoundaryTimer, id: overdue, host: work, duration_ms: 1000 }
  - { kind: BoundaryTimer, id: remind, host: work, duration_ms: 500, interrupting: false, repeat: 1 }
  - { kind: UserTask, id: escalate }
  - { kind: UserTask, id: reminder }
  - { kind: End, id: end }
edges:
  - { from: start, to: work }
  - { from: work, to: end }
  - { from: overdue, to: escalate }
  - { from: remind, to: reminder }
"#;

async fn timer(rig: &Rig, root: ExecutionId, node: &str) -> Option<SubscriptionId> {
    rig.engine
        .subscriptions(root)
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.kind == EventKind::Timer && s.node_id == node)
        .map(|s| s.id)
}

#[tokio::test]
async fn interrupting_timer_replaces_the_host() {
    let rig = Rig::new();
    rig.deploy(SLA).await;
    let root = rig.start("sla", json!({})).await;
    let overdue = timer(&rig, root, "overdue").await.unwrap();

    assert!(rig.engine.fire_timer(overdue).await.unwrap());

    rig.waiting_at(root, "escalate").await;
    assert!(rig.tokens_at(root, "work").await.is_empty());
    assert!(rig.engine.subscriptions(root).await.unwrap().is_empty());
    let deletions = rig.deletions(root).await;
    assert!(deletions
        .iter()
        .any(|(node, reason)| node.as_deref() == Some("work")
            && reason == "boundary event (overdue) interrupted work"));
    assert!(!rig.engine.fire_timer(overdue).await.unwrap());
    rig.assert_tree(root).await;
}

#[tokio::test]
async fn repeating_non_interrupting_timer_keeps_the_host() {
    let rig = Rig::new();
    rig.deploy(SLA).await;
    let root = rig.start("sla", json!({})).await;
    let remind = timer(&rig, root, "remind").await.unwrap();

    assert!(rig.engine.fire_timer(remind).await.unwrap());
    rig.waiting_at(root, "work").await;
    assert_eq!(rig.tokens_at(root, "reminder").await.len(), 1);

    // One repeat left: the subscription stays, re-armed.
    assert_eq!(timer(&rig, root, "remind").await, Some(remind));
    assert!(rig.engine.fire_timer(remind).await.unwrap());
    assert_eq!(rig.tokens_at(root, "reminder").await.len(), 2);
    assert_eq!(timer(&rig, root, "remind").await, None);
    assert!(!rig.engine.fire_timer(remind).await.unwrap());

    // Completing the host removes its remaining boundary waits.
    rig.complete_at(root, "work", json!({})).await;
    assert_eq!(timer(&rig, root, "overdue").await, None);
    assert_eq!(rig.tokens_at(root, "reminder").await.len(), 2);
    assert!(matches!(rig.state(root).await, ProcessState::Running));
    rig.assert_tree(root).await;
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[tokio::test]
async fn interrupting_message_boundary_cancels_a_sub_process() {
    let rig = Rig::new();
    rig.deploy(
        r#"
id: order
nodes:
  - { kind: Start, id: start }
  - { kind: SubProcess, id: fulfil }
  - { kind: Start, id: f_start, parent: fulfil }
  - { kind: ParallelGateway, id: f_fork, parent: fulfil }
  - { kind: UserTask, id: pick, parent: fulfil }
  - { kind: UserTask, id: pack, parent: fulfil }
  - kind: BoundaryMessage
    id: cancel_request
    host: fulfil
    message: cancel
    correlation_key: "${orderId}"
  - { kind: UserTask, id: refund }
  - { kind: UserTask, id: ship }
edges:
  - { from: start, to: fulfil }
  - { from: fulfil, to: ship }
  - { from: f_start, to: f_fork }
  - { from: f_fork, to: pick }
  - { from: f_fork, to: pack }
  - { from: cancel_request, to: refund }
"#,
    )
    .await;
    let root = rig.start("order", json!({ "orderId": "o-9" })).await;
    rig.waiting_at(root, "pick").await;
    rig.waiting_at(root, "pack").await;

    let receiver = rig
        .engine
        .message_received("cancel", Some("o-9"), vars(json!({ "why": "changed mind" })))
        .await
        .unwrap();
    assert!(receiver.is_some());

    rig.waiting_at(root, "refund").await;
    assert!(rig.tokens_at(root, "pick").await.is_empty());
    assert!(rig.tokens_at(root, "pack").await.is_empty());
    assert_eq!(rig.executions(root).await.len(), 2);
    assert_eq!(rig.variable(root, "why").await, Some(json!("changed mind")));
    rig.assert_tree(root).await;
}

const PAYMENT: &str = r#"
id: payment
nodes:
  - { kind: Start, id: start }
  - { kind: ReceiveTask, id: await_payment, message: paid, correlation_key: "${orderId}" }
  - { kind: UserTask, id: ship }
edges:
  - { from: start, to: await_payment }
  - { from: await_payment, to: ship }
"#;

#[tokio::test]
async fn correlation_keys_are_unique_per_message() {
    let rig = Rig::new();
    rig.deploy(PAYMENT).await;
    let first = rig.start("payment", json!({ "orderId": "o-1" })).await;

    let err = rig
        .engine
        .start_process("payment", None, vars(json!({ "orderId": "o-1" })))
        .await
        .unwrap_err();
    assert!(
        matches!(err, EngineError::DuplicateSubscription { ref correlation_key, .. } if correlation_key == "o-1"),
        "{err}"
    );

    let second = rig.start("payment", json!({ "orderId": "o-2" })).await;
    let receiver = rig
        .engine
        .message_received("paid", Some("o-2"), vars(json!({})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rig.execution(second, receiver).await.node_id.as_deref(), Some("ship"));
    rig.waiting_at(first, "await_payment").await;

    let none = rig
        .engine
        .message_received("paid", Some("o-3"), vars(json!({})))
        .await
        .unwrap();
    assert_eq!(none, None);
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

const LISTENER: &str = r#"
id: listener
nodes:
  - { kind: Start, id: start }
  - { kind: SignalCatch, id: wait_go, signal: go }
  - { kind: UserTask, id: after }
edges:
  - { from: start, to: wait_go }
  - { from: wait_go, to: after }
"#;

const BROADCASTER: &str = r#"
id: broadcaster
nodes:
  - { kind: Start, id: start }
  - { kind: SignalThrow, id: shout, signal: go }
  - { kind: End, id: end }
edges:
  - { from: start, to: shout }
  - { from: shout, to: end }
"#;

#[tokio::test]
async fn external_signal_reaches_every_waiting_instance() {
    let rig = Rig::new();
    rig.deploy(LISTENER).await;
    let first = rig.start("listener", json!({})).await;
    let second = rig.start("listener", json!({})).await;

    let reached = rig
        .engine
        .signal_event_received("go", vars(json!({ "wave": 1 })))
        .await
        .unwrap();
    assert_eq!(reached, 2);

    for root in [first, second] {
        rig.waiting_at(root, "after").await;
        assert_eq!(rig.variable(root, "wave").await, Some(json!(1)));
    }
    assert_eq!(rig.engine.signal_event_received("go", vars(json!({}))).await.unwrap(), 0);
}

#[tokio::test]
async fn thrown_signal_is_delivered_after_commit() {
    let rig = Rig::new();
    rig.deploy(LISTENER).await;
    rig.deploy(BROADCASTER).await;
    let listener = rig.start("listener", json!({})).await;

    let thrower = rig.start("broadcaster", json!({})).await;
    assert!(matches!(rig.state(thrower).await, ProcessState::Completed { .. }));
    rig.waiting_at(listener, "after").await;
}

#[tokio::test]
async fn failing_listener_does_not_fail_the_thrower() {
    let rig = Rig::new();
    rig.deploy(LISTENER).await;
    rig.deploy(
        r#"
id: broken_listener
nodes:
  - { kind: Start, id: start }
  - { kind: SignalCatch, id: wait_go, signal: go }
  - { kind: ExclusiveGateway, id: route }
  - { kind: UserTask, id: never }
edges:
  - { from: start, to: wait_go }
  - { from: wait_go, to: route }
  - { from: route, to: never, condition: "${missing == 1}" }
"#,
    )
    .await;
    rig.deploy(
        r#"
id: waiting_broadcaster
nodes:
  - { kind: Start, id: start }
  - { kind: SignalThrow, id: shout, signal: go }
  - { kind: MessageCatch, id: ack, message: ack }
  - { kind: End, id: end }
edges:
  - { from: start, to: shout }
  - { from: shout, to: ack }
  - { from: ack, to: end }
"#,
    )
    .await;
    // The broken family subscribed first, so it is offered the signal first.
    let broken = rig.start("broken_listener", json!({})).await;
    let healthy = rig.start("listener", json!({})).await;

    let thrower = rig
        .engine
        .start_process("waiting_broadcaster", None, vars(json!({})))
        .await
        .expect("the throwing process commits regardless of its listeners");

    rig.waiting_at(thrower, "ack").await;
    assert!(matches!(rig.state(thrower).await, ProcessState::Running));
    // The failed delivery rolled back on its own; the next family still got it.
    rig.waiting_at(broken, "wait_go").await;
    rig.waiting_at(healthy, "after").await;

    let reached = rig
        .engine
        .signal_event_received("go", vars(json!({})))
        .await
        .unwrap();
    assert_eq!(reached, 0);
    rig.waiting_at(broken, "wait_go").await;
}

// ---------------------------------------------------------------------------
// Terminate and cancel
// ---------------------------------------------------------------------------

const CHILD: &str = r#"
id: child
nodes:
  - { kind: Start, id: start }
  - { kind: UserTask, id: inner }
  - { kind: End, id: end }
edges:
  - { from: start, to: inner }
  - { from: inner, to: end }
"#;

#[tokio::test]
async fn terminate_all_ends_the_whole_family() {
    let rig = Rig::new();
    rig.deploy(CHILD).await;
    rig.deploy(
        r#"
id: kill_switch
nodes:
  - { kind: Start, id: start }
  - { kind: ParallelGateway, id: fork }
  - { kind: UserTask, id: wait_a }
  - { kind: CallActivity, id: delegate, called_process: child }
  - { kind: UserTask, id: trigger }
  - { kind: End, id: stop, terminate_all: true }
edges:
  - { from: start, to: fork }
  - { from: fork, to: wait_a }
  - { from: fork, to: delegate }
  - { from: fork, to: trigger }
  - { from: trigger, to: stop }
"#,
    )
    .await;
    let root = rig.start("kill_switch", json!({})).await;
    let called = rig
        .executions(root)
        .await
        .into_iter()
        .find(|e| e.super_execution_id.is_some())
        .expect("called instance")
        .id;
    rig.waiting_at(root, "inner").await;

    rig.complete_at(root, "trigger", json!({})).await;

    assert!(rig.executions(root).await.is_empty());
    assert!(rig.engine.subscriptions(root).await.unwrap().is_empty());
    for instance in [root, called] {
        assert!(
            matches!(rig.state(instance).await, ProcessState::Terminated { ref node_id, .. } if node_id == "stop")
        );
    }
    let in_root = rig.deletions(root).await;
    let in_called = rig.deletions(called).await;
    assert!(in_root.iter().any(|(node, _)| node.as_deref() == Some("wait_a")));
    assert!(in_called.iter().any(|(node, _)| node.as_deref() == Some("inner")));
    for (node, reason) in in_root.iter().chain(&in_called) {
        assert_eq!(
            reason, "terminated by end event (stop)",
            "deletion of {node:?} carries the terminating node"
        );
    }
}

#[tokio::test]
async fn terminate_inside_a_sub_process_only_ends_that_scope() {
    let rig = Rig::new();
    rig.deploy(
        r#"
id: scoped_kill
nodes:
  - { kind: Start, id: start }
  - { kind: SubProcess, id: sub }
  - { kind: Start, id: s_start, parent: sub }
  - { kind: ParallelGateway, id: s_fork, parent: sub }
  - { kind: UserTask, id: s_wait, parent: sub }
  - { kind: End, id: s_kill, parent: sub, terminate: true }
  - { kind: UserTask, id: after }
edges:
  - { from: start, to: sub }
  - { from: sub, to: after }
  - { from: s_start, to: s_fork }
  - { from: s_fork, to: s_wait }
  - { from: s_fork, to: s_kill }
"#,
    )
    .await;
    let root = rig.start("scoped_kill", json!({})).await;

    rig.waiting_at(root, "after").await;
    assert!(rig.tokens_at(root, "s_wait").await.is_empty());
    assert!(matches!(rig.state(root).await, ProcessState::Running));
    assert!(rig
        .deletions(root)
        .await
        .iter()
        .any(|(node, _)| node.as_deref() == Some("s_wait")));
}

#[tokio::test]
async fn cancelled_instance_is_gone() {
    let rig = Rig::new();
    rig.deploy(CHILD).await;
    let root = rig.start("child", json!({})).await;
    let inner = rig.waiting_at(root, "inner").await;

    rig.engine
        .cancel_process_instance(root, "customer withdrew")
        .await
        .unwrap();

    assert!(rig.executions(root).await.is_empty());
    assert!(
        matches!(rig.state(root).await, ProcessState::Cancelled { ref reason, .. } if reason == "customer withdrew")
    );
    let err = rig.engine.complete(inner, vars(json!({}))).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }), "{err}");
}
