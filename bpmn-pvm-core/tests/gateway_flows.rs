//! Sequence flow routing: parallel, exclusive, inclusive and event-based
//! gateways, and joins under concurrent transactions.

mod common;

use bpmn_pvm_core::{EngineConfig, EngineError, HistoryEvent, HistoryLevel, ProcessState};
use common::{vars, Rig};
use serde_json::json;

const FORK_JOIN: &str = r#"
id: fork_join
nodes:
  - { kind: Start, id: start }
  - { kind: ParallelGateway, id: fork }
  - { kind: UserTask, id: a }
  - { kind: UserTask, id: b }
  - { kind: ParallelGateway, id: join }
  - { kind: UserTask, id: after }
  - { kind: End, id: end }
edges:
  - { from: start, to: fork }
  - { from: fork, to: a }
  - { from: fork, to: b }
  - { from: a, to: join }
  - { from: b, to: join }
  - { from: join, to: after }
  - { from: after, to: end }
"#;

#[tokio::test]
async fn parallel_fork_waits_for_every_branch() {
    let rig = Rig::with_config(EngineConfig {
        history_level: HistoryLevel::Full,
        ..EngineConfig::default()
    });
    rig.deploy(FORK_JOIN).await;
    let root = rig.start("fork_join", json!({})).await;

    assert_eq!(rig.executions(root).await.len(), 3);
    rig.waiting_at(root, "a").await;
    rig.waiting_at(root, "b").await;

    rig.complete_at(root, "a", json!({})).await;
    assert!(rig.tokens_at(root, "after").await.is_empty());
    rig.assert_tree(root).await;

    rig.complete_at(root, "b", json!({})).await;
    rig.waiting_at(root, "after").await;
    assert_eq!(rig.executions(root).await.len(), 2);

    let arrivals: Vec<(usize, usize)> = rig
        .history(root)
        .await
        .into_iter()
        .filter_map(|e| match e {
            HistoryEvent::JoinArrived { joined, expected, .. } => Some((joined, expected)),
            _ => None,
        })
        .collect();
    assert_eq!(arrivals, vec![(1, 2), (2, 2)]);

    rig.complete_at(root, "after", json!({})).await;
    assert!(matches!(rig.state(root).await, ProcessState::Completed { .. }));
    assert!(rig.executions(root).await.is_empty());
}

#[tokio::test]
async fn parallel_join_fires_on_the_last_arrival_in_any_order() {
    let rig = Rig::with_config(EngineConfig {
        history_level: HistoryLevel::Full,
        ..EngineConfig::default()
    });
    rig.deploy(
        r#"
id: three_way
nodes:
  - { kind: Start, id: start }
  - { kind: ParallelGateway, id: fork }
  - { kind: UserTask, id: a }
  - { kind: UserTask, id: b }
  - { kind: SubProcess, id: sub }
  - { kind: Start, id: sub_start, parent: sub }
  - { kind: UserTask, id: c, parent: sub }
  - { kind: End, id: sub_end, parent: sub }
  - { kind: ParallelGateway, id: join }
  - { kind: UserTask, id: after }
edges:
  - { from: start, to: fork }
  - { from: fork, to: a }
  - { from: fork, to: b }
  - { from: fork, to: sub }
  - { from: sub_start, to: c }
  - { from: c, to: sub_end }
  - { from: a, to: join }
  - { from: b, to: join }
  - { from: sub, to: join }
  - { from: join, to: after }
"#,
    )
    .await;
    let root = rig.start("three_way", json!({})).await;
    // root, a, b, the sub-process scope and c inside it
    assert_eq!(rig.executions(root).await.len(), 5);

    rig.complete_at(root, "c", json!({})).await;
    assert_eq!(rig.executions(root).await.len(), 4);
    rig.complete_at(root, "b", json!({})).await;
    assert_eq!(rig.executions(root).await.len(), 4);
    assert!(rig.tokens_at(root, "after").await.is_empty());
    rig.assert_tree(root).await;

    rig.complete_at(root, "a", json!({})).await;
    rig.waiting_at(root, "after").await;
    assert_eq!(rig.executions(root).await.len(), 2);

    let arrivals: Vec<(usize, usize)> = rig
        .history(root)
        .await
        .into_iter()
        .filter_map(|e| match e {
            HistoryEvent::JoinArrived { joined, expected, .. } => Some((joined, expected)),
            _ => None,
        })
        .collect();
    assert_eq!(arrivals, vec![(1, 3), (2, 3), (3, 3)]);
    rig.assert_tree(root).await;
}

#[tokio::test]
async fn concurrent_arrivals_at_a_join_conflict() {
    let rig = Rig::new();
    rig.deploy(FORK_JOIN).await;
    let root = rig.start("fork_join", json!({})).await;
    let a = rig.waiting_at(root, "a").await;
    let b = rig.waiting_at(root, "b").await;

    // Both transactions read the same snapshot.
    let mut first = rig.engine.begin(root).await.unwrap();
    let mut second = rig.engine.begin(root).await.unwrap();
    first.complete(a, vars(json!({}))).unwrap();
    second.complete(b, vars(json!({}))).unwrap();

    rig.engine.commit(first).await.unwrap();
    let err = rig.engine.commit(second).await.unwrap_err();
    assert!(matches!(err, EngineError::ConcurrentModification { .. }), "{err}");

    // Nothing of the losing transaction was written; a retry succeeds.
    assert!(rig.tokens_at(root, "after").await.is_empty());
    rig.engine.complete(b, vars(json!({}))).await.unwrap();
    rig.waiting_at(root, "after").await;
    rig.assert_tree(root).await;
}

const ROUTING: &str = r#"
id: routing
nodes:
  - { kind: Start, id: start }
  - { kind: ExclusiveGateway, id: gw }
  - { kind: UserTask, id: big }
  - { kind: UserTask, id: medium }
  - { kind: UserTask, id: small }
edges:
  - { from: start, to: gw }
  - { from: gw, to: big, condition: "${amount > 100}" }
  - { from: gw, to: medium, condition: "${amount > 10}" }
  - { from: gw, to: small, is_default: true }
"#;

#[tokio::test]
async fn exclusive_gateway_takes_first_true_flow_in_order() {
    let rig = Rig::new();
    rig.deploy(ROUTING).await;

    for (amount, expected) in [(500, "big"), (50, "medium"), (1, "small")] {
        let root = rig.start("routing", json!({ "amount": amount })).await;
        rig.waiting_at(root, expected).await;
        assert_eq!(rig.executions(root).await.len(), 2, "amount {amount}");
    }
}

#[tokio::test]
async fn exclusive_gateway_without_match_or_default_fails() {
    let rig = Rig::new();
    rig.deploy(
        r#"
id: strict
nodes:
  - { kind: Start, id: start }
  - { kind: ExclusiveGateway, id: gw }
  - { kind: UserTask, id: big }
edges:
  - { from: start, to: gw }
  - { from: gw, to: big, condition: "${amount > 100}" }
"#,
    )
    .await;

    let err = rig
        .engine
        .start_process("strict", None, vars(json!({ "amount": 1 })))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoOutgoingFlow { ref node_id } if node_id == "gw"), "{err}");
}

const INCLUSIVE: &str = r#"
id: inclusive
nodes:
  - { kind: Start, id: start }
  - { kind: InclusiveGateway, id: split }
  - { kind: UserTask, id: a }
  - { kind: UserTask, id: b }
  - { kind: InclusiveGateway, id: merge }
  - { kind: UserTask, id: done }
edges:
  - { from: start, to: split }
  - { from: split, to: a, condition: "${wantA}" }
  - { from: split, to: b, condition: "${wantB}" }
  - { from: a, to: merge }
  - { from: b, to: merge }
  - { from: merge, to: done }
"#;

#[tokio::test]
async fn inclusive_join_waits_only_for_started_branches() {
    let rig = Rig::new();
    rig.deploy(INCLUSIVE).await;

    let single = rig.start("inclusive", json!({ "wantA": true, "wantB": false })).await;
    assert!(rig.tokens_at(single, "b").await.is_empty());
    rig.complete_at(single, "a", json!({})).await;
    rig.waiting_at(single, "done").await;

    let both = rig.start("inclusive", json!({ "wantA": true, "wantB": true })).await;
    rig.complete_at(both, "a", json!({})).await;
    assert!(rig.tokens_at(both, "done").await.is_empty());
    rig.complete_at(both, "b", json!({})).await;
    rig.waiting_at(both, "done").await;
    assert_eq!(rig.executions(both).await.len(), 2);
    rig.assert_tree(both).await;
}

#[tokio::test]
async fn inclusive_join_waits_for_a_looping_sibling() {
    let rig = Rig::new();
    rig.deploy(
        r#"
id: looping
nodes:
  - { kind: Start, id: start }
  - { kind: InclusiveGateway, id: split }
  - { kind: UserTask, id: a }
  - { kind: UserTask, id: rework }
  - { kind: ExclusiveGateway, id: check }
  - { kind: InclusiveGateway, id: merge }
  - { kind: UserTask, id: done }
edges:
  - { from: start, to: split }
  - { from: split, to: a }
  - { from: split, to: rework }
  - { from: rework, to: check }
  - { from: check, to: rework, condition: "${again}" }
  - { from: check, to: merge, is_default: true }
  - { from: a, to: merge }
  - { from: merge, to: done }
"#,
    )
    .await;
    let root = rig.start("looping", json!({})).await;

    rig.complete_at(root, "a", json!({})).await;
    rig.complete_at(root, "rework", json!({ "again": true })).await;
    assert!(rig.tokens_at(root, "done").await.is_empty());

    rig.complete_at(root, "rework", json!({ "again": false })).await;
    rig.waiting_at(root, "done").await;
    assert_eq!(rig.executions(root).await.len(), 2);
}

#[tokio::test]
async fn inclusive_join_fires_once_the_blocking_branch_dies() {
    let rig = Rig::new();
    rig.deploy(
        r#"
id: dying_branch
nodes:
  - { kind: Start, id: start }
  - { kind: InclusiveGateway, id: split }
  - { kind: UserTask, id: a }
  - { kind: UserTask, id: b }
  - { kind: ExclusiveGateway, id: decide }
  - { kind: End, id: drop }
  - { kind: InclusiveGateway, id: merge }
  - { kind: UserTask, id: done }
edges:
  - { from: start, to: split }
  - { from: split, to: a }
  - { from: split, to: b }
  - { from: a, to: decide }
  - { from: decide, to: merge, condition: "${go}" }
  - { from: decide, to: drop, is_default: true }
  - { from: b, to: merge }
  - { from: merge, to: done }
"#,
    )
    .await;
    let root = rig.start("dying_branch", json!({})).await;

    rig.complete_at(root, "b", json!({})).await;
    assert!(rig.tokens_at(root, "done").await.is_empty());

    // The parked arrival at `merge` is re-examined after the agenda drains.
    rig.complete_at(root, "a", json!({ "go": false })).await;
    rig.waiting_at(root, "done").await;
    rig.assert_tree(root).await;
}

const RACE: &str = r#"
id: race
nodes:
  - { kind: Start, id: start }
  - { kind: EventBasedGateway, id: gw }
  - { kind: MessageCatch, id: paid, message: payment, correlation_key: "${orderId}" }
  - { kind: TimerCatch, id: timeout, duration_ms: 60000 }
  - { kind: UserTask, id: ship }
  - { kind: UserTask, id: expire }
edges:
  - { from: start, to: gw }
  - { from: gw, to: paid }
  - { from: gw, to: timeout }
  - { from: paid, to: ship }
  - { from: timeout, to: expire }
"#;

#[tokio::test]
async fn event_gateway_message_wins_and_cancels_timer() {
    let rig = Rig::new();
    rig.deploy(RACE).await;
    let root = rig.start("race", json!({ "orderId": "o-1" })).await;
    assert_eq!(rig.engine.subscriptions(root).await.unwrap().len(), 2);

    let receiver = rig
        .engine
        .message_received("payment", Some("o-1"), vars(json!({ "amount": 5 })))
        .await
        .unwrap();
    assert!(receiver.is_some());

    rig.waiting_at(root, "ship").await;
    assert!(rig.tokens_at(root, "timeout").await.is_empty());
    assert!(rig.engine.subscriptions(root).await.unwrap().is_empty());
    assert_eq!(rig.variable(root, "amount").await, Some(json!(5)));

    let deletions = rig.deletions(root).await;
    assert_eq!(deletions.len(), 1);
    assert_eq!(deletions[0].0.as_deref(), Some("timeout"));
    assert!(deletions[0].1.contains("event gateway (gw) resolved by paid"));

    let again = rig
        .engine
        .message_received("payment", Some("o-1"), vars(json!({})))
        .await
        .unwrap();
    assert_eq!(again, None);
}

#[tokio::test]
async fn event_gateway_timer_wins() {
    let rig = Rig::new();
    rig.deploy(RACE).await;
    let root = rig.start("race", json!({ "orderId": "o-2" })).await;

    let later = chrono::Utc::now() + chrono::Duration::hours(1);
    let due = rig.engine.due_timers(later).await.unwrap();
    assert_eq!(due.len(), 1);
    assert!(rig.engine.due_timers(chrono::Utc::now()).await.unwrap().is_empty());

    assert!(rig.engine.fire_timer(due[0].id).await.unwrap());
    rig.waiting_at(root, "expire").await;
    assert!(!rig.engine.fire_timer(due[0].id).await.unwrap());

    let late = rig
        .engine
        .message_received("payment", Some("o-2"), vars(json!({})))
        .await
        .unwrap();
    assert_eq!(late, None);
}

#[tokio::test]
async fn two_arrivals_at_one_event_gateway_race_separately() {
    let rig = Rig::new();
    rig.deploy(
        r#"
id: double_race
nodes:
  - { kind: Start, id: start }
  - { kind: ParallelGateway, id: fork }
  - { kind: NoneThrow, id: x1 }
  - { kind: NoneThrow, id: x2 }
  - { kind: EventBasedGateway, id: gw }
  - { kind: MessageCatch, id: paid, message: payment }
  - { kind: TimerCatch, id: timeout, duration_ms: 60000 }
  - { kind: UserTask, id: ship }
  - { kind: UserTask, id: expire }
edges:
  - { from: start, to: fork }
  - { from: fork, to: x1 }
  - { from: fork, to: x2 }
  - { from: x1, to: gw }
  - { from: x2, to: gw }
  - { from: gw, to: paid }
  - { from: gw, to: timeout }
  - { from: paid, to: ship }
  - { from: timeout, to: expire }
"#,
    )
    .await;
    let root = rig.start("double_race", json!({})).await;
    assert_eq!(rig.tokens_at(root, "paid").await.len(), 2);
    assert_eq!(rig.tokens_at(root, "timeout").await.len(), 2);

    rig.engine
        .message_received("payment", None, vars(json!({})))
        .await
        .unwrap()
        .expect("one race takes the message");

    // Only the winning race lost its timer.
    rig.waiting_at(root, "ship").await;
    let paid = rig.waiting_at(root, "paid").await;
    let timeout = rig.waiting_at(root, "timeout").await;
    let deletions = rig.deletions(root).await;
    assert_eq!(deletions.len(), 1);
    assert_eq!(deletions[0].0.as_deref(), Some("timeout"));

    // The surviving race resolves on its own.
    let timer = rig
        .engine
        .subscriptions(root)
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.execution_id == timeout)
        .expect("surviving timer")
        .id;
    assert!(rig.engine.fire_timer(timer).await.unwrap());
    rig.waiting_at(root, "expire").await;
    assert!(rig.tokens_at(root, "paid").await.is_empty());
    assert!(rig
        .deletions(root)
        .await
        .iter()
        .any(|(node, reason)| node.as_deref() == Some("paid")
            && reason == "event gateway (gw) resolved by timeout"));
    assert!(rig.executions(root).await.iter().all(|e| e.id != paid));
    assert_eq!(rig.executions(root).await.len(), 3);
    rig.assert_tree(root).await;
}
