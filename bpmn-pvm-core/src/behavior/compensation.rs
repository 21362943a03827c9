//! Compensation: completed activities with a compensation handler leave a
//! `Compensate` subscription on their scope; a compensation throw consumes
//! them and starts the handlers.
//!
//! A completed sub-process without a handler of its own keeps the
//! subscriptions of its inner activities in a snapshot execution
//! (`is_event_scope`) so they can still be compensated from outside.

use super::event::{subscribe, unsubscribe};
use crate::context::CommandContext;
use crate::definition::{BoundaryTrigger, FlowNode, NodeKind, ProcessDefinition};
use crate::error::EngineResult;
use crate::events::HistoryEvent;
use crate::subscription::{EventSubscription, NewSubscription};
use crate::types::*;
use std::collections::VecDeque;
use tracing::{debug, info, warn};
use uuid::Uuid;

fn compensation_handler<'a>(definition: &'a ProcessDefinition, node: &FlowNode) -> Option<&'a NodeId> {
    node.boundaries
        .iter()
        .filter_map(|b| definition.nodes.get(b))
        .find_map(|b| match &b.kind {
            NodeKind::BoundaryEvent {
                trigger: BoundaryTrigger::Compensation { handler },
                ..
            } => Some(handler),
            _ => None,
        })
}

/// Scope that holds compensation for `execution_id`: its nearest scope
/// ancestor, looking through multi-instance roots.
fn compensation_scope(ctx: &CommandContext, execution_id: ExecutionId) -> EngineResult<ExecutionId> {
    let mut scope = ctx.tree.parent_scope(execution_id)?;
    while ctx.tree.get(scope)?.is_multi_instance_root {
        scope = ctx.tree.parent_scope(scope)?;
    }
    Ok(scope)
}

fn compensate_subscription(
    ctx: &CommandContext,
    holder: ExecutionId,
    node_id: &str,
    configuration: Option<String>,
) -> EngineResult<NewSubscription> {
    Ok(NewSubscription {
        kind: EventKind::Compensate,
        event_name: node_id.to_string(),
        correlation_key: None,
        execution_id: holder,
        process_instance_id: ctx.tree.process_instance_of(holder)?,
        node_id: node_id.to_string(),
        configuration,
        due_at: None,
        repeat: 0,
    })
}

/// Called when an activity completes: make it compensable if it has a handler.
pub(crate) fn register_completed(
    ctx: &mut CommandContext,
    definition: &ProcessDefinition,
    node: &FlowNode,
    execution_id: ExecutionId,
) -> EngineResult<()> {
    if compensation_handler(definition, node).is_none() {
        return Ok(());
    }
    let holder = compensation_scope(ctx, execution_id)?;
    let new = compensate_subscription(ctx, holder, &node.id, None)?;
    subscribe(ctx, new)?;
    Ok(())
}

/// Called before a sub-process scope is torn down.
pub(crate) fn snapshot_scope(
    ctx: &mut CommandContext,
    definition: &ProcessDefinition,
    node: &FlowNode,
    scope_id: ExecutionId,
) -> EngineResult<()> {
    let inner = ctx.subscriptions.find_compensation(scope_id, None);
    let nested: Vec<ExecutionId> = ctx
        .tree
        .find_children(scope_id)?
        .into_iter()
        .filter(|c| ctx.tree.find_by_id(*c).is_some_and(|e| e.is_event_scope))
        .collect();
    if inner.is_empty() && nested.is_empty() {
        return Ok(());
    }

    // A sub-process with its own handler is compensated as a whole.
    if compensation_handler(definition, node).is_some() {
        for subscription in inner {
            unsubscribe(ctx, subscription.id);
        }
        return Ok(());
    }

    let holder = compensation_scope(ctx, scope_id)?;
    let snapshot = ctx.tree.create_child(holder)?;
    {
        let execution = ctx.tree.get_mut(snapshot)?;
        execution.node_id = Some(node.id.clone());
        execution.is_scope = true;
        execution.is_event_scope = true;
        execution.is_active = false;
    }
    for subscription in &inner {
        ctx.subscriptions.move_to(subscription.id, snapshot)?;
    }
    for child in nested {
        ctx.tree.reparent(child, snapshot)?;
    }
    let new = compensate_subscription(ctx, holder, &node.id, Some(snapshot.to_string()))?;
    subscribe(ctx, new)?;
    debug!(
        node_id = %node.id,
        snapshot = %snapshot,
        subscriptions = inner.len(),
        "Compensation snapshot kept"
    );
    Ok(())
}

/// Compensate `activity` (or everything) in the scope of the throwing
/// execution, in subscription order. Snapshots expand in place into the
/// subscriptions they kept. Nothing to compensate is not an error.
pub(crate) fn throw(
    ctx: &mut CommandContext,
    definition: &ProcessDefinition,
    node: &FlowNode,
    execution_id: ExecutionId,
    activity: Option<&str>,
) -> EngineResult<usize> {
    let scope = compensation_scope(ctx, execution_id)?;
    let mut pending: VecDeque<EventSubscription> = ctx.subscriptions.find_compensation(scope, activity).into();
    let mut spent_snapshots = Vec::new();
    let mut handlers = 0;

    while let Some(subscription) = pending.pop_front() {
        unsubscribe(ctx, subscription.id);

        let snapshot = subscription
            .configuration
            .as_deref()
            .and_then(|c| Uuid::parse_str(c).ok())
            .filter(|s| ctx.tree.contains(*s));
        if let Some(snapshot) = snapshot {
            for (i, inner) in ctx.subscriptions.find_compensation(snapshot, None).into_iter().enumerate() {
                pending.insert(i, inner);
            }
            spent_snapshots.push(snapshot);
            continue;
        }

        let compensated = definition.node(&subscription.node_id)?;
        let Some(handler) = compensation_handler(definition, compensated) else {
            warn!(node_id = %subscription.node_id, "Compensable activity lost its handler");
            continue;
        };
        let spawned = ctx.create_child_at(scope, handler)?;
        ctx.agenda.plan_continue_process(spawned);
        handlers += 1;
    }
    ctx.delete_all(spent_snapshots, None)?;

    let instance = ctx.tree.process_instance_of(execution_id)?;
    ctx.record(
        instance,
        HistoryEvent::CompensationThrown {
            node_id: node.id.clone(),
            handlers,
        },
    );
    info!(node_id = %node.id, activity = ?activity, handlers, "Compensation thrown");
    Ok(handlers)
}
