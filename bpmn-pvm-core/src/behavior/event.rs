//! Catch and throw events: subscriptions for messages, signals and timers,
//! boundary events, signal broadcast and terminate end events.

use super::{leave, subprocess};
use crate::agenda::{Operation, Trigger};
use crate::context::{CommandContext, InstanceEnd};
use crate::definition::{BoundaryTrigger, FlowNode, NodeKind};
use crate::error::{EngineError, EngineResult};
use crate::events::HistoryEvent;
use crate::subscription::{EventSubscription, NewSubscription};
use crate::types::*;
use chrono::Duration;
use tracing::{debug, info};

// ─── Subscriptions ────────────────────────────────────────────

fn new_subscription(
    ctx: &CommandContext,
    execution_id: ExecutionId,
    node_id: &str,
    kind: EventKind,
    event_name: &str,
) -> EngineResult<NewSubscription> {
    Ok(NewSubscription {
        kind,
        event_name: event_name.to_string(),
        correlation_key: None,
        execution_id,
        process_instance_id: ctx.tree.process_instance_of(execution_id)?,
        node_id: node_id.to_string(),
        configuration: None,
        due_at: None,
        repeat: 0,
    })
}

pub(crate) fn subscribe(ctx: &mut CommandContext, new: NewSubscription) -> EngineResult<SubscriptionId> {
    let instance = new.process_instance_id;
    let (kind, event_name) = (new.kind, new.event_name.clone());
    let id = ctx.subscriptions.create(new)?;
    debug!(subscription_id = %id, kind = %kind, event_name = %event_name, "Subscribed");
    ctx.record(
        instance,
        HistoryEvent::SubscriptionCreated {
            subscription_id: id,
            kind,
            event_name,
        },
    );
    Ok(id)
}

/// Drop one subscription; `None` when it was already consumed.
pub(crate) fn unsubscribe(ctx: &mut CommandContext, id: SubscriptionId) -> Option<EventSubscription> {
    let removed = ctx.subscriptions.delete(id)?;
    record_unsubscribed(ctx, &removed);
    Some(removed)
}

pub(crate) fn unsubscribe_all(ctx: &mut CommandContext, execution_id: ExecutionId) -> EngineResult<()> {
    for removed in ctx.subscriptions.delete_for_execution(execution_id) {
        record_unsubscribed(ctx, &removed);
    }
    Ok(())
}

fn record_unsubscribed(ctx: &mut CommandContext, removed: &EventSubscription) {
    ctx.record(
        removed.process_instance_id,
        HistoryEvent::SubscriptionDeleted {
            subscription_id: removed.id,
            kind: removed.kind,
            event_name: removed.event_name.clone(),
        },
    );
}

pub(crate) fn subscribe_message(
    ctx: &mut CommandContext,
    node: &FlowNode,
    execution_id: ExecutionId,
    message: &str,
    correlation_key: Option<&str>,
) -> EngineResult<()> {
    let mut new = new_subscription(ctx, execution_id, &node.id, EventKind::Message, message)?;
    new.correlation_key = correlation_key
        .map(|expr| ctx.evaluate_key(execution_id, expr))
        .transpose()?;
    subscribe(ctx, new).map(|_| ())
}

/// Timers are named after their node; `repeat` counts further firings.
pub(crate) fn subscribe_timer(
    ctx: &mut CommandContext,
    node: &FlowNode,
    execution_id: ExecutionId,
    duration_ms: u64,
    repeat: u32,
) -> EngineResult<()> {
    let mut new = new_subscription(ctx, execution_id, &node.id, EventKind::Timer, &node.id)?;
    new.due_at = Some(due_after(ctx.now, duration_ms));
    new.repeat = repeat;
    subscribe(ctx, new).map(|_| ())
}

pub(crate) fn subscribe_signal(
    ctx: &mut CommandContext,
    node: &FlowNode,
    execution_id: ExecutionId,
    signal: &str,
) -> EngineResult<()> {
    let new = new_subscription(ctx, execution_id, &node.id, EventKind::Signal, signal)?;
    subscribe(ctx, new).map(|_| ())
}

pub(crate) fn subscribe_boundary(
    ctx: &mut CommandContext,
    boundary: &FlowNode,
    execution_id: ExecutionId,
) -> EngineResult<()> {
    let NodeKind::BoundaryEvent { trigger, .. } = &boundary.kind else {
        return Ok(());
    };
    match trigger {
        BoundaryTrigger::Timer {
            duration_ms,
            repeat,
        } => subscribe_timer(ctx, boundary, execution_id, *duration_ms, *repeat),
        BoundaryTrigger::Message {
            message,
            correlation_key,
        } => subscribe_message(ctx, boundary, execution_id, message, correlation_key.as_deref()),
        BoundaryTrigger::Signal { signal } => subscribe_signal(ctx, boundary, execution_id, signal),
        BoundaryTrigger::Error { .. } | BoundaryTrigger::Compensation { .. } => Ok(()),
    }
}

fn due_after(now: Timestamp, duration_ms: u64) -> Timestamp {
    now + Duration::milliseconds(i64::try_from(duration_ms).unwrap_or(i64::MAX))
}

// ─── Signal throw ─────────────────────────────────────────────

/// Trigger every signal wait in this family now; other families receive
/// the signal after commit.
pub(crate) fn throw_signal(
    ctx: &mut CommandContext,
    execution_id: ExecutionId,
    signal: &str,
) -> EngineResult<()> {
    let waiting = ctx.subscriptions.find_by_event(EventKind::Signal, signal, None);
    debug!(signal, receivers = waiting.len(), "Signal thrown");
    for subscription in waiting {
        ctx.agenda.plan_trigger_execution(
            subscription.execution_id,
            Trigger {
                subscription_id: Some(subscription.id),
                variables: Variables::new(),
            },
        );
    }
    ctx.throw_signal_later(signal, Variables::new());
    leave(ctx, execution_id);
    Ok(())
}

// ─── Boundary events ──────────────────────────────────────────

pub(crate) fn boundary_triggered(
    ctx: &mut CommandContext,
    node: &FlowNode,
    boundary: &BoundaryTrigger,
    interrupting: bool,
    execution_id: ExecutionId,
    trigger: Trigger,
) -> EngineResult<()> {
    let fired = match trigger.subscription_id {
        Some(id) => match ctx.subscriptions.find_by_id(id).cloned() {
            Some(subscription) => Some(subscription),
            None => {
                debug!(subscription_id = %id, "Boundary subscription already consumed");
                return Ok(());
            }
        },
        None => None,
    };

    if interrupting {
        unsubscribe_all(ctx, execution_id)?;
        ctx.tree.set_variables(execution_id, &trigger.variables)?;
        info!(boundary = %node.id, execution_id = %execution_id, "Interrupting boundary event fired");
        ctx.plan(Operation::DestroyScope { execution_id });
        return Ok(());
    }

    // Non-interrupting: the host keeps running and the boundary keeps
    // waiting, except for timers that have used up their repeats.
    if let Some(subscription) = fired {
        match boundary {
            BoundaryTrigger::Timer { duration_ms, .. } if subscription.repeat > 0 => {
                let due = due_after(ctx.now, *duration_ms);
                ctx.subscriptions.reschedule(subscription.id, due)?;
            }
            BoundaryTrigger::Timer { .. } => {
                unsubscribe(ctx, subscription.id);
            }
            _ => {}
        }
    }
    let host = ctx
        .tree
        .get(execution_id)?
        .parent_id
        .ok_or(EngineError::MissingScope(execution_id))?;
    let scope = ctx.tree.parent_scope(host)?;
    let spawned = ctx.create_child_at(scope, &node.id)?;
    ctx.tree.set_variables(spawned, &trigger.variables)?;
    debug!(boundary = %node.id, spawned = %spawned, "Non-interrupting boundary event fired");
    leave(ctx, spawned);
    Ok(())
}

// ─── Terminate ────────────────────────────────────────────────

/// Terminate the enclosing scope, or with `terminate_all` the whole
/// process family including called instances.
pub(crate) fn terminate(
    ctx: &mut CommandContext,
    node: &FlowNode,
    execution_id: ExecutionId,
    terminate_all: bool,
) -> EngineResult<()> {
    let reason = DeleteReason::TerminateEndEvent {
        node_id: node.id.clone(),
    };

    if terminate_all {
        let root = ctx.tree.get(execution_id)?.root_process_instance_id;
        let removed = ctx.delete_execution(root, Some(&reason))?;
        let at = ctx.now;
        ctx.close_removed_instances(&removed, |instance| {
            (
                ProcessState::Terminated {
                    node_id: node.id.clone(),
                    at,
                },
                HistoryEvent::ProcessTerminated {
                    instance_id: instance.id,
                    node_id: node.id.clone(),
                    at,
                },
            )
        });
        info!(root = %root, node_id = %node.id, removed = removed.len(), "Process family terminated");
        return Ok(());
    }

    let scope = ctx.tree.parent_scope(execution_id)?;
    let doomed: Vec<ExecutionId> = ctx
        .tree
        .find_children(scope)?
        .into_iter()
        .filter(|c| ctx.tree.find_by_id(*c).is_some_and(|e| !e.is_event_scope))
        .collect();
    ctx.interrupt(doomed, &reason)?;

    if ctx.tree.get(scope)?.is_process_instance() {
        ctx.end_process_instance(
            scope,
            InstanceEnd::Terminated {
                node_id: node.id.clone(),
            },
        )
    } else {
        subprocess::scope_flow_ended(ctx, scope)
    }
}
