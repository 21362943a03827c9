//! Gateway joins and event-based gateway resolution.
//!
//! Joins park the arriving execution inactive at the gateway and bump the
//! version of the enclosing scope, so two transactions arriving at the
//! same join from one snapshot cannot both commit.

use super::leave;
use crate::agenda::Operation;
use crate::context::CommandContext;
use crate::definition::{FlowNode, NodeKind, ProcessDefinition};
use crate::error::{EngineError, EngineResult};
use crate::events::HistoryEvent;
use crate::types::*;
use tracing::debug;

/// Park `execution_id` at the join and lock the enclosing scope.
fn arrive(ctx: &mut CommandContext, execution_id: ExecutionId) -> EngineResult<ExecutionId> {
    ctx.tree.get_mut(execution_id)?.is_active = false;
    let scope = ctx.tree.parent_scope(execution_id)?;
    ctx.tree.force_version_bump(scope)?;
    ctx.tree
        .get(execution_id)?
        .parent_id
        .ok_or(EngineError::MissingScope(execution_id))
}

/// Siblings of `execution_id` (itself included) parked at `gateway_id`.
fn parked_at(
    ctx: &CommandContext,
    parent: ExecutionId,
    gateway_id: &str,
) -> EngineResult<Vec<ExecutionId>> {
    Ok(ctx
        .tree
        .find_children(parent)?
        .into_iter()
        .filter(|c| {
            ctx.tree.find_by_id(*c).is_some_and(|e| {
                !e.is_active && !e.is_scope && e.node_id.as_deref() == Some(gateway_id)
            })
        })
        .collect())
}

/// Merge the parked siblings into `execution_id` and continue.
fn fire(
    ctx: &mut CommandContext,
    gateway_id: &str,
    execution_id: ExecutionId,
    merged: Vec<ExecutionId>,
    evaluate_conditions: bool,
) -> EngineResult<()> {
    let merged: Vec<ExecutionId> = merged.into_iter().filter(|e| *e != execution_id).collect();
    debug!(gateway_id, execution_id = %execution_id, merged = merged.len(), "Join fired");
    ctx.delete_all(merged, None)?;
    ctx.tree.get_mut(execution_id)?.is_active = true;
    ctx.plan(Operation::TakeOutgoingFlows {
        execution_id,
        evaluate_conditions,
    });
    Ok(())
}

// ─── Parallel ─────────────────────────────────────────────────

/// Fork to every outgoing flow; with several incoming flows, first wait
/// until one token per incoming flow has arrived.
pub(crate) fn parallel_gateway(
    ctx: &mut CommandContext,
    node: &FlowNode,
    execution_id: ExecutionId,
) -> EngineResult<()> {
    let expected = node.incoming.len();
    if expected <= 1 {
        ctx.plan(Operation::TakeOutgoingFlows {
            execution_id,
            evaluate_conditions: false,
        });
        return Ok(());
    }

    let parent = arrive(ctx, execution_id)?;
    let joined = parked_at(ctx, parent, &node.id)?;
    let instance = ctx.tree.process_instance_of(execution_id)?;
    ctx.record(
        instance,
        HistoryEvent::JoinArrived {
            gateway_id: node.id.clone(),
            execution_id,
            joined: joined.len(),
            expected,
        },
    );
    if joined.len() < expected {
        debug!(gateway_id = %node.id, joined = joined.len(), expected, "Waiting at parallel join");
        return Ok(());
    }

    // Surplus arrivals (a branch that looped) wait for the next round.
    let merged: Vec<ExecutionId> = joined
        .into_iter()
        .filter(|e| *e != execution_id)
        .take(expected - 1)
        .collect();
    fire(ctx, &node.id, execution_id, merged, false)
}

// ─── Inclusive ────────────────────────────────────────────────

/// Fork to every flow whose condition holds. As a join, wait while any
/// sibling is still active at the gateway or could still reach it.
pub(crate) fn inclusive_gateway(
    ctx: &mut CommandContext,
    definition: &ProcessDefinition,
    node: &FlowNode,
    execution_id: ExecutionId,
) -> EngineResult<()> {
    if node.incoming.len() <= 1 {
        leave(ctx, execution_id);
        return Ok(());
    }

    let parent = arrive(ctx, execution_id)?;
    let instance = ctx.tree.process_instance_of(execution_id)?;
    let joined = parked_at(ctx, parent, &node.id)?.len();
    ctx.record(
        instance,
        HistoryEvent::JoinArrived {
            gateway_id: node.id.clone(),
            execution_id,
            joined,
            expected: node.incoming.len(),
        },
    );
    try_fire_inclusive(ctx, definition, &node.id, execution_id).map(|_| ())
}

fn try_fire_inclusive(
    ctx: &mut CommandContext,
    definition: &ProcessDefinition,
    gateway_id: &str,
    execution_id: ExecutionId,
) -> EngineResult<bool> {
    let parent = ctx
        .tree
        .get(execution_id)?
        .parent_id
        .ok_or(EngineError::MissingScope(execution_id))?;
    if inclusive_join_blocked(ctx, definition, gateway_id, parent, execution_id)? {
        debug!(gateway_id, execution_id = %execution_id, "Waiting at inclusive join");
        return Ok(false);
    }
    let merged = parked_at(ctx, parent, gateway_id)?;
    fire(ctx, gateway_id, execution_id, merged, true)?;
    Ok(true)
}

fn inclusive_join_blocked(
    ctx: &CommandContext,
    definition: &ProcessDefinition,
    gateway_id: &str,
    parent: ExecutionId,
    execution_id: ExecutionId,
) -> EngineResult<bool> {
    for sibling in ctx.tree.find_children(parent)? {
        if sibling == execution_id {
            continue;
        }
        let execution = ctx.tree.get(sibling)?;
        if execution.is_event_scope || ctx.is_boundary_execution(execution) {
            continue;
        }
        let Some(node_id) = execution.node_id.as_deref() else {
            continue;
        };
        let blocking = if node_id == gateway_id {
            execution.is_active
        } else {
            definition.can_reach(node_id, gateway_id)
        };
        if blocking {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Re-check parked inclusive joins once the agenda has drained. Fires at
/// most one join per call; returns whether it did.
pub(crate) fn execute_inactive_joins(ctx: &mut CommandContext) -> EngineResult<bool> {
    let mut parked: Vec<(Timestamp, ExecutionId)> = ctx
        .tree
        .executions()
        .filter(|e| !e.is_active && !e.is_scope && !e.is_ended && e.node_id.is_some())
        .map(|e| (e.created_at, e.id))
        .collect();
    parked.sort();

    for (_, execution_id) in parked {
        let definition = ctx.definition_of(execution_id)?;
        let node_id = ctx.node_id_of(execution_id)?;
        let node = definition.node(&node_id)?;
        if !matches!(node.kind, NodeKind::InclusiveGateway) || node.incoming.len() <= 1 {
            continue;
        }
        if try_fire_inclusive(ctx, &definition, &node_id, execution_id)? {
            return Ok(true);
        }
    }
    Ok(false)
}

// ─── Event-based ──────────────────────────────────────────────

/// The first catch event behind an event-based gateway to fire wins; the
/// other waits spawned by the same gateway arrival are removed. Waits of
/// another arrival at the same gateway run their own race.
pub(crate) fn cancel_event_gateway_siblings(
    ctx: &mut CommandContext,
    definition: &ProcessDefinition,
    node: &FlowNode,
    execution_id: ExecutionId,
) -> EngineResult<()> {
    let winner = ctx.tree.get(execution_id)?;
    let (Some(race), Some(parent)) = (winner.race_id, winner.parent_id) else {
        return Ok(());
    };
    let Some(gateway) = node
        .incoming
        .iter()
        .filter_map(|&index| definition.flow(index).ok())
        .filter_map(|flow| definition.nodes.get(&flow.source))
        .find(|source| matches!(source.kind, NodeKind::EventBasedGateway))
    else {
        return Ok(());
    };

    ctx.tree.get_mut(execution_id)?.race_id = None;
    let losers: Vec<ExecutionId> = ctx
        .tree
        .find_children(parent)?
        .into_iter()
        .filter(|c| *c != execution_id)
        .filter(|c| ctx.tree.find_by_id(*c).is_some_and(|e| e.race_id == Some(race)))
        .collect();
    if losers.is_empty() {
        return Ok(());
    }
    debug!(
        gateway_id = %gateway.id,
        winner = %execution_id,
        cancelled = losers.len(),
        "Event-based gateway resolved"
    );
    let reason = DeleteReason::EventGatewayCancelled {
        gateway_id: gateway.id.clone(),
        winner_id: node.id.clone(),
    };
    ctx.interrupt(losers, &reason)?;
    Ok(())
}
