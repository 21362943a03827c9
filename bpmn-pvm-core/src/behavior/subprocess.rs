//! Embedded sub-processes, event sub-process scopes and call activities.

use super::compensation;
use crate::agenda::Operation;
use crate::context::{current_node, CommandContext, InstanceEnd};
use crate::definition::{FlowNode, Mapping, NodeKind};
use crate::error::{EngineError, EngineResult};
use crate::types::*;
use tracing::debug;

/// Turn the arriving execution into a scope and start its inner flow.
pub(crate) fn enter(ctx: &mut CommandContext, node: &FlowNode, execution_id: ExecutionId) -> EngineResult<()> {
    let initial = node.initial.as_deref().ok_or_else(|| {
        EngineError::InvalidDefinition(format!("sub-process '{}' has no start event", node.id))
    })?;
    ctx.tree.get_mut(execution_id)?.is_scope = true;
    let token = ctx.create_child_at(execution_id, initial)?;
    ctx.agenda.plan_continue_process(token);
    Ok(())
}

/// Start the latest deployed version of `called_process` below the caller.
/// The caller waits until that instance ends.
pub(crate) fn call_activity(
    ctx: &mut CommandContext,
    execution_id: ExecutionId,
    called_process: &str,
    inputs: &[Mapping],
) -> EngineResult<()> {
    let called = ctx
        .services
        .definitions
        .latest(called_process)
        .ok_or_else(|| EngineError::DefinitionNotFound(called_process.to_string()))?;
    let mut variables = Variables::new();
    for mapping in inputs {
        variables.insert(mapping.target.clone(), ctx.evaluate(execution_id, &mapping.source)?);
    }
    let instance = ctx.start_process_instance(&called, None, variables, Some(execution_id))?;
    debug!(caller = %execution_id, instance = %instance, called = %called.id, "Called process started");
    Ok(())
}

/// A flow inside `scope_id` ended. Completes the scope once nothing inside
/// it carries control flow any more.
pub(crate) fn scope_flow_ended(ctx: &mut CommandContext, scope_id: ExecutionId) -> EngineResult<()> {
    let mut scope_id = scope_id;
    loop {
        if !ctx.flow_children(scope_id)?.is_empty() {
            return Ok(());
        }
        let scope = ctx.tree.get(scope_id)?;
        if scope.is_process_instance() {
            return ctx.end_process_instance(scope_id, InstanceEnd::Completed);
        }
        if scope.is_multi_instance_root || !scope.is_scope {
            return Ok(());
        }
        let parent = scope.parent_id;
        let (definition, node_id) = current_node(ctx, scope_id)?;
        match definition.node(&node_id)?.kind {
            NodeKind::EventSubProcess => {
                ctx.delete_execution(scope_id, None)?;
                match parent {
                    Some(parent) => scope_id = parent,
                    None => return Ok(()),
                }
            }
            _ => return complete(ctx, scope_id),
        }
    }
}

/// The inner flow of an embedded sub-process is done: keep its
/// compensation handlers, drop what is left inside and continue the same
/// execution past the sub-process.
fn complete(ctx: &mut CommandContext, scope_id: ExecutionId) -> EngineResult<()> {
    let (definition, node_id) = current_node(ctx, scope_id)?;
    let node = definition.node(&node_id)?;
    compensation::snapshot_scope(ctx, &definition, node, scope_id)?;

    let leftovers = ctx.tree.find_children(scope_id)?;
    ctx.delete_all(leftovers, None)?;

    let is_instance = ctx.is_mi_instance(ctx.tree.get(scope_id)?);
    let execution = ctx.tree.get_mut(scope_id)?;
    execution.is_scope = false;
    // Instance locals feed the multi-instance output element.
    if !is_instance {
        execution.variables.clear();
    }
    debug!(execution_id = %scope_id, node_id = %node_id, "Sub-process completed");
    ctx.plan(Operation::TakeOutgoingFlows {
        execution_id: scope_id,
        evaluate_conditions: true,
    });
    Ok(())
}
