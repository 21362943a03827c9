//! Multi-instance activities.
//!
//! The arriving execution becomes the multi-instance root (a scope, kept
//! inactive) holding `nrOfInstances`, `nrOfCompletedInstances` and
//! `nrOfActiveInstances`. Each instance is a child positioned at the same
//! node with a local `loopCounter` and, for collections, the element
//! variable. Parallel activities create every instance up front;
//! sequential ones create the next instance when the previous completes.

use super::{create_boundary_executions, leave};
use crate::agenda::Operation;
use crate::context::CommandContext;
use crate::definition::{FlowNode, MultiInstance, ProcessDefinition};
use crate::error::{EngineError, EngineResult};
use crate::events::HistoryEvent;
use crate::types::*;
use serde_json::json;
use tracing::debug;

pub const NR_OF_INSTANCES: &str = "nrOfInstances";
pub const NR_OF_COMPLETED_INSTANCES: &str = "nrOfCompletedInstances";
pub const NR_OF_ACTIVE_INSTANCES: &str = "nrOfActiveInstances";
pub const LOOP_COUNTER: &str = "loopCounter";

fn settings(node: &FlowNode) -> EngineResult<&MultiInstance> {
    node.multi_instance.as_ref().ok_or_else(|| {
        EngineError::InvalidState(format!("node '{}' is not a multi-instance activity", node.id))
    })
}

/// Instance count, plus the collection when iterating one.
fn resolve(
    ctx: &CommandContext,
    execution_id: ExecutionId,
    settings: &MultiInstance,
) -> EngineResult<(usize, Option<Vec<Value>>)> {
    if let Some(cardinality) = &settings.cardinality {
        return Ok((ctx.evaluate_count(execution_id, cardinality)?, None));
    }
    let Some(collection) = &settings.collection else {
        return Err(EngineError::InvalidDefinition(
            "multi-instance needs a cardinality or a collection".to_string(),
        ));
    };
    match ctx.evaluate(execution_id, collection)? {
        Value::Array(items) => Ok((items.len(), Some(items))),
        other => Err(EngineError::Expression {
            expression: collection.clone(),
            message: format!("expected a list, got {other}"),
        }),
    }
}

fn counter(ctx: &CommandContext, root: ExecutionId, name: &str) -> EngineResult<u64> {
    Ok(ctx
        .tree
        .get(root)?
        .variables
        .get(name)
        .and_then(Value::as_u64)
        .unwrap_or(0))
}

fn set_counter(ctx: &mut CommandContext, root: ExecutionId, name: &str, value: u64) -> EngineResult<()> {
    ctx.tree.set_variable_local(root, name, json!(value))
}

fn create_instance(
    ctx: &mut CommandContext,
    settings: &MultiInstance,
    root: ExecutionId,
    index: usize,
    collection: Option<&[Value]>,
) -> EngineResult<ExecutionId> {
    let instance = ctx.tree.create_child(root)?;
    ctx.tree.set_variable_local(instance, LOOP_COUNTER, json!(index))?;
    if let (Some(name), Some(items)) = (&settings.element_variable, collection) {
        let element = items.get(index).cloned().unwrap_or(Value::Null);
        ctx.tree.set_variable_local(instance, name, element)?;
    }
    Ok(instance)
}

/// Turn the arriving execution into the multi-instance root and start the
/// first instance(s).
pub(crate) fn begin(
    ctx: &mut CommandContext,
    definition: &ProcessDefinition,
    node: &FlowNode,
    execution_id: ExecutionId,
) -> EngineResult<()> {
    let settings = settings(node)?;
    let (count, collection) = resolve(ctx, execution_id, settings)?;
    {
        let root = ctx.tree.get_mut(execution_id)?;
        root.is_scope = true;
        root.is_multi_instance_root = true;
        root.is_active = false;
    }
    set_counter(ctx, execution_id, NR_OF_INSTANCES, count as u64)?;
    set_counter(ctx, execution_id, NR_OF_COMPLETED_INSTANCES, 0)?;
    set_counter(ctx, execution_id, NR_OF_ACTIVE_INSTANCES, 0)?;
    create_boundary_executions(ctx, definition, node, execution_id)?;
    debug!(
        node_id = %node.id,
        count,
        sequential = settings.sequential,
        "Multi-instance started"
    );

    if count == 0 {
        return finish(ctx, node, execution_id);
    }

    let first_batch = if settings.sequential { 1 } else { count };
    let mut instances = Vec::with_capacity(first_batch);
    for index in 0..first_batch {
        instances.push(create_instance(ctx, settings, execution_id, index, collection.as_deref())?);
    }
    set_counter(ctx, execution_id, NR_OF_ACTIVE_INSTANCES, instances.len() as u64)?;
    for instance in instances {
        ctx.plan(Operation::ContinueMultiInstance {
            execution_id: instance,
        });
    }
    Ok(())
}

/// One instance finished its activity.
pub(crate) fn instance_completed(
    ctx: &mut CommandContext,
    node: &FlowNode,
    instance_id: ExecutionId,
) -> EngineResult<()> {
    let settings = settings(node)?;
    let instance = ctx.tree.get(instance_id)?;
    let root = instance.parent_id.ok_or(EngineError::MissingScope(instance_id))?;
    let index = instance
        .variables
        .get(LOOP_COUNTER)
        .and_then(Value::as_u64)
        .unwrap_or(0);

    if let Some(output) = &settings.output_element {
        let value = ctx.evaluate(instance_id, output)?;
        let slot = u32::try_from(index).unwrap_or(u32::MAX);
        ctx.tree.get_mut(root)?.multi_instance_outputs.insert(slot, value);
    }

    let total = counter(ctx, root, NR_OF_INSTANCES)?;
    let completed = counter(ctx, root, NR_OF_COMPLETED_INSTANCES)? + 1;
    let active = counter(ctx, root, NR_OF_ACTIVE_INSTANCES)?.saturating_sub(1);
    set_counter(ctx, root, NR_OF_COMPLETED_INSTANCES, completed)?;
    set_counter(ctx, root, NR_OF_ACTIVE_INSTANCES, active)?;

    let condition_met = match &settings.completion_condition {
        Some(condition) => ctx.evaluate_bool(instance_id, condition)?,
        None => false,
    };
    ctx.delete_execution(instance_id, None)?;

    if completed >= total || condition_met {
        let remaining = ctx.flow_children(root)?;
        if !remaining.is_empty() {
            debug!(node_id = %node.id, cancelled = remaining.len(), "Completion condition met");
            let reason = DeleteReason::MultiInstanceCompleted {
                node_id: node.id.clone(),
            };
            ctx.interrupt(remaining, &reason)?;
        }
        return finish(ctx, node, root);
    }

    if settings.sequential {
        // The collection is read again so the loop sees updates made by
        // earlier instances.
        let (_, collection) = resolve(ctx, root, settings)?;
        let next = create_instance(ctx, settings, root, (index + 1) as usize, collection.as_deref())?;
        set_counter(ctx, root, NR_OF_ACTIVE_INSTANCES, 1)?;
        ctx.plan(Operation::ContinueMultiInstance { execution_id: next });
    }
    Ok(())
}

/// Publish the output collection and continue the root past the activity.
fn finish(ctx: &mut CommandContext, node: &FlowNode, root: ExecutionId) -> EngineResult<()> {
    let settings = settings(node)?;
    let total = counter(ctx, root, NR_OF_INSTANCES)?;
    let completed = counter(ctx, root, NR_OF_COMPLETED_INSTANCES)?;

    let execution = ctx.tree.get(root)?;
    let outputs: Vec<Value> = execution.multi_instance_outputs.values().cloned().collect();
    let parent = execution.parent_id.ok_or(EngineError::MissingScope(root))?;
    if let Some(name) = &settings.output_collection {
        ctx.tree.set_variable(parent, name, Value::Array(outputs))?;
    }

    let leftovers = ctx.tree.find_children(root)?;
    ctx.delete_all(leftovers, None)?;
    {
        let execution = ctx.tree.get_mut(root)?;
        execution.is_scope = false;
        execution.is_multi_instance_root = false;
        execution.is_active = true;
        execution.multi_instance_outputs.clear();
        for name in [NR_OF_INSTANCES, NR_OF_COMPLETED_INSTANCES, NR_OF_ACTIVE_INSTANCES] {
            execution.variables.remove(name);
        }
    }

    let instance = ctx.tree.process_instance_of(root)?;
    ctx.record(
        instance,
        HistoryEvent::MultiInstanceCompleted {
            node_id: node.id.clone(),
            completed,
            total,
        },
    );
    debug!(node_id = %node.id, completed, total, "Multi-instance completed");
    leave(ctx, root);
    Ok(())
}
