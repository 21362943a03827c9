use super::leave;
use crate::context::CommandContext;
use crate::definition::FlowNode;
use crate::error::EngineResult;
use crate::handler::TaskContext;
use crate::types::ExecutionId;
use tracing::debug;

/// Run the registered handler inline and leave, or wait for an external
/// worker when no handler is registered for the task type.
///
/// A `BpmnError` from the handler surfaces as `EngineError::Bpmn`; the
/// agenda routes it to error propagation. Outputs of a failed handler are
/// discarded.
pub(crate) fn service_task(
    ctx: &mut CommandContext,
    node: &FlowNode,
    task_type: &str,
    execution_id: ExecutionId,
) -> EngineResult<()> {
    let Some(handler) = ctx.services.handlers.get(task_type) else {
        debug!(execution_id = %execution_id, task_type, "No handler; waiting for completion");
        return Ok(());
    };

    let variables = ctx.tree.visible_variables(execution_id)?;
    let mut task = TaskContext::new(execution_id, &node.id, task_type, &variables);
    handler.execute(&mut task)?;
    let outputs = task.into_outputs();
    debug!(execution_id = %execution_id, task_type, outputs = outputs.len(), "Service task completed");

    ctx.tree.set_variables(execution_id, &outputs)?;
    leave(ctx, execution_id);
    Ok(())
}

pub(crate) fn script_task(
    ctx: &mut CommandContext,
    execution_id: ExecutionId,
    script: &str,
    result_variable: Option<&str>,
) -> EngineResult<()> {
    let value = ctx.evaluate(execution_id, script)?;
    if let Some(name) = result_variable {
        ctx.tree.set_variable(execution_id, name, value)?;
    }
    leave(ctx, execution_id);
    Ok(())
}
