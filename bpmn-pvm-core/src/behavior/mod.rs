//! Node behaviors: what happens when a token arrives at a node (`execute`)
//! and when a waiting token is resumed (`trigger`).
//!
//! Behaviors never recurse into one another; they mutate the tree and
//! subscriptions, then plan follow-up operations on the agenda.

pub mod compensation;
pub mod error_propagation;
pub mod event;
pub mod gateway;
pub mod multi_instance;
pub mod subprocess;
pub mod task;

use crate::agenda::{Operation, Trigger};
use crate::context::CommandContext;
use crate::definition::{FlowNode, NodeKind, ProcessDefinition};
use crate::error::{BpmnError, EngineError, EngineResult};
use crate::types::ExecutionId;
use tracing::debug;

/// Run the behavior of `node` for an execution that just arrived there.
pub(crate) fn execute(
    ctx: &mut CommandContext,
    definition: &ProcessDefinition,
    node: &FlowNode,
    execution_id: ExecutionId,
) -> EngineResult<()> {
    match &node.kind {
        NodeKind::StartEvent
        | NodeKind::ErrorStartEvent { .. }
        | NodeKind::EndEvent
        | NodeKind::NoneThrowEvent
        | NodeKind::ManualTask
        | NodeKind::ExclusiveGateway => {
            leave(ctx, execution_id);
            Ok(())
        }

        NodeKind::ParallelGateway => gateway::parallel_gateway(ctx, node, execution_id),
        NodeKind::InclusiveGateway => gateway::inclusive_gateway(ctx, definition, node, execution_id),
        NodeKind::EventBasedGateway => {
            ctx.plan(Operation::TakeOutgoingFlows {
                execution_id,
                evaluate_conditions: false,
            });
            Ok(())
        }

        NodeKind::UserTask { .. } => {
            debug!(execution_id = %execution_id, node_id = %node.id, "Waiting for user task");
            Ok(())
        }
        NodeKind::ServiceTask { task_type } => task::service_task(ctx, node, task_type, execution_id),
        NodeKind::ScriptTask {
            script,
            result_variable,
        } => task::script_task(ctx, execution_id, script, result_variable.as_deref()),

        NodeKind::ReceiveTask {
            message,
            correlation_key,
        }
        | NodeKind::MessageCatchEvent {
            message,
            correlation_key,
        } => event::subscribe_message(ctx, node, execution_id, message, correlation_key.as_deref()),
        NodeKind::TimerCatchEvent { duration_ms } => {
            event::subscribe_timer(ctx, node, execution_id, *duration_ms, 0)
        }
        NodeKind::SignalCatchEvent { signal } => event::subscribe_signal(ctx, node, execution_id, signal),
        NodeKind::SignalThrowEvent { signal } => event::throw_signal(ctx, execution_id, signal),

        // Handlers run as siblings, so an end event's scope waits for them.
        NodeKind::CompensationThrowEvent { activity } | NodeKind::CompensationEndEvent { activity } => {
            compensation::throw(ctx, definition, node, execution_id, activity.as_deref())?;
            leave(ctx, execution_id);
            Ok(())
        }
        NodeKind::ErrorEndEvent {
            error_code,
            message,
        } => Err(BpmnError::new(error_code.clone(), message.clone().unwrap_or_default()).into()),
        NodeKind::TerminateEndEvent { terminate_all } => {
            event::terminate(ctx, node, execution_id, *terminate_all)
        }

        NodeKind::SubProcess => subprocess::enter(ctx, node, execution_id),
        NodeKind::CallActivity {
            called_process,
            inputs,
            ..
        } => subprocess::call_activity(ctx, execution_id, called_process, inputs),

        NodeKind::EventSubProcess | NodeKind::BoundaryEvent { .. } => Err(EngineError::InvalidState(
            format!("node '{}' cannot be entered by a sequence flow", node.id),
        )),
    }
}

/// Resume a waiting execution.
pub(crate) fn trigger(
    ctx: &mut CommandContext,
    definition: &ProcessDefinition,
    node: &FlowNode,
    execution_id: ExecutionId,
    trigger: Trigger,
) -> EngineResult<()> {
    match &node.kind {
        NodeKind::BoundaryEvent {
            interrupting,
            trigger: boundary,
            ..
        } => event::boundary_triggered(ctx, node, boundary, *interrupting, execution_id, trigger),
        kind if is_wait_state(kind) => {
            wait_state_triggered(ctx, definition, node, execution_id, trigger)
        }
        _ => Err(EngineError::InvalidState(format!(
            "execution {execution_id} at '{}' is not waiting",
            node.id
        ))),
    }
}

fn is_wait_state(kind: &NodeKind) -> bool {
    matches!(
        kind,
        NodeKind::UserTask { .. }
            | NodeKind::ServiceTask { .. }
            | NodeKind::ReceiveTask { .. }
            | NodeKind::TimerCatchEvent { .. }
            | NodeKind::MessageCatchEvent { .. }
            | NodeKind::SignalCatchEvent { .. }
    )
}

fn wait_state_triggered(
    ctx: &mut CommandContext,
    definition: &ProcessDefinition,
    node: &FlowNode,
    execution_id: ExecutionId,
    trigger: Trigger,
) -> EngineResult<()> {
    match trigger.subscription_id {
        Some(subscription_id) => {
            if event::unsubscribe(ctx, subscription_id).is_none() {
                debug!(
                    subscription_id = %subscription_id,
                    "Subscription already consumed; trigger ignored"
                );
                return Ok(());
            }
        }
        None => event::unsubscribe_all(ctx, execution_id)?,
    }
    ctx.tree.set_variables(execution_id, &trigger.variables)?;
    gateway::cancel_event_gateway_siblings(ctx, definition, node, execution_id)?;
    leave(ctx, execution_id);
    Ok(())
}

/// Leave the current node through its outgoing flows.
pub(crate) fn leave(ctx: &mut CommandContext, execution_id: ExecutionId) {
    ctx.plan(Operation::TakeOutgoingFlows {
        execution_id,
        evaluate_conditions: true,
    });
}

/// Give every timer/message/signal boundary of `node` a waiting child of
/// the host execution.
pub(crate) fn create_boundary_executions(
    ctx: &mut CommandContext,
    definition: &ProcessDefinition,
    node: &FlowNode,
    host_id: ExecutionId,
) -> EngineResult<()> {
    for boundary in definition.event_boundaries(node) {
        let child = ctx.create_child_at(host_id, &boundary.id)?;
        event::subscribe_boundary(ctx, boundary, child)?;
    }
    Ok(())
}
