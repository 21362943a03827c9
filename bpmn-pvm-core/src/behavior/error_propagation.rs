//! Business-fault routing.
//!
//! From the throwing execution upward: error event sub-processes of each
//! enclosing scope, then error boundaries of each enclosing activity, then
//! across a call activity into the calling instance. An exact error code
//! beats a catch-all at the same level. Nothing matching anywhere makes
//! the transaction fail with `UnhandledBpmnError`.

use crate::agenda::Operation;
use crate::context::CommandContext;
use crate::definition::{BoundaryTrigger, FlowNode, NodeKind, ProcessDefinition};
use crate::error::{BpmnError, EngineError, EngineResult};
use crate::events::HistoryEvent;
use crate::types::*;
use serde_json::json;
use tracing::{info, warn};

pub const ERROR_CODE_VARIABLE: &str = "errorCode";
pub const ERROR_MESSAGE_VARIABLE: &str = "errorMessage";

enum Catcher {
    Boundary { host: ExecutionId, boundary: NodeId },
    EventSubProcess { scope: ExecutionId, esp: NodeId },
}

/// Exact code first, then a catch-all (`None`).
fn pick<'a>(
    candidates: impl Iterator<Item = (&'a NodeId, Option<&'a str>)> + Clone,
    code: &str,
) -> Option<NodeId> {
    candidates
        .clone()
        .find(|(_, c)| *c == Some(code))
        .or_else(|| candidates.into_iter().find(|(_, c)| c.is_none()))
        .map(|(id, _)| id.clone())
}

fn matching_event_sub_process(
    definition: &ProcessDefinition,
    container: Option<&str>,
    code: &str,
) -> Option<NodeId> {
    let candidates = definition
        .event_sub_processes_of(container)
        .iter()
        .filter_map(|esp| {
            let start = definition.nodes.get(esp)?.initial.as_ref()?;
            match &definition.nodes.get(start)?.kind {
                NodeKind::ErrorStartEvent { error_code } => Some((esp, error_code.as_deref())),
                _ => None,
            }
        });
    pick(candidates, code)
}

fn matching_boundary(definition: &ProcessDefinition, node: &FlowNode, code: &str) -> Option<NodeId> {
    let candidates = node.boundaries.iter().filter_map(|b| match &definition.nodes.get(b)?.kind {
        NodeKind::BoundaryEvent {
            trigger: BoundaryTrigger::Error { error_code },
            ..
        } => Some((b, error_code.as_deref())),
        _ => None,
    });
    pick(candidates, code)
}

fn find_catcher(
    ctx: &CommandContext,
    thrower: ExecutionId,
    code: &str,
) -> EngineResult<Option<Catcher>> {
    let mut current = Some(thrower);
    let mut visited = 0usize;
    // An error leaving an event sub-process is not caught by its siblings.
    let mut left_event_sub_process = false;
    while let Some(id) = current {
        visited += 1;
        if visited > ctx.tree.len() + 1 {
            return Err(EngineError::InvalidState(format!(
                "error propagation from {thrower} does not terminate"
            )));
        }
        let execution = ctx.tree.get(id)?;
        let definition = ctx.definition_of(id)?;

        let in_scope = execution.is_scope && !execution.is_multi_instance_root && !execution.is_event_scope;
        if in_scope && !left_event_sub_process {
            if let Some(esp) = matching_event_sub_process(&definition, execution.node_id.as_deref(), code) {
                return Ok(Some(Catcher::EventSubProcess { scope: id, esp }));
            }
        }

        if !execution.is_process_instance() && !ctx.is_mi_instance(execution) {
            if let Some(node) = execution.node_id.as_deref().and_then(|n| definition.nodes.get(n)) {
                if let Some(boundary) = matching_boundary(&definition, node, code) {
                    return Ok(Some(Catcher::Boundary { host: id, boundary }));
                }
            }
        }

        left_event_sub_process = in_scope
            && execution
                .node_id
                .as_deref()
                .and_then(|n| definition.nodes.get(n))
                .is_some_and(|n| matches!(n.kind, NodeKind::EventSubProcess));
        current = execution.parent_id.or(execution.super_execution_id);
    }
    Ok(None)
}

/// Route `fault` thrown at `thrower` to its handler, or fail.
pub(crate) fn propagate(ctx: &mut CommandContext, thrower: ExecutionId, fault: BpmnError) -> EngineResult<()> {
    let thrown_at = ctx.tree.get(thrower)?.node_id.clone().unwrap_or_default();
    match find_catcher(ctx, thrower, &fault.error_code)? {
        Some(Catcher::Boundary { host, boundary }) => {
            catch_at_boundary(ctx, host, &boundary, &fault, &thrown_at)
        }
        Some(Catcher::EventSubProcess { scope, esp }) => {
            start_event_sub_process(ctx, scope, &esp, &fault, &thrown_at)
        }
        None => {
            warn!(
                error_code = %fault.error_code,
                node_id = %thrown_at,
                message = %fault.message,
                "Unhandled business error"
            );
            Err(EngineError::UnhandledBpmnError {
                error_code: fault.error_code,
                node_id: thrown_at,
            })
        }
    }
}

fn error_variables(ctx: &mut CommandContext, execution_id: ExecutionId, fault: &BpmnError) -> EngineResult<()> {
    ctx.tree
        .set_variable_local(execution_id, ERROR_CODE_VARIABLE, json!(fault.error_code))?;
    ctx.tree
        .set_variable_local(execution_id, ERROR_MESSAGE_VARIABLE, json!(fault.message))
}

fn record_caught(
    ctx: &mut CommandContext,
    at: ExecutionId,
    fault: &BpmnError,
    thrown_at: &str,
    handler_id: &str,
) -> EngineResult<()> {
    let instance = ctx.tree.process_instance_of(at)?;
    ctx.record(
        instance,
        HistoryEvent::ErrorCaught {
            error_code: fault.error_code.clone(),
            thrown_at: thrown_at.to_string(),
            handler_id: handler_id.to_string(),
        },
    );
    info!(error_code = %fault.error_code, thrown_at, handler_id, "Business error caught");
    Ok(())
}

/// The host activity is interrupted; flow continues from the boundary.
fn catch_at_boundary(
    ctx: &mut CommandContext,
    host: ExecutionId,
    boundary: &str,
    fault: &BpmnError,
    thrown_at: &str,
) -> EngineResult<()> {
    let host_execution = ctx.tree.get(host)?;
    let parent = host_execution.parent_id.ok_or(EngineError::MissingScope(host))?;
    let host_node = host_execution.node_id.clone().unwrap_or_default();

    let catcher = ctx.create_child_at(parent, boundary)?;
    let reason = DeleteReason::BoundaryEvent {
        boundary_id: boundary.to_string(),
        host_id: host_node,
    };
    ctx.interrupt([host], &reason)?;
    error_variables(ctx, catcher, fault)?;
    record_caught(ctx, catcher, fault, thrown_at, boundary)?;
    ctx.plan(Operation::TakeOutgoingFlows {
        execution_id: catcher,
        evaluate_conditions: true,
    });
    Ok(())
}

/// Everything running in the scope is interrupted and the event
/// sub-process starts inside it.
fn start_event_sub_process(
    ctx: &mut CommandContext,
    scope: ExecutionId,
    esp: &str,
    fault: &BpmnError,
    thrown_at: &str,
) -> EngineResult<()> {
    let definition = ctx.definition_of(scope)?;
    let start = definition.node(esp)?.initial.clone().ok_or_else(|| {
        EngineError::InvalidDefinition(format!("event sub-process '{esp}' has no start event"))
    })?;

    let interrupted: Vec<ExecutionId> = ctx
        .tree
        .find_children(scope)?
        .into_iter()
        .filter(|c| ctx.tree.find_by_id(*c).is_some_and(|e| !e.is_event_scope))
        .collect();
    let reason = DeleteReason::EventSubProcess {
        node_id: esp.to_string(),
    };
    ctx.interrupt(interrupted, &reason)?;

    let esp_scope = ctx.create_child_at(scope, esp)?;
    ctx.tree.get_mut(esp_scope)?.is_scope = true;
    error_variables(ctx, esp_scope, fault)?;
    let token = ctx.create_child_at(esp_scope, &start)?;
    record_caught(ctx, esp_scope, fault, thrown_at, esp)?;
    ctx.agenda.plan_continue_process(token);
    Ok(())
}
