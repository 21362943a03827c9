//! The agenda: a FIFO of operations drained to quiescence within one
//! transaction. Operations only ever append; nothing runs inline.

use crate::behavior::{self, compensation, error_propagation, gateway, multi_instance, subprocess};
use crate::context::{current_node, CommandContext, InstanceEnd};
use crate::definition::{FlowNode, NodeKind, ProcessDefinition};
use crate::error::{EngineError, EngineResult};
use crate::events::HistoryEvent;
use crate::types::*;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Payload delivered to a waiting execution.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Trigger {
    /// Subscription that fired; `None` for direct completion (user tasks,
    /// external service-task workers).
    pub subscription_id: Option<SubscriptionId>,
    pub variables: Variables,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    /// Run the behavior of the node the execution was just moved to.
    ContinueProcess { execution_id: ExecutionId },
    /// Leave the current node. `evaluate_conditions: false` takes every
    /// outgoing flow (parallel fork, event-based gateway).
    TakeOutgoingFlows {
        execution_id: ExecutionId,
        evaluate_conditions: bool,
    },
    /// The execution reached a node without outgoing flows.
    EndExecution { execution_id: ExecutionId },
    /// An interrupting boundary fired: remove its host and continue from the boundary.
    DestroyScope { execution_id: ExecutionId },
    TriggerExecution {
        execution_id: ExecutionId,
        trigger: Trigger,
    },
    /// Run the wrapped behavior for one multi-instance instance.
    ContinueMultiInstance { execution_id: ExecutionId },
}

impl Operation {
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            Operation::ContinueProcess { execution_id }
            | Operation::TakeOutgoingFlows { execution_id, .. }
            | Operation::EndExecution { execution_id }
            | Operation::DestroyScope { execution_id }
            | Operation::TriggerExecution { execution_id, .. }
            | Operation::ContinueMultiInstance { execution_id } => *execution_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::ContinueProcess { .. } => "continue_process",
            Operation::TakeOutgoingFlows { .. } => "take_outgoing_flows",
            Operation::EndExecution { .. } => "end_execution",
            Operation::DestroyScope { .. } => "destroy_scope",
            Operation::TriggerExecution { .. } => "trigger_execution",
            Operation::ContinueMultiInstance { .. } => "continue_multi_instance",
        }
    }
}

#[derive(Debug, Default)]
pub struct Agenda {
    queue: VecDeque<Operation>,
}

impl Agenda {
    pub fn plan(&mut self, operation: Operation) {
        self.queue.push_back(operation);
    }

    pub fn plan_continue_process(&mut self, execution_id: ExecutionId) {
        self.plan(Operation::ContinueProcess { execution_id });
    }

    pub fn plan_trigger_execution(&mut self, execution_id: ExecutionId, trigger: Trigger) {
        self.plan(Operation::TriggerExecution {
            execution_id,
            trigger,
        });
    }

    pub fn pop(&mut self) -> Option<Operation> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Drain the agenda until nothing is left and no waiting inclusive join
/// can fire.
///
/// A business fault abandons the failing operation and hands the fault to
/// error propagation, which either plans the recovery step or turns it
/// into `UnhandledBpmnError`. Every other error aborts the transaction.
///
/// Operations already queued for other branches keep running after a
/// caught fault; the recovery step is appended behind them. Branches the
/// handler interrupted are deleted first, so their queued operations are
/// skipped. An uncaught fault stops the drain and nothing is committed.
pub fn run(ctx: &mut CommandContext) -> EngineResult<()> {
    loop {
        while let Some(operation) = ctx.agenda.pop() {
            ctx.count_operation()?;
            let execution_id = operation.execution_id();
            if !ctx.tree.contains(execution_id) {
                debug!(
                    operation = operation.name(),
                    execution_id = %execution_id,
                    "Skipping operation on deleted execution"
                );
                continue;
            }
            trace!(
                operation = operation.name(),
                execution_id = %execution_id,
                "Running operation"
            );
            match execute(ctx, operation) {
                Ok(()) => {}
                Err(EngineError::Bpmn(fault)) => {
                    error_propagation::propagate(ctx, execution_id, fault)?
                }
                Err(other) => return Err(other),
            }
        }
        if !gateway::execute_inactive_joins(ctx)? {
            return Ok(());
        }
    }
}

fn execute(ctx: &mut CommandContext, operation: Operation) -> EngineResult<()> {
    match operation {
        Operation::ContinueProcess { execution_id } => continue_process(ctx, execution_id),
        Operation::TakeOutgoingFlows {
            execution_id,
            evaluate_conditions,
        } => take_outgoing_flows(ctx, execution_id, evaluate_conditions),
        Operation::EndExecution { execution_id } => end_execution(ctx, execution_id),
        Operation::DestroyScope { execution_id } => destroy_scope(ctx, execution_id),
        Operation::TriggerExecution {
            execution_id,
            trigger,
        } => {
            let (definition, node_id) = current_node(ctx, execution_id)?;
            let node = definition.node(&node_id)?;
            behavior::trigger(ctx, &definition, node, execution_id, trigger)
        }
        Operation::ContinueMultiInstance { execution_id } => {
            let (definition, node_id) = current_node(ctx, execution_id)?;
            let node = definition.node(&node_id)?;
            record_started(ctx, execution_id, &node_id)?;
            behavior::execute(ctx, &definition, node, execution_id)
        }
    }
}

fn record_started(ctx: &mut CommandContext, execution_id: ExecutionId, node_id: &str) -> EngineResult<()> {
    let instance = ctx.tree.process_instance_of(execution_id)?;
    ctx.record(
        instance,
        HistoryEvent::ActivityStarted {
            execution_id,
            node_id: node_id.to_string(),
            at: ctx.now,
        },
    );
    Ok(())
}

// ─── ContinueProcess ──────────────────────────────────────────

fn continue_process(ctx: &mut CommandContext, execution_id: ExecutionId) -> EngineResult<()> {
    let (definition, node_id) = current_node(ctx, execution_id)?;
    let node = definition.node(&node_id)?;
    let execution = ctx.tree.get(execution_id)?;

    if node.multi_instance.is_some()
        && !execution.is_multi_instance_root
        && !ctx.is_mi_instance(execution)
    {
        return multi_instance::begin(ctx, &definition, node, execution_id);
    }

    record_started(ctx, execution_id, &node_id)?;
    behavior::create_boundary_executions(ctx, &definition, node, execution_id)?;
    behavior::execute(ctx, &definition, node, execution_id)
}

// ─── TakeOutgoingFlows ────────────────────────────────────────

fn take_outgoing_flows(
    ctx: &mut CommandContext,
    execution_id: ExecutionId,
    evaluate_conditions: bool,
) -> EngineResult<()> {
    let (definition, node_id) = current_node(ctx, execution_id)?;
    let node = definition.node(&node_id)?;
    let instance = ctx.tree.process_instance_of(execution_id)?;
    ctx.record(
        instance,
        HistoryEvent::ActivityCompleted {
            execution_id,
            node_id: node_id.clone(),
            at: ctx.now,
        },
    );

    // Boundary events die with their host's activity.
    let boundaries: Vec<ExecutionId> = ctx
        .tree
        .find_children(execution_id)?
        .into_iter()
        .filter(|c| {
            ctx.tree
                .find_by_id(*c)
                .is_some_and(|e| ctx.is_boundary_execution(e))
        })
        .collect();
    ctx.delete_all(boundaries, None)?;

    let is_instance = ctx.is_mi_instance(ctx.tree.get(execution_id)?);
    if node.multi_instance.is_none() || is_instance {
        compensation::register_completed(ctx, &definition, node, execution_id)?;
    }
    if is_instance {
        return multi_instance::instance_completed(ctx, node, execution_id);
    }

    let flows = select_flows(ctx, &definition, node, execution_id, evaluate_conditions)?;
    if flows.is_empty() {
        ctx.plan(Operation::EndExecution { execution_id });
        return Ok(());
    }
    leave_via(ctx, &definition, execution_id, &flows)
}

/// Pick outgoing flows in declaration order. Exclusive gateways stop at the
/// first true condition; other nodes take every true one. The default flow
/// is the fallback in both cases.
fn select_flows(
    ctx: &CommandContext,
    definition: &ProcessDefinition,
    node: &FlowNode,
    execution_id: ExecutionId,
    evaluate_conditions: bool,
) -> EngineResult<Vec<usize>> {
    if node.outgoing.is_empty() || !evaluate_conditions {
        return Ok(node.outgoing.clone());
    }
    let exclusive = matches!(node.kind, NodeKind::ExclusiveGateway);

    let mut selected = Vec::new();
    for &index in &node.outgoing {
        if node.default_flow == Some(index) {
            continue;
        }
        let flow = definition.flow(index)?;
        let taken = match &flow.condition {
            Some(condition) => ctx.evaluate_bool(execution_id, condition)?,
            None => true,
        };
        if taken {
            selected.push(index);
            if exclusive {
                break;
            }
        }
    }
    if selected.is_empty() {
        selected.extend(node.default_flow);
    }
    if selected.is_empty() {
        return Err(EngineError::NoOutgoingFlow {
            node_id: node.id.clone(),
        });
    }
    Ok(selected)
}

/// Move the execution along the first flow; every further flow gets a new
/// sibling. All targets are then continued in flow order.
fn leave_via(
    ctx: &mut CommandContext,
    definition: &ProcessDefinition,
    execution_id: ExecutionId,
    flows: &[usize],
) -> EngineResult<()> {
    let execution = ctx.tree.get(execution_id)?;
    let instance = execution.process_instance_id;
    let parent = execution.parent_id.ok_or_else(|| {
        EngineError::InvalidState(format!("process instance {execution_id} cannot take flows"))
    })?;
    // Branches of one event-based gateway arrival share a race id.
    let left = execution.node_id.as_deref().and_then(|n| definition.nodes.get(n));
    let race = left
        .is_some_and(|n| matches!(n.kind, NodeKind::EventBasedGateway))
        .then_some(execution_id);

    let mut continued = Vec::with_capacity(flows.len());
    for (n, &index) in flows.iter().enumerate() {
        let flow = definition.flow(index)?;
        let target = if n == 0 {
            execution_id
        } else {
            ctx.tree.create_child(parent)?
        };
        let row = ctx.tree.get_mut(target)?;
        row.node_id = Some(flow.target.clone());
        row.is_active = true;
        row.race_id = race;
        ctx.record(
            instance,
            HistoryEvent::SequenceFlowTaken {
                execution_id: target,
                flow_id: flow.id.clone(),
            },
        );
        continued.push(target);
    }
    if continued.len() > 1 {
        debug!(
            execution_id = %execution_id,
            branches = continued.len(),
            "Forked"
        );
    }
    for target in continued {
        ctx.agenda.plan_continue_process(target);
    }
    Ok(())
}

// ─── EndExecution ─────────────────────────────────────────────

fn end_execution(ctx: &mut CommandContext, execution_id: ExecutionId) -> EngineResult<()> {
    let Some(parent) = ctx.tree.get(execution_id)?.parent_id else {
        return ctx.end_process_instance(execution_id, InstanceEnd::Completed);
    };
    ctx.delete_execution(execution_id, None)?;
    subprocess::scope_flow_ended(ctx, parent)
}

// ─── DestroyScope ─────────────────────────────────────────────

fn destroy_scope(ctx: &mut CommandContext, boundary_id: ExecutionId) -> EngineResult<()> {
    let boundary = ctx.tree.get(boundary_id)?;
    let boundary_node = boundary.node_id.clone().unwrap_or_default();
    let host_id = boundary.parent_id.ok_or(EngineError::MissingScope(boundary_id))?;
    let host_node = ctx.tree.get(host_id)?.node_id.clone().unwrap_or_default();
    let scope = ctx.tree.parent_scope(host_id)?;

    ctx.tree.reparent(boundary_id, scope)?;
    let reason = DeleteReason::BoundaryEvent {
        boundary_id: boundary_node,
        host_id: host_node,
    };
    ctx.interrupt([host_id], &reason)?;
    ctx.plan(Operation::TakeOutgoingFlows {
        execution_id: boundary_id,
        evaluate_conditions: true,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn operations_are_fifo() {
        let mut agenda = Agenda::default();
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        agenda.plan_continue_process(a);
        agenda.plan(Operation::EndExecution { execution_id: b });
        agenda.plan_trigger_execution(a, Trigger::default());
        assert_eq!(agenda.len(), 3);

        assert_eq!(agenda.pop(), Some(Operation::ContinueProcess { execution_id: a }));
        assert_eq!(agenda.pop().map(|o| o.execution_id()), Some(b));
        assert_eq!(agenda.pop().map(|o| o.name()), Some("trigger_execution"));
        assert!(agenda.is_empty());
    }
}
