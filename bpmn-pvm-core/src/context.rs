//! Per-transaction command context.
//!
//! Everything a behavior may touch (tree, subscriptions, agenda,
//! definitions, evaluator, handlers, config, history buffer) is reached
//! through `&mut CommandContext`. One context is one transaction.

use crate::agenda::{Agenda, Operation};
use crate::config::EngineConfig;
use crate::definition::{DefinitionRegistry, NodeKind, ProcessDefinition};
use crate::error::{EngineError, EngineResult};
use crate::events::{HistoryEvent, HistoryRecord};
use crate::expression::{self, ExpressionEvaluator};
use crate::handler::TaskHandlerRegistry;
use crate::store::ChangeSet;
use crate::subscription::SubscriptionRegistry;
use crate::tree::{Execution, ExecutionScope, ExecutionTree};
use crate::types::*;
use std::sync::Arc;
use tracing::{debug, info};

/// Long-lived collaborators shared by every transaction of an engine.
#[derive(Clone)]
pub struct EngineServices {
    pub definitions: Arc<DefinitionRegistry>,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub handlers: Arc<TaskHandlerRegistry>,
    pub config: Arc<EngineConfig>,
}

/// A signal thrown inside a transaction, re-broadcast to other process
/// families once the transaction has committed.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingSignal {
    pub name: String,
    pub variables: Variables,
}

/// How a process instance came to its end.
#[derive(Clone, Debug)]
pub(crate) enum InstanceEnd {
    Completed,
    Terminated { node_id: NodeId },
}

pub struct CommandContext {
    pub(crate) tree: ExecutionTree,
    pub(crate) subscriptions: SubscriptionRegistry,
    pub(crate) agenda: Agenda,
    pub(crate) services: EngineServices,
    history: Vec<HistoryRecord>,
    instances: Vec<ProcessInstanceSummary>,
    pending_signals: Vec<PendingSignal>,
    pub(crate) now: Timestamp,
    operations: usize,
}

impl CommandContext {
    pub fn new(
        services: EngineServices,
        tree: ExecutionTree,
        subscriptions: SubscriptionRegistry,
    ) -> Self {
        Self {
            tree,
            subscriptions,
            agenda: Agenda::default(),
            services,
            history: Vec::new(),
            instances: Vec::new(),
            pending_signals: Vec::new(),
            now: now(),
            operations: 0,
        }
    }

    pub fn tree(&self) -> &ExecutionTree {
        &self.tree
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn agenda_mut(&mut self) -> &mut Agenda {
        &mut self.agenda
    }

    pub(crate) fn plan(&mut self, operation: Operation) {
        self.agenda.plan(operation);
    }

    /// Count one drained operation against the configured limit.
    pub(crate) fn count_operation(&mut self) -> EngineResult<()> {
        self.operations += 1;
        match self.services.config.max_operations_per_transaction {
            Some(limit) if self.operations > limit => {
                Err(EngineError::OperationLimitExceeded { limit })
            }
            _ => Ok(()),
        }
    }

    // ── Definitions ──

    pub(crate) fn definition(&self, id: &str) -> EngineResult<Arc<ProcessDefinition>> {
        self.services
            .definitions
            .get(id)
            .ok_or_else(|| EngineError::DefinitionNotFound(id.to_string()))
    }

    pub(crate) fn definition_of(&self, execution_id: ExecutionId) -> EngineResult<Arc<ProcessDefinition>> {
        let execution = self.tree.get(execution_id)?;
        self.definition(&execution.process_definition_id)
    }

    pub(crate) fn node_id_of(&self, execution_id: ExecutionId) -> EngineResult<NodeId> {
        self.tree.get(execution_id)?.node_id.clone().ok_or_else(|| {
            EngineError::InvalidState(format!("execution {execution_id} is not at a flow node"))
        })
    }

    // ── Expressions ──

    pub(crate) fn evaluate(&self, execution_id: ExecutionId, expr: &str) -> EngineResult<Value> {
        let scope = ExecutionScope {
            tree: &self.tree,
            execution_id,
        };
        self.services.evaluator.evaluate(expr, &scope)
    }

    pub(crate) fn evaluate_bool(&self, execution_id: ExecutionId, expr: &str) -> EngineResult<bool> {
        let scope = ExecutionScope {
            tree: &self.tree,
            execution_id,
        };
        expression::evaluate_bool(self.services.evaluator.as_ref(), expr, &scope)
    }

    pub(crate) fn evaluate_count(&self, execution_id: ExecutionId, expr: &str) -> EngineResult<usize> {
        let scope = ExecutionScope {
            tree: &self.tree,
            execution_id,
        };
        expression::evaluate_count(self.services.evaluator.as_ref(), expr, &scope)
    }

    /// Correlation keys are expressions; the value is rendered to a string.
    pub(crate) fn evaluate_key(&self, execution_id: ExecutionId, expr: &str) -> EngineResult<String> {
        Ok(match self.evaluate(execution_id, expr)? {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }

    // ── History ──

    pub(crate) fn record(&mut self, process_instance_id: ExecutionId, event: HistoryEvent) {
        if self.services.config.records(event.level()) {
            self.history.push(HistoryRecord {
                process_instance_id,
                event,
            });
        }
    }

    pub fn history(&self) -> &[HistoryRecord] {
        &self.history
    }

    pub(crate) fn throw_signal_later(&mut self, name: &str, variables: Variables) {
        self.pending_signals.push(PendingSignal {
            name: name.to_string(),
            variables,
        });
    }

    // ── Tree shape helpers ──

    /// An instance execution of a multi-instance activity.
    pub(crate) fn is_mi_instance(&self, execution: &Execution) -> bool {
        execution
            .parent_id
            .and_then(|p| self.tree.find_by_id(p))
            .is_some_and(|p| p.is_multi_instance_root && p.node_id == execution.node_id)
    }

    /// A boundary event still waiting below its host.
    pub(crate) fn is_boundary_execution(&self, execution: &Execution) -> bool {
        let (Some(node_id), Some(parent_id)) = (&execution.node_id, execution.parent_id) else {
            return false;
        };
        let Ok(definition) = self.definition(&execution.process_definition_id) else {
            return false;
        };
        let host_of_parent = self.tree.find_by_id(parent_id).and_then(|p| p.node_id.as_deref());
        match definition.nodes.get(node_id).map(|n| &n.kind) {
            Some(NodeKind::BoundaryEvent { host, .. }) => host_of_parent == Some(host.as_str()),
            _ => false,
        }
    }

    /// Children of `scope_id` that still carry control flow: no waiting
    /// boundary events, no compensation snapshots.
    pub(crate) fn flow_children(&self, scope_id: ExecutionId) -> EngineResult<Vec<ExecutionId>> {
        Ok(self
            .tree
            .find_children(scope_id)?
            .into_iter()
            .filter(|c| {
                self.tree
                    .find_by_id(*c)
                    .is_some_and(|e| !e.is_event_scope && !self.is_boundary_execution(e))
            })
            .collect())
    }

    // ── Create / delete ──

    /// New child of `parent_id` positioned at `node_id`.
    pub(crate) fn create_child_at(
        &mut self,
        parent_id: ExecutionId,
        node_id: &str,
    ) -> EngineResult<ExecutionId> {
        let child = self.tree.create_child(parent_id)?;
        self.tree.get_mut(child)?.node_id = Some(node_id.to_string());
        Ok(child)
    }

    /// Delete a subtree, dropping every subscription it held. A reason
    /// marks the removal as a cancellation in history.
    pub(crate) fn delete_execution(
        &mut self,
        execution_id: ExecutionId,
        reason: Option<&DeleteReason>,
    ) -> EngineResult<Vec<Execution>> {
        let mut removed = Vec::new();
        let mut events = Vec::new();
        let subscriptions = &mut self.subscriptions;
        self.tree.delete_subtree(execution_id, &mut |e| {
            for s in subscriptions.delete_for_execution(e.id) {
                events.push((
                    e.process_instance_id,
                    HistoryEvent::SubscriptionDeleted {
                        subscription_id: s.id,
                        kind: s.kind,
                        event_name: s.event_name,
                    },
                ));
            }
            if let Some(reason) = reason {
                events.push((
                    e.process_instance_id,
                    HistoryEvent::ExecutionDeleted {
                        execution_id: e.id,
                        node_id: e.node_id.clone(),
                        reason: reason.to_string(),
                    },
                ));
            }
            removed.push(e.clone());
        })?;
        for (instance, event) in events {
            self.record(instance, event);
        }
        if let Some(reason) = reason {
            debug!(
                execution_id = %execution_id,
                removed = removed.len(),
                reason = %reason,
                "Deleted execution subtree"
            );
        }
        Ok(removed)
    }

    /// Delete every listed execution that still exists.
    pub(crate) fn delete_all(
        &mut self,
        ids: impl IntoIterator<Item = ExecutionId>,
        reason: Option<&DeleteReason>,
    ) -> EngineResult<Vec<Execution>> {
        let mut removed = Vec::new();
        for id in ids {
            if self.tree.contains(id) {
                removed.extend(self.delete_execution(id, reason)?);
            }
        }
        Ok(removed)
    }

    /// Delete executions cut short by `reason`. Called process instances
    /// removed with them end as cancelled.
    pub(crate) fn interrupt(
        &mut self,
        ids: impl IntoIterator<Item = ExecutionId>,
        reason: &DeleteReason,
    ) -> EngineResult<Vec<Execution>> {
        let removed = self.delete_all(ids, Some(reason))?;
        let (at, why) = (self.now, reason.to_string());
        self.close_removed_instances(&removed, |root| {
            (
                ProcessState::Cancelled {
                    reason: why.clone(),
                    at,
                },
                HistoryEvent::ProcessCancelled {
                    instance_id: root.id,
                    reason: why.clone(),
                    at,
                },
            )
        });
        Ok(removed)
    }

    // ── Process instance lifecycle ──

    /// Create a process instance (or a called instance when `super_execution`
    /// is set) and plan its first step.
    pub(crate) fn start_process_instance(
        &mut self,
        definition: &ProcessDefinition,
        business_key: Option<String>,
        variables: Variables,
        super_execution: Option<ExecutionId>,
    ) -> EngineResult<ExecutionId> {
        let instance_id = match super_execution {
            Some(caller) => self.tree.create_sub_process_instance(caller, &definition.id)?,
            None => {
                let tenant = self.services.config.default_tenant_id.clone();
                self.tree
                    .create_process_instance(&definition.id, business_key, tenant)
            }
        };
        for (name, value) in variables {
            self.tree.set_variable_local(instance_id, &name, value)?;
        }
        let token = self.create_child_at(instance_id, &definition.initial)?;

        let root = self.tree.get(instance_id)?;
        let summary = summarize(root, ProcessState::Running);
        self.record(
            instance_id,
            HistoryEvent::ProcessStarted {
                instance_id,
                process_definition_id: definition.id.clone(),
                business_key: summary.business_key.clone(),
                super_execution_id: super_execution,
                at: self.now,
            },
        );
        self.instances.push(summary);
        info!(
            instance_id = %instance_id,
            definition = %definition.id,
            "Process instance started"
        );

        self.plan(Operation::ContinueProcess {
            execution_id: token,
        });
        Ok(instance_id)
    }

    /// End a process instance whose flow is done. A called instance copies
    /// its outputs to the calling execution, which then leaves.
    pub(crate) fn end_process_instance(
        &mut self,
        instance_id: ExecutionId,
        end: InstanceEnd,
    ) -> EngineResult<()> {
        let root = self.tree.get(instance_id)?.clone();

        let mut outputs = Vec::new();
        let caller = root
            .super_execution_id
            .filter(|caller| self.tree.contains(*caller));
        if let Some(caller) = caller {
            let definition = self.definition_of(caller)?;
            let node = definition.node(&self.node_id_of(caller)?)?;
            if let NodeKind::CallActivity { outputs: mappings, .. } = &node.kind {
                for mapping in mappings {
                    outputs.push((mapping.target.clone(), self.evaluate(instance_id, &mapping.source)?));
                }
            }
        }

        self.delete_execution(instance_id, None)?;

        let (state, event) = match end {
            InstanceEnd::Completed => (
                ProcessState::Completed { at: self.now },
                HistoryEvent::ProcessCompleted {
                    instance_id,
                    at: self.now,
                },
            ),
            InstanceEnd::Terminated { node_id } => (
                ProcessState::Terminated {
                    node_id: node_id.clone(),
                    at: self.now,
                },
                HistoryEvent::ProcessTerminated {
                    instance_id,
                    node_id,
                    at: self.now,
                },
            ),
        };
        self.record(instance_id, event);
        self.instances.push(summarize(&root, state));
        info!(instance_id = %instance_id, "Process instance ended");

        if let Some(caller) = caller {
            for (name, value) in outputs {
                self.tree.set_variable(caller, &name, value)?;
            }
            self.plan(Operation::TakeOutgoingFlows {
                execution_id: caller,
                evaluate_conditions: true,
            });
        }
        Ok(())
    }

    /// Record the end of every process instance root among `removed`.
    pub(crate) fn close_removed_instances(
        &mut self,
        removed: &[Execution],
        state: impl Fn(&Execution) -> (ProcessState, HistoryEvent),
    ) {
        for root in removed.iter().filter(|e| e.is_process_instance()) {
            let (state, event) = state(root);
            self.record(root.id, event);
            self.instances.push(summarize(root, state));
        }
    }

    /// Delete a whole process instance (and the instances it called).
    pub(crate) fn cancel_process_instance(
        &mut self,
        instance_id: ExecutionId,
        reason: &str,
    ) -> EngineResult<()> {
        if !self.tree.get(instance_id)?.is_process_instance() {
            return Err(EngineError::InvalidState(format!(
                "{instance_id} is not a process instance"
            )));
        }
        let delete_reason = DeleteReason::Cancelled {
            reason: reason.to_string(),
        };
        let removed = self.delete_execution(instance_id, Some(&delete_reason))?;
        let at = self.now;
        self.close_removed_instances(&removed, |root| {
            (
                ProcessState::Cancelled {
                    reason: reason.to_string(),
                    at,
                },
                HistoryEvent::ProcessCancelled {
                    instance_id: root.id,
                    reason: reason.to_string(),
                    at,
                },
            )
        });
        info!(instance_id = %instance_id, reason, "Process instance cancelled");
        Ok(())
    }

    // ── Transaction hand-off ──

    pub(crate) fn take_changes(&mut self) -> ChangeSet {
        ChangeSet {
            executions: self.tree.take_changes(),
            subscriptions: self.subscriptions.take_changes(),
            instances: std::mem::take(&mut self.instances),
        }
    }

    pub(crate) fn take_history(&mut self) -> Vec<HistoryRecord> {
        std::mem::take(&mut self.history)
    }

    pub(crate) fn take_pending_signals(&mut self) -> Vec<PendingSignal> {
        std::mem::take(&mut self.pending_signals)
    }
}

pub(crate) fn summarize(root: &Execution, state: ProcessState) -> ProcessInstanceSummary {
    ProcessInstanceSummary {
        instance_id: root.id,
        root_instance_id: root.root_process_instance_id,
        process_definition_id: root.process_definition_id.clone(),
        business_key: root.business_key.clone(),
        tenant_id: root.tenant_id.clone(),
        state,
        started_at: root.created_at,
    }
}

/// Node lookup for the flow node an execution sits on.
pub(crate) fn current_node(
    ctx: &CommandContext,
    execution_id: ExecutionId,
) -> EngineResult<(Arc<ProcessDefinition>, NodeId)> {
    let definition = ctx.definition_of(execution_id)?;
    let node_id = ctx.node_id_of(execution_id)?;
    definition.node(&node_id)?;
    Ok((definition, node_id))
}
