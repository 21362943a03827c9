//! ProcessEngine: the async façade over the agenda.
//!
//! Every command is one transaction: load the process family from the
//! store, drain the agenda in memory, commit the change set. A command that
//! fails leaves the store untouched.

use crate::agenda::{self, Trigger};
use crate::behavior::error_propagation;
use crate::config::EngineConfig;
use crate::context::{CommandContext, EngineServices, PendingSignal};
use crate::definition::{
    build_definition, parse_process_yaml, DefinitionRegistry, NodeKind, ProcessDefinition, ProcessDto,
};
use crate::error::{BpmnError, EngineError, EngineResult};
use crate::events::HistoryEvent;
use crate::expression::{ExpressionEvaluator, SimpleExpressionEvaluator};
use crate::handler::TaskHandlerRegistry;
use crate::store::{CommitConflict, ProcessStore};
use crate::subscription::{EventSubscription, SubscriptionRegistry};
use crate::tree::{Execution, ExecutionTree};
use crate::types::*;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An open transaction on one process family.
///
/// Commands on a transaction drain the agenda immediately; nothing reaches
/// the store until [`ProcessEngine::commit`]. A transaction whose command
/// failed must be dropped, not committed.
pub struct Transaction {
    ctx: CommandContext,
    root: ExecutionId,
}

impl Transaction {
    pub fn root_instance_id(&self) -> ExecutionId {
        self.root
    }

    pub fn context(&self) -> &CommandContext {
        &self.ctx
    }

    /// Complete a waiting execution (user task, external service task, or
    /// any catch event delivered by hand).
    pub fn complete(&mut self, execution_id: ExecutionId, variables: Variables) -> EngineResult<()> {
        self.trigger(
            execution_id,
            Trigger {
                subscription_id: None,
                variables,
            },
        )
    }

    pub fn trigger(&mut self, execution_id: ExecutionId, trigger: Trigger) -> EngineResult<()> {
        self.ctx.tree.get(execution_id)?;
        self.ctx.agenda.plan_trigger_execution(execution_id, trigger);
        agenda::run(&mut self.ctx)
    }

    /// Throw a business fault from a waiting execution.
    pub fn fail_task(&mut self, execution_id: ExecutionId, fault: BpmnError) -> EngineResult<()> {
        self.ctx.tree.get(execution_id)?;
        error_propagation::propagate(&mut self.ctx, execution_id, fault)?;
        agenda::run(&mut self.ctx)
    }

    pub fn cancel(&mut self, instance_id: ExecutionId, reason: &str) -> EngineResult<()> {
        self.ctx.cancel_process_instance(instance_id, reason)
    }

    /// Deliver `signal` to every signal wait of this family.
    fn signal(&mut self, signal: &PendingSignal) -> EngineResult<usize> {
        let waiting = self
            .ctx
            .subscriptions
            .find_by_event(EventKind::Signal, &signal.name, None);
        for subscription in &waiting {
            self.ctx.agenda.plan_trigger_execution(
                subscription.execution_id,
                Trigger {
                    subscription_id: Some(subscription.id),
                    variables: signal.variables.clone(),
                },
            );
        }
        agenda::run(&mut self.ctx)?;
        Ok(waiting.len())
    }
}

pub struct ProcessEngine {
    store: Arc<dyn ProcessStore>,
    services: EngineServices,
}

impl ProcessEngine {
    pub fn new(store: Arc<dyn ProcessStore>) -> Self {
        Self {
            store,
            services: EngineServices {
                definitions: Arc::new(DefinitionRegistry::new()),
                evaluator: Arc::new(SimpleExpressionEvaluator),
                handlers: Arc::new(TaskHandlerRegistry::new()),
                config: Arc::new(EngineConfig::default()),
            },
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.services.config = Arc::new(config);
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.services.evaluator = evaluator;
        self
    }

    pub fn with_handlers(mut self, handlers: TaskHandlerRegistry) -> Self {
        self.services.handlers = Arc::new(handlers);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn store(&self) -> &Arc<dyn ProcessStore> {
        &self.store
    }

    // ── Deployment ──

    /// Validate, compile and store a definition; it becomes the latest
    /// version of its key.
    pub async fn deploy(&self, dto: &ProcessDto) -> EngineResult<Arc<ProcessDefinition>> {
        let definition = build_definition(dto)?;
        self.store.save_definition(&definition).await?;
        info!(definition = %definition.id, nodes = definition.nodes.len(), "Process definition deployed");
        Ok(self.services.definitions.insert(definition))
    }

    pub async fn deploy_yaml(&self, yaml: &str) -> EngineResult<Arc<ProcessDefinition>> {
        let dto = parse_process_yaml(yaml).map_err(|e| EngineError::InvalidDefinition(format!("{e:#}")))?;
        self.deploy(&dto).await
    }

    // ── Commands ──

    /// Start the latest version of `key` and run it to its first wait states.
    pub async fn start_process(
        &self,
        key: &str,
        business_key: Option<String>,
        variables: Variables,
    ) -> EngineResult<ExecutionId> {
        let definition = self
            .latest_definition(key)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(key.to_string()))?;
        self.load_called_definitions(&definition).await?;
        let mut ctx = CommandContext::new(
            self.services.clone(),
            ExecutionTree::new(),
            SubscriptionRegistry::new(),
        );
        let instance_id = ctx.start_process_instance(&definition, business_key, variables, None)?;
        agenda::run(&mut ctx)?;
        self.commit(Transaction {
            ctx,
            root: instance_id,
        })
        .await?;
        Ok(instance_id)
    }

    pub async fn complete(&self, execution_id: ExecutionId, variables: Variables) -> EngineResult<()> {
        let mut tx = self.begin_for_execution(execution_id).await?;
        tx.complete(execution_id, variables)?;
        self.commit(tx).await
    }

    pub async fn fail_task(&self, execution_id: ExecutionId, fault: BpmnError) -> EngineResult<()> {
        let mut tx = self.begin_for_execution(execution_id).await?;
        tx.fail_task(execution_id, fault)?;
        self.commit(tx).await
    }

    /// Deliver a message to the oldest matching wait. Returns the execution
    /// that received it, or `None` when nothing was waiting.
    pub async fn message_received(
        &self,
        name: &str,
        correlation_key: Option<&str>,
        variables: Variables,
    ) -> EngineResult<Option<ExecutionId>> {
        let waiting = self
            .store
            .find_subscriptions(EventKind::Message, name, correlation_key)
            .await?;
        let Some(subscription) = waiting.into_iter().next() else {
            debug!(message = name, correlation_key, "No execution waiting for message");
            return Ok(None);
        };
        let mut tx = self.begin_for_execution(subscription.execution_id).await?;
        tx.trigger(
            subscription.execution_id,
            Trigger {
                subscription_id: Some(subscription.id),
                variables,
            },
        )?;
        self.commit(tx).await?;
        Ok(Some(subscription.execution_id))
    }

    /// Broadcast a signal to every process family. Returns how many
    /// families received it.
    pub async fn signal_event_received(&self, name: &str, variables: Variables) -> EngineResult<usize> {
        let signal = PendingSignal {
            name: name.to_string(),
            variables,
        };
        Ok(self.broadcast(VecDeque::from([(signal, None)])).await)
    }

    /// Fire a timer subscription. Returns false when it is already gone.
    pub async fn fire_timer(&self, subscription_id: SubscriptionId) -> EngineResult<bool> {
        let Some(subscription) = self.store.load_subscription(subscription_id).await? else {
            return Ok(false);
        };
        if subscription.kind != EventKind::Timer {
            return Err(EngineError::InvalidState(format!(
                "subscription {subscription_id} is a {} subscription, not a timer",
                subscription.kind
            )));
        }
        let mut tx = self.begin_for_execution(subscription.execution_id).await?;
        tx.trigger(
            subscription.execution_id,
            Trigger {
                subscription_id: Some(subscription_id),
                variables: Variables::new(),
            },
        )?;
        self.commit(tx).await?;
        Ok(true)
    }

    /// Timers due at `now`, for an external scheduler to fire.
    pub async fn due_timers(&self, now: Timestamp) -> EngineResult<Vec<EventSubscription>> {
        Ok(self.store.due_timers(now).await?)
    }

    pub async fn cancel_process_instance(&self, instance_id: ExecutionId, reason: &str) -> EngineResult<()> {
        let mut tx = self.begin_for_execution(instance_id).await?;
        tx.cancel(instance_id, reason)?;
        self.commit(tx).await
    }

    // ── Transactions ──

    /// Open a transaction on the family rooted at `root_instance_id`.
    pub async fn begin(&self, root_instance_id: ExecutionId) -> EngineResult<Transaction> {
        let snapshot = self.store.load_family(root_instance_id).await?;
        if snapshot.executions.is_empty() {
            return Err(EngineError::NotFound {
                kind: "process instance",
                id: root_instance_id.to_string(),
            });
        }
        self.load_definitions(&snapshot.executions).await?;
        let ctx = CommandContext::new(
            self.services.clone(),
            ExecutionTree::from_executions(snapshot.executions),
            SubscriptionRegistry::from_subscriptions(snapshot.subscriptions),
        );
        Ok(Transaction {
            ctx,
            root: root_instance_id,
        })
    }

    /// Open a transaction on the family that contains `execution_id`.
    pub async fn begin_for_execution(&self, execution_id: ExecutionId) -> EngineResult<Transaction> {
        let execution = self
            .store
            .load_execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::execution_not_found(execution_id))?;
        self.begin(execution.root_process_instance_id).await
    }

    /// Commit a transaction, append its history, then deliver the signals
    /// it threw to the other process families. Once the commit succeeds
    /// the command has succeeded; a family that fails to take a signal is
    /// logged and skipped.
    pub async fn commit(&self, tx: Transaction) -> EngineResult<()> {
        let origin = tx.root;
        let signals = self.persist(tx).await?;
        if !signals.is_empty() {
            self.broadcast(signals.into_iter().map(|s| (s, Some(origin))).collect())
                .await;
        }
        Ok(())
    }

    async fn persist(&self, mut tx: Transaction) -> EngineResult<Vec<PendingSignal>> {
        let changes = tx.ctx.take_changes();
        self.store.commit(&changes).await.map_err(commit_error)?;
        for record in tx.ctx.take_history() {
            if let Err(e) = self
                .store
                .append_history(record.process_instance_id, &record.event)
                .await
            {
                warn!(
                    instance_id = %record.process_instance_id,
                    error = %e,
                    "History append failed"
                );
            }
        }
        Ok(tx.ctx.take_pending_signals())
    }

    /// Each signal reaches each family at most once; a family does not
    /// receive the signals it threw itself. Every delivery is its own
    /// transaction, so one failing family does not stop the others.
    async fn broadcast(&self, mut queue: VecDeque<(PendingSignal, Option<ExecutionId>)>) -> usize {
        let mut delivered: HashSet<(String, ExecutionId)> = HashSet::new();
        let mut reached = 0;
        while let Some((signal, origin)) = queue.pop_front() {
            let roots = match self.families_waiting_for(&signal.name).await {
                Ok(roots) => roots,
                Err(e) => {
                    warn!(signal = %signal.name, error = %e, "Signal lookup failed");
                    continue;
                }
            };
            for root in roots {
                if origin == Some(root) || !delivered.insert((signal.name.clone(), root)) {
                    continue;
                }
                match self.deliver_signal(root, &signal).await {
                    Ok(None) => {}
                    Ok(Some(thrown)) => {
                        reached += 1;
                        debug!(signal = %signal.name, root = %root, "Signal delivered");
                        queue.extend(thrown.into_iter().map(|s| (s, Some(root))));
                    }
                    Err(e) => warn!(
                        signal = %signal.name,
                        root = %root,
                        error = %e,
                        "Signal delivery failed"
                    ),
                }
            }
        }
        reached
    }

    /// Deliver `signal` to one family in its own transaction. `None` when
    /// nothing there was waiting any more.
    async fn deliver_signal(
        &self,
        root: ExecutionId,
        signal: &PendingSignal,
    ) -> EngineResult<Option<Vec<PendingSignal>>> {
        let mut tx = self.begin(root).await?;
        if tx.signal(signal)? == 0 {
            return Ok(None);
        }
        Ok(Some(self.persist(tx).await?))
    }

    async fn families_waiting_for(&self, signal: &str) -> EngineResult<Vec<ExecutionId>> {
        let mut roots = Vec::new();
        for subscription in self
            .store
            .find_subscriptions(EventKind::Signal, signal, None)
            .await?
        {
            if let Some(execution) = self.store.load_execution(subscription.execution_id).await? {
                if !roots.contains(&execution.root_process_instance_id) {
                    roots.push(execution.root_process_instance_id);
                }
            }
        }
        Ok(roots)
    }

    /// Latest version of `key`: the registry first, then deployments made
    /// by earlier engines over the same store.
    async fn latest_definition(&self, key: &str) -> EngineResult<Option<Arc<ProcessDefinition>>> {
        if let Some(definition) = self.services.definitions.latest(key) {
            return Ok(Some(definition));
        }
        let stored = self
            .store
            .list_definitions()
            .await?
            .into_iter()
            .filter(|d| d.key == key)
            .last();
        Ok(stored.map(|definition| {
            debug!(key, definition = %definition.id, "Definition loaded from store");
            self.services.definitions.insert(definition)
        }))
    }

    /// Call activities resolve their process inside the agenda, so every
    /// key reachable through them is loaded before the transaction runs.
    /// Unknown keys are left for the call activity to report.
    async fn load_called_definitions(&self, definition: &ProcessDefinition) -> EngineResult<()> {
        let mut seen: HashSet<String> = HashSet::from([definition.key.clone()]);
        let mut pending = called_keys(definition);
        while let Some(key) = pending.pop() {
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some(called) = self.latest_definition(&key).await? {
                pending.extend(called_keys(&called));
            }
        }
        Ok(())
    }

    async fn load_definitions(&self, executions: &[Execution]) -> EngineResult<()> {
        let ids: BTreeSet<&str> = executions
            .iter()
            .map(|e| e.process_definition_id.as_str())
            .collect();
        for id in ids {
            let definition = match self.services.definitions.get(id) {
                Some(definition) => definition,
                None => {
                    let stored = self
                        .store
                        .load_definition(id)
                        .await?
                        .ok_or_else(|| EngineError::DefinitionNotFound(id.to_string()))?;
                    self.services.definitions.cache(stored)
                }
            };
            self.load_called_definitions(&definition).await?;
        }
        Ok(())
    }

    // ── Reads ──

    /// Live executions of a process family, oldest first.
    pub async fn executions(&self, root_instance_id: ExecutionId) -> EngineResult<Vec<Execution>> {
        let mut executions = self.store.load_family(root_instance_id).await?.executions;
        executions.sort_by_key(|e| (e.created_at, e.id));
        Ok(executions)
    }

    pub async fn subscriptions(&self, root_instance_id: ExecutionId) -> EngineResult<Vec<EventSubscription>> {
        let mut subscriptions = self.store.load_family(root_instance_id).await?.subscriptions;
        subscriptions.sort_by_key(|s| s.sequence);
        Ok(subscriptions)
    }

    pub async fn history(&self, instance_id: ExecutionId) -> EngineResult<Vec<HistoryEvent>> {
        Ok(self
            .store
            .read_history(instance_id, 1)
            .await?
            .into_iter()
            .map(|(_, event)| event)
            .collect())
    }

    pub async fn instance_state(&self, instance_id: ExecutionId) -> EngineResult<ProcessState> {
        self.store
            .load_instance(instance_id)
            .await?
            .map(|summary| summary.state)
            .ok_or_else(|| EngineError::NotFound {
                kind: "process instance",
                id: instance_id.to_string(),
            })
    }
}

/// Typed engine errors for store conflicts; anything else stays a store error.
fn called_keys(definition: &ProcessDefinition) -> Vec<String> {
    definition
        .nodes
        .values()
        .filter_map(|node| match &node.kind {
            NodeKind::CallActivity { called_process, .. } => Some(called_process.clone()),
            _ => None,
        })
        .collect()
}

fn commit_error(error: anyhow::Error) -> EngineError {
    match error.downcast::<CommitConflict>() {
        Ok(CommitConflict::StaleExecution(execution_id)) => {
            EngineError::ConcurrentModification { execution_id }
        }
        Ok(CommitConflict::DuplicateSubscription {
            kind,
            name,
            correlation_key,
        }) => EngineError::DuplicateSubscription {
            kind,
            name,
            correlation_key,
        },
        Err(other) => EngineError::Store(other),
    }
}
