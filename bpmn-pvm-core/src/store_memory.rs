use crate::definition::ProcessDefinition;
use crate::events::HistoryEvent;
use crate::store::{ChangeSet, CommitConflict, FamilySnapshot, ProcessStore};
use crate::subscription::EventSubscription;
use crate::tree::Execution;
use crate::types::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

#[derive(Default)]
struct StoreInner {
    definitions: HashMap<String, ProcessDefinition>,
    /// Definition ids in deployment order.
    deployed: Vec<String>,
    executions: HashMap<ExecutionId, Execution>,
    subscriptions: HashMap<SubscriptionId, EventSubscription>,
    instances: HashMap<ExecutionId, ProcessInstanceSummary>,
    history: HashMap<ExecutionId, Vec<HistoryEvent>>,
}

/// In-memory ProcessStore for testing and embedding.
///
/// Commits are all-or-nothing: every row written back must still carry the
/// revision it was read with, and a correlated subscription may exist only
/// once across all families.
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check(store: &StoreInner, changes: &ChangeSet) -> Result<(), CommitConflict> {
    let read_revision = |id: &ExecutionId| store.executions.get(id).map(|e| e.revision);

    for execution in &changes.executions.updated {
        if read_revision(&execution.id) != Some(execution.revision) {
            return Err(CommitConflict::StaleExecution(execution.id));
        }
    }
    for (id, revision) in &changes.executions.deleted {
        if read_revision(id) != Some(*revision) {
            return Err(CommitConflict::StaleExecution(*id));
        }
    }

    let released: HashSet<SubscriptionId> = changes.subscriptions.deleted.iter().copied().collect();
    for created in &changes.subscriptions.created {
        let Some(key) = &created.correlation_key else {
            continue;
        };
        let taken = store.subscriptions.values().any(|s| {
            s.id != created.id
                && !released.contains(&s.id)
                && s.kind == created.kind
                && s.event_name == created.event_name
                && s.correlation_key.as_ref() == Some(key)
        });
        if taken {
            return Err(CommitConflict::DuplicateSubscription {
                kind: created.kind,
                name: created.event_name.clone(),
                correlation_key: key.clone(),
            });
        }
    }
    Ok(())
}

#[async_trait]
impl ProcessStore for MemoryStore {
    // ── Definitions ──

    async fn save_definition(&self, definition: &ProcessDefinition) -> Result<()> {
        let mut store = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        store.deployed.retain(|id| *id != definition.id);
        store.deployed.push(definition.id.clone());
        store
            .definitions
            .insert(definition.id.clone(), definition.clone());
        Ok(())
    }

    async fn load_definition(&self, id: &str) -> Result<Option<ProcessDefinition>> {
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(store.definitions.get(id).cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<ProcessDefinition>> {
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(store
            .deployed
            .iter()
            .filter_map(|id| store.definitions.get(id).cloned())
            .collect())
    }

    // ── Runtime state ──

    async fn load_family(&self, root_instance_id: ExecutionId) -> Result<FamilySnapshot> {
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let executions: Vec<Execution> = store
            .executions
            .values()
            .filter(|e| e.root_process_instance_id == root_instance_id)
            .cloned()
            .collect();
        let members: HashSet<ExecutionId> = executions.iter().map(|e| e.id).collect();
        let subscriptions = store
            .subscriptions
            .values()
            .filter(|s| members.contains(&s.execution_id))
            .cloned()
            .collect();
        Ok(FamilySnapshot {
            executions,
            subscriptions,
        })
    }

    async fn load_execution(&self, id: ExecutionId) -> Result<Option<Execution>> {
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(store.executions.get(&id).cloned())
    }

    async fn commit(&self, changes: &ChangeSet) -> Result<()> {
        let mut store = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        check(&store, changes)?;

        for (id, _) in &changes.executions.deleted {
            store.executions.remove(id);
        }
        for execution in changes
            .executions
            .created
            .iter()
            .chain(&changes.executions.updated)
        {
            let mut row = execution.clone();
            row.revision += 1;
            store.executions.insert(row.id, row);
        }

        for id in &changes.subscriptions.deleted {
            store.subscriptions.remove(id);
        }
        for subscription in changes
            .subscriptions
            .created
            .iter()
            .chain(&changes.subscriptions.updated)
        {
            store
                .subscriptions
                .insert(subscription.id, subscription.clone());
        }

        for summary in &changes.instances {
            store.instances.insert(summary.instance_id, summary.clone());
        }
        Ok(())
    }

    // ── Subscription queries ──

    async fn load_subscription(&self, id: SubscriptionId) -> Result<Option<EventSubscription>> {
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(store.subscriptions.get(&id).cloned())
    }

    async fn find_subscriptions(
        &self,
        kind: EventKind,
        name: &str,
        correlation_key: Option<&str>,
    ) -> Result<Vec<EventSubscription>> {
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut found: Vec<EventSubscription> = store
            .subscriptions
            .values()
            .filter(|s| {
                s.kind == kind
                    && s.event_name == name
                    && s.correlation_key.as_deref() == correlation_key
            })
            .cloned()
            .collect();
        found.sort_by_key(|s| (s.created_at, s.sequence));
        Ok(found)
    }

    async fn due_timers(&self, now: Timestamp) -> Result<Vec<EventSubscription>> {
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut due: Vec<EventSubscription> = store
            .subscriptions
            .values()
            .filter(|s| s.kind == EventKind::Timer && s.due_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.due_at, s.sequence));
        Ok(due)
    }

    // ── Instances ──

    async fn load_instance(&self, id: ExecutionId) -> Result<Option<ProcessInstanceSummary>> {
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(store.instances.get(&id).cloned())
    }

    // ── History ──

    async fn append_history(&self, instance_id: ExecutionId, event: &HistoryEvent) -> Result<u64> {
        let mut store = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let events = store.history.entry(instance_id).or_default();
        events.push(event.clone());
        Ok(events.len() as u64)
    }

    async fn read_history(
        &self,
        instance_id: ExecutionId,
        from_seq: u64,
    ) -> Result<Vec<(u64, HistoryEvent)>> {
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(store
            .history
            .get(&instance_id)
            .map(|events| {
                events
                    .iter()
                    .enumerate()
                    .map(|(i, e)| (i as u64 + 1, e.clone()))
                    .filter(|(seq, _)| *seq >= from_seq)
                    .collect()
            })
            .unwrap_or_default())
    }
}
