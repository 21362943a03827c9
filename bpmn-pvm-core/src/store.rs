use crate::definition::ProcessDefinition;
use crate::events::HistoryEvent;
use crate::subscription::{EventSubscription, SubscriptionChanges};
use crate::tree::{Execution, TreeChanges};
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;

/// Everything one transaction changed; applied atomically by `commit`.
#[derive(Clone, Debug, Default)]
pub struct ChangeSet {
    pub executions: TreeChanges,
    pub subscriptions: SubscriptionChanges,
    /// Instance summaries to upsert, in order (start, then end).
    pub instances: Vec<ProcessInstanceSummary>,
}

/// Rows and subscriptions of one process family (a root instance and the
/// instances it called).
#[derive(Clone, Debug, Default)]
pub struct FamilySnapshot {
    pub executions: Vec<Execution>,
    pub subscriptions: Vec<EventSubscription>,
}

/// Reasons a commit is refused. Stores wrap these in `anyhow::Error`; the
/// engine downcasts them back into typed engine errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommitConflict {
    #[error("execution {0} changed or vanished since it was read")]
    StaleExecution(ExecutionId),
    #[error("{kind} subscription '{name}' for '{correlation_key}' already exists")]
    DuplicateSubscription {
        kind: EventKind,
        name: String,
        correlation_key: String,
    },
}

/// Persistence trait for process state.
///
/// The agenda works on an in-memory family snapshot; the store is touched
/// only to load that snapshot and to commit the resulting change set.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    // ── Definitions ──

    async fn save_definition(&self, definition: &ProcessDefinition) -> Result<()>;
    async fn load_definition(&self, id: &str) -> Result<Option<ProcessDefinition>>;
    /// Deployment order, oldest first; a redeployed definition moves to the end.
    async fn list_definitions(&self) -> Result<Vec<ProcessDefinition>>;

    // ── Runtime state ──

    async fn load_family(&self, root_instance_id: ExecutionId) -> Result<FamilySnapshot>;
    async fn load_execution(&self, id: ExecutionId) -> Result<Option<Execution>>;

    /// Apply a change set atomically. Fails with a [`CommitConflict`] when
    /// a read revision is stale or a correlated subscription is taken.
    async fn commit(&self, changes: &ChangeSet) -> Result<()>;

    // ── Subscription queries ──

    async fn load_subscription(&self, id: SubscriptionId) -> Result<Option<EventSubscription>>;
    async fn find_subscriptions(
        &self,
        kind: EventKind,
        name: &str,
        correlation_key: Option<&str>,
    ) -> Result<Vec<EventSubscription>>;
    async fn due_timers(&self, now: Timestamp) -> Result<Vec<EventSubscription>>;

    // ── Instances ──

    async fn load_instance(&self, id: ExecutionId) -> Result<Option<ProcessInstanceSummary>>;

    // ── History (append-only) ──

    /// Append an event and return its sequence number.
    async fn append_history(&self, instance_id: ExecutionId, event: &HistoryEvent) -> Result<u64>;
    async fn read_history(
        &self,
        instance_id: ExecutionId,
        from_seq: u64,
    ) -> Result<Vec<(u64, HistoryEvent)>>;
}
