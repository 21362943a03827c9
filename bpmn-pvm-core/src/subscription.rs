//! Event Subscription Registry: which waiting execution resumes on which
//! message, signal, timer or compensation trigger.

use crate::error::{EngineError, EngineResult};
use crate::types::{now, EventKind, ExecutionId, NodeId, SubscriptionId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventSubscription {
    pub id: SubscriptionId,
    pub kind: EventKind,
    pub event_name: String,
    pub correlation_key: Option<String>,
    pub execution_id: ExecutionId,
    pub process_instance_id: ExecutionId,
    /// Catching node, or for compensation the compensable activity.
    pub node_id: NodeId,
    /// Compensation: id of the snapshot execution for a completed sub-process.
    pub configuration: Option<String>,
    pub due_at: Option<Timestamp>,
    /// Timer firings left after the next one.
    pub repeat: u32,
    /// Creation order within the process family.
    pub sequence: u64,
    pub created_at: Timestamp,
}

/// Fields a behavior supplies when it starts waiting.
#[derive(Clone, Debug)]
pub struct NewSubscription {
    pub kind: EventKind,
    pub event_name: String,
    pub correlation_key: Option<String>,
    pub execution_id: ExecutionId,
    pub process_instance_id: ExecutionId,
    pub node_id: NodeId,
    pub configuration: Option<String>,
    pub due_at: Option<Timestamp>,
    pub repeat: u32,
}

#[derive(Clone, Debug, Default)]
pub struct SubscriptionChanges {
    pub created: Vec<EventSubscription>,
    pub updated: Vec<EventSubscription>,
    pub deleted: Vec<SubscriptionId>,
}

#[derive(Clone, Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: BTreeMap<SubscriptionId, EventSubscription>,
    next_sequence: u64,
    created: HashSet<SubscriptionId>,
    updated: HashSet<SubscriptionId>,
    deleted: Vec<SubscriptionId>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_subscriptions(subscriptions: impl IntoIterator<Item = EventSubscription>) -> Self {
        let subscriptions: BTreeMap<_, _> = subscriptions.into_iter().map(|s| (s.id, s)).collect();
        let next_sequence = subscriptions
            .values()
            .map(|s| s.sequence + 1)
            .max()
            .unwrap_or(0);
        Self {
            subscriptions,
            next_sequence,
            ..Self::default()
        }
    }

    /// Register a wait. A correlated (kind, name, key) may only be held once.
    pub fn create(&mut self, new: NewSubscription) -> EngineResult<SubscriptionId> {
        if let Some(key) = &new.correlation_key {
            let taken = self.subscriptions.values().any(|s| {
                s.kind == new.kind
                    && s.event_name == new.event_name
                    && s.correlation_key.as_ref() == Some(key)
            });
            if taken {
                return Err(EngineError::DuplicateSubscription {
                    kind: new.kind,
                    name: new.event_name,
                    correlation_key: key.clone(),
                });
            }
        }

        let id = Uuid::now_v7();
        let subscription = EventSubscription {
            id,
            kind: new.kind,
            event_name: new.event_name,
            correlation_key: new.correlation_key,
            execution_id: new.execution_id,
            process_instance_id: new.process_instance_id,
            node_id: new.node_id,
            configuration: new.configuration,
            due_at: new.due_at,
            repeat: new.repeat,
            sequence: self.next_sequence,
            created_at: now(),
        };
        self.next_sequence += 1;
        self.created.insert(id);
        self.subscriptions.insert(id, subscription);
        Ok(id)
    }

    pub fn get(&self, id: SubscriptionId) -> EngineResult<&EventSubscription> {
        self.subscriptions.get(&id).ok_or_else(|| EngineError::NotFound {
            kind: "subscription",
            id: id.to_string(),
        })
    }

    pub fn find_by_id(&self, id: SubscriptionId) -> Option<&EventSubscription> {
        self.subscriptions.get(&id)
    }

    /// Subscriptions held by one execution, in creation order.
    pub fn find_by_execution(&self, execution_id: ExecutionId) -> Vec<EventSubscription> {
        self.sorted(|s| s.execution_id == execution_id)
    }

    /// Lookup by (kind, name, correlation). `None` matches uncorrelated waits.
    pub fn find_by_event(
        &self,
        kind: EventKind,
        name: &str,
        correlation_key: Option<&str>,
    ) -> Vec<EventSubscription> {
        self.sorted(|s| {
            s.kind == kind
                && s.event_name == name
                && s.correlation_key.as_deref() == correlation_key
        })
    }

    /// Compensate subscriptions held by `scope_id`; all of them, or only
    /// the one for `activity`.
    pub fn find_compensation(
        &self,
        scope_id: ExecutionId,
        activity: Option<&str>,
    ) -> Vec<EventSubscription> {
        self.sorted(|s| {
            s.kind == EventKind::Compensate
                && s.execution_id == scope_id
                && activity.map_or(true, |a| s.event_name == a)
        })
    }

    pub fn all(&self) -> Vec<EventSubscription> {
        self.sorted(|_| true)
    }

    fn sorted(&self, filter: impl Fn(&EventSubscription) -> bool) -> Vec<EventSubscription> {
        let mut found: Vec<EventSubscription> = self
            .subscriptions
            .values()
            .filter(|s| filter(s))
            .cloned()
            .collect();
        found.sort_by_key(|s| s.sequence);
        found
    }

    pub fn delete(&mut self, id: SubscriptionId) -> Option<EventSubscription> {
        let removed = self.subscriptions.remove(&id)?;
        self.updated.remove(&id);
        if !self.created.remove(&id) {
            self.deleted.push(id);
        }
        Some(removed)
    }

    /// Bulk cancellation of everything an execution waits on.
    pub fn delete_for_execution(&mut self, execution_id: ExecutionId) -> Vec<EventSubscription> {
        self.find_by_execution(execution_id)
            .into_iter()
            .filter_map(|s| self.delete(s.id))
            .collect()
    }

    /// Hand a subscription over to another execution (compensation snapshots).
    pub fn move_to(&mut self, id: SubscriptionId, execution_id: ExecutionId) -> EngineResult<()> {
        let subscription = self.subscriptions.get_mut(&id).ok_or_else(|| EngineError::NotFound {
            kind: "subscription",
            id: id.to_string(),
        })?;
        subscription.execution_id = execution_id;
        if !self.created.contains(&id) {
            self.updated.insert(id);
        }
        Ok(())
    }

    /// Re-arm a repeating timer.
    pub fn reschedule(&mut self, id: SubscriptionId, due_at: Timestamp) -> EngineResult<()> {
        let subscription = self.subscriptions.get_mut(&id).ok_or_else(|| EngineError::NotFound {
            kind: "subscription",
            id: id.to_string(),
        })?;
        subscription.due_at = Some(due_at);
        subscription.repeat = subscription.repeat.saturating_sub(1);
        if !self.created.contains(&id) {
            self.updated.insert(id);
        }
        Ok(())
    }

    pub fn take_changes(&mut self) -> SubscriptionChanges {
        let mut created: Vec<EventSubscription> = self
            .created
            .drain()
            .filter_map(|id| self.subscriptions.get(&id).cloned())
            .collect();
        created.sort_by_key(|s| s.sequence);
        let updated = self
            .updated
            .drain()
            .filter_map(|id| self.subscriptions.get(&id).cloned())
            .collect();
        SubscriptionChanges {
            created,
            updated,
            deleted: std::mem::take(&mut self.deleted),
        }
    }
}
