use crate::config::HistoryLevel;
use crate::types::*;
use serde::{Deserialize, Serialize};

/// History events: the audit trail for every process instance. Appended
/// after the transaction commits; the engine never depends on the outcome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum HistoryEvent {
    ProcessStarted {
        instance_id: ExecutionId,
        process_definition_id: String,
        business_key: Option<String>,
        super_execution_id: Option<ExecutionId>,
        at: Timestamp,
    },
    ProcessCompleted {
        instance_id: ExecutionId,
        at: Timestamp,
    },
    ProcessTerminated {
        instance_id: ExecutionId,
        node_id: NodeId,
        at: Timestamp,
    },
    ProcessCancelled {
        instance_id: ExecutionId,
        reason: String,
        at: Timestamp,
    },
    ActivityStarted {
        execution_id: ExecutionId,
        node_id: NodeId,
        at: Timestamp,
    },
    ActivityCompleted {
        execution_id: ExecutionId,
        node_id: NodeId,
        at: Timestamp,
    },
    /// Execution removed before completing normally.
    ExecutionDeleted {
        execution_id: ExecutionId,
        node_id: Option<NodeId>,
        reason: String,
    },
    /// Business fault routed to an error boundary or error event sub-process.
    ErrorCaught {
        error_code: String,
        thrown_at: NodeId,
        handler_id: NodeId,
    },
    MultiInstanceCompleted {
        node_id: NodeId,
        completed: u64,
        total: u64,
    },
    CompensationThrown {
        node_id: NodeId,
        handlers: usize,
    },
    SequenceFlowTaken {
        execution_id: ExecutionId,
        flow_id: String,
    },
    JoinArrived {
        gateway_id: NodeId,
        execution_id: ExecutionId,
        joined: usize,
        expected: usize,
    },
    SubscriptionCreated {
        subscription_id: SubscriptionId,
        kind: EventKind,
        event_name: String,
    },
    SubscriptionDeleted {
        subscription_id: SubscriptionId,
        kind: EventKind,
        event_name: String,
    },
}

impl HistoryEvent {
    /// Lowest history level that records this event.
    pub fn level(&self) -> HistoryLevel {
        match self {
            HistoryEvent::SequenceFlowTaken { .. }
            | HistoryEvent::JoinArrived { .. }
            | HistoryEvent::SubscriptionCreated { .. }
            | HistoryEvent::SubscriptionDeleted { .. } => HistoryLevel::Full,
            _ => HistoryLevel::Activity,
        }
    }
}

/// A history event tagged with the process instance it belongs to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub process_instance_id: ExecutionId,
    pub event: HistoryEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn flow_level_events_need_full_history() {
        let taken = HistoryEvent::SequenceFlowTaken {
            execution_id: Uuid::now_v7(),
            flow_id: "a->b".into(),
        };
        assert_eq!(taken.level(), HistoryLevel::Full);

        let started = HistoryEvent::ActivityStarted {
            execution_id: Uuid::now_v7(),
            node_id: "a".into(),
            at: now(),
        };
        assert_eq!(started.level(), HistoryLevel::Activity);
    }

    #[test]
    fn events_serialize() {
        let event = HistoryEvent::ExecutionDeleted {
            execution_id: Uuid::now_v7(),
            node_id: Some("task".into()),
            reason: DeleteReason::TerminateEndEvent {
                node_id: "kill".into(),
            }
            .to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: HistoryEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
