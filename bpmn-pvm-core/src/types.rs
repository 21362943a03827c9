use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Identity of an execution node.
pub type ExecutionId = Uuid;

/// Identity of an event subscription.
pub type SubscriptionId = Uuid;

/// Flow node id as declared in the process definition.
pub type NodeId = String;

/// Process variable value. Opaque JSON to the core.
pub type Value = serde_json::Value;

/// Variable map carried by executions and trigger payloads.
pub type Variables = BTreeMap<String, Value>;

pub type Timestamp = DateTime<Utc>;

// ─── Process instance lifecycle ───────────────────────────────

/// Top-level process state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum ProcessState {
    Running,
    Completed { at: Timestamp },
    Cancelled { reason: String, at: Timestamp },
    Terminated { node_id: NodeId, at: Timestamp },
}

impl ProcessState {
    /// Returns true if the process is in a terminal state (no further progress possible).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Completed { .. }
                | ProcessState::Cancelled { .. }
                | ProcessState::Terminated { .. }
        )
    }
}

/// Durable summary of a process instance, kept after its tree is gone.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessInstanceSummary {
    pub instance_id: ExecutionId,
    pub root_instance_id: ExecutionId,
    pub process_definition_id: String,
    pub business_key: Option<String>,
    pub tenant_id: Option<String>,
    pub state: ProcessState,
    pub started_at: Timestamp,
}

// ─── Delete reasons ───────────────────────────────────────────

/// Why an execution was removed before completing normally.
///
/// Rendered into history as a string; every variant names the flow node
/// responsible for the removal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DeleteReason {
    /// Terminate end event (scope or whole root family).
    TerminateEndEvent { node_id: NodeId },
    /// Interrupting boundary event fired on the host activity.
    BoundaryEvent { boundary_id: NodeId, host_id: NodeId },
    /// Sibling of the winning catch event after an event-based gateway.
    EventGatewayCancelled { gateway_id: NodeId, winner_id: NodeId },
    /// Remaining instances once a multi-instance activity completed.
    MultiInstanceCompleted { node_id: NodeId },
    /// Scope interrupted by an error event sub-process.
    EventSubProcess { node_id: NodeId },
    /// Explicit cancellation by the caller.
    Cancelled { reason: String },
}

impl std::fmt::Display for DeleteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeleteReason::TerminateEndEvent { node_id } => {
                write!(f, "terminated by end event ({node_id})")
            }
            DeleteReason::BoundaryEvent {
                boundary_id,
                host_id,
            } => write!(f, "boundary event ({boundary_id}) interrupted {host_id}"),
            DeleteReason::EventGatewayCancelled {
                gateway_id,
                winner_id,
            } => write!(
                f,
                "event gateway ({gateway_id}) resolved by {winner_id}"
            ),
            DeleteReason::MultiInstanceCompleted { node_id } => {
                write!(f, "multi-instance ({node_id}) completed")
            }
            DeleteReason::EventSubProcess { node_id } => {
                write!(f, "interrupted by event sub-process ({node_id})")
            }
            DeleteReason::Cancelled { reason } => write!(f, "cancelled: {reason}"),
        }
    }
}

// ─── Event subscriptions ──────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Message,
    Signal,
    Timer,
    Compensate,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Message => "message",
            EventKind::Signal => "signal",
            EventKind::Timer => "timer",
            EventKind::Compensate => "compensate",
        };
        f.write_str(s)
    }
}

pub(crate) fn now() -> Timestamp {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!ProcessState::Running.is_terminal());
        assert!(ProcessState::Completed { at: now() }.is_terminal());
        assert!(ProcessState::Terminated {
            node_id: "end".into(),
            at: now()
        }
        .is_terminal());
    }

    #[test]
    fn delete_reason_names_the_node() {
        let reason = DeleteReason::TerminateEndEvent {
            node_id: "kill_all".into(),
        };
        assert!(reason.to_string().contains("kill_all"));

        let reason = DeleteReason::EventGatewayCancelled {
            gateway_id: "gw".into(),
            winner_id: "msg".into(),
        };
        assert!(reason.to_string().contains("gw"));
    }
}
