//! Compiled, immutable flow graph consumed by the behaviors.

use crate::error::{EngineError, EngineResult};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// `key:<content hash>`; unique per deployed content.
    pub id: String,
    pub key: String,
    pub name: Option<String>,
    /// None start event of the process level.
    pub initial: NodeId,
    pub nodes: BTreeMap<NodeId, FlowNode>,
    pub flows: Vec<SequenceFlow>,
    /// Event sub-processes declared at process level.
    pub event_sub_processes: Vec<NodeId>,
    /// `from -> every node reachable in one or more steps`.
    pub(crate) reachability: HashMap<NodeId, BTreeSet<NodeId>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: NodeId,
    /// Enclosing sub-process; `None` at process level.
    pub container: Option<NodeId>,
    pub kind: NodeKind,
    /// Indexes into `ProcessDefinition::flows`, declaration order.
    pub incoming: Vec<usize>,
    pub outgoing: Vec<usize>,
    pub default_flow: Option<usize>,
    /// Boundary events attached to this activity, declaration order.
    pub boundaries: Vec<NodeId>,
    pub multi_instance: Option<MultiInstance>,
    pub is_for_compensation: bool,
    /// Containers only: the start event that begins the inner flow.
    pub initial: Option<NodeId>,
    /// Sub-processes only: event sub-processes declared inside.
    pub event_sub_processes: Vec<NodeId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    pub source: NodeId,
    pub target: NodeId,
    pub condition: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Mapping {
    pub source: String,
    pub target: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultiInstance {
    pub sequential: bool,
    pub cardinality: Option<String>,
    pub collection: Option<String>,
    pub element_variable: Option<String>,
    pub completion_condition: Option<String>,
    pub output_element: Option<String>,
    pub output_collection: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum BoundaryTrigger {
    Timer { duration_ms: u64, repeat: u32 },
    Message { message: String, correlation_key: Option<String> },
    Signal { signal: String },
    Error { error_code: Option<String> },
    Compensation { handler: NodeId },
}

/// Closed set of node behaviors, selected at compile time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NodeKind {
    StartEvent,
    ErrorStartEvent { error_code: Option<String> },
    EndEvent,
    TerminateEndEvent { terminate_all: bool },
    ErrorEndEvent { error_code: String, message: Option<String> },
    CompensationEndEvent { activity: Option<NodeId> },
    UserTask { assignee: Option<String> },
    ManualTask,
    ReceiveTask { message: String, correlation_key: Option<String> },
    ServiceTask { task_type: String },
    ScriptTask { script: String, result_variable: Option<String> },
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    EventBasedGateway,
    TimerCatchEvent { duration_ms: u64 },
    MessageCatchEvent { message: String, correlation_key: Option<String> },
    SignalCatchEvent { signal: String },
    SignalThrowEvent { signal: String },
    CompensationThrowEvent { activity: Option<NodeId> },
    NoneThrowEvent,
    SubProcess,
    EventSubProcess,
    CallActivity {
        called_process: String,
        inputs: Vec<Mapping>,
        outputs: Vec<Mapping>,
    },
    BoundaryEvent {
        host: NodeId,
        interrupting: bool,
        trigger: BoundaryTrigger,
    },
}

impl NodeKind {
    /// Boundary events that wait on an execution of their own.
    pub fn is_event_boundary(&self) -> bool {
        matches!(
            self,
            NodeKind::BoundaryEvent {
                trigger: BoundaryTrigger::Timer { .. }
                    | BoundaryTrigger::Message { .. }
                    | BoundaryTrigger::Signal { .. },
                ..
            }
        )
    }
}

impl ProcessDefinition {
    pub fn node(&self, id: &str) -> EngineResult<&FlowNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| EngineError::node_not_found(id))
    }

    pub fn flow(&self, index: usize) -> EngineResult<&SequenceFlow> {
        self.flows.get(index).ok_or_else(|| {
            EngineError::InvalidDefinition(format!("flow index {index} out of range"))
        })
    }

    pub fn outgoing<'a>(&'a self, node: &'a FlowNode) -> impl Iterator<Item = &'a SequenceFlow> + 'a {
        node.outgoing.iter().filter_map(|i| self.flows.get(*i))
    }

    /// True when a token at `from` can arrive at `to` by following sequence
    /// flows or leaving through a boundary event. Loops are accounted for.
    pub fn can_reach(&self, from: &str, to: &str) -> bool {
        self.reachability
            .get(from)
            .is_some_and(|targets| targets.contains(to))
    }

    /// Event sub-processes of a container (`None` = process level).
    pub fn event_sub_processes_of(&self, container: Option<&str>) -> &[NodeId] {
        match container.and_then(|c| self.nodes.get(c)) {
            Some(node) => &node.event_sub_processes,
            None => &self.event_sub_processes,
        }
    }

    /// Boundary nodes of `node` that need their own waiting execution.
    pub fn event_boundaries<'a>(&'a self, node: &'a FlowNode) -> impl Iterator<Item = &'a FlowNode> + 'a {
        node.boundaries
            .iter()
            .filter_map(|b| self.nodes.get(b))
            .filter(|b| b.kind.is_event_boundary())
    }
}
