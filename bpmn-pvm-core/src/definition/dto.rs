use serde::{Deserialize, Serialize};

// ── Helper defaults for serde ──

fn default_true() -> bool {
    true
}

fn is_false(v: &bool) -> bool {
    !v
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

// ── Top-level DTO ──

/// Authoring form of a process. `id` is the process key; deployments of the
/// same key get distinct definition ids derived from the content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDto {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub nodes: Vec<NodeDto>,
    #[serde(default)]
    pub edges: Vec<EdgeDto>,
}

// ── Edge ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDto {
    /// Optional explicit flow id; defaults to `from->to`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub from: String,
    pub to: String,
    /// Expression evaluated against the arriving execution, e.g. `${amount > 100}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_default: bool,
}

impl EdgeDto {
    pub fn flow_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}->{}", self.from, self.to))
    }
}

// ── Node ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDto {
    pub id: String,
    /// Enclosing sub-process or event sub-process; `None` = process level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_instance: Option<MultiInstanceDto>,
    /// Compensation handler activity (only reachable through a compensation boundary).
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_for_compensation: bool,
    #[serde(flatten)]
    pub kind: NodeKindDto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum NodeKindDto {
    Start,
    ErrorStart {
        /// `None` catches every error code.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
    End {
        #[serde(default, skip_serializing_if = "is_false")]
        terminate: bool,
        /// Terminate the whole process instance family, not just the enclosing scope.
        #[serde(default, skip_serializing_if = "is_false")]
        terminate_all: bool,
    },
    ErrorEnd {
        error_code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    CompensationEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        activity: Option<String>,
    },
    UserTask {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignee: Option<String>,
    },
    ManualTask,
    ReceiveTask {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_key: Option<String>,
    },
    ServiceTask {
        task_type: String,
    },
    ScriptTask {
        script: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_variable: Option<String>,
    },
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    EventBasedGateway,
    TimerCatch {
        duration_ms: u64,
    },
    MessageCatch {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_key: Option<String>,
    },
    SignalCatch {
        signal: String,
    },
    SignalThrow {
        signal: String,
    },
    CompensationThrow {
        /// `None` broadcasts to every compensable activity of the scope.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        activity: Option<String>,
    },
    NoneThrow,
    SubProcess,
    EventSubProcess,
    CallActivity {
        called_process: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        inputs: Vec<MappingDto>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        outputs: Vec<MappingDto>,
    },
    BoundaryTimer {
        host: String,
        duration_ms: u64,
        #[serde(default = "default_true")]
        interrupting: bool,
        /// Extra firings after the first (non-interrupting only).
        #[serde(default, skip_serializing_if = "is_zero")]
        repeat: u32,
    },
    BoundaryMessage {
        host: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_key: Option<String>,
        #[serde(default = "default_true")]
        interrupting: bool,
    },
    BoundarySignal {
        host: String,
        signal: String,
        #[serde(default = "default_true")]
        interrupting: bool,
    },
    BoundaryError {
        host: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
    BoundaryCompensation {
        host: String,
        handler: String,
    },
}

/// Variable mapping for call activities: `source` is an expression evaluated
/// in the calling (or called, for outputs) scope, `target` a variable name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingDto {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiInstanceDto {
    #[serde(default, skip_serializing_if = "is_false")]
    pub sequential: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cardinality: Option<String>,
    /// Expression resolving to a JSON array.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_condition: Option<String>,
    /// Expression evaluated in each instance when it completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_element: Option<String>,
    /// Variable receiving the ordered list of output elements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_collection: Option<String>,
}

// ── NodeKindDto helpers ──

impl NodeKindDto {
    /// Host activity id for boundary events.
    pub fn host(&self) -> Option<&str> {
        match self {
            NodeKindDto::BoundaryTimer { host, .. }
            | NodeKindDto::BoundaryMessage { host, .. }
            | NodeKindDto::BoundarySignal { host, .. }
            | NodeKindDto::BoundaryError { host, .. }
            | NodeKindDto::BoundaryCompensation { host, .. } => Some(host),
            _ => None,
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self, NodeKindDto::Start | NodeKindDto::ErrorStart { .. })
    }

    /// Nodes that can own boundary events and a multi-instance block.
    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            NodeKindDto::UserTask { .. }
                | NodeKindDto::ManualTask
                | NodeKindDto::ReceiveTask { .. }
                | NodeKindDto::ServiceTask { .. }
                | NodeKindDto::ScriptTask { .. }
                | NodeKindDto::SubProcess
                | NodeKindDto::CallActivity { .. }
        )
    }

    /// Containers whose children declare them as `parent`.
    pub fn is_container(&self) -> bool {
        matches!(self, NodeKindDto::SubProcess | NodeKindDto::EventSubProcess)
    }
}
