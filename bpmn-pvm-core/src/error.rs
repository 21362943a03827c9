//! Engine error taxonomy.
//!
//! Programmatic errors abort the whole transaction. Business faults
//! (`BpmnError`) travel inside `EngineError::Bpmn` only until the agenda
//! hands them to error propagation; if no handler catches them they come
//! back out as `UnhandledBpmnError`.

use crate::types::{EventKind, ExecutionId};
use serde::{Deserialize, Serialize};

/// A business fault carrying an error code, thrown by task behaviors and
/// error end events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("BPMN error '{error_code}': {message}")]
pub struct BpmnError {
    pub error_code: String,
    pub message: String,
}

impl BpmnError {
    pub fn new(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("no outgoing sequence flow of '{node_id}' could be selected")]
    NoOutgoingFlow { node_id: String },

    #[error("duplicate {kind} subscription '{name}' for correlation key '{correlation_key}'")]
    DuplicateSubscription {
        kind: EventKind,
        name: String,
        correlation_key: String,
    },

    #[error("expression '{expression}' failed: {message}")]
    Expression { expression: String, message: String },

    #[error("invalid process definition: {0}")]
    InvalidDefinition(String),

    #[error("process definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("no scope execution above {0}")]
    MissingScope(ExecutionId),

    #[error("invalid execution state: {0}")]
    InvalidState(String),

    #[error("unhandled BPMN error '{error_code}' thrown at '{node_id}'")]
    UnhandledBpmnError { error_code: String, node_id: String },

    #[error("execution {execution_id} was modified by a concurrent transaction")]
    ConcurrentModification { execution_id: ExecutionId },

    #[error("transaction exceeded {limit} agenda operations")]
    OperationLimitExceeded { limit: usize },

    #[error(transparent)]
    Bpmn(#[from] BpmnError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    pub(crate) fn execution_not_found(id: ExecutionId) -> Self {
        EngineError::NotFound {
            kind: "execution",
            id: id.to_string(),
        }
    }

    pub(crate) fn node_not_found(id: &str) -> Self {
        EngineError::NotFound {
            kind: "flow node",
            id: id.to_string(),
        }
    }

    /// True for the business-fault class; everything else is programmatic.
    pub fn is_business_fault(&self) -> bool {
        matches!(self, EngineError::Bpmn(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
