//! bpmn-pvm-core: a process virtual machine for BPMN-style processes.
//!
//! A running process is a tree of executions. Behaviors attached to flow
//! nodes move executions through the graph by planning operations on a
//! FIFO agenda; waits are recorded as event subscriptions. Each command is
//! one transaction over a process family, committed to a [`ProcessStore`]
//! with optimistic locking.
//!
//! - [`definition`]: authoring DTO, YAML loading, validation, compiled graph
//! - [`tree`] / [`subscription`]: the runtime state of one family
//! - [`agenda`] / [`behavior`]: the operation loop and node semantics
//! - [`engine`]: the async façade (deploy, start, complete, correlate)

pub mod agenda;
pub mod behavior;
pub mod config;
pub mod context;
pub mod definition;
pub mod engine;
pub mod error;
pub mod events;
pub mod expression;
pub mod handler;
pub mod store;
pub mod store_memory;
pub mod subscription;
pub mod tree;
pub mod types;

pub use agenda::Trigger;
pub use config::{EngineConfig, HistoryLevel};
pub use engine::{ProcessEngine, Transaction};
pub use error::{BpmnError, EngineError, EngineResult};
pub use events::HistoryEvent;
pub use handler::{TaskContext, TaskHandler, TaskHandlerRegistry};
pub use store::ProcessStore;
pub use store_memory::MemoryStore;
pub use types::*;
