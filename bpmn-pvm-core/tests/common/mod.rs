//! Shared harness for the engine integration tests: an engine over a
//! fresh `MemoryStore` plus helpers to find waiting executions.

#![allow(dead_code)]

use bpmn_pvm_core::tree::{Execution, ExecutionTree};
use bpmn_pvm_core::{
    EngineConfig, ExecutionId, HistoryEvent, MemoryStore, ProcessEngine, ProcessState,
    TaskHandlerRegistry, Value, Variables,
};
use std::sync::Arc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Variables from a JSON object literal.
pub fn vars(value: Value) -> Variables {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        Value::Null => Variables::new(),
        other => panic!("expected a JSON object, got {other}"),
    }
}

// ---------------------------------------------------------------------------
// Rig
// ---------------------------------------------------------------------------

pub struct Rig {
    pub engine: ProcessEngine,
}

impl Rig {
    pub fn new() -> Self {
        Self::build(EngineConfig::default(), TaskHandlerRegistry::new())
    }

    pub fn with_handlers(handlers: TaskHandlerRegistry) -> Self {
        Self::build(EngineConfig::default(), handlers)
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::build(config, TaskHandlerRegistry::new())
    }

    fn build(config: EngineConfig, handlers: TaskHandlerRegistry) -> Self {
        init_tracing();
        let engine = ProcessEngine::new(Arc::new(MemoryStore::new()))
            .with_config(config)
            .with_handlers(handlers);
        Self { engine }
    }

    pub async fn deploy(&self, yaml: &str) {
        self.engine.deploy_yaml(yaml).await.expect("deploy");
    }

    pub async fn start(&self, key: &str, variables: Value) -> ExecutionId {
        self.engine
            .start_process(key, None, vars(variables))
            .await
            .expect("start process")
    }

    pub async fn executions(&self, root: ExecutionId) -> Vec<Execution> {
        self.engine.executions(root).await.expect("load executions")
    }

    pub async fn execution(&self, root: ExecutionId, id: ExecutionId) -> Execution {
        self.executions(root)
            .await
            .into_iter()
            .find(|e| e.id == id)
            .unwrap_or_else(|| panic!("execution {id} is gone"))
    }

    /// Active tokens positioned at `node`, oldest first.
    pub async fn tokens_at(&self, root: ExecutionId, node: &str) -> Vec<Execution> {
        self.executions(root)
            .await
            .into_iter()
            .filter(|e| e.node_id.as_deref() == Some(node) && e.is_active && !e.is_scope)
            .collect()
    }

    /// The single token waiting at `node`.
    pub async fn waiting_at(&self, root: ExecutionId, node: &str) -> ExecutionId {
        let tokens = self.tokens_at(root, node).await;
        assert_eq!(tokens.len(), 1, "expected one token at '{node}', found {}", tokens.len());
        tokens[0].id
    }

    pub async fn complete_at(&self, root: ExecutionId, node: &str, variables: Value) {
        let id = self.waiting_at(root, node).await;
        self.engine
            .complete(id, vars(variables))
            .await
            .unwrap_or_else(|e| panic!("complete '{node}': {e}"));
    }

    pub async fn variable(&self, root: ExecutionId, name: &str) -> Option<Value> {
        self.execution(root, root).await.variables.get(name).cloned()
    }

    pub async fn state(&self, instance: ExecutionId) -> ProcessState {
        self.engine.instance_state(instance).await.expect("instance state")
    }

    pub async fn history(&self, instance: ExecutionId) -> Vec<HistoryEvent> {
        self.engine.history(instance).await.expect("history")
    }

    /// Delete reasons recorded for `instance`, as `(node, reason)`.
    pub async fn deletions(&self, instance: ExecutionId) -> Vec<(Option<String>, String)> {
        self.history(instance)
            .await
            .into_iter()
            .filter_map(|event| match event {
                HistoryEvent::ExecutionDeleted { node_id, reason, .. } => Some((node_id, reason)),
                _ => None,
            })
            .collect()
    }

    pub async fn assert_tree(&self, root: ExecutionId) {
        let tree = ExecutionTree::from_executions(self.executions(root).await);
        if let Err(violation) = tree.check_invariants() {
            panic!("tree invariant violated: {violation}");
        }
    }
}
