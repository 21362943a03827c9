//! Synchronous service-task handlers.
//!
//! A service task whose `task_type` has a registered handler runs inline in
//! the agenda and leaves; without one it is a wait state completed from the
//! outside (`ProcessEngine::complete` / `fail_task`).

use crate::error::BpmnError;
use crate::types::{ExecutionId, Value, Variables};
use std::collections::HashMap;
use std::sync::Arc;

pub struct TaskContext<'a> {
    pub execution_id: ExecutionId,
    pub node_id: &'a str,
    pub task_type: &'a str,
    variables: &'a Variables,
    outputs: Variables,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        execution_id: ExecutionId,
        node_id: &'a str,
        task_type: &'a str,
        variables: &'a Variables,
    ) -> Self {
        Self {
            execution_id,
            node_id,
            task_type,
            variables,
            outputs: Variables::new(),
        }
    }

    /// Variable visible from the task's execution (outputs set so far win).
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name).or_else(|| self.variables.get(name))
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.outputs.insert(name.into(), value);
    }

    pub(crate) fn into_outputs(self) -> Variables {
        self.outputs
    }
}

pub trait TaskHandler: Send + Sync {
    fn execute(&self, task: &mut TaskContext<'_>) -> Result<(), BpmnError>;
}

impl<F> TaskHandler for F
where
    F: Fn(&mut TaskContext<'_>) -> Result<(), BpmnError> + Send + Sync,
{
    fn execute(&self, task: &mut TaskContext<'_>) -> Result<(), BpmnError> {
        self(task)
    }
}

#[derive(Clone, Default)]
pub struct TaskHandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure for `task_type`.
    pub fn register<F>(&mut self, task_type: impl Into<String>, handler: F)
    where
        F: Fn(&mut TaskContext<'_>) -> Result<(), BpmnError> + Send + Sync + 'static,
    {
        self.handlers.insert(task_type.into(), Arc::new(handler));
    }

    pub fn register_handler(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type.into(), handler);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }
}

impl std::fmt::Debug for TaskHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&String> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("TaskHandlerRegistry")
            .field("task_types", &types)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn closures_are_handlers() {
        let mut registry = TaskHandlerRegistry::new();
        registry.register("double", |task| {
            let n = task
                .variable("n")
                .and_then(Value::as_i64)
                .ok_or_else(|| BpmnError::new("NO_INPUT", "n missing"))?;
            task.set_variable("doubled", json!(n * 2));
            Ok(())
        });

        let vars = Variables::from([("n".to_string(), json!(21))]);
        let handler = registry.get("double").unwrap();
        let mut task = TaskContext::new(Uuid::now_v7(), "calc", "double", &vars);
        handler.execute(&mut task).unwrap();
        assert_eq!(task.variable("doubled"), Some(&json!(42)));
        assert_eq!(task.into_outputs().len(), 1);

        let empty = Variables::new();
        let mut task = TaskContext::new(Uuid::now_v7(), "calc", "double", &empty);
        assert_eq!(handler.execute(&mut task).unwrap_err().error_code, "NO_INPUT");
        assert!(registry.get("missing").is_none());
    }
}
