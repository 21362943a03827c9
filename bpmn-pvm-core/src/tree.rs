//! Execution Tree Store.
//!
//! Executions live in a flat arena keyed by id. Parent/child links are ids,
//! so deletion, reparenting and cycle checks are table operations. The tree
//! also records which rows were created, touched or deleted so the
//! transaction can hand a change set to storage.

use crate::error::{EngineError, EngineResult};
use crate::expression::VariableScope;
use crate::types::{now, ExecutionId, NodeId, Timestamp, Value, Variables};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub parent_id: Option<ExecutionId>,
    /// Creation order.
    pub children: Vec<ExecutionId>,
    pub process_instance_id: ExecutionId,
    /// Top of the call-activity family.
    pub root_process_instance_id: ExecutionId,
    pub process_definition_id: String,
    /// `None` for pure structural holders (e.g. a fresh process instance root).
    pub node_id: Option<NodeId>,
    pub is_scope: bool,
    pub is_active: bool,
    pub is_multi_instance_root: bool,
    /// Compensation snapshot of a completed sub-process.
    pub is_event_scope: bool,
    pub is_ended: bool,
    /// Calling execution, set on the root of a called process instance.
    pub super_execution_id: Option<ExecutionId>,
    /// Called process instance, set on the calling execution.
    pub sub_process_instance_id: Option<ExecutionId>,
    pub business_key: Option<String>,
    pub tenant_id: Option<String>,
    pub variables: Variables,
    /// Multi-instance roots: output element of each finished instance by loop index.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub multi_instance_outputs: BTreeMap<u32, Value>,
    /// Event-based gateway arrival this wait was spawned by; the arriving
    /// execution's id, shared by every branch of that race.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub race_id: Option<ExecutionId>,
    /// Optimistic lock version as read from storage.
    pub revision: u64,
    pub created_at: Timestamp,
}

impl Execution {
    pub fn is_process_instance(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Rows touched during one transaction.
#[derive(Clone, Debug, Default)]
pub struct TreeChanges {
    pub created: Vec<Execution>,
    pub updated: Vec<Execution>,
    /// Deleted ids with the revision that was read.
    pub deleted: Vec<(ExecutionId, u64)>,
}

impl TreeChanges {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExecutionTree {
    executions: HashMap<ExecutionId, Execution>,
    created: HashSet<ExecutionId>,
    dirty: HashSet<ExecutionId>,
    deleted: Vec<(ExecutionId, u64)>,
}

impl ExecutionTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a tree from stored rows; nothing is marked changed.
    pub fn from_executions(executions: impl IntoIterator<Item = Execution>) -> Self {
        Self {
            executions: executions.into_iter().map(|e| (e.id, e)).collect(),
            ..Self::default()
        }
    }

    // ── Create ──

    pub fn create_process_instance(
        &mut self,
        process_definition_id: &str,
        business_key: Option<String>,
        tenant_id: Option<String>,
    ) -> ExecutionId {
        let id = Uuid::now_v7();
        self.insert_new(Execution {
            id,
            parent_id: None,
            children: Vec::new(),
            process_instance_id: id,
            root_process_instance_id: id,
            process_definition_id: process_definition_id.to_string(),
            node_id: None,
            is_scope: true,
            is_active: true,
            is_multi_instance_root: false,
            is_event_scope: false,
            is_ended: false,
            super_execution_id: None,
            sub_process_instance_id: None,
            business_key,
            tenant_id,
            variables: Variables::new(),
            multi_instance_outputs: BTreeMap::new(),
            race_id: None,
            revision: 0,
            created_at: now(),
        });
        id
    }

    /// Create the root of a called process instance and link it both ways.
    pub fn create_sub_process_instance(
        &mut self,
        super_execution_id: ExecutionId,
        process_definition_id: &str,
    ) -> EngineResult<ExecutionId> {
        let caller = self.get(super_execution_id)?;
        let (root, business_key, tenant_id) = (
            caller.root_process_instance_id,
            caller.business_key.clone(),
            caller.tenant_id.clone(),
        );
        let id = self.create_process_instance(process_definition_id, business_key, tenant_id);
        if let Some(sub) = self.executions.get_mut(&id) {
            sub.root_process_instance_id = root;
            sub.super_execution_id = Some(super_execution_id);
        }
        self.get_mut(super_execution_id)?.sub_process_instance_id = Some(id);
        Ok(id)
    }

    /// New active, non-scope child appended to `parent`.
    pub fn create_child(&mut self, parent_id: ExecutionId) -> EngineResult<ExecutionId> {
        let parent = self.get(parent_id)?;
        let id = Uuid::now_v7();
        let child = Execution {
            id,
            parent_id: Some(parent_id),
            children: Vec::new(),
            process_instance_id: parent.process_instance_id,
            root_process_instance_id: parent.root_process_instance_id,
            process_definition_id: parent.process_definition_id.clone(),
            node_id: parent.node_id.clone(),
            is_scope: false,
            is_active: true,
            is_multi_instance_root: false,
            is_event_scope: false,
            is_ended: false,
            super_execution_id: None,
            sub_process_instance_id: None,
            business_key: parent.business_key.clone(),
            tenant_id: parent.tenant_id.clone(),
            variables: Variables::new(),
            multi_instance_outputs: BTreeMap::new(),
            race_id: None,
            revision: 0,
            created_at: now(),
        };
        self.insert_new(child);
        self.get_mut(parent_id)?.children.push(id);
        Ok(id)
    }

    fn insert_new(&mut self, execution: Execution) {
        self.created.insert(execution.id);
        self.executions.insert(execution.id, execution);
    }

    // ── Read ──

    pub fn find_by_id(&self, id: ExecutionId) -> Option<&Execution> {
        self.executions.get(&id)
    }

    pub fn contains(&self, id: ExecutionId) -> bool {
        self.executions.contains_key(&id)
    }

    pub fn get(&self, id: ExecutionId) -> EngineResult<&Execution> {
        self.executions
            .get(&id)
            .ok_or_else(|| EngineError::execution_not_found(id))
    }

    /// Mutable access; the row is written back at commit.
    pub fn get_mut(&mut self, id: ExecutionId) -> EngineResult<&mut Execution> {
        let execution = self
            .executions
            .get_mut(&id)
            .ok_or_else(|| EngineError::execution_not_found(id))?;
        if !self.created.contains(&id) {
            self.dirty.insert(id);
        }
        Ok(execution)
    }

    pub fn find_children(&self, parent_id: ExecutionId) -> EngineResult<Vec<ExecutionId>> {
        Ok(self.get(parent_id)?.children.clone())
    }

    pub fn executions(&self) -> impl Iterator<Item = &Execution> {
        self.executions.values()
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    /// `id` followed by its ancestors up to the process instance root.
    pub fn ancestor_chain(&self, id: ExecutionId) -> EngineResult<Vec<ExecutionId>> {
        let mut chain = vec![id];
        let mut current = self.get(id)?;
        while let Some(parent_id) = current.parent_id {
            if chain.len() > self.executions.len() {
                return Err(EngineError::InvalidState(format!(
                    "cycle in parent chain of {id}"
                )));
            }
            chain.push(parent_id);
            current = self.get(parent_id)?;
        }
        Ok(chain)
    }

    /// Nearest strict ancestor that is a scope.
    pub fn parent_scope(&self, id: ExecutionId) -> EngineResult<ExecutionId> {
        self.ancestor_chain(id)?
            .into_iter()
            .skip(1)
            .find(|a| self.executions.get(a).is_some_and(|e| e.is_scope))
            .ok_or(EngineError::MissingScope(id))
    }

    /// `id` itself when it is a scope, else its parent scope.
    pub fn scope_of(&self, id: ExecutionId) -> EngineResult<ExecutionId> {
        if self.get(id)?.is_scope {
            Ok(id)
        } else {
            self.parent_scope(id)
        }
    }

    pub fn process_instance_of(&self, id: ExecutionId) -> EngineResult<ExecutionId> {
        Ok(self.get(id)?.process_instance_id)
    }

    // ── Mutate ──

    /// Mark a row changed so its revision is checked and bumped at commit,
    /// even though none of its fields moved.
    pub fn force_version_bump(&mut self, id: ExecutionId) -> EngineResult<()> {
        self.get_mut(id).map(|_| ())
    }

    pub fn reparent(&mut self, id: ExecutionId, new_parent_id: ExecutionId) -> EngineResult<()> {
        if self.ancestor_chain(new_parent_id)?.contains(&id) {
            return Err(EngineError::InvalidState(format!(
                "cannot move {id} below its own descendant {new_parent_id}"
            )));
        }
        let old_parent = self.get(id)?.parent_id;
        if let Some(old) = old_parent {
            self.get_mut(old)?.children.retain(|c| *c != id);
        }
        self.get_mut(new_parent_id)?.children.push(id);
        self.get_mut(id)?.parent_id = Some(new_parent_id);
        Ok(())
    }

    /// Delete `id` and everything below it, including called process
    /// instances, children before parents. `on_delete` sees each row once,
    /// already marked ended. Returns the deleted ids in deletion order.
    pub fn delete_subtree(
        &mut self,
        id: ExecutionId,
        on_delete: &mut dyn FnMut(&Execution),
    ) -> EngineResult<Vec<ExecutionId>> {
        self.get(id)?;
        let mut preorder = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(execution) = self.executions.get(&current) else {
                continue;
            };
            preorder.push(current);
            stack.extend(execution.children.iter().rev().copied());
            stack.extend(execution.sub_process_instance_id);
        }

        let order: Vec<ExecutionId> = preorder.into_iter().rev().collect();
        for current in &order {
            let Some(mut execution) = self.executions.remove(current) else {
                continue;
            };
            execution.is_ended = true;
            execution.is_active = false;
            if let Some(parent) = execution.parent_id {
                if self.contains(parent) {
                    self.get_mut(parent)?.children.retain(|c| c != current);
                }
            }
            if let Some(caller) = execution.super_execution_id {
                if self.contains(caller) {
                    self.get_mut(caller)?.sub_process_instance_id = None;
                }
            }
            self.dirty.remove(current);
            if !self.created.remove(current) {
                self.deleted.push((*current, execution.revision));
            }
            on_delete(&execution);
        }
        Ok(order)
    }

    // ── Variables ──

    /// Look a variable up through the ancestor chain, nearest first.
    pub fn variable(&self, id: ExecutionId, name: &str) -> Option<Value> {
        let chain = self.ancestor_chain(id).ok()?;
        chain
            .iter()
            .filter_map(|a| self.executions.get(a))
            .find_map(|e| e.variables.get(name).cloned())
    }

    /// All variables visible from `id`, inner scopes shadowing outer ones.
    pub fn visible_variables(&self, id: ExecutionId) -> EngineResult<Variables> {
        let mut merged = Variables::new();
        for a in self.ancestor_chain(id)?.into_iter().rev() {
            merged.extend(self.get(a)?.variables.clone());
        }
        Ok(merged)
    }

    /// Update the nearest execution that already holds `name`, else set it
    /// on the process instance. A new variable written below a
    /// multi-instance instance stays local to that instance.
    pub fn set_variable(&mut self, id: ExecutionId, name: &str, value: Value) -> EngineResult<()> {
        let chain = self.ancestor_chain(id)?;
        let rows: Vec<&Execution> = chain.iter().filter_map(|a| self.executions.get(a)).collect();
        let holder = rows
            .iter()
            .find(|e| e.variables.contains_key(name))
            .or_else(|| rows.iter().find(|e| self.is_instance_of_multi_root(e)))
            .map(|e| e.id)
            .or_else(|| chain.last().copied())
            .unwrap_or(id);
        self.set_variable_local(holder, name, value)
    }

    fn is_instance_of_multi_root(&self, execution: &Execution) -> bool {
        execution
            .parent_id
            .and_then(|p| self.executions.get(&p))
            .is_some_and(|p| p.is_multi_instance_root && p.node_id == execution.node_id)
    }

    pub fn set_variable_local(
        &mut self,
        id: ExecutionId,
        name: &str,
        value: Value,
    ) -> EngineResult<()> {
        self.get_mut(id)?.variables.insert(name.to_string(), value);
        Ok(())
    }

    pub fn set_variables(&mut self, id: ExecutionId, variables: &Variables) -> EngineResult<()> {
        for (name, value) in variables {
            self.set_variable(id, name, value.clone())?;
        }
        Ok(())
    }

    // ── Transaction support ──

    pub fn take_changes(&mut self) -> TreeChanges {
        let mut created: Vec<Execution> = self
            .created
            .drain()
            .filter_map(|id| self.executions.get(&id).cloned())
            .collect();
        created.sort_by_key(|e| (e.created_at, e.id));
        let updated = self
            .dirty
            .drain()
            .filter_map(|id| self.executions.get(&id).cloned())
            .collect();
        TreeChanges {
            created,
            updated,
            deleted: std::mem::take(&mut self.deleted),
        }
    }

    /// Structural invariants: parents exist and list their children, parent
    /// chains are acyclic, ended rows have no active children.
    pub fn check_invariants(&self) -> Result<(), String> {
        for execution in self.executions.values() {
            if let Some(parent_id) = execution.parent_id {
                let parent = self
                    .executions
                    .get(&parent_id)
                    .ok_or_else(|| format!("{} has missing parent {parent_id}", execution.id))?;
                if !parent.children.contains(&execution.id) {
                    return Err(format!("{} not listed by parent {parent_id}", execution.id));
                }
            }
            self.ancestor_chain(execution.id)
                .map_err(|e| e.to_string())?;
            if execution.is_ended
                && execution
                    .children
                    .iter()
                    .filter_map(|c| self.executions.get(c))
                    .any(|c| c.is_active)
            {
                return Err(format!("ended {} has active children", execution.id));
            }
        }
        Ok(())
    }
}

/// Variable view of one execution for expression evaluation.
pub struct ExecutionScope<'a> {
    pub tree: &'a ExecutionTree,
    pub execution_id: ExecutionId,
}

impl VariableScope for ExecutionScope<'_> {
    fn variable(&self, name: &str) -> Option<Value> {
        self.tree.variable(self.execution_id, name)
    }
}
