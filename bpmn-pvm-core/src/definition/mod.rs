//! Process definitions: authoring DTO, YAML, validation and the compiled graph.

pub mod build;
pub mod dto;
pub mod model;
pub mod validate;
pub mod yaml;

pub use build::{build_definition, compute_hash};
pub use dto::{EdgeDto, MappingDto, MultiInstanceDto, NodeDto, NodeKindDto, ProcessDto};
pub use validate::{validate_dto, ValidationError};
pub use yaml::parse_process_yaml;
pub use model::{
    BoundaryTrigger, FlowNode, Mapping, MultiInstance, NodeKind, ProcessDefinition, SequenceFlow,
};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// In-process cache of compiled definitions, by id and by latest key.
#[derive(Default)]
pub struct DefinitionRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<String, Arc<ProcessDefinition>>,
    latest: HashMap<String, String>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition; it becomes the latest for its key.
    pub fn insert(&self, definition: ProcessDefinition) -> Arc<ProcessDefinition> {
        let definition = Arc::new(definition);
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner
            .latest
            .insert(definition.key.clone(), definition.id.clone());
        inner
            .by_id
            .insert(definition.id.clone(), Arc::clone(&definition));
        definition
    }

    /// Cache a definition loaded from storage without changing which one is latest.
    pub fn cache(&self, definition: ProcessDefinition) -> Arc<ProcessDefinition> {
        let definition = Arc::new(definition);
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner
            .by_id
            .entry(definition.id.clone())
            .or_insert_with(|| Arc::clone(&definition))
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProcessDefinition>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_id.get(id).cloned()
    }

    pub fn latest(&self, key: &str) -> Option<Arc<ProcessDefinition>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .latest
            .get(key)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::yaml::parse_process_yaml;

    const V1: &str = "id: p\nnodes:\n  - { kind: Start, id: s }\n";
    const V2: &str = "id: p\nname: second\nnodes:\n  - { kind: Start, id: s }\n";

    #[test]
    fn latest_tracks_last_insert() {
        let registry = DefinitionRegistry::new();
        let a = registry.insert(build_definition(&parse_process_yaml(V1).unwrap()).unwrap());
        let b = registry.insert(build_definition(&parse_process_yaml(V2).unwrap()).unwrap());
        assert_ne!(a.id, b.id);
        assert_eq!(registry.latest("p").unwrap().id, b.id);
        assert!(registry.get(&a.id).is_some());
        assert!(registry.latest("missing").is_none());
    }

    #[test]
    fn cache_does_not_move_latest() {
        let registry = DefinitionRegistry::new();
        let b = registry.insert(build_definition(&parse_process_yaml(V2).unwrap()).unwrap());
        let a = registry.cache(build_definition(&parse_process_yaml(V1).unwrap()).unwrap());
        assert_eq!(registry.latest("p").unwrap().id, b.id);
        assert_eq!(registry.get(&a.id).unwrap().id, a.id);
    }
}
