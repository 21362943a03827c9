use super::dto::*;
use super::model::*;
use super::validate::validate_dto;
use crate::error::{EngineError, EngineResult};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Deterministic content hash of a DTO: hex of the first 8 bytes of SHA-256
/// over its JSON form.
pub fn compute_hash(dto: &ProcessDto) -> EngineResult<String> {
    let json = serde_json::to_string(dto)
        .map_err(|e| EngineError::InvalidDefinition(format!("serializing {}: {e}", dto.id)))?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    let digest = hasher.finalize();
    Ok(digest[..8].iter().map(|b| format!("{b:02x}")).collect())
}

/// Validate and compile a DTO into an immutable ProcessDefinition.
pub fn build_definition(dto: &ProcessDto) -> EngineResult<ProcessDefinition> {
    let errors = validate_dto(dto);
    if !errors.is_empty() {
        let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(EngineError::InvalidDefinition(format!(
            "{} failed validation:\n{}",
            dto.id,
            msgs.join("\n")
        )));
    }

    // 1. Flows, in declaration order
    let flows: Vec<SequenceFlow> = dto
        .edges
        .iter()
        .map(|e| SequenceFlow {
            id: e.flow_id(),
            source: e.from.clone(),
            target: e.to.clone(),
            condition: e.condition.clone(),
        })
        .collect();

    // 2. Nodes
    let mut nodes: BTreeMap<String, FlowNode> = BTreeMap::new();
    for node in &dto.nodes {
        nodes.insert(
            node.id.clone(),
            FlowNode {
                id: node.id.clone(),
                container: node.parent.clone(),
                kind: compile_kind(&node.kind),
                incoming: Vec::new(),
                outgoing: Vec::new(),
                default_flow: None,
                boundaries: Vec::new(),
                multi_instance: node.multi_instance.as_ref().map(|mi| MultiInstance {
                    sequential: mi.sequential,
                    cardinality: mi.cardinality.clone(),
                    collection: mi.collection.clone(),
                    element_variable: mi.element_variable.clone(),
                    completion_condition: mi.completion_condition.clone(),
                    output_element: mi.output_element.clone(),
                    output_collection: mi.output_collection.clone(),
                }),
                is_for_compensation: node.is_for_compensation,
                initial: None,
                event_sub_processes: Vec::new(),
            },
        );
    }

    for (index, edge) in dto.edges.iter().enumerate() {
        if let Some(source) = nodes.get_mut(&edge.from) {
            source.outgoing.push(index);
            if edge.is_default {
                source.default_flow = Some(index);
            }
        }
        if let Some(target) = nodes.get_mut(&edge.to) {
            target.incoming.push(index);
        }
    }

    // 3. Boundaries, container starts, event sub-processes
    let mut process_initial = None;
    let mut process_esps = Vec::new();
    for node in &dto.nodes {
        if let Some(host) = node.kind.host() {
            if let Some(h) = nodes.get_mut(host) {
                h.boundaries.push(node.id.clone());
            }
        }
        if node.kind.is_start() {
            match &node.parent {
                Some(parent) => {
                    if let Some(c) = nodes.get_mut(parent) {
                        c.initial = Some(node.id.clone());
                    }
                }
                None => process_initial = Some(node.id.clone()),
            }
        }
        if matches!(node.kind, NodeKindDto::EventSubProcess) {
            match &node.parent {
                Some(parent) => {
                    if let Some(c) = nodes.get_mut(parent) {
                        c.event_sub_processes.push(node.id.clone());
                    }
                }
                None => process_esps.push(node.id.clone()),
            }
        }
    }

    let initial = process_initial.ok_or_else(|| {
        EngineError::InvalidDefinition(format!("{}: no process-level start", dto.id))
    })?;

    let reachability = compute_reachability(&nodes, &flows);

    Ok(ProcessDefinition {
        id: format!("{}:{}", dto.id, compute_hash(dto)?),
        key: dto.id.clone(),
        name: dto.name.clone(),
        initial,
        nodes,
        flows,
        event_sub_processes: process_esps,
        reachability,
    })
}

fn compile_kind(kind: &NodeKindDto) -> NodeKind {
    match kind.clone() {
        NodeKindDto::Start => NodeKind::StartEvent,
        NodeKindDto::ErrorStart { error_code } => NodeKind::ErrorStartEvent { error_code },
        NodeKindDto::End {
            terminate,
            terminate_all,
        } => {
            if terminate || terminate_all {
                NodeKind::TerminateEndEvent { terminate_all }
            } else {
                NodeKind::EndEvent
            }
        }
        NodeKindDto::ErrorEnd {
            error_code,
            message,
        } => NodeKind::ErrorEndEvent {
            error_code,
            message,
        },
        NodeKindDto::CompensationEnd { activity } => NodeKind::CompensationEndEvent { activity },
        NodeKindDto::UserTask { assignee } => NodeKind::UserTask { assignee },
        NodeKindDto::ManualTask => NodeKind::ManualTask,
        NodeKindDto::ReceiveTask {
            message,
            correlation_key,
        } => NodeKind::ReceiveTask {
            message,
            correlation_key,
        },
        NodeKindDto::ServiceTask { task_type } => NodeKind::ServiceTask { task_type },
        NodeKindDto::ScriptTask {
            script,
            result_variable,
        } => NodeKind::ScriptTask {
            script,
            result_variable,
        },
        NodeKindDto::ExclusiveGateway => NodeKind::ExclusiveGateway,
        NodeKindDto::ParallelGateway => NodeKind::ParallelGateway,
        NodeKindDto::InclusiveGateway => NodeKind::InclusiveGateway,
        NodeKindDto::EventBasedGateway => NodeKind::EventBasedGateway,
        NodeKindDto::TimerCatch { duration_ms } => NodeKind::TimerCatchEvent { duration_ms },
        NodeKindDto::MessageCatch {
            message,
            correlation_key,
        } => NodeKind::MessageCatchEvent {
            message,
            correlation_key,
        },
        NodeKindDto::SignalCatch { signal } => NodeKind::SignalCatchEvent { signal },
        NodeKindDto::SignalThrow { signal } => NodeKind::SignalThrowEvent { signal },
        NodeKindDto::CompensationThrow { activity } => {
            NodeKind::CompensationThrowEvent { activity }
        }
        NodeKindDto::NoneThrow => NodeKind::NoneThrowEvent,
        NodeKindDto::SubProcess => NodeKind::SubProcess,
        NodeKindDto::EventSubProcess => NodeKind::EventSubProcess,
        NodeKindDto::CallActivity {
            called_process,
            inputs,
            outputs,
        } => NodeKind::CallActivity {
            called_process,
            inputs: inputs.into_iter().map(compile_mapping).collect(),
            outputs: outputs.into_iter().map(compile_mapping).collect(),
        },
        NodeKindDto::BoundaryTimer {
            host,
            duration_ms,
            interrupting,
            repeat,
        } => NodeKind::BoundaryEvent {
            host,
            interrupting,
            trigger: BoundaryTrigger::Timer {
                duration_ms,
                repeat: if interrupting { 0 } else { repeat },
            },
        },
        NodeKindDto::BoundaryMessage {
            host,
            message,
            correlation_key,
            interrupting,
        } => NodeKind::BoundaryEvent {
            host,
            interrupting,
            trigger: BoundaryTrigger::Message {
                message,
                correlation_key,
            },
        },
        NodeKindDto::BoundarySignal {
            host,
            signal,
            interrupting,
        } => NodeKind::BoundaryEvent {
            host,
            interrupting,
            trigger: BoundaryTrigger::Signal { signal },
        },
        NodeKindDto::BoundaryError { host, error_code } => NodeKind::BoundaryEvent {
            host,
            interrupting: true,
            trigger: BoundaryTrigger::Error { error_code },
        },
        NodeKindDto::BoundaryCompensation { host, handler } => NodeKind::BoundaryEvent {
            host,
            interrupting: false,
            trigger: BoundaryTrigger::Compensation { handler },
        },
    }
}

fn compile_mapping(m: MappingDto) -> Mapping {
    Mapping {
        source: m.source,
        target: m.target,
    }
}

/// Transitive successors of every node over sequence flows plus
/// host -> boundary edges. Dfs keeps a discovered set, so cycles terminate.
fn compute_reachability(
    nodes: &BTreeMap<String, FlowNode>,
    flows: &[SequenceFlow],
) -> HashMap<String, BTreeSet<String>> {
    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for id in nodes.keys() {
        index.insert(id.as_str(), graph.add_node(id.clone()));
    }
    for flow in flows {
        if let (Some(a), Some(b)) = (index.get(flow.source.as_str()), index.get(flow.target.as_str())) {
            graph.add_edge(*a, *b, ());
        }
    }
    for node in nodes.values() {
        for boundary in &node.boundaries {
            if let (Some(a), Some(b)) = (index.get(node.id.as_str()), index.get(boundary.as_str())) {
                graph.add_edge(*a, *b, ());
            }
        }
    }

    let mut result = HashMap::new();
    for (id, start) in &index {
        let mut dfs = Dfs::empty(&graph);
        let mut reached = BTreeSet::new();
        for succ in graph.neighbors(*start) {
            dfs.move_to(succ);
            while let Some(nx) = dfs.next(&graph) {
                reached.insert(graph[nx].clone());
            }
        }
        result.insert(id.to_string(), reached);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::yaml::parse_process_yaml;

    fn build(yaml: &str) -> ProcessDefinition {
        build_definition(&parse_process_yaml(yaml).unwrap()).unwrap()
    }

    const LOOP: &str = r#"
id: loop
nodes:
  - { kind: Start, id: s }
  - { kind: InclusiveGateway, id: fork }
  - { kind: UserTask, id: a }
  - { kind: UserTask, id: b }
  - { kind: ExclusiveGateway, id: retry }
  - { kind: InclusiveGateway, id: join }
  - { kind: End, id: e }
edges:
  - { from: s, to: fork }
  - { from: fork, to: a }
  - { from: fork, to: b }
  - { from: a, to: join }
  - { from: b, to: retry }
  - { from: retry, to: b, condition: "${again}" }
  - { from: retry, to: join, is_default: true }
  - { from: join, to: e }
"#;

    #[test]
    fn test_flows_keep_declaration_order() {
        let def = build(LOOP);
        let retry = def.node("retry").unwrap();
        let targets: Vec<&str> = def.outgoing(retry).map(|f| f.target.as_str()).collect();
        assert_eq!(targets, vec!["b", "join"]);
        assert_eq!(retry.default_flow, Some(6));
        assert_eq!(def.initial, "s");
    }

    #[test]
    fn test_reachability_terminates_on_loops() {
        let def = build(LOOP);
        assert!(def.can_reach("b", "join"));
        assert!(def.can_reach("b", "b"));
        assert!(def.can_reach("retry", "retry"));
        assert!(!def.can_reach("a", "b"));
        assert!(!def.can_reach("join", "join"));
        assert!(!def.can_reach("e", "join"));
    }

    #[test]
    fn test_boundaries_count_toward_reachability() {
        let def = build(
            r#"
id: boundary
nodes:
  - { kind: Start, id: s }
  - { kind: UserTask, id: t }
  - { kind: BoundaryTimer, id: late, host: t, duration_ms: 10 }
  - { kind: UserTask, id: escalate }
  - { kind: End, id: e }
edges:
  - { from: s, to: t }
  - { from: t, to: e }
  - { from: late, to: escalate }
"#,
        );
        assert_eq!(def.node("t").unwrap().boundaries, vec!["late".to_string()]);
        assert!(def.can_reach("t", "escalate"));
        assert_eq!(def.event_boundaries(def.node("t").unwrap()).count(), 1);
    }

    #[test]
    fn test_id_is_content_addressed() {
        let dto = parse_process_yaml(LOOP).unwrap();
        let a = build_definition(&dto).unwrap();
        let b = build_definition(&dto).unwrap();
        assert_eq!(a.id, b.id);
        assert!(a.id.starts_with("loop:"));
        assert_eq!(a.id.len(), "loop:".len() + 16);

        let mut changed = dto.clone();
        changed.name = Some("renamed".into());
        assert_ne!(build_definition(&changed).unwrap().id, a.id);
    }

    #[test]
    fn test_invalid_definition_lists_rules() {
        let dto = parse_process_yaml("id: empty\nnodes: []\n").unwrap();
        let err = build_definition(&dto).unwrap_err();
        assert!(err.to_string().contains("[V4]"));
    }

    #[test]
    fn test_sub_process_structure() {
        let def = build(
            r#"
id: nested
nodes:
  - { kind: Start, id: s }
  - { kind: SubProcess, id: sub }
  - { kind: Start, id: sub_s, parent: sub }
  - { kind: End, id: sub_e, parent: sub }
  - { kind: EventSubProcess, id: esp, parent: sub }
  - { kind: ErrorStart, id: esp_s, parent: esp }
  - { kind: End, id: esp_e, parent: esp }
  - { kind: End, id: e }
edges:
  - { from: s, to: sub }
  - { from: sub_s, to: sub_e }
  - { from: esp_s, to: esp_e }
  - { from: sub, to: e }
"#,
        );
        let sub = def.node("sub").unwrap();
        assert_eq!(sub.initial.as_deref(), Some("sub_s"));
        assert_eq!(def.event_sub_processes_of(Some("sub")), ["esp".to_string()]);
        assert!(def.event_sub_processes_of(None).is_empty());
        assert_eq!(def.node("esp").unwrap().initial.as_deref(), Some("esp_s"));
    }
}
