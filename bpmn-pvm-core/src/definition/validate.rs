use super::dto::*;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub rule: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

fn err(errors: &mut Vec<ValidationError>, rule: &str, message: String) {
    errors.push(ValidationError {
        rule: rule.to_string(),
        message,
    });
}

/// Validate a ProcessDto before compilation. Returns all errors found.
pub fn validate_dto(dto: &ProcessDto) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut node_map: HashMap<&str, &NodeDto> = HashMap::new();

    // V1: Node IDs must be unique
    for node in &dto.nodes {
        if node_map.insert(node.id.as_str(), node).is_some() {
            err(&mut errors, "V1", format!("Duplicate node id: {}", node.id));
        }
    }

    // V2: `parent` must name a sub-process or event sub-process
    for node in &dto.nodes {
        if let Some(parent) = &node.parent {
            let ok = node_map
                .get(parent.as_str())
                .is_some_and(|p| p.kind.is_container());
            if !ok {
                err(
                    &mut errors,
                    "V2",
                    format!("Node {}: parent '{}' is not a sub-process", node.id, parent),
                );
            }
        }
    }

    // V3: Edges reference known nodes in the same container
    let mut outgoing: HashMap<&str, Vec<&EdgeDto>> = HashMap::new();
    let mut incoming: HashMap<&str, usize> = HashMap::new();
    for edge in &dto.edges {
        outgoing.entry(edge.from.as_str()).or_default().push(edge);
        *incoming.entry(edge.to.as_str()).or_default() += 1;
        match (node_map.get(edge.from.as_str()), node_map.get(edge.to.as_str())) {
            (Some(from), Some(to)) => {
                if from.parent != to.parent {
                    err(
                        &mut errors,
                        "V3",
                        format!("Edge {} crosses a sub-process boundary", edge.flow_id()),
                    );
                }
            }
            _ => err(
                &mut errors,
                "V3",
                format!("Edge {} references an unknown node", edge.flow_id()),
            ),
        }
    }

    // V4: Exactly one none start per process and per embedded sub-process
    let mut containers: Vec<Option<&str>> = vec![None];
    containers.extend(
        dto.nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKindDto::SubProcess))
            .map(|n| Some(n.id.as_str())),
    );
    for container in containers {
        let starts = dto
            .nodes
            .iter()
            .filter(|n| n.parent.as_deref() == container && matches!(n.kind, NodeKindDto::Start))
            .count();
        if starts != 1 {
            err(
                &mut errors,
                "V4",
                format!(
                    "{}: expected exactly one Start node, found {}",
                    container.unwrap_or(&dto.id),
                    starts
                ),
            );
        }
    }

    // V5: Event sub-processes have exactly one ErrorStart and no sequence flows
    for node in dto
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKindDto::EventSubProcess))
    {
        let starts: Vec<&NodeDto> = dto
            .nodes
            .iter()
            .filter(|n| n.parent.as_deref() == Some(node.id.as_str()) && n.kind.is_start())
            .collect();
        if starts.len() != 1 || !matches!(starts[0].kind, NodeKindDto::ErrorStart { .. }) {
            err(
                &mut errors,
                "V5",
                format!("EventSubProcess {}: needs exactly one ErrorStart", node.id),
            );
        }
        if outgoing.contains_key(node.id.as_str()) || incoming.contains_key(node.id.as_str()) {
            err(
                &mut errors,
                "V5",
                format!("EventSubProcess {}: must not have sequence flows", node.id),
            );
        }
    }

    // V6: ErrorStart only inside event sub-processes
    for node in &dto.nodes {
        if matches!(node.kind, NodeKindDto::ErrorStart { .. }) {
            let in_esp = node
                .parent
                .as_deref()
                .and_then(|p| node_map.get(p))
                .is_some_and(|p| matches!(p.kind, NodeKindDto::EventSubProcess));
            if !in_esp {
                err(
                    &mut errors,
                    "V6",
                    format!("ErrorStart {} must live in an EventSubProcess", node.id),
                );
            }
        }
    }

    // V7: Boundary hosts are activities in the same container; boundaries have no incoming flows
    for node in &dto.nodes {
        let Some(host) = node.kind.host() else {
            continue;
        };
        match node_map.get(host) {
            Some(h) if h.kind.is_activity() && h.parent == node.parent => {}
            _ => err(
                &mut errors,
                "V7",
                format!(
                    "Boundary {}: host '{}' is not an activity in the same scope",
                    node.id, host
                ),
            ),
        }
        if incoming.contains_key(node.id.as_str()) {
            err(
                &mut errors,
                "V7",
                format!("Boundary {} must not have incoming flows", node.id),
            );
        }
    }

    // V8: At most one default flow per node, and default flows carry no condition
    for (from, edges) in &outgoing {
        let defaults: Vec<&&EdgeDto> = edges.iter().filter(|e| e.is_default).collect();
        if defaults.len() > 1 {
            err(
                &mut errors,
                "V8",
                format!("Node {}: {} default flows declared", from, defaults.len()),
            );
        }
        if defaults.iter().any(|e| e.condition.is_some()) {
            err(
                &mut errors,
                "V8",
                format!("Node {}: default flow must not carry a condition", from),
            );
        }
    }

    // V9: Multi-instance only on activities, with exactly one of cardinality / collection
    for node in &dto.nodes {
        let Some(mi) = &node.multi_instance else {
            continue;
        };
        if !node.kind.is_activity() {
            err(
                &mut errors,
                "V9",
                format!("Node {}: multi_instance requires an activity", node.id),
            );
        }
        if mi.cardinality.is_some() == mi.collection.is_some() {
            err(
                &mut errors,
                "V9",
                format!(
                    "Node {}: multi_instance needs exactly one of cardinality or collection",
                    node.id
                ),
            );
        }
        if mi.output_collection.is_some() != mi.output_element.is_some() {
            err(
                &mut errors,
                "V9",
                format!(
                    "Node {}: output_collection and output_element go together",
                    node.id
                ),
            );
        }
    }

    // V10: Compensation handlers exist, are marked, and are not part of the normal flow
    for node in &dto.nodes {
        if let NodeKindDto::BoundaryCompensation { handler, .. } = &node.kind {
            let ok = node_map
                .get(handler.as_str())
                .is_some_and(|h| h.is_for_compensation && h.kind.is_activity());
            if !ok {
                err(
                    &mut errors,
                    "V10",
                    format!(
                        "BoundaryCompensation {}: handler '{}' must be an activity marked is_for_compensation",
                        node.id, handler
                    ),
                );
            }
        }
        if node.is_for_compensation && incoming.contains_key(node.id.as_str()) {
            err(
                &mut errors,
                "V10",
                format!("Compensation handler {} must not have incoming flows", node.id),
            );
        }
    }

    // V11: Compensation throws name existing activities
    for node in &dto.nodes {
        let activity = match &node.kind {
            NodeKindDto::CompensationThrow { activity } | NodeKindDto::CompensationEnd { activity } => {
                activity
            }
            _ => continue,
        };
        if let Some(a) = activity {
            if !node_map.get(a.as_str()).is_some_and(|n| n.kind.is_activity()) {
                err(
                    &mut errors,
                    "V11",
                    format!("Compensation throw {}: unknown activity '{}'", node.id, a),
                );
            }
        }
    }

    // V12: Event-based gateways lead only to catch events, unconditionally
    for node in dto
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKindDto::EventBasedGateway))
    {
        for edge in outgoing.get(node.id.as_str()).into_iter().flatten() {
            let target_ok = node_map.get(edge.to.as_str()).is_some_and(|t| {
                matches!(
                    t.kind,
                    NodeKindDto::TimerCatch { .. }
                        | NodeKindDto::MessageCatch { .. }
                        | NodeKindDto::SignalCatch { .. }
                        | NodeKindDto::ReceiveTask { .. }
                )
            });
            if !target_ok || edge.condition.is_some() {
                err(
                    &mut errors,
                    "V12",
                    format!(
                        "EventBasedGateway {}: flow to '{}' must be an unconditional catch event",
                        node.id, edge.to
                    ),
                );
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::yaml::parse_process_yaml;

    fn rules(yaml: &str) -> Vec<String> {
        let dto = parse_process_yaml(yaml).unwrap();
        validate_dto(&dto).into_iter().map(|e| e.rule).collect()
    }

    #[test]
    fn test_valid_process_passes() {
        let r = rules(
            r#"
id: ok
nodes:
  - { kind: Start, id: s }
  - { kind: UserTask, id: t }
  - { kind: BoundaryError, id: b, host: t }
  - { kind: End, id: e }
edges:
  - { from: s, to: t }
  - { from: t, to: e }
  - { from: b, to: e }
"#,
        );
        assert!(r.is_empty(), "unexpected errors: {r:?}");
    }

    #[test]
    fn test_duplicate_ids_and_unknown_edge() {
        let r = rules(
            r#"
id: dup
nodes:
  - { kind: Start, id: s }
  - { kind: End, id: s }
edges:
  - { from: s, to: nowhere }
"#,
        );
        assert!(r.contains(&"V1".to_string()));
        assert!(r.contains(&"V3".to_string()));
    }

    #[test]
    fn test_sub_process_needs_start_and_edges_stay_inside() {
        let r = rules(
            r#"
id: nested
nodes:
  - { kind: Start, id: s }
  - { kind: SubProcess, id: sub }
  - { kind: UserTask, id: inner, parent: sub }
edges:
  - { from: s, to: inner }
"#,
        );
        assert!(r.contains(&"V3".to_string()));
        assert!(r.contains(&"V4".to_string()));
    }

    #[test]
    fn test_two_defaults_rejected() {
        let r = rules(
            r#"
id: defaults
nodes:
  - { kind: Start, id: s }
  - { kind: ExclusiveGateway, id: gw }
  - { kind: End, id: a }
  - { kind: End, id: b }
edges:
  - { from: s, to: gw }
  - { from: gw, to: a, is_default: true }
  - { from: gw, to: b, is_default: true, condition: "${x}" }
"#,
        );
        assert_eq!(r.iter().filter(|x| *x == "V8").count(), 2);
    }

    #[test]
    fn test_multi_instance_needs_one_source() {
        let r = rules(
            r#"
id: mi
nodes:
  - { kind: Start, id: s }
  - kind: UserTask
    id: t
    multi_instance: { sequential: false }
edges:
  - { from: s, to: t }
"#,
        );
        assert_eq!(r, vec!["V9".to_string()]);
    }

    #[test]
    fn test_compensation_handler_must_be_marked() {
        let r = rules(
            r#"
id: comp
nodes:
  - { kind: Start, id: s }
  - { kind: ServiceTask, id: book, task_type: book }
  - { kind: BoundaryCompensation, id: cb, host: book, handler: undo }
  - { kind: ServiceTask, id: undo, task_type: cancel }
edges:
  - { from: s, to: book }
"#,
        );
        assert_eq!(r, vec!["V10".to_string()]);
    }

    #[test]
    fn test_event_gateway_targets() {
        let r = rules(
            r#"
id: ebg
nodes:
  - { kind: Start, id: s }
  - { kind: EventBasedGateway, id: gw }
  - { kind: UserTask, id: t }
edges:
  - { from: s, to: gw }
  - { from: gw, to: t }
"#,
        );
        assert_eq!(r, vec!["V12".to_string()]);
    }
}
