use super::dto::ProcessDto;
use anyhow::{Context, Result};

/// Parse a YAML string into a ProcessDto.
///
/// Validation is NOT performed here; `build_definition` validates before
/// compiling.
pub fn parse_process_yaml(yaml_str: &str) -> Result<ProcessDto> {
    let dto: ProcessDto = serde_yaml::from_str(yaml_str).context("Parsing process YAML")?;
    Ok(dto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::dto::*;

    #[test]
    fn test_basic_yaml_parse() {
        let yaml = r#"
id: order
nodes:
  - kind: Start
    id: start
  - kind: ServiceTask
    id: charge
    task_type: charge_card
  - kind: End
    id: end
edges:
  - from: start
    to: charge
  - from: charge
    to: end
"#;
        let dto = parse_process_yaml(yaml).unwrap();
        assert_eq!(dto.id, "order");
        assert_eq!(dto.nodes.len(), 3);
        assert_eq!(dto.edges.len(), 2);
        assert!(matches!(
            &dto.nodes[1].kind,
            NodeKindDto::ServiceTask { task_type } if task_type == "charge_card"
        ));
    }

    #[test]
    fn test_yaml_with_conditions_and_default() {
        let yaml = r#"
id: xor
nodes:
  - { kind: Start, id: start }
  - { kind: ExclusiveGateway, id: gw }
  - { kind: UserTask, id: big }
  - { kind: UserTask, id: small }
edges:
  - { from: start, to: gw }
  - { from: gw, to: big, condition: "${amount > 100}" }
  - { from: gw, to: small, is_default: true }
"#;
        let dto = parse_process_yaml(yaml).unwrap();
        assert_eq!(dto.edges[1].condition.as_deref(), Some("${amount > 100}"));
        assert!(dto.edges[2].is_default);
        assert_eq!(dto.edges[0].flow_id(), "start->gw");
    }

    #[test]
    fn test_nested_and_multi_instance() {
        let yaml = r#"
id: nested
nodes:
  - { kind: Start, id: start }
  - kind: SubProcess
    id: sub
    multi_instance:
      sequential: true
      collection: "${items}"
      element_variable: item
  - { kind: Start, id: sub_start, parent: sub }
  - { kind: BoundaryTimer, id: timeout, host: sub, duration_ms: 5000 }
edges: []
"#;
        let dto = parse_process_yaml(yaml).unwrap();
        let mi = dto.nodes[1].multi_instance.as_ref().unwrap();
        assert!(mi.sequential);
        assert_eq!(mi.element_variable.as_deref(), Some("item"));
        assert_eq!(dto.nodes[2].parent.as_deref(), Some("sub"));
        match &dto.nodes[3].kind {
            NodeKindDto::BoundaryTimer {
                interrupting,
                repeat,
                ..
            } => {
                assert!(*interrupting);
                assert_eq!(*repeat, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_kind_fails() {
        let yaml = r#"
id: bad
nodes:
  - { kind: Teleport, id: t }
"#;
        assert!(parse_process_yaml(yaml).is_err());
    }
}
