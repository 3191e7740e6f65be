//! Loads a [`WorkflowDefinition`] from JSON or YAML (spec §6.3), mirroring
//! the shape of [`crate::config::load_config`]/`parse_config`.

use std::path::Path;

use crate::error::{ArgusError, Result};
use crate::workflow::definition::WorkflowDefinition;

/// Reads a workflow definition from disk, inferring JSON vs. YAML from the
/// file extension (`.json` vs. `.yaml`/`.yml`). Does not validate the
/// definition — callers still go through
/// [`WorkflowEngine::register_workflow`](super::WorkflowEngine::register_workflow)
/// for that.
pub fn load_definition(path: &Path) -> Result<WorkflowDefinition> {
    let data = std::fs::read_to_string(path)?;

    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => parse_yaml(&data),
        _ => parse_json(&data),
    }
}

pub fn parse_json(data: &str) -> Result<WorkflowDefinition> {
    serde_json::from_str(data).map_err(|e| ArgusError::Validation(format!("invalid workflow JSON: {e}")))
}

pub fn parse_yaml(data: &str) -> Result<WorkflowDefinition> {
    serde_yaml::from_str(data).map_err(|e| ArgusError::Validation(format!("invalid workflow YAML: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
workflow_id: greet
name: Greet
nodes:
  start:
    id: start
    node_type: START
    name: start
  end:
    id: end
    node_type: END
    name: end
edges:
  e1:
    id: e1
    from_node: start
    to_node: end
    edge_type: SEQUENTIAL
"#;

    #[test]
    fn yaml_definition_parses() {
        let def = parse_yaml(YAML).unwrap();
        assert_eq!(def.workflow_id, "greet");
        assert_eq!(def.nodes.len(), 2);
        assert_eq!(def.edges.len(), 1);
    }

    #[test]
    fn json_definition_parses() {
        let data = serde_json::json!({
            "workflow_id": "greet",
            "name": "Greet",
            "nodes": {
                "start": {"id": "start", "node_type": "START", "name": "start"},
                "end": {"id": "end", "node_type": "END", "name": "end"},
            },
            "edges": {
                "e1": {"id": "e1", "from_node": "start", "to_node": "end", "edge_type": "SEQUENTIAL"}
            },
        })
        .to_string();

        let def = parse_json(&data).unwrap();
        assert_eq!(def.workflow_id, "greet");
    }

    #[test]
    fn malformed_yaml_is_rejected() {
        let err = parse_yaml("not: [valid, yaml: structure").unwrap_err();
        assert!(matches!(err, ArgusError::Validation(_)));
    }
}
