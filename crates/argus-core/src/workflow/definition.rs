//! Immutable workflow graph definitions (spec §3, §4.4.4, component F).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::ArgusError;
use crate::workflow::node::{Node, NodeType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeType {
    Sequential,
    Conditional,
    Parallel,
    LoopBack,
    ErrorHandler,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub from_node: String,
    pub to_node: String,
    pub edge_type: EdgeType,
    #[serde(default)]
    pub condition: Option<String>,
}

/// An immutable, registered workflow graph (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Whole-execution deadline in seconds; `None` means unbounded.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    pub nodes: HashMap<String, Node>,
    /// Keyed by `edge_id` per the wire format (spec §6.3); `Edge::id`
    /// duplicates the key, mirroring `nodes`/`Node::id`.
    pub edges: HashMap<String, Edge>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowDefinition {
    /// Edges whose `from_node` matches `node_id`.
    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.values().filter(move |e| e.from_node == node_id)
    }

    /// Edges whose `to_node` matches `node_id`.
    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.values().filter(move |e| e.to_node == node_id)
    }

    pub fn start_node(&self) -> Option<&Node> {
        self.nodes.values().find(|n| n.node_type == NodeType::Start)
    }

    /// Validates the invariants in spec §3. `known_workflows` is the set of
    /// already-registered workflow ids, used to reject a SUBPROCESS
    /// reference graph that would recurse into itself (spec §9 design
    /// note).
    pub fn validate(&self, known_workflows: &HashMap<String, WorkflowDefinition>) -> Result<(), ArgusError> {
        let starts: Vec<&Node> = self
            .nodes
            .values()
            .filter(|n| n.node_type == NodeType::Start)
            .collect();
        if starts.len() != 1 {
            return Err(ArgusError::Validation(format!(
                "workflow '{}' must have exactly one START node, found {}",
                self.workflow_id,
                starts.len()
            )));
        }

        if !self.nodes.values().any(|n| n.node_type == NodeType::End) {
            return Err(ArgusError::Validation(format!(
                "workflow '{}' must have at least one END node",
                self.workflow_id
            )));
        }

        for edge in self.edges.values() {
            if !self.nodes.contains_key(&edge.from_node) {
                return Err(ArgusError::Validation(format!(
                    "edge '{}' references unknown from_node '{}'",
                    edge.id, edge.from_node
                )));
            }
            if !self.nodes.contains_key(&edge.to_node) {
                return Err(ArgusError::Validation(format!(
                    "edge '{}' references unknown to_node '{}'",
                    edge.id, edge.to_node
                )));
            }
        }

        self.check_acyclic_excluding_loop_back()?;
        self.check_subprocess_recursion(known_workflows)?;

        Ok(())
    }

    /// Every edge type except `LOOP_BACK` must not introduce a cycle.
    fn check_acyclic_excluding_loop_back(&self) -> Result<(), ArgusError> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for id in self.nodes.keys() {
            adjacency.insert(id.as_str(), Vec::new());
        }
        for edge in self.edges.values() {
            if edge.edge_type != EdgeType::LoopBack {
                adjacency
                    .entry(edge.from_node.as_str())
                    .or_default()
                    .push(edge.to_node.as_str());
            }
        }

        let mut visiting: HashSet<&str> = HashSet::new();
        let mut visited: HashSet<&str> = HashSet::new();

        fn dfs<'a>(
            node: &'a str,
            adjacency: &HashMap<&'a str, Vec<&'a str>>,
            visiting: &mut HashSet<&'a str>,
            visited: &mut HashSet<&'a str>,
        ) -> bool {
            if visited.contains(node) {
                return false;
            }
            if !visiting.insert(node) {
                return true;
            }
            if let Some(next) = adjacency.get(node) {
                for &n in next {
                    if dfs(n, adjacency, visiting, visited) {
                        return true;
                    }
                }
            }
            visiting.remove(node);
            visited.insert(node);
            false
        }

        for id in self.nodes.keys() {
            if dfs(id.as_str(), &adjacency, &mut visiting, &mut visited) {
                return Err(ArgusError::Validation(format!(
                    "workflow '{}' has a cycle not formed by a LOOP_BACK edge",
                    self.workflow_id
                )));
            }
        }
        Ok(())
    }

    fn check_subprocess_recursion(
        &self,
        known_workflows: &HashMap<String, WorkflowDefinition>,
    ) -> Result<(), ArgusError> {
        let mut visiting = HashSet::new();
        self.walk_subprocess_refs(known_workflows, &mut visiting)
    }

    fn walk_subprocess_refs<'a>(
        &'a self,
        known_workflows: &'a HashMap<String, WorkflowDefinition>,
        visiting: &mut HashSet<&'a str>,
    ) -> Result<(), ArgusError> {
        if !visiting.insert(self.workflow_id.as_str()) {
            return Err(ArgusError::Validation(format!(
                "workflow '{}' participates in a cyclic SUBPROCESS reference",
                self.workflow_id
            )));
        }

        for node in self.nodes.values() {
            if node.node_type == NodeType::Subprocess {
                if let Some(target_id) = node.subprocess_workflow_id() {
                    if let Some(target) = known_workflows.get(target_id) {
                        target.walk_subprocess_refs(known_workflows, visiting)?;
                    }
                }
            }
        }

        visiting.remove(self.workflow_id.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::node::NodeType;

    fn node(id: &str, node_type: NodeType) -> Node {
        Node {
            id: id.to_string(),
            node_type,
            name: id.to_string(),
            description: None,
            agent_type: None,
            action: None,
            parameters: HashMap::new(),
            conditions: HashMap::new(),
            timeout_seconds: None,
            max_retries: 3,
        }
    }

    fn edge(id: &str, from: &str, to: &str, edge_type: EdgeType) -> Edge {
        Edge {
            id: id.to_string(),
            from_node: from.to_string(),
            to_node: to.to_string(),
            edge_type,
            condition: None,
        }
    }

    fn edges_map(edges: Vec<Edge>) -> HashMap<String, Edge> {
        edges.into_iter().map(|e| (e.id.clone(), e)).collect()
    }

    fn minimal_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            workflow_id: "wf1".into(),
            name: "wf1".into(),
            description: String::new(),
            version: "1.0.0".into(),
            tags: vec![],
            timeout_seconds: None,
            nodes: HashMap::from([
                ("start".to_string(), node("start", NodeType::Start)),
                ("end".to_string(), node("end", NodeType::End)),
            ]),
            edges: edges_map(vec![edge("e1", "start", "end", EdgeType::Sequential)]),
        }
    }

    #[test]
    fn valid_definition_passes() {
        let def = minimal_definition();
        def.validate(&HashMap::new()).unwrap();
    }

    #[test]
    fn missing_start_node_is_rejected() {
        let mut def = minimal_definition();
        def.nodes.remove("start");
        let err = def.validate(&HashMap::new()).unwrap_err();
        assert!(matches!(err, ArgusError::Validation(_)));
    }

    #[test]
    fn dangling_edge_is_rejected() {
        let mut def = minimal_definition();
        let bad = edge("bad", "start", "nowhere", EdgeType::Sequential);
        def.edges.insert(bad.id.clone(), bad);
        let err = def.validate(&HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn non_loop_back_cycle_is_rejected() {
        let mut def = minimal_definition();
        def.nodes.insert("mid".to_string(), node("mid", NodeType::Task));
        def.edges = edges_map(vec![
            edge("e1", "start", "mid", EdgeType::Sequential),
            edge("e2", "mid", "end", EdgeType::Sequential),
            edge("e3", "end", "mid", EdgeType::Sequential),
        ]);
        let err = def.validate(&HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn loop_back_cycle_is_allowed() {
        let mut def = minimal_definition();
        def.nodes.insert("mid".to_string(), node("mid", NodeType::Task));
        def.edges = edges_map(vec![
            edge("e1", "start", "mid", EdgeType::Sequential),
            edge("e2", "mid", "end", EdgeType::Sequential),
            edge("e3", "end", "mid", EdgeType::LoopBack),
        ]);
        def.validate(&HashMap::new()).unwrap();
    }
}
