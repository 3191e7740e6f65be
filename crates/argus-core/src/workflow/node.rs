//! Node types and the typed result sum type (spec §3, §4.2, §9 component H).
//!
//! `node_results` in the source is a free-form map; here every node type
//! carries its own strongly-typed outcome, and the edge evaluator reads
//! them through [`ResultView`] instead of probing a dynamic map.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::execution::ExecutionStatus;

/// The kind of operation a node performs (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Start,
    End,
    Task,
    Decision,
    Parallel,
    Merge,
    Loop,
    Condition,
    Subprocess,
    Delay,
}

/// A node in a [`WorkflowDefinition`](super::definition::WorkflowDefinition).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub node_type: NodeType,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,

    /// TASK: capability key looked up in the agent registry.
    #[serde(default)]
    pub agent_type: Option<String>,
    /// TASK: opaque action name passed through to the agent.
    #[serde(default)]
    pub action: Option<String>,
    /// TASK/DELAY/SUBPROCESS: opaque parameter bag. DELAY reads
    /// `delay_seconds`; SUBPROCESS reads `workflow_id`.
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    /// DECISION/CONDITION: recognized predicate names mapped to thresholds.
    #[serde(default)]
    pub conditions: HashMap<String, f64>,

    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

impl Node {
    pub fn delay_seconds(&self) -> Option<u64> {
        self.parameters.get("delay_seconds").and_then(|v| v.as_u64())
    }

    pub fn subprocess_workflow_id(&self) -> Option<&str> {
        self.parameters.get("workflow_id").and_then(|v| v.as_str())
    }
}

/// Mutable per-node lifecycle state tracked inside a
/// [`WorkflowExecution`](super::execution::WorkflowExecution) (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
}

/// Why a TASK node's most recent attempt failed, used by the edge evaluator
/// to pick between `ERROR_HANDLER` and `TIMEOUT` outgoing edges (spec
/// §4.4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    AgentError,
    Timeout,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeState {
    pub status: Option<NodeStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_failure_cause: Option<FailureCause>,
}

/// Result of completing a TASK node: a direct projection of
/// [`TaskResult`](crate::agent::TaskResult) plus bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    pub confidence: Option<f64>,
    pub sources: Option<Vec<String>>,
    pub evidence: Option<Vec<String>>,
    pub evidence_quality: Option<f64>,
    pub completeness: Option<f64>,
    pub error: Option<String>,
    pub payload: HashMap<String, Value>,
    pub retries_used: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub success: bool,
    pub decision: bool,
    pub conditions_met: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub merge_count: usize,
    pub results: HashMap<String, NodeOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubprocessOutcome {
    pub nested_execution_id: Uuid,
    pub nested_status: ExecutionStatus,
    pub success: bool,
    pub error: Option<String>,
}

/// Strongly-typed node result, one variant per node type (spec §9 design
/// note: a sum type in place of the source's free-form result map).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeOutcome {
    Start,
    End,
    Task(TaskOutcome),
    Decision(DecisionOutcome),
    Parallel,
    Merge(MergeOutcome),
    Delay,
    Subprocess(SubprocessOutcome),
}

/// Typed accessor interface the edge evaluator consumes (spec §9), so it
/// never needs to know which variant produced a given result.
pub trait ResultView {
    fn outcome_success(&self) -> bool;
    fn confidence(&self) -> Option<f64>;
    fn completeness(&self) -> Option<f64>;
    fn sources(&self) -> &[String];
    fn evidence(&self) -> &[String];
    fn evidence_quality(&self) -> Option<f64>;
}

const EMPTY: &[String] = &[];

impl ResultView for NodeOutcome {
    fn outcome_success(&self) -> bool {
        match self {
            NodeOutcome::Task(t) => t.success,
            NodeOutcome::Decision(d) => d.success,
            NodeOutcome::Subprocess(s) => s.success,
            NodeOutcome::Start
            | NodeOutcome::End
            | NodeOutcome::Parallel
            | NodeOutcome::Merge(_)
            | NodeOutcome::Delay => true,
        }
    }

    fn confidence(&self) -> Option<f64> {
        match self {
            NodeOutcome::Task(t) => t.confidence,
            _ => None,
        }
    }

    fn completeness(&self) -> Option<f64> {
        match self {
            NodeOutcome::Task(t) => t.completeness,
            _ => None,
        }
    }

    fn sources(&self) -> &[String] {
        match self {
            NodeOutcome::Task(t) => t.sources.as_deref().unwrap_or(EMPTY),
            _ => EMPTY,
        }
    }

    fn evidence(&self) -> &[String] {
        match self {
            NodeOutcome::Task(t) => t.evidence.as_deref().unwrap_or(EMPTY),
            _ => EMPTY,
        }
    }

    fn evidence_quality(&self) -> Option<f64> {
        match self {
            NodeOutcome::Task(t) => t.evidence_quality,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_task_outcomes_default_to_no_evidence() {
        assert_eq!(NodeOutcome::Start.evidence(), EMPTY);
        assert_eq!(NodeOutcome::Parallel.confidence(), None);
    }

    #[test]
    fn task_outcome_surfaces_its_fields() {
        let outcome = NodeOutcome::Task(TaskOutcome {
            success: true,
            confidence: Some(0.9),
            evidence: Some(vec!["a".into(), "b".into()]),
            ..Default::default()
        });
        assert_eq!(outcome.confidence(), Some(0.9));
        assert_eq!(outcome.evidence().len(), 2);
        assert!(outcome.outcome_success());
    }

    #[test]
    fn delay_seconds_reads_parameter() {
        let node = Node {
            id: "d".into(),
            node_type: NodeType::Delay,
            name: "wait".into(),
            description: None,
            agent_type: None,
            action: None,
            parameters: HashMap::from([("delay_seconds".to_string(), Value::from(5))]),
            conditions: HashMap::new(),
            timeout_seconds: None,
            max_retries: 3,
        };
        assert_eq!(node.delay_seconds(), Some(5));
    }
}
