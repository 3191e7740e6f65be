use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifies the live execution and node that a task belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContextRef {
    pub execution_id: Uuid,
    pub node_id: String,
    pub workflow_id: String,
}

/// A unit of work handed to an [`Agent`](super::Agent).
///
/// `parameters` must be treated as read-only by the agent: the engine may
/// reuse the same map across retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: String,
    pub description: String,
    pub parameters: HashMap<String, Value>,
    pub workflow_context: WorkflowContextRef,
}

/// Result returned by [`Agent::process_task`].
///
/// Numeric fields are left `None` when the agent has no opinion; the edge
/// evaluator treats missing values with documented defaults rather than
/// failing (spec.md S4.4).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub confidence: Option<f64>,
    pub sources: Option<Vec<String>>,
    pub evidence: Option<Vec<String>>,
    pub evidence_quality: Option<f64>,
    pub completeness: Option<f64>,
    pub error: Option<String>,
    #[serde(default)]
    pub payload: HashMap<String, Value>,
}

impl TaskResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}
