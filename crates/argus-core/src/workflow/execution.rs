//! Mutable per-run execution state (spec §3, component G).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::workflow::node::{NodeOutcome, NodeState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Timeout
        )
    }
}

/// Cooperative cancellation signal shared by every task dispatched for one
/// execution (spec §5). Cheap to clone; `cancel` may be called more than
/// once.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// A live or historical instance of a workflow (spec §3).
#[derive(Clone)]
pub struct WorkflowExecution {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub current_nodes: HashSet<String>,
    pub completed_nodes: HashSet<String>,
    pub failed_nodes: HashSet<String>,
    pub node_results: HashMap<String, NodeOutcome>,
    pub node_states: HashMap<String, NodeState>,
    pub execution_context: HashMap<String, Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub initiated_by: String,
    pub priority: i32,
    pub error: Option<String>,
    pub cancellation: CancellationToken,
}

impl WorkflowExecution {
    pub fn new(
        workflow_id: impl Into<String>,
        execution_context: HashMap<String, Value>,
        initiated_by: impl Into<String>,
        priority: i32,
    ) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Created,
            current_nodes: HashSet::new(),
            completed_nodes: HashSet::new(),
            failed_nodes: HashSet::new(),
            node_results: HashMap::new(),
            node_states: HashMap::new(),
            execution_context,
            started_at: Utc::now(),
            completed_at: None,
            initiated_by: initiated_by.into(),
            priority,
            error: None,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn total_known_nodes(&self) -> usize {
        self.current_nodes.len() + self.completed_nodes.len() + self.failed_nodes.len()
    }
}

/// Progress summary returned by `GetWorkflowStatus` (spec §4.5, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub total_nodes: usize,
    pub completed_nodes: usize,
    pub failed_nodes: usize,
    pub current_nodes: Vec<String>,
    pub completion_percentage: f64,
}
