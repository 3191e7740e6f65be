//! The workflow engine: graph definitions, live execution state, edge
//! evaluation, and the scheduler that drives them (spec §3, §4.4, §4.5).

mod definition;
mod edge;
mod engine;
mod execution;
mod loader;
mod node;

pub use definition::{Edge, EdgeType, WorkflowDefinition};
pub use edge::{evaluate_decision_conditions, evaluate_named_condition, should_traverse};
pub use engine::{EngineMetrics, EngineStatusSnapshot, StatusSnapshot, WorkflowEngine};
pub use loader::{load_definition, parse_json, parse_yaml};
pub use execution::{CancellationToken, ExecutionStatus, Progress, WorkflowExecution};
pub use node::{
    DecisionOutcome, FailureCause, MergeOutcome, Node, NodeOutcome, NodeState, NodeStatus,
    NodeType, ResultView, SubprocessOutcome, TaskOutcome,
};
