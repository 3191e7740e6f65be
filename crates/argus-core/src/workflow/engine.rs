//! The workflow engine scheduler (spec §4.4, component J) and public
//! façade (spec §4.5, component K).
//!
//! Runs four independent loops sharing only the executions map, the
//! priority queue, and the definitions map: the execution loop, the
//! timeout monitor, the cleanup loop, and a performance monitor that keeps
//! aggregate metrics current (spec §5).

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentRegistry, Task, TaskResult, WorkflowContextRef};
use crate::clock::next_sequence;
use crate::config::EngineConfig;
use crate::error::{ArgusError, Result};
use crate::queue::ExecutionQueue;
use crate::workflow::definition::{EdgeType, WorkflowDefinition};
use crate::workflow::edge::{evaluate_decision_conditions, should_traverse};
use crate::workflow::execution::{ExecutionStatus, Progress, WorkflowExecution};
use crate::workflow::node::{
    DecisionOutcome, FailureCause, MergeOutcome, Node, NodeOutcome, NodeState, NodeStatus,
    NodeType, SubprocessOutcome, TaskOutcome,
};

/// Aggregate metrics the façade exposes via `EngineStatus` (spec §6).
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EngineMetrics {
    pub total_workflows: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub active_executions: u64,
    pub average_execution_time_seconds: f64,
    /// Per-node-type rollup, keyed by its `SCREAMING_SNAKE_CASE` name,
    /// drained from `node_events` by the performance monitor loop (spec §6.1
    /// `EngineStatus.metrics.per_node_type`).
    pub per_node_type: HashMap<String, NodeTypeMetrics>,
    total_execution_time_seconds: f64,
}

/// Rolling count/avg-time/success-rate for one node type (spec §6.1).
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct NodeTypeMetrics {
    pub count: u64,
    pub avg_time_seconds: f64,
    pub success_rate: f64,
}

impl NodeTypeMetrics {
    fn record(&mut self, success: bool, elapsed_seconds: f64) {
        let total_time = self.avg_time_seconds * self.count as f64 + elapsed_seconds;
        let successes = self.success_rate * self.count as f64 + if success { 1.0 } else { 0.0 };
        self.count += 1;
        self.avg_time_seconds = total_time / self.count as f64;
        self.success_rate = successes / self.count as f64;
    }
}

/// One completed node attempt, fed to the performance monitor loop (spec
/// §5 — a dedicated fourth loop consumes these rather than updating
/// `metrics` inline on every completion).
#[derive(Debug, Clone, Copy)]
struct NodeCompletionEvent {
    node_type: NodeType,
    success: bool,
    elapsed_seconds: f64,
}

impl EngineMetrics {
    fn record_completion(&mut self, status: ExecutionStatus, execution_time_seconds: f64) {
        self.total_workflows += 1;
        if status == ExecutionStatus::Completed {
            self.successful_executions += 1;
        } else {
            self.failed_executions += 1;
        }
        self.total_execution_time_seconds += execution_time_seconds;
        self.average_execution_time_seconds =
            self.total_execution_time_seconds / self.total_workflows as f64;
    }
}

/// Snapshot returned by `GetWorkflowStatus` (spec §6).
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusSnapshot {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub progress: Progress,
    pub started_at: chrono::DateTime<Utc>,
    pub completed_at: Option<chrono::DateTime<Utc>>,
    pub execution_time_seconds: f64,
    pub initiated_by: String,
    pub error: Option<String>,
    pub node_results: HashMap<String, NodeOutcome>,
}

/// One entry of `EngineStatus().workflows` (spec §6.1) — a minimal registry
/// listing, mirroring the shape of `AdapterRegistry::known_keys` adapted to
/// carry both the id and the display name.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub name: String,
}

/// Snapshot returned by `EngineStatus` (spec §6).
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatusSnapshot {
    pub engine_status: String,
    pub registered_workflows: usize,
    pub active_executions: usize,
    pub execution_history_size: usize,
    pub metrics: EngineMetrics,
    pub configuration: EngineConfig,
    pub workflows: Vec<WorkflowSummary>,
}

struct ExecutionSlot {
    execution: WorkflowExecution,
    /// Edges already decided this run: `true` if traversed. Populated as
    /// each predecessor completes; only traversed entries create a MERGE
    /// obligation (spec §9 design note).
    resolved_edges: HashMap<String, bool>,
}

/// Owns every registered [`WorkflowDefinition`] and every live or
/// historical [`WorkflowExecution`] (spec §4.4, §4.5).
pub struct WorkflowEngine {
    definitions: RwLock<HashMap<String, WorkflowDefinition>>,
    executions: RwLock<HashMap<Uuid, ExecutionSlot>>,
    history: RwLock<VecDeque<WorkflowExecution>>,
    queue: ExecutionQueue,
    agents: Arc<AgentRegistry>,
    config: EngineConfig,
    metrics: RwLock<EngineMetrics>,
    running: AtomicBool,
    /// Fed one [`NodeCompletionEvent`] per completed node attempt; drained
    /// by the performance monitor loop rather than updating `metrics`
    /// inline on every completion (spec §5 — a dedicated fourth loop).
    node_events_tx: mpsc::UnboundedSender<NodeCompletionEvent>,
    node_events_rx: Mutex<mpsc::UnboundedReceiver<NodeCompletionEvent>>,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig, agents: Arc<AgentRegistry>) -> Arc<Self> {
        let (node_events_tx, node_events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            definitions: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            queue: ExecutionQueue::new(),
            agents,
            config,
            metrics: RwLock::new(EngineMetrics::default()),
            running: AtomicBool::new(false),
            node_events_tx,
            node_events_rx: Mutex::new(node_events_rx),
        })
    }

    // -- K: public façade ---------------------------------------------

    /// Validates and admits a workflow definition (spec §4.5).
    pub async fn register_workflow(&self, definition: WorkflowDefinition) -> Result<()> {
        let definitions = self.definitions.read().await;
        definition.validate(&definitions)?;
        drop(definitions);
        let mut definitions = self.definitions.write().await;
        definitions.insert(definition.workflow_id.clone(), definition);
        Ok(())
    }

    /// Creates and enqueues an execution (spec §4.5).
    pub async fn execute_workflow(
        self: &Arc<Self>,
        workflow_id: &str,
        context: HashMap<String, Value>,
        initiated_by: impl Into<String>,
        priority: i32,
    ) -> Result<Uuid> {
        let definitions = self.definitions.read().await;
        let definition = definitions
            .get(workflow_id)
            .ok_or_else(|| ArgusError::NotFound(format!("workflow '{workflow_id}' not registered")))?
            .clone();
        drop(definitions);

        let mut execution = WorkflowExecution::new(workflow_id, context, initiated_by, priority);
        let start = definition
            .start_node()
            .expect("validated definitions always have a START node");
        execution
            .node_states
            .insert(start.id.clone(), NodeState {
                status: Some(NodeStatus::Ready),
                ..Default::default()
            });
        execution.current_nodes.insert(start.id.clone());
        let execution_id = execution.execution_id;

        let mut executions = self.executions.write().await;
        executions.insert(
            execution_id,
            ExecutionSlot {
                execution,
                resolved_edges: HashMap::new(),
            },
        );
        drop(executions);

        self.queue
            .push(priority, next_sequence(), execution_id)
            .await;

        Ok(execution_id)
    }

    /// Reads a live or historical execution snapshot (spec §4.5).
    pub async fn get_workflow_status(&self, execution_id: Uuid) -> Result<StatusSnapshot> {
        if let Some(slot) = self.executions.read().await.get(&execution_id) {
            return Ok(self.snapshot(&slot.execution).await);
        }
        if let Some(execution) = self
            .history
            .read()
            .await
            .iter()
            .find(|e| e.execution_id == execution_id)
        {
            return Ok(self.snapshot(execution).await);
        }
        Err(ArgusError::NotFound(format!(
            "execution '{execution_id}' not found"
        )))
    }

    async fn snapshot(&self, execution: &WorkflowExecution) -> StatusSnapshot {
        let total_nodes = execution.total_known_nodes();
        let completed = execution.completed_nodes.len();
        let failed = execution.failed_nodes.len();
        let completion_percentage = if total_nodes == 0 {
            0.0
        } else {
            100.0 * (completed + failed) as f64 / total_nodes as f64
        };

        let execution_time_seconds = execution
            .completed_at
            .unwrap_or_else(Utc::now)
            .signed_duration_since(execution.started_at)
            .num_milliseconds() as f64
            / 1000.0;

        let workflow_name = self
            .definitions
            .read()
            .await
            .get(&execution.workflow_id)
            .map(|def| def.name.clone())
            .unwrap_or_else(|| execution.workflow_id.clone());

        StatusSnapshot {
            execution_id: execution.execution_id,
            workflow_id: execution.workflow_id.clone(),
            workflow_name,
            status: execution.status,
            progress: Progress {
                total_nodes,
                completed_nodes: completed,
                failed_nodes: failed,
                current_nodes: execution.current_nodes.iter().cloned().collect(),
                completion_percentage,
            },
            started_at: execution.started_at,
            completed_at: execution.completed_at,
            execution_time_seconds,
            initiated_by: execution.initiated_by.clone(),
            error: execution.error.clone(),
            node_results: execution.node_results.clone(),
        }
    }

    /// Cooperatively cancels a live execution (spec §4.5, idempotent per I11).
    pub async fn cancel_execution(&self, execution_id: Uuid, reason: &str) -> Result<()> {
        let mut executions = self.executions.write().await;
        let Some(slot) = executions.get_mut(&execution_id) else {
            return Err(ArgusError::NotFound(format!(
                "execution '{execution_id}' not found"
            )));
        };
        slot.execution.cancellation.cancel();
        slot.execution.status = ExecutionStatus::Cancelled;
        slot.execution.error = Some(reason.to_string());
        slot.execution.completed_at = Some(Utc::now());
        let execution = slot.execution.clone();
        executions.remove(&execution_id);
        drop(executions);
        self.finish(execution).await;
        Ok(())
    }

    pub async fn engine_status(&self) -> EngineStatusSnapshot {
        let definitions = self.definitions.read().await;
        let executions = self.executions.read().await;
        let history = self.history.read().await;
        let metrics = self.metrics.read().await;
        let workflows = definitions
            .values()
            .map(|def| WorkflowSummary {
                workflow_id: def.workflow_id.clone(),
                name: def.name.clone(),
            })
            .collect();
        EngineStatusSnapshot {
            engine_status: if self.running.load(Ordering::Acquire) {
                "running".to_string()
            } else {
                "stopped".to_string()
            },
            registered_workflows: definitions.len(),
            active_executions: executions.len(),
            execution_history_size: history.len(),
            metrics: metrics.clone(),
            configuration: self.config.clone(),
            workflows,
        }
    }

    /// Starts the four background loops (spec §5). Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("workflow engine starting");
        tokio::spawn(self.clone().execution_loop());
        tokio::spawn(self.clone().timeout_monitor_loop());
        tokio::spawn(self.clone().cleanup_loop());
        tokio::spawn(self.clone().performance_monitor_loop());
    }

    /// Cancels every active execution and stops the background loops
    /// within the configured grace period (spec §4.5, §6).
    pub async fn stop(self: &Arc<Self>) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("workflow engine stopping");
        let ids: Vec<Uuid> = self.executions.read().await.keys().copied().collect();
        for id in ids {
            let _ = self.cancel_execution(id, "Engine shutdown").await;
        }
        self.queue.shutdown();
        tokio::time::sleep(StdDuration::from_secs(
            self.config.general.shutdown_grace_seconds.min(1),
        ))
        .await;
    }

    // -- J: background loops -------------------------------------------

    async fn execution_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Acquire) {
            let Some((priority, _seq, execution_id)) = self.queue.pop().await else {
                break;
            };

            let Some(status) = self
                .executions
                .read()
                .await
                .get(&execution_id)
                .map(|slot| slot.execution.status)
            else {
                continue;
            };

            // Real backpressure: admission beyond `max_concurrent_executions`
            // queues but does not dispatch (spec §5). A CREATED execution is
            // re-enqueued untouched rather than promoted to RUNNING; anything
            // already RUNNING keeps making progress regardless of the cap.
            if status == ExecutionStatus::Created && self.at_concurrency_capacity().await {
                tokio::time::sleep(StdDuration::from_millis(10)).await;
                self.queue
                    .push(priority, next_sequence(), execution_id)
                    .await;
                continue;
            }

            self.drive_round(execution_id).await;

            let still_running = self
                .executions
                .read()
                .await
                .get(&execution_id)
                .map(|s| s.execution.status == ExecutionStatus::Running)
                .unwrap_or(false);

            if still_running {
                self.queue
                    .push(priority, next_sequence(), execution_id)
                    .await;
            }
        }
    }

    /// Whether the number of RUNNING executions has reached the configured
    /// cap (spec §5 backpressure). Executions already RUNNING are never
    /// paused by this check — only admission of new ones is deferred.
    async fn at_concurrency_capacity(&self) -> bool {
        let running = self
            .executions
            .read()
            .await
            .values()
            .filter(|slot| slot.execution.status == ExecutionStatus::Running)
            .count();
        running >= self.config.general.max_concurrent_executions
    }

    /// Runs one round of frontier processing for `execution_id`, then
    /// completes it if it reached a terminal state.
    async fn drive_round(self: &Arc<Self>, execution_id: Uuid) {
        let definition = {
            let executions = self.executions.read().await;
            let Some(slot) = executions.get(&execution_id) else {
                return;
            };
            let definitions = self.definitions.read().await;
            let Some(def) = definitions.get(&slot.execution.workflow_id) else {
                return;
            };
            def.clone()
        };

        {
            let mut executions = self.executions.write().await;
            if let Some(slot) = executions.get_mut(&execution_id) {
                if slot.execution.status == ExecutionStatus::Created {
                    slot.execution.status = ExecutionStatus::Running;
                }
            }
        }

        self.process_ready_frontier(&definition, execution_id).await;

        let terminal = {
            let executions = self.executions.read().await;
            executions
                .get(&execution_id)
                .map(|s| s.execution.status.is_terminal())
                .unwrap_or(true)
        };

        if terminal {
            self.complete_execution(execution_id).await;
        }
    }

    /// Drives a SUBPROCESS's nested execution directly to completion,
    /// bypassing the shared queue (spec §4.4.2).
    // Written as a manually-boxed future (rather than `async fn`) to break
    // the otherwise-infinite recursive future type formed by
    // run_to_completion -> drive_round -> process_ready_frontier ->
    // dispatch_node -> run_subprocess -> run_to_completion.
    fn run_to_completion<'a>(
        self: &'a Arc<Self>,
        execution_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            loop {
                let (status, has_ready) = {
                    let executions = self.executions.read().await;
                    let Some(slot) = executions.get(&execution_id) else {
                        return;
                    };
                    (
                        slot.execution.status,
                        !slot.execution.current_nodes.is_empty(),
                    )
                };
                if status.is_terminal() {
                    return;
                }
                if !has_ready {
                    return;
                }
                self.drive_round(execution_id).await;
            }
        })
    }

    async fn process_ready_frontier(self: &Arc<Self>, definition: &WorkflowDefinition, execution_id: Uuid) {
        let ready_ids: Vec<String> = {
            let executions = self.executions.read().await;
            let Some(slot) = executions.get(&execution_id) else {
                return;
            };
            slot.execution
                .current_nodes
                .iter()
                .filter(|id| {
                    matches!(
                        slot.execution.node_states.get(*id).and_then(|s| s.status.clone()),
                        Some(NodeStatus::Ready)
                    )
                })
                .cloned()
                .collect()
        };

        if ready_ids.is_empty() {
            return;
        }

        let cancellation = {
            let executions = self.executions.read().await;
            executions
                .get(&execution_id)
                .map(|s| s.execution.cancellation.clone())
        };
        let Some(cancellation) = cancellation else {
            return;
        };

        let mut handles = Vec::with_capacity(ready_ids.len());
        for node_id in ready_ids {
            let node = definition.nodes.get(&node_id).cloned();
            let Some(node) = node else { continue };
            let this = self.clone();
            let cancellation = cancellation.clone();
            let definition = definition.clone();
            handles.push(tokio::spawn(async move {
                let outcome = this
                    .dispatch_node(&definition, execution_id, &node, cancellation)
                    .await;
                (node_id, outcome)
            }));
        }

        let mut completions = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(result) = handle.await {
                completions.push(result);
            }
        }

        for (node_id, completion) in completions {
            self.apply_completion(definition, execution_id, &node_id, completion)
                .await;
        }

        self.update_state(definition, execution_id).await;
    }

    async fn dispatch_node(
        self: &Arc<Self>,
        definition: &WorkflowDefinition,
        execution_id: Uuid,
        node: &Node,
        cancellation: crate::workflow::execution::CancellationToken,
    ) -> NodeCompletion {
        {
            let mut executions = self.executions.write().await;
            if let Some(slot) = executions.get_mut(&execution_id) {
                slot.execution.node_states.entry(node.id.clone()).or_default().status =
                    Some(NodeStatus::Running);
                slot.execution
                    .node_states
                    .entry(node.id.clone())
                    .or_default()
                    .started_at = Some(Utc::now());
            }
        }

        match node.node_type {
            NodeType::Start => NodeCompletion::done(NodeOutcome::Start),
            NodeType::End => NodeCompletion::done(NodeOutcome::End),
            NodeType::Parallel => NodeCompletion::done(NodeOutcome::Parallel),
            NodeType::Delay => self.run_delay(node, cancellation).await,
            NodeType::Task => self.run_task(execution_id, node, cancellation).await,
            NodeType::Decision | NodeType::Condition => {
                self.run_decision(execution_id, node).await
            }
            NodeType::Merge => self.run_merge(definition, execution_id, node).await,
            NodeType::Subprocess => self.run_subprocess(execution_id, node).await,
            // LOOP carries no work of its own; iteration is driven entirely
            // by a LOOP_BACK edge routed back into the loop body.
            NodeType::Loop => NodeCompletion::done(NodeOutcome::Parallel),
        }
    }

    async fn run_delay(
        &self,
        node: &Node,
        cancellation: crate::workflow::execution::CancellationToken,
    ) -> NodeCompletion {
        let seconds = node.delay_seconds().unwrap_or(0);
        tokio::select! {
            _ = tokio::time::sleep(StdDuration::from_secs(seconds)) => {}
            _ = cancellation.cancelled() => {}
        }
        NodeCompletion::done(NodeOutcome::Delay)
    }

    async fn run_task(
        self: &Arc<Self>,
        execution_id: Uuid,
        node: &Node,
        cancellation: crate::workflow::execution::CancellationToken,
    ) -> NodeCompletion {
        let Some(agent_type) = node.agent_type.as_deref() else {
            return NodeCompletion::terminal_failure(
                "no suitable agent: node has no agent_type".to_string(),
                FailureCause::AgentError,
            );
        };

        let agent: Arc<dyn Agent> = match self.agents.lookup(agent_type) {
            Ok(agent) => agent,
            Err(_) => {
                return NodeCompletion::terminal_failure(
                    format!("no suitable agent for capability '{agent_type}'"),
                    FailureCause::AgentError,
                )
            }
        };

        let workflow_id = {
            let executions = self.executions.read().await;
            executions
                .get(&execution_id)
                .map(|s| s.execution.workflow_id.clone())
                .unwrap_or_default()
        };

        let task = Task {
            id: Uuid::new_v4(),
            task_type: node.action.clone().unwrap_or_else(|| node.id.clone()),
            description: node.description.clone().unwrap_or_default(),
            parameters: node
                .parameters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            workflow_context: WorkflowContextRef {
                execution_id,
                node_id: node.id.clone(),
                workflow_id,
            },
        };

        let timeout = StdDuration::from_secs(
            node.timeout_seconds
                .unwrap_or(self.config.general.default_node_timeout_seconds),
        );

        let result = tokio::select! {
            res = tokio::time::timeout(timeout, agent.process_task(task)) => res,
            _ = cancellation.cancelled() => return NodeCompletion::terminal_failure(
                "cancelled".to_string(),
                FailureCause::AgentError,
            ),
        };

        match result {
            Ok(task_result) => self.to_task_completion(task_result),
            Err(_) => NodeCompletion::retryable_failure(
                format!("timeout after {}s", timeout.as_secs()),
                FailureCause::Timeout,
            ),
        }
    }

    fn to_task_completion(&self, result: TaskResult) -> NodeCompletion {
        if result.success {
            NodeCompletion::done(NodeOutcome::Task(TaskOutcome {
                success: true,
                confidence: result.confidence,
                sources: result.sources,
                evidence: result.evidence,
                evidence_quality: result.evidence_quality,
                completeness: result.completeness,
                error: None,
                payload: result.payload,
                retries_used: 0,
            }))
        } else {
            NodeCompletion::retryable_failure(
                result.error.unwrap_or_else(|| "task failed".to_string()),
                FailureCause::AgentError,
            )
        }
    }

    async fn run_decision(self: &Arc<Self>, execution_id: Uuid, node: &Node) -> NodeCompletion {
        let node_results = {
            let executions = self.executions.read().await;
            executions
                .get(&execution_id)
                .map(|s| s.execution.node_results.clone())
                .unwrap_or_default()
        };
        let passed = evaluate_decision_conditions(&node.conditions, &node_results);
        NodeCompletion::done(NodeOutcome::Decision(DecisionOutcome {
            success: true,
            decision: passed,
            conditions_met: passed,
        }))
    }

    /// Gathers the results of every predecessor whose edge into this MERGE
    /// node was actually traversed (spec §9 design note: predecessors whose
    /// edge was never evaluated true, e.g. the untaken branch of a
    /// DECISION, do not contribute).
    async fn run_merge(
        self: &Arc<Self>,
        definition: &WorkflowDefinition,
        execution_id: Uuid,
        node: &Node,
    ) -> NodeCompletion {
        let executions = self.executions.read().await;
        let Some(slot) = executions.get(&execution_id) else {
            return NodeCompletion::done(NodeOutcome::Merge(MergeOutcome {
                merge_count: 0,
                results: HashMap::new(),
            }));
        };

        let results: HashMap<String, NodeOutcome> = definition
            .incoming(&node.id)
            .filter(|edge| slot.resolved_edges.get(&edge.id).copied().unwrap_or(false))
            .filter_map(|edge| {
                slot.execution
                    .node_results
                    .get(&edge.from_node)
                    .map(|r| (edge.from_node.clone(), r.clone()))
            })
            .collect();
        let merge_count = results.len();
        drop(executions);
        NodeCompletion::done(NodeOutcome::Merge(MergeOutcome { merge_count, results }))
    }

    async fn run_subprocess(self: &Arc<Self>, execution_id: Uuid, node: &Node) -> NodeCompletion {
        let Some(target_workflow_id) = node.subprocess_workflow_id().map(str::to_string) else {
            return NodeCompletion::terminal_failure(
                "subprocess node missing workflow_id parameter".to_string(),
                FailureCause::AgentError,
            );
        };

        let (context, initiated_by) = {
            let executions = self.executions.read().await;
            let Some(slot) = executions.get(&execution_id) else {
                return NodeCompletion::terminal_failure(
                    "parent execution vanished".to_string(),
                    FailureCause::AgentError,
                );
            };
            (
                slot.execution.execution_context.clone(),
                slot.execution.initiated_by.clone(),
            )
        };

        let nested_id = match self
            .execute_workflow(&target_workflow_id, context, initiated_by, 3)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                return NodeCompletion::terminal_failure(e.to_string(), FailureCause::AgentError)
            }
        };

        let timeout = StdDuration::from_secs(
            node.timeout_seconds
                .unwrap_or(self.config.general.subprocess_default_timeout_seconds),
        );

        let outcome = tokio::time::timeout(timeout, self.run_to_completion(nested_id)).await;

        let (nested_status, error) = {
            let executions = self.executions.read().await;
            if let Some(slot) = executions.get(&nested_id) {
                (slot.execution.status, slot.execution.error.clone())
            } else {
                let history = self.history.read().await;
                history
                    .iter()
                    .find(|e| e.execution_id == nested_id)
                    .map(|e| (e.status, e.error.clone()))
                    .unwrap_or((ExecutionStatus::Failed, Some("nested execution lost".into())))
            }
        };

        if outcome.is_err() {
            return NodeCompletion::terminal_failure(
                "subprocess timed out".to_string(),
                FailureCause::Timeout,
            );
        }

        let success = nested_status == ExecutionStatus::Completed;
        NodeCompletion::done(NodeOutcome::Subprocess(SubprocessOutcome {
            nested_execution_id: nested_id,
            nested_status,
            success,
            error,
        }))
    }

    async fn apply_completion(
        self: &Arc<Self>,
        definition: &WorkflowDefinition,
        execution_id: Uuid,
        node_id: &str,
        completion: NodeCompletion,
    ) {
        let mut executions = self.executions.write().await;
        let Some(slot) = executions.get_mut(&execution_id) else {
            return;
        };

        let state = slot.execution.node_states.entry(node_id.to_string()).or_default();

        match completion {
            NodeCompletion::Completed(outcome) => {
                let completed_at = Utc::now();
                let elapsed_seconds = state
                    .started_at
                    .map(|started| (completed_at - started).num_milliseconds() as f64 / 1000.0)
                    .unwrap_or(0.0);

                slot.execution.current_nodes.remove(node_id);
                slot.execution.completed_nodes.insert(node_id.to_string());
                slot.execution
                    .node_results
                    .insert(node_id.to_string(), outcome);
                state.status = Some(NodeStatus::Completed);
                state.completed_at = Some(completed_at);

                if let Some(node_type) = definition.nodes.get(node_id).map(|n| n.node_type) {
                    let _ = self.node_events_tx.send(NodeCompletionEvent {
                        node_type,
                        success: true,
                        elapsed_seconds,
                    });
                    if node_type == NodeType::End {
                        slot.execution.status = ExecutionStatus::Completed;
                        slot.execution.completed_at = Some(completed_at);
                    }
                }
            }
            NodeCompletion::Retry(error, cause) => {
                let max_retries = definition
                    .nodes
                    .get(node_id)
                    .map(|n| n.max_retries)
                    .unwrap_or(0);
                state.last_error = Some(error.clone());
                state.last_failure_cause = Some(cause);

                if state.retry_count < max_retries {
                    state.retry_count += 1;
                    state.status = Some(NodeStatus::Ready);
                } else {
                    self.apply_terminal_node_failure(definition, slot, node_id, error, cause);
                }
            }
            NodeCompletion::TerminalFailure(error, cause) => {
                self.apply_terminal_node_failure(definition, slot, node_id, error, cause);
            }
        }
    }

    /// Runs the failure policy for a task node that has exhausted retries
    /// (spec §4.4.5): route to ERROR_HANDLER edges if any exist, otherwise
    /// fail the whole execution.
    fn apply_terminal_node_failure(
        &self,
        definition: &WorkflowDefinition,
        slot: &mut ExecutionSlot,
        node_id: &str,
        error: String,
        cause: FailureCause,
    ) {
        let state = slot.execution.node_states.entry(node_id.to_string()).or_default();
        let completed_at = Utc::now();
        let elapsed_seconds = state
            .started_at
            .map(|started| (completed_at - started).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);
        state.status = Some(NodeStatus::Failed);
        state.completed_at = Some(completed_at);
        state.last_error = Some(error.clone());
        state.last_failure_cause = Some(cause);

        if let Some(node_type) = definition.nodes.get(node_id).map(|n| n.node_type) {
            let _ = self.node_events_tx.send(NodeCompletionEvent {
                node_type,
                success: false,
                elapsed_seconds,
            });
        }

        let has_error_handler = definition
            .outgoing(node_id)
            .any(|e| e.edge_type == EdgeType::ErrorHandler);

        slot.execution.current_nodes.remove(node_id);
        slot.execution.node_results.insert(
            node_id.to_string(),
            NodeOutcome::Task(TaskOutcome {
                success: false,
                error: Some(error.clone()),
                ..Default::default()
            }),
        );

        if has_error_handler {
            slot.execution.completed_nodes.insert(node_id.to_string());
        } else {
            slot.execution.failed_nodes.insert(node_id.to_string());
            slot.execution.status = ExecutionStatus::Failed;
            slot.execution.error = Some(format!("Node {node_id} failed: {error}"));
            slot.execution.completed_at = Some(Utc::now());
        }
    }

    /// Advances the frontier after a round of completions (spec §4.4.3).
    async fn update_state(self: &Arc<Self>, definition: &WorkflowDefinition, execution_id: Uuid) {
        let mut executions = self.executions.write().await;
        let Some(slot) = executions.get_mut(&execution_id) else {
            return;
        };
        if slot.execution.status.is_terminal() {
            return;
        }

        for node_id in slot.execution.completed_nodes.clone() {
            for edge in definition.outgoing(&node_id) {
                if slot.resolved_edges.contains_key(&edge.id) {
                    continue;
                }
                let node_results = slot.execution.node_results.clone();
                let default_state = NodeState::default();
                let from_state = slot
                    .execution
                    .node_states
                    .get(&node_id)
                    .unwrap_or(&default_state);
                let traversed = should_traverse(edge, &node_results, from_state);
                slot.resolved_edges.insert(edge.id.clone(), traversed);

                if !traversed {
                    continue;
                }

                let Some(target) = definition.nodes.get(&edge.to_node) else {
                    continue;
                };
                if slot.execution.completed_nodes.contains(&edge.to_node)
                    || slot.execution.failed_nodes.contains(&edge.to_node)
                    || slot.execution.current_nodes.contains(&edge.to_node)
                {
                    continue;
                }

                let ready = if target.node_type == NodeType::Merge {
                    definition
                        .incoming(&edge.to_node)
                        .all(|e| slot.resolved_edges.contains_key(&e.id))
                        && definition
                            .incoming(&edge.to_node)
                            .any(|e| slot.resolved_edges.get(&e.id).copied().unwrap_or(false))
                } else {
                    match edge.edge_type {
                        EdgeType::Parallel | EdgeType::ErrorHandler | EdgeType::Timeout | EdgeType::LoopBack => {
                            true
                        }
                        EdgeType::Sequential | EdgeType::Conditional => definition
                            .incoming(&edge.to_node)
                            .filter(|e| matches!(e.edge_type, EdgeType::Sequential | EdgeType::Conditional))
                            .all(|e| slot.execution.completed_nodes.contains(&e.from_node)),
                    }
                };

                if ready {
                    slot.execution
                        .node_states
                        .entry(edge.to_node.clone())
                        .or_default()
                        .status = Some(NodeStatus::Ready);
                    slot.execution.current_nodes.insert(edge.to_node.clone());
                }
            }
        }

        if slot.execution.current_nodes.is_empty() && !slot.execution.status.is_terminal() {
            // No further nodes are reachable and no END node completed: the
            // graph drained without reaching an END (e.g. every branch of a
            // DECISION evaluated false). Treat as failed rather than hang.
            if !slot
                .execution
                .completed_nodes
                .iter()
                .any(|id| definition.nodes.get(id).map(|n| n.node_type == NodeType::End).unwrap_or(false))
            {
                slot.execution.status = ExecutionStatus::Failed;
                slot.execution.error = Some("workflow drained with no reachable END node".to_string());
                slot.execution.completed_at = Some(Utc::now());
            }
        }
    }

    async fn complete_execution(self: &Arc<Self>, execution_id: Uuid) {
        let mut executions = self.executions.write().await;
        let Some(slot) = executions.remove(&execution_id) else {
            return;
        };
        drop(executions);
        self.finish(slot.execution).await;
    }

    async fn finish(&self, mut execution: WorkflowExecution) {
        if execution.completed_at.is_none() {
            execution.completed_at = Some(Utc::now());
        }
        let execution_time_seconds = execution
            .completed_at
            .unwrap()
            .signed_duration_since(execution.started_at)
            .num_milliseconds() as f64
            / 1000.0;

        {
            let mut metrics = self.metrics.write().await;
            metrics.record_completion(execution.status, execution_time_seconds);
        }

        let mut history = self.history.write().await;
        history.push_back(execution);
        while history.len() > self.config.general.max_execution_history {
            history.pop_front();
        }
    }

    async fn timeout_monitor_loop(self: Arc<Self>) {
        let interval = StdDuration::from_secs(self.config.general.timeout_monitor_interval_seconds);
        while self.running.load(Ordering::Acquire) {
            tokio::time::sleep(interval).await;
            self.sweep_timeouts().await;
        }
    }

    async fn sweep_timeouts(self: &Arc<Self>) {
        let definitions = self.definitions.read().await;
        let stuck: Vec<Uuid> = {
            let executions = self.executions.read().await;
            executions
                .iter()
                .filter_map(|(id, slot)| {
                    let def = definitions.get(&slot.execution.workflow_id)?;
                    let timeout = def.timeout_seconds?;
                    let elapsed = Utc::now()
                        .signed_duration_since(slot.execution.started_at)
                        .num_seconds();
                    (elapsed as u64 > timeout).then_some(*id)
                })
                .collect()
        };
        drop(definitions);

        for id in stuck {
            let mut executions = self.executions.write().await;
            if let Some(slot) = executions.get_mut(&id) {
                slot.execution.status = ExecutionStatus::Timeout;
                slot.execution.error = Some("Workflow timeout".to_string());
                slot.execution.completed_at = Some(Utc::now());
                let execution = slot.execution.clone();
                executions.remove(&id);
                drop(executions);
                self.finish(execution).await;
            }
        }
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let interval = StdDuration::from_secs(self.config.general.cleanup_interval_seconds);
        while self.running.load(Ordering::Acquire) {
            tokio::time::sleep(interval).await;
            self.sweep_stuck_executions().await;
        }
    }

    async fn sweep_stuck_executions(self: &Arc<Self>) {
        let threshold = self.config.general.stuck_execution_threshold_seconds as i64;
        let stuck: Vec<Uuid> = {
            let executions = self.executions.read().await;
            executions
                .iter()
                .filter(|(_, slot)| {
                    slot.execution.status == ExecutionStatus::Running
                        && Utc::now()
                            .signed_duration_since(slot.execution.started_at)
                            .num_seconds()
                            > threshold
                })
                .map(|(id, _)| *id)
                .collect()
        };

        for id in stuck {
            let mut executions = self.executions.write().await;
            if let Some(slot) = executions.get_mut(&id) {
                warn!(execution_id = %id, "execution appears stuck, forcing failure");
                slot.execution.status = ExecutionStatus::Failed;
                slot.execution.error = Some("Execution appears stuck".to_string());
                slot.execution.completed_at = Some(Utc::now());
                let execution = slot.execution.clone();
                executions.remove(&id);
                drop(executions);
                self.finish(execution).await;
            }
        }
    }

    async fn performance_monitor_loop(self: Arc<Self>) {
        let interval = StdDuration::from_secs(self.config.general.timeout_monitor_interval_seconds);
        while self.running.load(Ordering::Acquire) {
            tokio::time::sleep(interval).await;

            let mut completions = Vec::new();
            {
                let mut rx = self.node_events_rx.lock().await;
                while let Ok(event) = rx.try_recv() {
                    completions.push(event);
                }
            }

            let active = self.executions.read().await.len() as u64;
            let mut metrics = self.metrics.write().await;
            metrics.active_executions = active;
            for event in completions {
                metrics
                    .per_node_type
                    .entry(format!("{:?}", event.node_type).to_uppercase())
                    .or_default()
                    .record(event.success, event.elapsed_seconds);
            }
        }
    }
}

/// Outcome of dispatching one node for exactly one attempt (spec §4.4.2,
/// §4.4.5).
enum NodeCompletion {
    Completed(NodeOutcome),
    /// Failed this attempt; may still be retried.
    Retry(String, FailureCause),
    /// Failed in a way retries cannot help (missing agent, cancellation).
    TerminalFailure(String, FailureCause),
}

impl NodeCompletion {
    fn done(outcome: NodeOutcome) -> Self {
        NodeCompletion::Completed(outcome)
    }

    fn retryable_failure(error: String, cause: FailureCause) -> Self {
        NodeCompletion::Retry(error, cause)
    }

    fn terminal_failure(error: String, cause: FailureCause) -> Self {
        NodeCompletion::TerminalFailure(error, cause)
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod engine_tests;
