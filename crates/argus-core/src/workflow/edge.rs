//! Edge condition evaluation (spec §4.4.4, component I).
//!
//! The set of recognized condition names is closed: an unrecognized name
//! evaluates to `false` and logs a warning rather than attempting to
//! interpret an arbitrary expression (spec §9 design note).

use std::collections::HashMap;

use tracing::warn;

use crate::workflow::definition::{Edge, EdgeType};
use crate::workflow::node::{FailureCause, NodeOutcome, NodeState, ResultView};

fn mean<I: Iterator<Item = f64>>(values: I) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0usize;
    for v in values {
        sum += v;
        count += 1;
    }
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

/// Evaluates one of the built-in named predicates against the accumulated
/// node results of an execution (spec §4.4.4).
pub fn evaluate_named_condition(name: &str, node_results: &HashMap<String, NodeOutcome>) -> bool {
    let avg_confidence =
        mean(node_results.values().map(|r| r.confidence().unwrap_or(0.5))).unwrap_or(0.5);
    let avg_completeness =
        mean(node_results.values().map(|r| r.completeness().unwrap_or(0.5))).unwrap_or(0.5);

    match name {
        "quality_sufficient" => (avg_confidence + avg_completeness) / 2.0 >= 0.7,
        "quality_insufficient" => (avg_confidence + avg_completeness) / 2.0 < 0.7,
        "high_confidence" => {
            match mean(node_results.values().filter_map(|r| r.confidence())) {
                Some(avg) => avg >= 0.8,
                None => false,
            }
        }
        "low_confidence" => match mean(node_results.values().filter_map(|r| r.confidence())) {
            Some(avg) => avg < 0.8,
            None => true,
        },
        "evidence_sufficient" => {
            let total_evidence: usize = node_results.values().map(|r| r.evidence().len()).sum();
            let max_quality = node_results
                .values()
                .filter_map(|r| r.evidence_quality())
                .fold(f64::MIN, f64::max);
            total_evidence >= 3 && max_quality >= 0.6
        }
        "evidence_insufficient" => {
            let total_evidence: usize = node_results.values().map(|r| r.evidence().len()).sum();
            let max_quality = node_results
                .values()
                .filter_map(|r| r.evidence_quality())
                .fold(f64::MIN, f64::max);
            !(total_evidence >= 3 && max_quality >= 0.6)
        }
        other => {
            warn!(condition = other, "unrecognized edge condition name");
            false
        }
    }
}

/// Decides whether an edge should be traversed (spec §4.4.4).
///
/// `from_state` is the completed state of `edge.from_node`, needed to
/// distinguish `ERROR_HANDLER`/`TIMEOUT` routing from ordinary completion.
pub fn should_traverse(
    edge: &Edge,
    node_results: &HashMap<String, NodeOutcome>,
    from_state: &NodeState,
) -> bool {
    match edge.edge_type {
        EdgeType::Sequential | EdgeType::Parallel => true,
        EdgeType::LoopBack => edge
            .condition
            .as_deref()
            .map(|c| evaluate_named_condition(c, node_results))
            .unwrap_or(false),
        EdgeType::ErrorHandler => {
            from_state.last_error.is_some() && from_state.retry_count_exhausted_failure()
        }
        EdgeType::Timeout => matches!(from_state.last_failure_cause, Some(FailureCause::Timeout)),
        EdgeType::Conditional => edge
            .condition
            .as_deref()
            .map(|c| evaluate_named_condition(c, node_results))
            .unwrap_or(false),
    }
}

/// Evaluates a DECISION/CONDITION node's own `conditions` map (spec
/// §4.4.4): every recognized key must pass for the decision to be true.
pub fn evaluate_decision_conditions(
    conditions: &HashMap<String, f64>,
    node_results: &HashMap<String, NodeOutcome>,
) -> bool {
    if conditions.is_empty() {
        return true;
    }

    let avg_confidence = mean(node_results.values().map(|r| r.confidence().unwrap_or(0.5)));
    let avg_completeness = mean(node_results.values().map(|r| r.completeness().unwrap_or(0.5)));
    let total_sources: usize = node_results.values().map(|r| r.sources().len()).sum();

    for (key, threshold) in conditions {
        let passes = match key.as_str() {
            "min_confidence" => avg_confidence.unwrap_or(0.5) >= *threshold,
            "min_sources" => total_sources as f64 >= *threshold,
            "completeness_threshold" => avg_completeness.unwrap_or(0.5) >= *threshold,
            other => {
                warn!(condition = other, "unrecognized decision condition key");
                false
            }
        };
        if !passes {
            return false;
        }
    }
    true
}

impl NodeState {
    /// True once this node has exhausted its retries and failed terminally
    /// (as opposed to still being mid-retry).
    fn retry_count_exhausted_failure(&self) -> bool {
        matches!(self.status, Some(crate::workflow::node::NodeStatus::Failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::node::TaskOutcome;

    fn task(confidence: f64, completeness: f64) -> NodeOutcome {
        NodeOutcome::Task(TaskOutcome {
            success: true,
            confidence: Some(confidence),
            completeness: Some(completeness),
            ..Default::default()
        })
    }

    #[test]
    fn quality_sufficient_passes_above_threshold() {
        let mut results = HashMap::new();
        results.insert("a".to_string(), task(0.9, 0.9));
        assert!(evaluate_named_condition("quality_sufficient", &results));
        assert!(!evaluate_named_condition("quality_insufficient", &results));
    }

    #[test]
    fn quality_insufficient_when_below_threshold() {
        let mut results = HashMap::new();
        results.insert("a".to_string(), task(0.3, 0.3));
        assert!(!evaluate_named_condition("quality_sufficient", &results));
        assert!(evaluate_named_condition("quality_insufficient", &results));
    }

    #[test]
    fn unknown_condition_is_false() {
        let results = HashMap::new();
        assert!(!evaluate_named_condition("made_up_predicate", &results));
    }

    #[test]
    fn evidence_sufficient_requires_count_and_quality() {
        let mut results = HashMap::new();
        results.insert(
            "a".to_string(),
            NodeOutcome::Task(TaskOutcome {
                success: true,
                evidence: Some(vec!["x".into(), "y".into(), "z".into()]),
                evidence_quality: Some(0.7),
                ..Default::default()
            }),
        );
        assert!(evaluate_named_condition("evidence_sufficient", &results));
    }

    #[test]
    fn decision_conditions_all_must_pass() {
        let mut results = HashMap::new();
        results.insert("a".to_string(), task(0.9, 0.4));
        let mut conditions = HashMap::new();
        conditions.insert("min_confidence".to_string(), 0.8);
        conditions.insert("completeness_threshold".to_string(), 0.8);
        assert!(!evaluate_decision_conditions(&conditions, &results));
    }

    #[test]
    fn empty_conditions_map_passes_trivially() {
        assert!(evaluate_decision_conditions(&HashMap::new(), &HashMap::new()));
    }
}
