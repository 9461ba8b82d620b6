use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::{NodeId, NodeStatus, NodeType, TaskGraph};
use crate::repair::{Checkpoint, RollbackRecord};
use crate::router::RouterStats;
use crate::verify::VerificationResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AbortReason {
    /// `max_steps` or `max_cost_usd` exhausted
    BudgetExceeded,
    /// Escalated PLAN_FAIL with no COLLECT ancestor left
    NoRollbackTarget { node: NodeId },
    Cancelled,
    /// Pending nodes remain but none can become ready
    Stalled { pending: Vec<NodeId> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    Completed,
    Aborted { reason: AbortReason },
    /// A rollback would repeat a committed side effect. Resolve the listed
    /// nodes with `TaskGraph::resolve_manual` and execute again to resume.
    ManualInterventionRequired {
        node: NodeId,
        blocking: NodeId,
        awaiting: Vec<NodeId>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub attempts: u32,
    pub needs_manual: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spliced_from: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: String,
    pub outcome: TaskOutcome,
    pub steps: usize,
    pub nodes: Vec<NodeReport>,
    pub router: RouterStats,
    pub rollbacks: Vec<RollbackRecord>,
    pub checkpoints: Vec<Checkpoint>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    pub fn is_completed(&self) -> bool {
        self.outcome == TaskOutcome::Completed
    }

    pub fn node(&self, id: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.id.as_str() == id)
    }
}

pub(crate) fn node_reports(graph: &TaskGraph) -> Vec<NodeReport> {
    graph
        .nodes()
        .map(|n| NodeReport {
            id: n.id.clone(),
            node_type: n.node_type,
            status: n.status(),
            attempts: n.attempts(),
            needs_manual: n.runtime.needs_manual,
            output: n.runtime.output.clone(),
            verification: n.runtime.last_verification.clone(),
            spliced_from: n.runtime.spliced_from.clone(),
        })
        .collect()
}
