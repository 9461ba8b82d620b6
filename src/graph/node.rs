//! Task node type with explicit lifecycle transitions.
//!
//! # Invariants
//! - `id` is unique within a `TaskGraph`
//! - `attempts <= max_repair_per_node` (enforced by the executor)
//! - status only moves along the edges of the state machine below; the one
//!   exception is `reset_for_retry`, which a rollback uses to re-queue a node

use std::fmt;

use serde::{Deserialize, Serialize};

use super::predicate::Predicate;
use super::GraphError;
use crate::browser::WaitCondition;
use crate::verify::VerificationResult;

/// Identifier of a node inside a task graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The fixed step vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Navigate,
    Collect,
    Extract,
    Compute,
    Act,
    Verify,
    Iterate,
    Branch,
}

impl NodeType {
    /// Whether executing this node reads or mutates the live page.
    ///
    /// Only page-free nodes may run alongside the node holding the page lock.
    pub fn touches_page(&self) -> bool {
        !matches!(self, NodeType::Compute | NodeType::Iterate)
    }

    /// Whether `WAIT_UNTIL` is available to this node type.
    pub fn supports_wait(&self) -> bool {
        matches!(self, NodeType::Navigate | NodeType::Act | NodeType::Verify)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::Navigate => "NAVIGATE",
            NodeType::Collect => "COLLECT",
            NodeType::Extract => "EXTRACT",
            NodeType::Compute => "COMPUTE",
            NodeType::Act => "ACT",
            NodeType::Verify => "VERIFY",
            NodeType::Iterate => "ITERATE",
            NodeType::Branch => "BRANCH",
        };
        f.write_str(name)
    }
}

/// Status of a node in its lifecycle.
///
/// # State Machine
/// ```text
/// Pending -> Running -> Success
///                   \-> Failed -> Repairing -> Pending
///        \-> Skipped
/// (any non-terminal) -> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Failed,
    Repairing,
    Skipped,
    Aborted,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Success | NodeStatus::Skipped | NodeStatus::Aborted
        )
    }

    /// A dependency in this status no longer blocks its successors.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, NodeStatus::Success | NodeStatus::Skipped)
    }
}

/// Caller decision for a node flagged as needing manual intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualDecision {
    /// The side effect may be repeated; later rollbacks may re-run the node.
    AllowReexecution,
    /// Keep the committed effect; rollbacks treat the node as fixed.
    KeepCommitted,
}

/// Repair adjustments applied to a node between attempts.
///
/// These live beside the compiled parameters and never overwrite them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepairHints {
    /// Index into the node's anchor candidates (`target`/`selector` then `alt_selectors`)
    pub anchor_index: usize,
    /// Anchor proposed by a model when the candidates ran out
    pub anchor_override: Option<String>,
    /// Extra wait inserted before verification
    pub extra_wait: Option<WaitCondition>,
    /// Dismiss interstitials before acting
    pub dismiss_interstitial: bool,
    /// Ignore the extraction `scope` selector
    pub widen_scope: bool,
    /// Multiplier applied to `limit`
    pub limit_multiplier: u32,
    /// Treat fields as required only when they were actually seen
    pub relaxed_fields: bool,
    /// Replacement COMPUTE operation
    pub compute_override: Option<String>,
}

/// Mutable per-node execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRuntime {
    pub status: NodeStatus,
    pub attempts: u32,
    pub output: Option<serde_json::Value>,
    pub last_verification: Option<VerificationResult>,
    pub needs_manual: bool,
    pub manual_decision: Option<ManualDecision>,
    /// Number of PLAN_FAIL rollbacks this node has already triggered
    pub escalation_level: u32,
    pub hints: RepairHints,
    /// ITERATE/BRANCH node that spliced this node in
    pub spliced_from: Option<NodeId>,
    /// BRANCH node whose untaken arm skipped this node
    pub skipped_by: Option<NodeId>,
}

impl Default for NodeRuntime {
    fn default() -> Self {
        Self {
            status: NodeStatus::Pending,
            attempts: 0,
            output: None,
            last_verification: None,
            needs_manual: false,
            manual_decision: None,
            escalation_level: 0,
            hints: RepairHints::default(),
            spliced_from: None,
            skipped_by: None,
        }
    }
}

/// A typed step of a task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub goal: String,
    pub predicate: Predicate,
    pub idempotent: bool,
    pub params: serde_json::Map<String, serde_json::Value>,
    #[serde(skip)]
    pub runtime: NodeRuntime,
}

impl TaskNode {
    pub fn new(id: impl Into<NodeId>, node_type: NodeType, goal: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            id: id.into(),
            node_type,
            goal: goal.into(),
            predicate,
            idempotent: true,
            params: serde_json::Map::new(),
            runtime: NodeRuntime::default(),
        }
    }

    pub fn with_param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    pub fn status(&self) -> NodeStatus {
        self.runtime.status
    }

    pub fn attempts(&self) -> u32 {
        self.runtime.attempts
    }

    pub fn output(&self) -> Option<&serde_json::Value> {
        self.runtime.output.as_ref()
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(|v| v.as_u64())
    }

    pub fn param_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(|v| v.as_bool())
    }

    /// Anchor candidates in preference order: primary target, then `alt_selectors`.
    pub fn anchor_candidates(&self) -> Vec<String> {
        let mut anchors = Vec::new();
        let primary = match self.node_type {
            NodeType::Collect => self.param_str("selector"),
            _ => self.param_str("target"),
        };
        if let Some(primary) = primary {
            anchors.push(primary.to_string());
        }
        if let Some(alts) = self.params.get("alt_selectors").and_then(|v| v.as_array()) {
            anchors.extend(alts.iter().filter_map(|v| v.as_str()).map(str::to_string));
        }
        anchors
    }

    /// The anchor currently in effect after repairs.
    pub fn active_anchor(&self) -> Option<String> {
        if let Some(anchor) = &self.runtime.hints.anchor_override {
            return Some(anchor.clone());
        }
        let anchors = self.anchor_candidates();
        if anchors.is_empty() {
            return None;
        }
        let index = self.runtime.hints.anchor_index.min(anchors.len() - 1);
        Some(anchors[index].clone())
    }

    /// Whether a rollback crossing this node would repeat a committed side effect.
    pub fn is_committed_side_effect(&self) -> bool {
        !self.idempotent
            && self.runtime.status == NodeStatus::Success
            && self.runtime.manual_decision != Some(ManualDecision::AllowReexecution)
    }

    // State transitions - explicit and validated

    fn transition(&mut self, allowed: &[NodeStatus], to: NodeStatus) -> Result<(), GraphError> {
        if allowed.contains(&self.runtime.status) {
            self.runtime.status = to;
            Ok(())
        } else {
            Err(GraphError::InvalidTransition {
                node: self.id.clone(),
                from: self.runtime.status,
                to,
            })
        }
    }

    /// Pending -> Running
    pub fn start(&mut self) -> Result<(), GraphError> {
        self.transition(&[NodeStatus::Pending], NodeStatus::Running)
    }

    /// Running -> Success, caching the produced output.
    pub fn succeed(&mut self, output: Option<serde_json::Value>) -> Result<(), GraphError> {
        self.transition(&[NodeStatus::Running], NodeStatus::Success)?;
        self.runtime.output = output;
        Ok(())
    }

    /// Running -> Failed
    pub fn fail(&mut self) -> Result<(), GraphError> {
        self.transition(&[NodeStatus::Running], NodeStatus::Failed)
    }

    /// Failed -> Repairing
    pub fn begin_repair(&mut self) -> Result<(), GraphError> {
        self.transition(&[NodeStatus::Failed], NodeStatus::Repairing)
    }

    /// Repairing -> Pending
    pub fn requeue(&mut self) -> Result<(), GraphError> {
        self.transition(&[NodeStatus::Repairing], NodeStatus::Pending)
    }

    /// Pending -> Skipped
    pub fn skip(&mut self, by: &NodeId) -> Result<(), GraphError> {
        self.transition(&[NodeStatus::Pending], NodeStatus::Skipped)?;
        self.runtime.skipped_by = Some(by.clone());
        Ok(())
    }

    /// Any non-terminal status -> Aborted
    pub fn abort(&mut self) {
        if !self.runtime.status.is_terminal() {
            self.runtime.status = NodeStatus::Aborted;
        }
    }

    /// Rollback reset: back to Pending with the cached output discarded.
    pub fn reset_for_retry(&mut self) {
        self.runtime.status = NodeStatus::Pending;
        self.runtime.output = None;
        self.runtime.last_verification = None;
    }
}
