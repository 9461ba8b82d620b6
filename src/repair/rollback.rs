//! Rollback scope computation and application.
//!
//! Depth 0 retries the failing node alone, depth 1 also re-runs its nearest
//! parent, and depth 2 (PLAN_FAIL) rewinds to a COLLECT ancestor. Each
//! further escalation of the same node reaches one COLLECT ancestor higher.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::browser::PageState;
use crate::graph::{GraphError, ManualDecision, NodeId, NodeType, TaskGraph};

use super::{FailureType, RepairPlan};

/// Checkpoints kept for reporting; older ones are dropped first.
pub const MAX_CHECKPOINTS: usize = 10;

#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("No COLLECT ancestor left to roll back to from '{node}'")]
    NoRollbackTarget { node: NodeId },

    #[error("Rolling back '{node}' to '{target}' would re-execute committed side effect of '{blocking}'")]
    IrreversibleSideEffect {
        node: NodeId,
        target: NodeId,
        blocking: NodeId,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub failing: NodeId,
    pub target: NodeId,
    /// Nodes returned to PENDING with their cached output discarded
    pub reset: Vec<NodeId>,
    pub depth: u8,
    /// Committed side effects excluded from the reset and flagged NEEDS_MANUAL
    pub needs_manual: Vec<NodeId>,
    /// The failing node's escalation level is raised after the reset
    pub escalates: bool,
}

/// One applied rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub step: usize,
    pub failing: NodeId,
    pub failure: FailureType,
    pub strategy: String,
    pub target: NodeId,
    pub reset: Vec<NodeId>,
    pub removed: Vec<NodeId>,
    pub depth: u8,
    pub needs_manual: Vec<NodeId>,
}

/// Page state at a node's success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub node: NodeId,
    pub step: usize,
    pub url: String,
    pub fingerprint: String,
}

#[derive(Debug, Default)]
pub struct RollbackManager {
    history: Vec<RollbackRecord>,
    checkpoints: VecDeque<Checkpoint>,
}

impl RollbackManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// `rollback(node, depth) -> RollbackPlan`, without touching the graph.
    pub fn plan(
        &self,
        graph: &TaskGraph,
        failing: &NodeId,
        depth: u8,
    ) -> Result<RollbackPlan, RollbackError> {
        let node = graph.get(failing)?;

        let target = match depth {
            0 => failing.clone(),
            1 => graph
                .dependencies(failing)
                .into_iter()
                .min_by_key(|d| graph.topo_rank(d))
                .unwrap_or_else(|| failing.clone()),
            _ => {
                let level = node.runtime.escalation_level as usize;
                graph
                    .ancestors_by_distance(failing)
                    .into_iter()
                    .filter(|(id, _)| {
                        graph
                            .node(id)
                            .is_some_and(|n| n.node_type == NodeType::Collect)
                    })
                    .nth(level)
                    .map(|(id, _)| id)
                    .ok_or_else(|| RollbackError::NoRollbackTarget {
                        node: failing.clone(),
                    })?
            }
        };

        let path = if &target == failing {
            vec![failing.clone()]
        } else {
            graph.path_between(&target, failing)
        };

        let mut reset = Vec::new();
        let mut needs_manual = Vec::new();
        for id in path {
            let Some(candidate) = graph.node(&id) else {
                continue;
            };
            if &id != failing && candidate.is_committed_side_effect() {
                if candidate.runtime.manual_decision == Some(ManualDecision::KeepCommitted) {
                    continue;
                }
                if depth >= 2 {
                    return Err(RollbackError::IrreversibleSideEffect {
                        node: failing.clone(),
                        target,
                        blocking: id,
                    });
                }
                needs_manual.push(id);
                continue;
            }
            reset.push(id);
        }

        Ok(RollbackPlan {
            failing: failing.clone(),
            target,
            reset,
            depth,
            needs_manual,
            escalates: depth >= 2,
        })
    }

    /// Apply `plan` to the graph and record it.
    ///
    /// Returns the ids of spliced nodes removed because their ITERATE or
    /// BRANCH origin was reset.
    pub fn apply(
        &mut self,
        graph: &mut TaskGraph,
        plan: &RollbackPlan,
        repair: &RepairPlan,
        step: usize,
    ) -> Result<Vec<NodeId>, RollbackError> {
        for id in &plan.needs_manual {
            let node = graph.get_mut(id)?;
            node.runtime.needs_manual = true;
            tracing::warn!(node = %id, "Committed side effect needs a manual decision");
        }

        let mut origins = Vec::new();
        for id in &plan.reset {
            let node = graph.get_mut(id)?;
            if id == &plan.failing {
                node.begin_repair()?;
                node.requeue()?;
                node.runtime.output = None;
                if plan.escalates {
                    node.runtime.attempts = 0;
                    node.runtime.escalation_level += 1;
                }
            } else {
                node.reset_for_retry();
                node.runtime.manual_decision = None;
            }
            if matches!(node.node_type, NodeType::Iterate | NodeType::Branch) {
                origins.push(id.clone());
            }
        }

        let mut removed = Vec::new();
        for origin in origins {
            if graph.contains(&origin) {
                removed.extend(graph.unsplice(&origin));
            }
        }

        tracing::info!(
            node = %plan.failing,
            target = %plan.target,
            depth = plan.depth,
            reset = plan.reset.len(),
            removed = removed.len(),
            "Applied rollback"
        );

        self.history.push(RollbackRecord {
            step,
            failing: plan.failing.clone(),
            failure: repair.failure,
            strategy: repair.strategy.name().to_string(),
            target: plan.target.clone(),
            reset: plan.reset.clone(),
            removed: removed.clone(),
            depth: plan.depth,
            needs_manual: plan.needs_manual.clone(),
        });
        Ok(removed)
    }

    pub fn record_checkpoint(&mut self, node: &NodeId, step: usize, page: &PageState) {
        if self.checkpoints.len() == MAX_CHECKPOINTS {
            self.checkpoints.pop_front();
        }
        self.checkpoints.push_back(Checkpoint {
            node: node.clone(),
            step,
            url: page.url.clone(),
            fingerprint: page.fingerprint(),
        });
    }

    pub fn history(&self) -> &[RollbackRecord] {
        &self.history
    }

    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.checkpoints.iter().cloned().collect()
    }
}
