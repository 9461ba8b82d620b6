//! Cost-aware model routing.
//!
//! Every model-backed decision point (soft verification, anchor repair,
//! compute reflection, graph compilation) asks the router which tier should
//! answer. The router owns the per-node failure counters that drive
//! escalation and the running call and cost totals.

mod pricing;

pub use pricing::{cost_nanos, nanos_to_usd, pricing_for_model, ModelPricing, NANOS_PER_USD};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::browser::PageState;
use crate::config::Config;
use crate::graph::NodeId;
use crate::llm::{Completion, LlmError, ModelBackend, TokenUsage};
use crate::repair::FailureType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelTier {
    NoLlm,
    Small,
    Large,
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ModelTier::NoLlm => "NO_LLM",
            ModelTier::Small => "SMALL",
            ModelTier::Large => "LARGE",
        })
    }
}

/// What is being decided at a routing point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Deterministic rules alone settle the answer
    pub deterministic: bool,
    /// Failure kind being repaired, if any
    pub failure: Option<FailureType>,
}

impl Decision {
    /// A judgment that needs a model.
    pub fn semantic() -> Self {
        Self {
            deterministic: false,
            failure: None,
        }
    }

    /// A judgment already settled by deterministic checks.
    pub fn deterministic() -> Self {
        Self {
            deterministic: true,
            failure: None,
        }
    }

    /// A repair choice for the given failure kind.
    pub fn repair(failure: FailureType) -> Self {
        Self {
            deterministic: false,
            failure: Some(failure),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct NodeRouting {
    consecutive_failures: u32,
    tier: ModelTier,
}

impl Default for NodeRouting {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            tier: ModelTier::Small,
        }
    }
}

/// Router-owned mutable state.
#[derive(Debug, Default)]
pub struct RouterState {
    nodes: HashMap<NodeId, NodeRouting>,
    no_llm_decisions: u64,
    small_calls: u64,
    large_calls: u64,
    failed_calls: u64,
    usage: TokenUsage,
    cost_nanos: u64,
    calls_by_node: BTreeMap<String, u64>,
    escalations: u64,
}

/// Serializable snapshot of router totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterStats {
    pub total_calls: u64,
    pub no_llm_decisions: u64,
    pub small_model_calls: u64,
    pub large_model_calls: u64,
    pub failed_calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_cost_usd: f64,
    pub escalations: u64,
    pub calls_by_node: BTreeMap<String, u64>,
}

pub struct CostAwareRouter {
    upgrade_after_failures: u32,
    dom_complexity_threshold: f64,
    backend: ModelBackend,
    state: Mutex<RouterState>,
}

impl CostAwareRouter {
    pub fn new(config: &Config, backend: ModelBackend) -> Self {
        Self {
            upgrade_after_failures: config.upgrade_after_failures,
            dom_complexity_threshold: config.dom_complexity_threshold,
            backend,
            state: Mutex::new(RouterState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, RouterState> {
        // counters stay usable even if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Choose the tier for one decision point of `node` on `page`.
    ///
    /// - `NO_LLM` when the decision is deterministic and the node has no failures
    /// - `LARGE` once consecutive failures reach `upgrade_after_failures`, for
    ///   PLAN_FAIL repairs, and for as long as the node stays escalated
    /// - `LARGE` when the page is more complex than `dom_complexity_threshold`
    /// - `SMALL` otherwise
    pub fn route(&self, node: &NodeId, page: &PageState, decision: &Decision) -> ModelTier {
        let mut state = self.state();
        let entry = state.nodes.entry(node.clone()).or_default();
        let failures = entry.consecutive_failures;

        let escalate = failures >= self.upgrade_after_failures
            || decision.failure == Some(FailureType::PlanFail)
            || entry.tier == ModelTier::Large;

        let tier = if decision.deterministic && failures == 0 {
            ModelTier::NoLlm
        } else if escalate {
            ModelTier::Large
        } else if page.complexity() > self.dom_complexity_threshold {
            tracing::debug!(node = %node, url = %page.url, "Complex page routed to LARGE");
            ModelTier::Large
        } else {
            ModelTier::Small
        };

        if tier != ModelTier::NoLlm && escalate && entry.tier != ModelTier::Large {
            entry.tier = ModelTier::Large;
            state.escalations += 1;
            tracing::info!(node = %node, failures, "Router escalated node to LARGE");
        }
        if tier == ModelTier::NoLlm {
            state.no_llm_decisions += 1;
        }
        tracing::debug!(node = %node, %tier, failures, "Routing decision");
        tier
    }

    /// Pin `node` to LARGE until it succeeds or is abandoned by a rollback.
    pub fn escalate(&self, node: &NodeId) {
        let mut state = self.state();
        let entry = state.nodes.entry(node.clone()).or_default();
        if entry.tier != ModelTier::Large {
            entry.tier = ModelTier::Large;
            state.escalations += 1;
            tracing::info!(node = %node, "Router escalated node to LARGE after PLAN_FAIL");
        }
    }

    /// Call the model for `tier` on behalf of `node` and account for the call.
    pub async fn complete(
        &self,
        node: &NodeId,
        tier: ModelTier,
        prompt: &str,
    ) -> Result<Completion, LlmError> {
        let result = self.backend.complete(prompt, tier).await;

        let mut state = self.state();
        match &result {
            Ok(completion) => {
                match tier {
                    ModelTier::Small => state.small_calls += 1,
                    ModelTier::Large => state.large_calls += 1,
                    ModelTier::NoLlm => {}
                }
                state.usage = state.usage.add(&completion.usage);
                state.cost_nanos = state
                    .cost_nanos
                    .saturating_add(cost_nanos(&completion.model, &completion.usage));
                *state.calls_by_node.entry(node.to_string()).or_default() += 1;
            }
            Err(e) => {
                state.failed_calls += 1;
                tracing::warn!(node = %node, %tier, "Model call failed: {}", e);
            }
        }
        result
    }

    /// Route, then call the model unless the decision needs none.
    pub async fn ask(
        &self,
        node: &NodeId,
        page: &PageState,
        decision: &Decision,
        prompt: &str,
    ) -> Result<Option<Completion>, LlmError> {
        match self.route(node, page, decision) {
            ModelTier::NoLlm => Ok(None),
            tier => self.complete(node, tier, prompt).await.map(Some),
        }
    }

    pub fn record_failure(&self, node: &NodeId) -> u32 {
        let mut state = self.state();
        let entry = state.nodes.entry(node.clone()).or_default();
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.consecutive_failures
    }

    /// The node succeeded: its counter and tier reset.
    pub fn record_success(&self, node: &NodeId) {
        self.state().nodes.remove(node);
    }

    /// The node was abandoned by a rollback: same reset as a success.
    pub fn abandon(&self, node: &NodeId) {
        if self.state().nodes.remove(node).is_some() {
            tracing::debug!(node = %node, "Router state reset by rollback");
        }
    }

    pub fn consecutive_failures(&self, node: &NodeId) -> u32 {
        self.state()
            .nodes
            .get(node)
            .map_or(0, |n| n.consecutive_failures)
    }

    pub fn total_cost_usd(&self) -> f64 {
        nanos_to_usd(self.state().cost_nanos)
    }

    pub fn stats(&self) -> RouterStats {
        let state = self.state();
        RouterStats {
            total_calls: state.small_calls + state.large_calls,
            no_llm_decisions: state.no_llm_decisions,
            small_model_calls: state.small_calls,
            large_model_calls: state.large_calls,
            failed_calls: state.failed_calls,
            prompt_tokens: state.usage.prompt_tokens,
            completion_tokens: state.usage.completion_tokens,
            total_cost_usd: nanos_to_usd(state.cost_nanos),
            escalations: state.escalations,
            calls_by_node: state.calls_by_node.clone(),
        }
    }
}
