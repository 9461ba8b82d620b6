//! Dual verification of step outcomes.
//!
//! Three independent signals are combined into one confidence:
//! - **hard**: deterministic match of the outcome against the node predicate
//! - **soft**: a model-backed judgment of the goal, routed by tier
//! - **consistency**: completeness of produced data against the node schema
//!
//! A hard score of exactly 0 fails the step whatever the other two say.

mod consistency;
mod hard;
mod soft;

pub use consistency::ConsistencyCheck;
pub use hard::{HardCheck, HardMiss};
pub use soft::parse_judgment;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::browser::PageState;
use crate::config::Config;
use crate::executor::{HandlerError, NodeOutcome};
use crate::graph::TaskNode;
use crate::router::{CostAwareRouter, Decision, ModelTier};

/// What failed and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub hard_misses: Vec<HardMiss>,
    pub soft_tier: ModelTier,
    pub soft_rationale: String,
    pub missing_fields: Vec<String>,
    pub empty_output: bool,
    pub handler_error: Option<HandlerError>,
    pub timed_out: bool,
    /// Recent state-changing actions left the page unchanged
    pub no_progress: bool,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            hard_misses: Vec::new(),
            soft_tier: ModelTier::NoLlm,
            soft_rationale: String::new(),
            missing_fields: Vec::new(),
            empty_output: true,
            handler_error: None,
            timed_out: false,
            no_progress: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub hard_score: f64,
    pub soft_score: f64,
    pub consistency_score: f64,
    pub confidence: f64,
    pub passed: bool,
    pub diagnostics: Diagnostics,
}

impl VerificationResult {
    /// A failing verdict for an outcome that never reached the checks.
    pub fn rejected(error: HandlerError) -> Self {
        Self {
            hard_score: 0.0,
            soft_score: 0.0,
            consistency_score: 0.0,
            confidence: 0.0,
            passed: false,
            diagnostics: Diagnostics {
                hard_misses: vec![HardMiss::Handler { kind: error.kind }],
                handler_error: Some(error),
                ..Diagnostics::default()
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights {
    pub hard: f64,
    pub soft: f64,
    pub consistency: f64,
}

pub struct DualVerifier {
    weights: Weights,
    threshold: f64,
    router: Arc<CostAwareRouter>,
}

impl DualVerifier {
    /// `config` is assumed validated; weights are taken as given.
    pub fn new(config: &Config, router: Arc<CostAwareRouter>) -> Self {
        Self {
            weights: Weights {
                hard: config.hard_weight,
                soft: config.soft_weight,
                consistency: config.consistency_weight,
            },
            threshold: config.confidence_threshold,
            router,
        }
    }

    pub fn weights(&self) -> Weights {
        self.weights
    }

    /// `verify(node, outcome, page_state) -> VerificationResult`
    pub async fn verify(
        &self,
        node: &TaskNode,
        outcome: &NodeOutcome,
        page: &PageState,
    ) -> VerificationResult {
        let hard = hard::evaluate(&node.predicate, outcome, page);
        let consistency = consistency::evaluate(node, outcome);
        let (soft_score, soft_tier, soft_rationale) = self.soft_check(node, outcome, page, &hard).await;

        let (confidence, passed) = combine(
            &self.weights,
            self.threshold,
            hard.score,
            soft_score,
            consistency.score,
        );

        tracing::info!(
            node = %node.id,
            hard = hard.score,
            soft = soft_score,
            consistency = consistency.score,
            confidence,
            passed,
            "Verification verdict"
        );

        VerificationResult {
            hard_score: hard.score,
            soft_score,
            consistency_score: consistency.score,
            confidence,
            passed,
            diagnostics: Diagnostics {
                hard_misses: hard.misses,
                soft_tier,
                soft_rationale,
                missing_fields: consistency.missing_fields,
                empty_output: !outcome.has_output(),
                handler_error: outcome.error.clone(),
                timed_out: outcome.timed_out,
                no_progress: false,
            },
        }
    }

    async fn soft_check(
        &self,
        node: &TaskNode,
        outcome: &NodeOutcome,
        page: &PageState,
        hard: &HardCheck,
    ) -> (f64, ModelTier, String) {
        let decision = if node.predicate.is_structural() && hard.score >= 1.0 {
            Decision::deterministic()
        } else {
            Decision::semantic()
        };

        let tier = self.router.route(&node.id, page, &decision);
        if tier == ModelTier::NoLlm {
            return (hard.score, tier, "deterministic".to_string());
        }

        let prompt = soft::build_prompt(node, outcome, page);
        match self.router.complete(&node.id, tier, &prompt).await {
            Ok(completion) => {
                let (score, rationale) = parse_judgment(&completion.text);
                (score, tier, rationale)
            }
            Err(e) => (0.0, tier, format!("soft check unavailable: {}", e)),
        }
    }
}

/// `confidence = w_hard*hard + w_soft*soft + w_consistency*consistency`;
/// passes iff `confidence >= threshold` and `hard > 0`.
pub fn combine(
    weights: &Weights,
    threshold: f64,
    hard: f64,
    soft: f64,
    consistency: f64,
) -> (f64, bool) {
    let confidence = weights.hard * hard + weights.soft * soft + weights.consistency * consistency;
    let passed = confidence >= threshold && hard > 0.0;
    (confidence, passed)
}
