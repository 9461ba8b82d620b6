//! Concrete effects of repair strategies.
//!
//! Effects land in the node's runtime hints, never in its compiled params,
//! so a later rollback can re-run the node with the repair still applied.

use crate::browser::{dismiss_interstitial, PageState, WaitCheck, WaitCondition};
use crate::graph::{NodeId, Predicate, TaskGraph, TaskNode};
use crate::llm::extract_json_object;
use crate::repair::{FailureType, RepairPlan, RepairStrategy};
use crate::router::Decision;

use super::compute::COMPUTE_OPS;
use super::{ExecutorError, GraphExecutor};

const DOM_EXCERPT_CHARS: usize = 2000;

/// Target to wait for: the active anchor, else something the predicate names.
fn wait_target(node: &TaskNode) -> Option<WaitCheck> {
    if let Some(anchor) = node.active_anchor() {
        return Some(WaitCheck::Element(anchor));
    }
    if let Some(selector) = node.predicate.selectors().into_iter().next() {
        return Some(WaitCheck::Element(selector));
    }
    match &node.predicate {
        Predicate::UrlContains(s) => Some(WaitCheck::UrlContains(s.clone())),
        Predicate::TitleContains(s) => Some(WaitCheck::TitleContains(s.clone())),
        _ => None,
    }
}

/// Pull a selector out of a model reply: `{"selector": ...}` or the first line.
fn parse_selector(reply: &str) -> Option<String> {
    if let Some(obj) = extract_json_object(reply) {
        return obj
            .get("selector")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
    }
    reply
        .lines()
        .map(|line| line.trim().trim_matches(|c| c == '`' || c == '"' || c == '\''))
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// First known op named in a model reply.
fn parse_op(reply: &str) -> Option<&'static str> {
    let lower = reply.to_lowercase();
    lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .find_map(|word| COMPUTE_OPS.iter().copied().find(|op| *op == word))
}

impl GraphExecutor {
    /// Apply the effect of `plan.strategy` to the failing node.
    pub(crate) async fn apply_strategy(
        &self,
        graph: &mut TaskGraph,
        id: &NodeId,
        plan: &RepairPlan,
        page: &PageState,
    ) -> Result<(), ExecutorError> {
        let node = graph.get(id)?.clone();
        let mut hints = node.runtime.hints.clone();

        match plan.strategy {
            RepairStrategy::SwitchAnchor => {
                let anchors = node.anchor_candidates();
                if !anchors.is_empty() {
                    hints.anchor_index += 1;
                    if hints.anchor_index >= anchors.len() {
                        if let Some(anchor) = self.propose_anchor(&node, &anchors, page).await {
                            hints.anchor_override = Some(anchor);
                        }
                    }
                }
            }
            RepairStrategy::WaitForElement => {
                if let Some(check) = wait_target(&node) {
                    let timeout = hints
                        .extra_wait
                        .as_ref()
                        .and_then(|w| w.timeout_ms)
                        .unwrap_or(self.config.wait_timeout_ms)
                        .saturating_mul(2);
                    hints.extra_wait = Some(WaitCondition {
                        check,
                        interval_ms: None,
                        timeout_ms: Some(timeout),
                    });
                }
            }
            RepairStrategy::DismissInterstitial => {
                let mut browser = self.page.acquire().await;
                match dismiss_interstitial(&mut **browser).await {
                    Ok(cleared) => tracing::debug!(node = %id, cleared, "Dismissed interstitial"),
                    Err(e) => tracing::warn!(node = %id, "Interstitial dismissal failed: {}", e),
                }
                hints.dismiss_interstitial = true;
            }
            RepairStrategy::WidenScope => {
                hints.widen_scope = true;
                hints.limit_multiplier = hints.limit_multiplier.max(1).saturating_mul(2);
            }
            RepairStrategy::AdjustExtraction => hints.relaxed_fields = true,
            RepairStrategy::ReflectCompute => {
                if let Some(op) = self.reflect_compute(&node, page).await {
                    hints.compute_override = Some(op.to_string());
                }
            }
            // carried by the rollback itself
            RepairStrategy::Renavigate | RepairStrategy::RollbackToCollect => {}
        }

        if hints != node.runtime.hints {
            tracing::debug!(node = %id, strategy = %plan.strategy, ?hints, "Repair hints updated");
            graph.get_mut(id)?.runtime.hints = hints;
        }
        Ok(())
    }

    async fn propose_anchor(
        &self,
        node: &TaskNode,
        tried: &[String],
        page: &PageState,
    ) -> Option<String> {
        let dom: String = page.dom_summary.chars().take(DOM_EXCERPT_CHARS).collect();
        let prompt = format!(
            "A web automation step could not find its target element.\n\n\
             Step goal: {}\n\
             Selectors already tried: {}\n\
             Page URL: {}\n\
             Page summary:\n{}\n\n\
             Reply with a JSON object {{\"selector\": \"<css selector>\"}} for the element \
             the step should use instead.",
            node.goal,
            tried.join(", "),
            page.url,
            dom,
        );
        let decision = Decision::repair(FailureType::GroundingFail);
        match self.router.ask(&node.id, page, &decision, &prompt).await {
            Ok(Some(completion)) => {
                let selector = parse_selector(&completion.text);
                tracing::info!(node = %node.id, ?selector, "Model proposed anchor");
                selector.filter(|s| !tried.contains(s))
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(node = %node.id, "Anchor proposal failed: {}", e);
                None
            }
        }
    }

    async fn reflect_compute(&self, node: &TaskNode, page: &PageState) -> Option<&'static str> {
        let current = node
            .runtime
            .hints
            .compute_override
            .as_deref()
            .or_else(|| node.param_str("op"))
            .unwrap_or("(none)");
        let error = node
            .runtime
            .last_verification
            .as_ref()
            .and_then(|v| v.diagnostics.handler_error.as_ref())
            .map(|e| e.message.clone())
            .unwrap_or_default();
        let prompt = format!(
            "A computation step of a web task failed.\n\n\
             Goal: {}\n\
             Operation used: {}\n\
             Error: {}\n\
             Available operations: {}\n\n\
             Reply with the single operation name that achieves the goal.",
            node.goal,
            current,
            error,
            COMPUTE_OPS.join(", "),
        );
        let decision = Decision::repair(FailureType::ComputeFail);
        match self.router.ask(&node.id, page, &decision, &prompt).await {
            Ok(Some(completion)) => {
                let op = parse_op(&completion.text).filter(|op| *op != current);
                tracing::info!(node = %node.id, from = current, to = ?op, "Reflected compute op");
                op
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(node = %node.id, "Compute reflection failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeType;
    use serde_json::json;

    #[test]
    fn test_parse_selector() {
        assert_eq!(
            parse_selector("{\"selector\": \"a.product\"}").as_deref(),
            Some("a.product")
        );
        assert_eq!(parse_selector("`button.buy`\nbecause").as_deref(), Some("button.buy"));
        assert_eq!(parse_selector("   "), None);
    }

    #[test]
    fn test_parse_op() {
        assert_eq!(parse_op("Use COUNT here."), Some("count"));
        assert_eq!(parse_op("try the average"), None);
    }

    #[test]
    fn test_wait_target_fallbacks() {
        let act = TaskNode::new("A", NodeType::Act, "buy", Predicate::OutputNotEmpty)
            .with_param("target", json!("#buy"));
        assert_eq!(wait_target(&act), Some(WaitCheck::Element("#buy".to_string())));

        let verify = TaskNode::new(
            "V",
            NodeType::Verify,
            "on search",
            Predicate::parse("URL contains /search"),
        );
        assert_eq!(
            wait_target(&verify),
            Some(WaitCheck::UrlContains("/search".to_string()))
        );
    }
}
