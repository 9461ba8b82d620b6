use crate::browser::PageState;
use crate::executor::HandlerErrorKind;
use crate::graph::{NodeType, TaskNode};
use crate::verify::VerificationResult;

use super::FailureType;

/// Whether the node expects an interstitial to be on the page.
fn anticipates_interstitial(node: &TaskNode) -> bool {
    node.param_bool("expect_interstitial").unwrap_or(false) || node.predicate.mentions_interstitial()
}

/// `classify(node, verification, page_state) -> FailureType`
///
/// First match wins:
/// 1. attempts already at `max_repair_per_node` -> PLAN_FAIL
/// 2. hard miss on a target element, URL or wait deadline -> GROUNDING_FAIL
/// 3. unanticipated interstitial on the page -> STATE_FAIL
/// 4. state-changing actions made no progress -> STATE_FAIL
/// 5. COLLECT/EXTRACT with empty or incomplete output -> EXTRACTION_FAIL
/// 6. COMPUTE whose handler raised -> COMPUTE_FAIL
/// 7. anything else -> PLAN_FAIL
pub fn classify(
    node: &TaskNode,
    verification: &VerificationResult,
    page: &PageState,
    max_repair_per_node: u32,
) -> FailureType {
    let diagnostics = &verification.diagnostics;

    if node.attempts() >= max_repair_per_node {
        return FailureType::PlanFail;
    }

    let element_missing = diagnostics
        .handler_error
        .as_ref()
        .is_some_and(|e| e.kind == HandlerErrorKind::ElementNotFound);
    if element_missing || diagnostics.hard_misses.iter().any(|m| m.is_grounding()) {
        return FailureType::GroundingFail;
    }

    if node.node_type.touches_page() && !anticipates_interstitial(node) {
        if let Some(kind) = page.interstitial() {
            tracing::debug!(node = %node.id, interstitial = kind, "Unexpected interstitial");
            return FailureType::StateFail;
        }
    }

    if diagnostics.no_progress {
        return FailureType::StateFail;
    }

    match node.node_type {
        NodeType::Collect | NodeType::Extract
            if diagnostics.empty_output || verification.consistency_score < 1.0 =>
        {
            FailureType::ExtractionFail
        }
        NodeType::Compute if diagnostics.handler_error.is_some() => FailureType::ComputeFail,
        _ => FailureType::PlanFail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::HandlerError;
    use crate::graph::Predicate;
    use crate::verify::{Diagnostics, HardMiss};
    use serde_json::json;

    fn failing(diagnostics: Diagnostics) -> VerificationResult {
        VerificationResult {
            hard_score: 0.0,
            soft_score: 0.0,
            consistency_score: 1.0,
            confidence: 0.0,
            passed: false,
            diagnostics,
        }
    }

    fn page(dom: &str) -> PageState {
        PageState {
            url: "https://x.test/".to_string(),
            title: "Shop".to_string(),
            dom_summary: dom.to_string(),
        }
    }

    fn url_miss() -> Diagnostics {
        Diagnostics {
            hard_misses: vec![HardMiss::Url {
                expected: "/search".to_string(),
                actual: "https://x.test/".to_string(),
            }],
            ..Diagnostics::default()
        }
    }

    fn node(node_type: NodeType) -> TaskNode {
        TaskNode::new("n", node_type, "goal", Predicate::OutputNotEmpty)
    }

    #[test]
    fn test_exhausted_attempts_escalate_first() {
        let mut n = node(NodeType::Verify);
        n.runtime.attempts = 3;
        assert_eq!(classify(&n, &failing(url_miss()), &page(""), 3), FailureType::PlanFail);
        n.runtime.attempts = 2;
        assert_eq!(
            classify(&n, &failing(url_miss()), &page(""), 3),
            FailureType::GroundingFail
        );
    }

    #[test]
    fn test_element_not_found_is_grounding() {
        let diagnostics = Diagnostics {
            handler_error: Some(HandlerError::new(HandlerErrorKind::ElementNotFound, "#buy")),
            ..Diagnostics::default()
        };
        assert_eq!(
            classify(&node(NodeType::Act), &failing(diagnostics), &page(""), 3),
            FailureType::GroundingFail
        );
    }

    #[test]
    fn test_interstitial_is_state_fail_unless_expected() {
        let v = failing(Diagnostics::default());
        let modal = page("<div class=\"modal\">Subscribe!</div>");
        assert_eq!(classify(&node(NodeType::Act), &v, &modal, 3), FailureType::StateFail);

        let expecting = node(NodeType::Act).with_param("expect_interstitial", json!(true));
        assert_eq!(classify(&expecting, &v, &modal, 3), FailureType::PlanFail);

        // page-free nodes never blame the page
        assert_eq!(classify(&node(NodeType::Compute), &v, &modal, 3), FailureType::PlanFail);
    }

    #[test]
    fn test_no_progress_is_state_fail() {
        let v = failing(Diagnostics {
            no_progress: true,
            ..Diagnostics::default()
        });
        assert_eq!(classify(&node(NodeType::Act), &v, &page(""), 3), FailureType::StateFail);
    }

    #[test]
    fn test_extraction_and_compute() {
        let empty = failing(Diagnostics::default());
        assert_eq!(
            classify(&node(NodeType::Collect), &empty, &page(""), 3),
            FailureType::ExtractionFail
        );

        let compute_error = failing(Diagnostics {
            empty_output: true,
            handler_error: Some(HandlerError::compute("no numeric values")),
            ..Diagnostics::default()
        });
        assert_eq!(
            classify(&node(NodeType::Compute), &compute_error, &page(""), 3),
            FailureType::ComputeFail
        );
    }

    #[test]
    fn test_classification_is_deterministic() {
        let n = node(NodeType::Extract);
        let v = failing(Diagnostics {
            empty_output: false,
            missing_fields: vec!["price".to_string()],
            ..Diagnostics::default()
        });
        let mut v = v;
        v.consistency_score = 0.5;
        let first = classify(&n, &v, &page(""), 3);
        for _ in 0..5 {
            assert_eq!(classify(&n, &v, &page(""), 3), first);
        }
        assert_eq!(first, FailureType::ExtractionFail);
    }
}
