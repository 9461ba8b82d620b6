//! Model-backed semantic judgment.

use std::sync::LazyLock;

use regex::Regex;

use crate::browser::PageState;
use crate::executor::NodeOutcome;
use crate::graph::TaskNode;
use crate::llm::extract_json_object;

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").expect("number pattern literal"));

const DOM_EXCERPT_CHARS: usize = 1500;
const OUTPUT_EXCERPT_CHARS: usize = 1000;

fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut)
}

pub fn build_prompt(node: &TaskNode, outcome: &NodeOutcome, page: &PageState) -> String {
    let output = outcome
        .output
        .as_ref()
        .map(|v| excerpt(&v.to_string(), OUTPUT_EXCERPT_CHARS))
        .unwrap_or_else(|| "(none)".to_string());
    let error = outcome
        .error
        .as_ref()
        .map(|e| e.message.as_str())
        .unwrap_or("(none)");

    format!(
        "Judge whether a step of an automated web task achieved its goal.\n\n\
         Step type: {}\n\
         Goal: {}\n\
         Expected: {}\n\n\
         Page URL: {}\n\
         Page title: {}\n\
         Page summary:\n{}\n\n\
         Step output: {}\n\
         Step error: {}\n\n\
         Reply with a JSON object {{\"score\": <0.0-1.0>, \"rationale\": \"<one sentence>\"}}.",
        node.node_type,
        node.goal,
        node.predicate,
        page.url,
        page.title,
        excerpt(&page.dom_summary, DOM_EXCERPT_CHARS),
        output,
        error,
    )
}

/// Parse a judgment reply into `(score, rationale)`.
///
/// Accepts a JSON object with `score` (or a boolean `passed`), then a bare
/// number (percentages are scaled down), then a yes/no answer.
pub fn parse_judgment(text: &str) -> (f64, String) {
    if let Some(obj) = extract_json_object(text) {
        let rationale = obj
            .get("rationale")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if let Some(score) = obj.get("score").and_then(|v| v.as_f64()) {
            return (normalize(score), rationale);
        }
        if let Some(passed) = obj.get("passed").and_then(|v| v.as_bool()) {
            return (if passed { 1.0 } else { 0.0 }, rationale);
        }
    }

    let trimmed = text.trim();
    if let Some(m) = NUMBER.find(trimmed) {
        if let Ok(score) = m.as_str().parse::<f64>() {
            return (normalize(score), trimmed.to_string());
        }
    }

    let lower = trimmed.to_lowercase();
    if lower.starts_with("yes") {
        return (0.8, trimmed.to_string());
    }
    if lower.starts_with("no") {
        return (0.2, trimmed.to_string());
    }

    tracing::warn!(reply = %excerpt(trimmed, 200), "Unparseable soft-check reply");
    (0.0, trimmed.to_string())
}

fn normalize(score: f64) -> f64 {
    let score = if score > 1.0 { score / 100.0 } else { score };
    score.clamp(0.0, 1.0)
}
