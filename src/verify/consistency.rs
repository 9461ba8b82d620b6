//! Structural completeness of produced data.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::executor::{is_empty_value, NodeOutcome};
use crate::graph::{NodeType, TaskNode};

#[derive(Debug, Clone, PartialEq)]
pub struct ConsistencyCheck {
    pub score: f64,
    pub missing_fields: Vec<String>,
}

impl ConsistencyCheck {
    fn complete() -> Self {
        Self {
            score: 1.0,
            missing_fields: Vec::new(),
        }
    }
}

fn present(map: &Map<String, Value>, field: &str) -> bool {
    map.get(field).is_some_and(|v| !is_empty_value(v))
}

/// Required fields for an EXTRACT node: every `fields` entry unless it says
/// `"required": false`.
fn required_extract_fields(node: &TaskNode) -> Vec<String> {
    node.params
        .get("fields")
        .and_then(|v| v.as_array())
        .map(|fields| {
            fields
                .iter()
                .filter(|f| f.get("required").and_then(|r| r.as_bool()).unwrap_or(true))
                .filter_map(|f| f.get("name").and_then(|n| n.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn required_collect_fields(node: &TaskNode) -> Vec<String> {
    node.params
        .get("schema")
        .and_then(|s| s.get("required"))
        .and_then(|r| r.as_array())
        .map(|fields| {
            fields
                .iter()
                .filter_map(|f| f.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn check_collect(node: &TaskNode, output: Option<&Value>) -> ConsistencyCheck {
    let mut required = required_collect_fields(node);
    if required.is_empty() {
        return ConsistencyCheck::complete();
    }

    let items: Vec<&Map<String, Value>> = output
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(|i| i.as_object()).collect())
        .unwrap_or_default();
    if items.is_empty() {
        return ConsistencyCheck {
            score: 0.0,
            missing_fields: required,
        };
    }

    if node.runtime.hints.relaxed_fields {
        let seen: BTreeSet<&str> = items
            .iter()
            .flat_map(|item| item.iter())
            .filter(|(_, v)| !is_empty_value(v))
            .map(|(k, _)| k.as_str())
            .collect();
        required.retain(|f| seen.contains(f.as_str()));
        if required.is_empty() {
            return ConsistencyCheck::complete();
        }
    }

    let total = items.len() * required.len();
    let mut found = 0;
    let mut missing = BTreeSet::new();
    for item in &items {
        for field in &required {
            if present(item, field) {
                found += 1;
            } else {
                missing.insert(field.clone());
            }
        }
    }
    ConsistencyCheck {
        score: found as f64 / total as f64,
        missing_fields: missing.into_iter().collect(),
    }
}

fn check_extract(node: &TaskNode, output: Option<&Value>) -> ConsistencyCheck {
    let mut required = required_extract_fields(node);
    let empty = Map::new();
    let fields = output.and_then(|v| v.as_object()).unwrap_or(&empty);

    if node.runtime.hints.relaxed_fields {
        required.retain(|f| present(fields, f));
    }
    if required.is_empty() {
        return ConsistencyCheck::complete();
    }

    let missing: Vec<String> = required
        .iter()
        .filter(|f| !present(fields, f))
        .cloned()
        .collect();
    ConsistencyCheck {
        score: (required.len() - missing.len()) as f64 / required.len() as f64,
        missing_fields: missing,
    }
}

/// Score produced data against the node's declared shape.
pub fn evaluate(node: &TaskNode, outcome: &NodeOutcome) -> ConsistencyCheck {
    match node.node_type {
        NodeType::Collect => check_collect(node, outcome.output.as_ref()),
        NodeType::Extract => check_extract(node, outcome.output.as_ref()),
        NodeType::Compute => {
            let ok = outcome.error.is_none() && outcome.has_output();
            ConsistencyCheck {
                score: if ok { 1.0 } else { 0.0 },
                missing_fields: Vec::new(),
            }
        }
        _ => ConsistencyCheck::complete(),
    }
}
