//! Pure evaluation for COMPUTE ops and BRANCH conditions.

use regex::Regex;
use serde_json::{json, Value};

use crate::browser::PageState;
use crate::graph::NodeId;

use super::is_empty_value;

pub const COMPUTE_OPS: &[&str] = &["count", "sum", "min", "max", "avg", "concat", "first", "last"];

/// Project `value` onto `field` when given: arrays map element-wise.
fn project(value: &Value, field: Option<&str>) -> Vec<Value> {
    let items: Vec<Value> = match value {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    };
    match field {
        Some(field) => items
            .iter()
            .filter_map(|item| item.get(field).cloned())
            .collect(),
        None => items,
    }
}

/// Read a number out of a value: `"$1,299.00"` -> 1299.0.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            cleaned.parse().ok()
        }
        Value::Object(map) => map.get("text").and_then(as_number),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("text")
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

/// Apply `op` to `input`.
pub fn apply_op(op: &str, input: &Value, field: Option<&str>) -> Result<Value, String> {
    let values = project(input, field);

    let numbers = || -> Result<Vec<f64>, String> {
        let numbers: Vec<f64> = values.iter().filter_map(as_number).collect();
        if numbers.is_empty() {
            Err(format!("'{}' found no numeric values", op))
        } else {
            Ok(numbers)
        }
    };

    match op.trim().to_ascii_lowercase().as_str() {
        "count" => Ok(json!(values.len())),
        "sum" => Ok(json!(numbers()?.iter().sum::<f64>())),
        "min" => Ok(json!(numbers()?.into_iter().fold(f64::INFINITY, f64::min))),
        "max" => Ok(json!(numbers()?.into_iter().fold(f64::NEG_INFINITY, f64::max))),
        "avg" => {
            let numbers = numbers()?;
            Ok(json!(numbers.iter().sum::<f64>() / numbers.len() as f64))
        }
        "concat" => Ok(json!(values.iter().map(as_text).collect::<Vec<_>>().join(", "))),
        "first" => values.first().cloned().ok_or_else(|| "'first' of empty input".to_string()),
        "last" => values.last().cloned().ok_or_else(|| "'last' of empty input".to_string()),
        other => Err(format!("unknown compute op '{}'", other)),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConditionField {
    Url,
    Title,
    Dom,
    Output(NodeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOp {
    Contains,
    Equals,
    Matches,
    NotEmpty,
    Empty,
}

/// BRANCH condition over the page or an upstream output.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: ConditionField,
    pub op: ConditionOp,
    pub value: String,
}

impl Condition {
    /// Accepts `{"field", "op", "value"}` or the string form `<field> <op> [value]`.
    pub fn from_value(value: &Value) -> Result<Condition, String> {
        let (field, op, operand) = match value {
            Value::String(text) => {
                let mut parts = text.trim().splitn(3, char::is_whitespace);
                let field = parts.next().unwrap_or_default().to_string();
                let op = parts.next().unwrap_or_default().to_string();
                let operand = parts.next().unwrap_or_default().trim().to_string();
                (field, op, operand)
            }
            Value::Object(map) => {
                let get = |key: &str| {
                    map.get(key)
                        .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                        .unwrap_or_default()
                };
                (get("field"), get("op"), get("value"))
            }
            _ => return Err("condition must be a string or an object".to_string()),
        };

        let field = match field.to_ascii_lowercase().as_str() {
            "url" => ConditionField::Url,
            "title" => ConditionField::Title,
            "dom" => ConditionField::Dom,
            other => match field.strip_prefix("output:") {
                Some(node) if !node.is_empty() => ConditionField::Output(NodeId::from(node)),
                _ => return Err(format!("unknown condition field '{}'", other)),
            },
        };
        let op = match op.to_ascii_lowercase().as_str() {
            "contains" => ConditionOp::Contains,
            "equals" | "==" => ConditionOp::Equals,
            "matches" => ConditionOp::Matches,
            "not_empty" => ConditionOp::NotEmpty,
            "empty" => ConditionOp::Empty,
            other => return Err(format!("unknown condition op '{}'", other)),
        };
        if op == ConditionOp::Matches {
            Regex::new(&operand).map_err(|e| format!("bad condition pattern: {}", e))?;
        }

        Ok(Condition {
            field,
            op,
            value: operand,
        })
    }

    /// `output` resolves `output:<node>` fields.
    pub fn evaluate<'a>(
        &self,
        page: &PageState,
        output: impl Fn(&NodeId) -> Option<&'a Value>,
    ) -> Result<bool, String> {
        let (subject, empty) = match &self.field {
            ConditionField::Url => (page.url.clone(), page.url.trim().is_empty()),
            ConditionField::Title => (page.title.clone(), page.title.trim().is_empty()),
            ConditionField::Dom => (page.dom_summary.clone(), page.dom_summary.trim().is_empty()),
            ConditionField::Output(node) => match output(node) {
                Some(value) => (as_text(value), is_empty_value(value)),
                None => (String::new(), true),
            },
        };

        Ok(match self.op {
            ConditionOp::Contains => subject
                .to_lowercase()
                .contains(&self.value.to_lowercase()),
            ConditionOp::Equals => subject.trim() == self.value.trim(),
            ConditionOp::Matches => Regex::new(&self.value)
                .map_err(|e| format!("bad condition pattern: {}", e))?
                .is_match(&subject),
            ConditionOp::NotEmpty => !empty,
            ConditionOp::Empty => empty,
        })
    }
}
