//! Serialized graph format produced by the compiler.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::node::{NodeType, TaskNode};
use super::predicate::Predicate;

fn default_idempotent() -> bool {
    true
}

/// A node as it appears in the graph document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub goal: String,
    pub predicate: Predicate,
    #[serde(default = "default_idempotent")]
    pub idempotent: bool,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl NodeSpec {
    pub fn into_node(self) -> TaskNode {
        let mut node = TaskNode::new(self.id, self.node_type, self.goal, self.predicate);
        node.idempotent = self.idempotent;
        node.params = self.params;
        node
    }
}

/// Node template used by ITERATE bodies and inline BRANCH arms.
///
/// Same shape as `NodeSpec` without an id; ids are allocated at splice time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTemplate {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub goal: String,
    pub predicate: Predicate,
    #[serde(default = "default_idempotent")]
    pub idempotent: bool,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl NodeTemplate {
    /// Instantiate with a fresh id, substituting `{item}` / `{item.<key>}` in string params.
    pub fn instantiate(&self, id: String, item: Option<&Value>) -> TaskNode {
        let mut params = self.params.clone();
        if let Some(item) = item {
            for value in params.values_mut() {
                substitute_item(value, item);
            }
            params.insert("item".to_string(), item.clone());
        }
        let goal = match item {
            Some(item) => substitute_text(&self.goal, item),
            None => self.goal.clone(),
        };
        let mut node = TaskNode::new(id, self.node_type, goal, self.predicate.clone());
        node.idempotent = self.idempotent;
        node.params = params;
        node
    }
}

fn item_text(item: &Value, key: Option<&str>) -> String {
    let target = match key {
        Some(key) => item.get(key).unwrap_or(&Value::Null),
        None => item,
    };
    match target {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Object(map) => ["href", "url", "text"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| target.to_string()),
        other => other.to_string(),
    }
}

fn substitute_text(text: &str, item: &Value) -> String {
    if !text.contains("{item") {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{item") {
        out.push_str(&rest[..start]);
        let after = &rest[start..];
        match after.find('}') {
            Some(end) => {
                let inner = &after[1..end];
                let key = inner.strip_prefix("item.").filter(|k| !k.is_empty());
                if inner == "item" || key.is_some() {
                    out.push_str(&item_text(item, key));
                } else {
                    out.push_str(&after[..=end]);
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(after);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn substitute_item(value: &mut Value, item: &Value) {
    match value {
        Value::String(s) => *s = substitute_text(s, item),
        Value::Array(items) => items.iter_mut().for_each(|v| substitute_item(v, item)),
        Value::Object(map) => map.values_mut().for_each(|v| substitute_item(v, item)),
        _ => {}
    }
}

/// The graph document: `{task_id, nodes, edges, metadata}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSpec {
    #[serde(default)]
    pub task_id: Option<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<(String, String)>,
    #[serde(default)]
    pub metadata: Value,
}
