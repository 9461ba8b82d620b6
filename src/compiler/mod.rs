//! Natural-language task to [`TaskGraph`].
//!
//! The LLM-backed compiler asks the large model for a graph document and
//! validates it like any loaded graph. When generation fails it falls back to
//! a two-node template: open the first URL in the text, then extract the page
//! body.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use thiserror::Error;

use crate::graph::{GraphError, GraphSpec, NodeId, TaskGraph};
use crate::llm::{extract_json_object, LlmError};
use crate::router::{CostAwareRouter, ModelTier};

static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>)\]]+"#).expect("url pattern literal"));

/// Router accounting key for compiler calls.
const COMPILER_NODE: &str = "compiler";

const GRAPH_PROMPT: &str = r#"Compile the web task below into a JSON task graph.

Schema:
{"task_id": "...",
 "nodes": [{"id": "N1", "type": "NAVIGATE|COLLECT|EXTRACT|COMPUTE|ACT|VERIFY|ITERATE|BRANCH",
            "goal": "...", "predicate": "...", "idempotent": true, "params": {}}],
 "edges": [["N1", "N2"]]}

Predicates use: "URL contains <s>", "title contains <s>", "element <selector> present",
"at least <n> <selector>", "output not empty", joined with " and ".
Mark every step that submits, buys, posts or deletes with "idempotent": false.

Reply with the JSON object only.

Task:
"#;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Task text is empty")]
    EmptyTask,

    #[error("No URL found in task text and model generation failed: {0}")]
    NoFallback(String),

    #[error("Model reply contained no JSON object")]
    NoJson,

    #[error("Model reply is not a graph document: {0}")]
    Schema(#[from] serde_json::Error),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Produces the graph the executor consumes.
#[async_trait]
pub trait GraphCompiler: Send + Sync {
    async fn compile(&self, text: &str) -> Result<TaskGraph, CompileError>;
}

pub struct LlmGraphCompiler {
    router: Arc<CostAwareRouter>,
}

impl LlmGraphCompiler {
    pub fn new(router: Arc<CostAwareRouter>) -> Self {
        Self { router }
    }

    async fn generate(&self, text: &str) -> Result<TaskGraph, CompileError> {
        let prompt = format!("{GRAPH_PROMPT}{text}");
        let completion = self
            .router
            .complete(&NodeId::from(COMPILER_NODE), ModelTier::Large, &prompt)
            .await?;
        let doc = extract_json_object(&completion.text).ok_or(CompileError::NoJson)?;
        let spec: GraphSpec = serde_json::from_value(doc)?;
        Ok(TaskGraph::from_spec(spec)?)
    }
}

#[async_trait]
impl GraphCompiler for LlmGraphCompiler {
    async fn compile(&self, text: &str) -> Result<TaskGraph, CompileError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CompileError::EmptyTask);
        }

        match self.generate(text).await {
            Ok(graph) => {
                tracing::info!(task_id = graph.task_id(), nodes = graph.len(), "Compiled task graph");
                Ok(graph)
            }
            Err(e) => {
                tracing::warn!("Graph generation failed, using fallback template: {}", e);
                fallback_graph(text).ok_or_else(|| CompileError::NoFallback(e.to_string()))
            }
        }
    }
}

/// NAVIGATE to the first URL in `text`, then EXTRACT the page body.
pub fn fallback_graph(text: &str) -> Option<TaskGraph> {
    let url = URL
        .find(text)?
        .as_str()
        .trim_end_matches(['.', ',', ';', ':']);
    let doc = json!({
        "nodes": [
            {"id": "N1", "type": "NAVIGATE", "goal": format!("open {url}"),
             "predicate": "output not empty", "params": {"url": url}},
            {"id": "N2", "type": "EXTRACT", "goal": text, "predicate": "output not empty",
             "params": {"fields": [{"name": "content", "selector": "body"}]}}
        ],
        "edges": [["N1", "N2"]],
        "metadata": {"fallback": true}
    });
    let spec: GraphSpec = serde_json::from_value(doc).ok()?;
    TaskGraph::from_spec(spec).ok()
}
