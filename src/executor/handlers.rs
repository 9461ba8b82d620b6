//! Node-type handlers.
//!
//! Page-bound handlers run entirely under the page lock: the action, any
//! `WAIT_UNTIL` polls, the stability wait, the element counts the predicate
//! needs, and the final snapshot. COMPUTE and ITERATE never touch the page.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::browser::{
    dismiss_interstitial, wait_for_stable, wait_until, Action, BrowserEnv, BrowserError, PageState,
    WaitCondition,
};
use crate::graph::{NodeId, NodeTemplate, NodeType, TaskGraph, TaskNode};
use crate::verify::VerificationResult;

use super::compute::{apply_op, Condition};
use super::{GraphExecutor, HandlerError, NodeOutcome};

const DEFAULT_MAX_ITERATIONS: u64 = 10;

/// Cached outputs of a node's completed ancestors, nearest first.
#[derive(Debug, Clone, Default)]
pub(crate) struct Upstream {
    entries: Vec<(NodeId, NodeType, Value)>,
}

impl Upstream {
    pub(crate) fn collect(graph: &TaskGraph, id: &NodeId) -> Self {
        let entries = graph
            .ancestors_by_distance(id)
            .into_iter()
            .filter_map(|(ancestor, _)| {
                let node = graph.node(&ancestor)?;
                let output = node.output()?.clone();
                Some((ancestor, node.node_type, output))
            })
            .collect();
        Self { entries }
    }

    pub(crate) fn get(&self, id: &NodeId) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(node, _, _)| node == id)
            .map(|(_, _, value)| value)
    }

    fn nearest(&self) -> Option<&Value> {
        self.entries.first().map(|(_, _, value)| value)
    }

    fn nearest_of(&self, node_type: NodeType) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(_, t, _)| *t == node_type)
            .map(|(_, _, value)| value)
    }
}

/// Subgraph changes an ITERATE or BRANCH requests once it passes.
#[derive(Debug, Default)]
pub(crate) struct Expansion {
    pub chains: Vec<Vec<TaskNode>>,
    pub skip: Vec<NodeId>,
}

impl Expansion {
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty() && self.skip.is_empty()
    }
}

/// Everything one node execution produced.
pub(crate) struct NodeRun {
    pub id: NodeId,
    pub outcome: NodeOutcome,
    /// Snapshot taken before the page was released
    pub page: Option<PageState>,
    pub verification: VerificationResult,
    pub expansion: Expansion,
    /// An ACT whose action is expected to change the page
    pub state_change: bool,
}

#[derive(Default)]
struct PageRun {
    outcome: NodeOutcome,
    page: Option<PageState>,
    expansion: Expansion,
    state_change: bool,
}

fn param_error(node: &TaskNode, what: &str) -> HandlerError {
    HandlerError::invalid_params(format!("{} node '{}' {}", node.node_type, node.id, what))
}

impl GraphExecutor {
    pub(crate) async fn run_node(
        &self,
        node: TaskNode,
        upstream: Upstream,
        last_page: PageState,
        cancel: CancellationToken,
    ) -> NodeRun {
        tracing::info!(node = %node.id, node_type = %node.node_type, attempt = node.attempts(), "Running node");

        let run = match node.node_type {
            NodeType::Compute => PageRun {
                outcome: run_compute(&node, &upstream),
                ..PageRun::default()
            },
            NodeType::Iterate => {
                let mut run = PageRun::default();
                match expand_iterate(&node, &upstream) {
                    Ok((output, chains)) => {
                        run.outcome = NodeOutcome::with_output(output);
                        run.expansion.chains = chains;
                    }
                    Err(e) => run.outcome = NodeOutcome::failed(e),
                }
                run
            }
            _ => {
                let mut browser = self.page.acquire().await;
                self.run_page_node(&mut **browser, &node, &upstream, &cancel)
                    .await
            }
        };

        let page = run.page.clone().unwrap_or(last_page);
        let verification = self.verifier.verify(&node, &run.outcome, &page).await;

        NodeRun {
            id: node.id,
            outcome: run.outcome,
            page: run.page,
            verification,
            expansion: run.expansion,
            state_change: run.state_change,
        }
    }

    fn wait_timing(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.config.wait_interval_ms),
            Duration::from_millis(self.config.wait_timeout_ms),
        )
    }

    async fn run_page_node(
        &self,
        browser: &mut dyn BrowserEnv,
        node: &TaskNode,
        upstream: &Upstream,
        cancel: &CancellationToken,
    ) -> PageRun {
        let mut run = PageRun::default();
        let (interval, timeout) = self.wait_timing();

        let mut waits = Vec::new();
        if node.node_type.supports_wait() {
            if let Some(condition) = node.params.get("wait_until").and_then(WaitCondition::from_param) {
                waits.push(condition);
            }
        }
        if let Some(condition) = &node.runtime.hints.extra_wait {
            waits.push(condition.clone());
        }
        // readers wait for their target before reading it
        let waits_first = matches!(
            node.node_type,
            NodeType::Collect | NodeType::Extract | NodeType::Branch
        );

        if node.runtime.hints.dismiss_interstitial && node.node_type != NodeType::Navigate {
            dismiss(browser, node).await;
        }
        if waits_first {
            for condition in &waits {
                let result = wait_until(browser, condition, interval, timeout, cancel).await;
                run.outcome.absorb_wait(result.map(|_| ()));
            }
        }

        let result = match node.node_type {
            NodeType::Navigate => navigate(browser, node).await,
            NodeType::Collect => collect(browser, node).await,
            NodeType::Extract => extract(browser, node).await,
            NodeType::Act => match act(browser, node).await {
                Ok((output, action)) => {
                    run.state_change = action.changes_state();
                    Ok(Some(output))
                }
                Err(e) => Err(e),
            },
            NodeType::Verify => Ok(None),
            NodeType::Branch => branch(browser, node, upstream, &mut run.expansion).await,
            NodeType::Compute | NodeType::Iterate => Err(param_error(node, "does not use the page")),
        };
        match result {
            Ok(output) => run.outcome.output = output,
            Err(e) => run.outcome.error = Some(e),
        }

        if node.node_type == NodeType::Navigate && node.runtime.hints.dismiss_interstitial {
            dismiss(browser, node).await;
        }
        if !waits_first && run.outcome.error.is_none() {
            for condition in &waits {
                let result = wait_until(browser, condition, interval, timeout, cancel).await;
                run.outcome.absorb_wait(result.map(|_| ()));
            }
        }
        if matches!(node.node_type, NodeType::Navigate | NodeType::Act) {
            let settled = wait_for_stable(browser, interval, timeout, cancel).await;
            run.outcome.absorb_wait(settled.map(|_| ()));
        }

        let mut counts = BTreeMap::new();
        for selector in node.predicate.selectors() {
            match browser.query(&selector).await {
                Ok(found) => {
                    counts.insert(selector, found.len());
                }
                Err(BrowserError::ElementNotFound(_)) => {
                    counts.insert(selector, 0);
                }
                Err(e) => tracing::debug!(node = %node.id, %selector, "Element count failed: {}", e),
            }
        }
        run.outcome.element_counts = counts;

        match browser.snapshot().await {
            Ok(page) => {
                if run.outcome.error.is_none() {
                    match node.node_type {
                        NodeType::Navigate => run.outcome.output = Some(json!({"url": page.url})),
                        NodeType::Verify => {
                            run.outcome.output = Some(json!({"url": page.url, "title": page.title}))
                        }
                        _ => {}
                    }
                }
                run.page = Some(page);
            }
            Err(e) => {
                tracing::warn!(node = %node.id, "Snapshot failed: {}", e);
                run.outcome.error.get_or_insert(e.into());
            }
        }
        run
    }
}

async fn dismiss(browser: &mut dyn BrowserEnv, node: &TaskNode) {
    match dismiss_interstitial(browser).await {
        Ok(cleared) => tracing::debug!(node = %node.id, cleared, "Interstitial dismissal"),
        Err(e) => tracing::warn!(node = %node.id, "Interstitial dismissal failed: {}", e),
    }
}

async fn navigate(
    browser: &mut dyn BrowserEnv,
    node: &TaskNode,
) -> Result<Option<Value>, HandlerError> {
    let url = node
        .param_str("url")
        .ok_or_else(|| param_error(node, "needs a 'url'"))?;
    if let Err(e) = url::Url::parse(url) {
        return Err(param_error(node, &format!("has an invalid url '{}': {}", url, e)));
    }
    browser.navigate(url).await?;
    Ok(None)
}

fn scoped(node: &TaskNode, selector: &str) -> String {
    match node.param_str("scope") {
        Some(scope) if !node.runtime.hints.widen_scope => format!("{} {}", scope, selector),
        _ => selector.to_string(),
    }
}

async fn collect(
    browser: &mut dyn BrowserEnv,
    node: &TaskNode,
) -> Result<Option<Value>, HandlerError> {
    let selector = node
        .active_anchor()
        .ok_or_else(|| param_error(node, "needs a 'selector'"))?;
    let found = browser.query(&scoped(node, &selector)).await?;

    let mut items: Vec<Value> = found.iter().map(|e| e.to_item()).collect();
    if let Some(limit) = node.param_u64("limit") {
        let multiplier = u64::from(node.runtime.hints.limit_multiplier.max(1));
        items.truncate(limit.saturating_mul(multiplier) as usize);
    }
    tracing::debug!(node = %node.id, %selector, items = items.len(), "Collected items");
    Ok(Some(Value::Array(items)))
}

async fn extract(
    browser: &mut dyn BrowserEnv,
    node: &TaskNode,
) -> Result<Option<Value>, HandlerError> {
    let Some(fields) = node.params.get("fields").and_then(|v| v.as_array()) else {
        let selector = node
            .active_anchor()
            .or_else(|| node.param_str("selector").map(str::to_string))
            .unwrap_or_else(|| "body".to_string());
        let found = browser.query(&scoped(node, &selector)).await?;
        return Ok(found.first_text().map(|text| json!({"content": text})));
    };

    let mut record = serde_json::Map::new();
    for field in fields {
        let (Some(name), Some(selector)) = (
            field.get("name").and_then(|v| v.as_str()),
            field.get("selector").and_then(|v| v.as_str()),
        ) else {
            return Err(param_error(node, "has a field without 'name' and 'selector'"));
        };
        match browser.query(&scoped(node, selector)).await {
            Ok(found) => {
                if let Some(text) = found.first_text() {
                    record.insert(name.to_string(), Value::String(text.trim().to_string()));
                }
            }
            Err(BrowserError::ElementNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(Value::Object(record)))
}

async fn act(
    browser: &mut dyn BrowserEnv,
    node: &TaskNode,
) -> Result<(Value, Action), HandlerError> {
    let name = node
        .param_str("action")
        .ok_or_else(|| param_error(node, "needs an 'action'"))?;
    let action = Action::parse(name)
        .ok_or_else(|| param_error(node, &format!("has unknown action '{}'", name)))?;
    let target = match node.active_anchor() {
        Some(target) => target,
        None if matches!(action, Action::Press | Action::Scroll) => "body".to_string(),
        None => return Err(param_error(node, "needs a 'target'")),
    };
    let value = node.param_str("value").or_else(|| node.param_str("text"));

    browser.act(action, &target, value).await?;
    Ok((json!({"action": action.as_str(), "target": target}), action))
}

async fn branch(
    browser: &mut dyn BrowserEnv,
    node: &TaskNode,
    upstream: &Upstream,
    expansion: &mut Expansion,
) -> Result<Option<Value>, HandlerError> {
    let condition = node
        .params
        .get("condition")
        .ok_or_else(|| param_error(node, "needs a 'condition'"))
        .and_then(|c| Condition::from_value(c).map_err(|e| param_error(node, &e)))?;

    let page = browser.snapshot().await?;
    let taken = condition
        .evaluate(&page, |id| upstream.get(id))
        .map_err(|e| param_error(node, &e))?;
    let (taken_arm, other_arm) = if taken { ("then", "else") } else { ("else", "then") };

    let arm = |name: &str| -> Vec<Value> {
        node.params
            .get(name)
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
    };

    let mut chain = Vec::new();
    for entry in arm(taken_arm) {
        if entry.is_object() {
            let template: NodeTemplate = serde_json::from_value(entry)
                .map_err(|e| param_error(node, &format!("has an invalid '{}' template: {}", taken_arm, e)))?;
            let id = format!("{}#{}.{}", node.id, taken_arm, chain.len());
            chain.push(template.instantiate(id, None));
        }
    }
    if !chain.is_empty() {
        expansion.chains.push(chain);
    }
    expansion.skip = arm(other_arm)
        .iter()
        .filter_map(|entry| entry.as_str())
        .map(NodeId::from)
        .collect();

    tracing::info!(node = %node.id, taken = taken_arm, "Branch condition evaluated");
    Ok(Some(json!({"taken": taken_arm})))
}

fn run_compute(node: &TaskNode, upstream: &Upstream) -> NodeOutcome {
    let op = match node
        .runtime
        .hints
        .compute_override
        .as_deref()
        .or_else(|| node.param_str("op"))
    {
        Some(op) => op,
        None => return NodeOutcome::failed(param_error(node, "needs an 'op'")),
    };

    let input = match node.param_str("input") {
        Some(id) => upstream.get(&NodeId::from(id)),
        None => upstream.nearest(),
    };
    let Some(input) = input else {
        return NodeOutcome::failed(HandlerError::compute(format!(
            "no upstream output available for '{}'",
            op
        )));
    };

    match apply_op(op, input, node.param_str("field")) {
        Ok(value) => {
            tracing::debug!(node = %node.id, op, "Computed value");
            NodeOutcome::with_output(value)
        }
        Err(e) => NodeOutcome::failed(HandlerError::compute(e)),
    }
}

/// Build one chain per iterated item from the `body` templates.
fn expand_iterate(
    node: &TaskNode,
    upstream: &Upstream,
) -> Result<(Value, Vec<Vec<TaskNode>>), HandlerError> {
    let collection = match node.param_str("over") {
        Some(id) => upstream.get(&NodeId::from(id)),
        None => upstream.nearest_of(NodeType::Collect),
    }
    .ok_or_else(|| param_error(node, "has no collected items to iterate"))?;
    let items = collection
        .as_array()
        .ok_or_else(|| param_error(node, "can only iterate over an array"))?;

    let body: Vec<NodeTemplate> = node
        .params
        .get("body")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| param_error(node, &format!("has an invalid 'body': {}", e)))?
        .unwrap_or_default();
    if body.is_empty() {
        return Err(param_error(node, "needs a non-empty 'body'"));
    }

    let max = node
        .param_u64("max_iterations")
        .unwrap_or(DEFAULT_MAX_ITERATIONS) as usize;
    let chains: Vec<Vec<TaskNode>> = items
        .iter()
        .take(max)
        .enumerate()
        .map(|(i, item)| {
            body.iter()
                .enumerate()
                .map(|(k, template)| template.instantiate(format!("{}#{}.{}", node.id, i, k), Some(item)))
                .collect()
        })
        .collect();

    tracing::info!(node = %node.id, items = items.len(), iterations = chains.len(), "Expanding iteration");
    Ok((json!({"iterations": chains.len()}), chains))
}
