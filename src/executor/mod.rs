//! Graph executor: the top-level control loop.
//!
//! Each iteration takes the ready set in schedule order, runs at most one
//! page-bound node alongside any ready page-free nodes, verifies every
//! outcome, and either advances the graph or hands the failure to the
//! classify -> plan -> rollback pipeline.
//!
//! # Termination
//! - every node terminal: `Completed`
//! - `max_steps` or `max_cost_usd` exhausted: `Aborted(BudgetExceeded)`
//! - escalated PLAN_FAIL with no COLLECT ancestor left: `Aborted(NoRollbackTarget)`
//! - a rollback would repeat a committed side effect: `ManualInterventionRequired`

mod compute;
mod context;
mod handlers;
mod outcome;
mod progress;
mod repairs;
mod result;

pub use compute::{apply_op, Condition, ConditionField, ConditionOp, COMPUTE_OPS};
pub use context::ExecutionContext;
pub use outcome::{is_empty_value, HandlerError, HandlerErrorKind, NodeOutcome};
pub use progress::ProgressTracker;
pub use result::{AbortReason, ExecutionResult, NodeReport, TaskOutcome};

use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;

use crate::browser::{BrowserEnv, PageLock};
use crate::config::Config;
use crate::graph::{GraphError, NodeId, TaskGraph};
use crate::repair::{classify, plan, FailureType, RollbackError, RollbackManager};
use crate::router::CostAwareRouter;
use crate::verify::DualVerifier;

use handlers::{Expansion, NodeRun, Upstream};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Rollback error: {0}")]
    Rollback(#[from] RollbackError),
}

pub struct GraphExecutor {
    config: Config,
    page: PageLock,
    router: Arc<CostAwareRouter>,
    verifier: DualVerifier,
    rollback: RollbackManager,
}

impl GraphExecutor {
    pub fn new(config: Config, browser: Box<dyn BrowserEnv>, router: Arc<CostAwareRouter>) -> Self {
        let verifier = DualVerifier::new(&config, Arc::clone(&router));
        Self {
            config,
            page: PageLock::new(browser),
            router,
            verifier,
            rollback: RollbackManager::new(),
        }
    }

    pub fn router(&self) -> &CostAwareRouter {
        &self.router
    }

    pub fn rollback_manager(&self) -> &RollbackManager {
        &self.rollback
    }

    /// `execute(graph, context) -> ExecutionResult`
    ///
    /// May be called again on the same graph after a
    /// `ManualInterventionRequired` outcome has been resolved.
    ///
    /// # Errors
    /// Only on internal graph inconsistencies; node failures are absorbed
    /// by the repair loop and reported through the outcome.
    pub async fn execute(
        &mut self,
        graph: &mut TaskGraph,
        ctx: &mut ExecutionContext,
    ) -> Result<ExecutionResult, ExecutorError> {
        tracing::info!(
            task_id = %graph.task_id(),
            nodes = graph.len(),
            max_steps = ctx.max_steps,
            "Starting graph execution"
        );

        let outcome = self.run_loop(graph, ctx).await?;

        if let TaskOutcome::Aborted { reason } = &outcome {
            tracing::warn!(task_id = %graph.task_id(), ?reason, "Aborting task");
            ctx.cancel();
            let ids: Vec<NodeId> = graph.nodes().map(|n| n.id.clone()).collect();
            for id in ids {
                graph.get_mut(&id)?.abort();
            }
        }

        let result = ExecutionResult {
            task_id: graph.task_id().to_string(),
            outcome,
            steps: ctx.steps,
            nodes: result::node_reports(graph),
            router: self.router.stats(),
            rollbacks: self.rollback.history().to_vec(),
            checkpoints: self.rollback.checkpoints(),
            started_at: ctx.started_at(),
            elapsed_ms: ctx.elapsed_ms(),
        };
        tracing::info!(
            task_id = %result.task_id,
            outcome = ?result.outcome,
            steps = result.steps,
            cost_usd = result.router.total_cost_usd,
            "Graph execution finished"
        );
        Ok(result)
    }

    async fn run_loop(
        &mut self,
        graph: &mut TaskGraph,
        ctx: &mut ExecutionContext,
    ) -> Result<TaskOutcome, ExecutorError> {
        loop {
            if ctx.is_cancelled() {
                return Ok(TaskOutcome::Aborted {
                    reason: AbortReason::Cancelled,
                });
            }
            if graph.is_exhausted() {
                return Ok(TaskOutcome::Completed);
            }

            let ready = graph.ready_nodes();
            if ready.is_empty() {
                let pending = graph
                    .nodes()
                    .filter(|n| !n.status().is_terminal())
                    .map(|n| n.id.clone())
                    .collect();
                return Ok(TaskOutcome::Aborted {
                    reason: AbortReason::Stalled { pending },
                });
            }

            if ctx.steps_exhausted() {
                tracing::warn!(steps = ctx.steps, max_steps = ctx.max_steps, "Step budget exhausted");
                return Ok(TaskOutcome::Aborted {
                    reason: AbortReason::BudgetExceeded,
                });
            }
            if let Some(cap) = self.config.max_cost_usd {
                let spent = self.router.total_cost_usd();
                if spent >= cap {
                    tracing::warn!(spent, cap, "Model cost budget exhausted");
                    return Ok(TaskOutcome::Aborted {
                        reason: AbortReason::BudgetExceeded,
                    });
                }
            }

            let wave = self.build_wave(graph, &ready, ctx.max_steps - ctx.steps);
            let mut jobs = Vec::with_capacity(wave.len());
            for id in &wave {
                let node = graph.get_mut(id)?;
                node.start()?;
                let node = node.clone();
                jobs.push((node, Upstream::collect(graph, id)));
            }
            ctx.steps += wave.len();

            let last_page = ctx.page.clone();
            let cancel = ctx.cancellation_token();
            let runs = join_all(jobs.into_iter().map(|(node, upstream)| {
                self.run_node(node, upstream, last_page.clone(), cancel.clone())
            }))
            .await;

            // every run of the wave is applied so none is left RUNNING
            let mut stop = None;
            for run in runs {
                let outcome = self.apply_run(graph, ctx, run).await?;
                if stop.is_none() {
                    stop = outcome;
                }
            }
            if let Some(outcome) = stop {
                return Ok(outcome);
            }
        }
    }

    /// The first ready node plus every other ready node that never touches
    /// the page, so at most one page-bound node runs at a time.
    fn build_wave(&self, graph: &TaskGraph, ready: &[NodeId], budget: usize) -> Vec<NodeId> {
        let mut wave = Vec::new();
        for (i, id) in ready.iter().enumerate() {
            if wave.len() >= budget {
                break;
            }
            let page_free = graph
                .node(id)
                .is_some_and(|n| !n.node_type.touches_page());
            if i == 0 || page_free {
                wave.push(id.clone());
            }
        }
        wave
    }

    /// Fold one node run back into the graph. Returns an outcome when the
    /// task must stop.
    async fn apply_run(
        &mut self,
        graph: &mut TaskGraph,
        ctx: &mut ExecutionContext,
        run: NodeRun,
    ) -> Result<Option<TaskOutcome>, ExecutorError> {
        let NodeRun {
            id,
            outcome,
            page,
            mut verification,
            expansion,
            state_change,
        } = run;

        if !graph.contains(&id) {
            tracing::debug!(node = %id, "Discarding run of a node removed by rollback");
            return Ok(None);
        }

        if let Some(page) = page {
            if state_change && ctx.progress.record(page.fingerprint()) {
                tracing::debug!(node = %id, url = %page.url, "No progress across recent actions");
                verification.diagnostics.no_progress = true;
            }
            ctx.page = page;
        }

        if verification.passed && !expansion.is_empty() {
            if let Err(e) = self.expand(graph, &id, expansion) {
                tracing::warn!(node = %id, "Runtime expansion rejected: {}", e);
                verification.passed = false;
                verification.diagnostics.handler_error =
                    Some(HandlerError::invalid_params(e.to_string()));
            }
        }

        if verification.passed {
            let node = graph.get_mut(&id)?;
            node.succeed(outcome.output)?;
            node.runtime.last_verification = Some(verification);
            self.router.record_success(&id);
            self.rollback.record_checkpoint(&id, ctx.steps, &ctx.page);
            tracing::info!(node = %id, "Node succeeded");
            return Ok(None);
        }

        let max_repair = self.config.max_repair_per_node;
        let node = graph.get_mut(&id)?;
        node.fail()?;
        node.runtime.attempts += 1;
        node.runtime.last_verification = Some(verification.clone());
        let failures = self.router.record_failure(&id);

        let failure = classify(node, &verification, &ctx.page, max_repair);
        let repair = plan(failure, node.attempts().saturating_sub(1));
        if failure == FailureType::PlanFail {
            // the retried node keeps LARGE until it succeeds
            self.router.escalate(&id);
        }
        tracing::info!(
            node = %id,
            %failure,
            strategy = %repair.strategy,
            depth = repair.rollback_depth,
            attempt = repair.attempt_index,
            failures,
            "Node failed, repair planned"
        );

        let rollback = match self.rollback.plan(graph, &id, repair.rollback_depth) {
            Ok(rollback) => rollback,
            Err(RollbackError::NoRollbackTarget { node }) => {
                tracing::warn!(node = %node, "No rollback target left");
                return Ok(Some(TaskOutcome::Aborted {
                    reason: AbortReason::NoRollbackTarget { node },
                }));
            }
            Err(RollbackError::IrreversibleSideEffect {
                node,
                target,
                blocking,
            }) => {
                tracing::warn!(
                    node = %node,
                    target = %target,
                    blocking = %blocking,
                    "Rollback blocked by committed side effect"
                );
                let failing = graph.get_mut(&id)?;
                failing.begin_repair()?;
                failing.requeue()?;
                // the escalation did not happen; the next failure escalates again
                failing.runtime.attempts = failing.runtime.attempts.saturating_sub(1);
                graph.get_mut(&blocking)?.runtime.needs_manual = true;
                return Ok(Some(TaskOutcome::ManualInterventionRequired {
                    node,
                    blocking,
                    awaiting: graph.awaiting_manual(),
                }));
            }
            Err(e) => return Err(e.into()),
        };

        self.apply_strategy(graph, &id, &repair, &ctx.page).await?;
        let removed = self.rollback.apply(graph, &rollback, &repair, ctx.steps)?;

        for reset in rollback.reset.iter().filter(|r| *r != &id) {
            self.router.abandon(reset);
        }
        for gone in &removed {
            self.router.abandon(gone);
        }
        if failure == FailureType::StateFail {
            ctx.progress.reset();
        }
        Ok(None)
    }

    fn expand(
        &self,
        graph: &mut TaskGraph,
        origin: &NodeId,
        expansion: Expansion,
    ) -> Result<(), GraphError> {
        if !expansion.chains.is_empty() {
            graph.splice_chains(origin, expansion.chains)?;
        }
        for id in &expansion.skip {
            match graph.get_mut(id).and_then(|n| n.skip(origin)) {
                Ok(()) => tracing::debug!(node = %id, by = %origin, "Skipped untaken branch arm"),
                Err(e) => tracing::warn!(node = %id, "Cannot skip node: {}", e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::Element;
    use crate::graph::{GraphSpec, ManualDecision, NodeStatus};
    use crate::testing::{router_with, ScriptedBrowser, ScriptedLlm};
    use serde_json::{json, Value};

    fn test_config() -> Config {
        Config {
            wait_interval_ms: 1,
            wait_timeout_ms: 20,
            ..Config::default()
        }
    }

    fn graph(doc: Value) -> TaskGraph {
        TaskGraph::from_spec(serde_json::from_value::<GraphSpec>(doc).unwrap()).unwrap()
    }

    fn executor(browser: ScriptedBrowser, llm: ScriptedLlm, config: Config) -> GraphExecutor {
        let router = Arc::new(router_with(llm, &config));
        GraphExecutor::new(config, Box::new(browser), router)
    }

    async fn run(executor: &mut GraphExecutor, graph: &mut TaskGraph, config: &Config) -> ExecutionResult {
        let mut ctx = ExecutionContext::new(config);
        executor.execute(graph, &mut ctx).await.unwrap()
    }

    fn search_graph() -> TaskGraph {
        graph(json!({
            "task_id": "search",
            "nodes": [
                {"id": "N1", "type": "NAVIGATE", "goal": "open search", "predicate": "URL contains /search",
                 "params": {"url": "https://shop.test/search?q=lamp"}},
                {"id": "N2", "type": "VERIFY", "goal": "on results page", "predicate": "URL contains /search"}
            ],
            "edges": [["N1", "N2"]]
        }))
    }

    #[tokio::test]
    async fn test_passing_graph_completes_without_models() {
        let config = test_config();
        let browser = ScriptedBrowser::new().page("https://shop.test/search?q=lamp", "Results", "<ul></ul>");
        let llm = ScriptedLlm::new();
        let mut exec = executor(browser, llm.clone(), config.clone());
        let mut g = search_graph();

        let result = run(&mut exec, &mut g, &config).await;
        assert!(result.is_completed());
        assert_eq!(result.steps, 2);
        let n2 = result.node("N2").unwrap();
        assert_eq!(n2.status, NodeStatus::Success);
        let v = n2.verification.as_ref().unwrap();
        assert_eq!((v.hard_score, v.soft_score, v.consistency_score), (1.0, 1.0, 1.0));
        assert!(llm.prompts().is_empty());
        assert_eq!(result.router.no_llm_decisions, 2);
        assert_eq!(result.checkpoints.len(), 2);
    }

    #[tokio::test]
    async fn test_grounding_failure_plans_switch_anchor() {
        let config = test_config();
        let browser = ScriptedBrowser::new().page("https://shop.test/home", "Home", "<main></main>");
        let mut exec = executor(browser, ScriptedLlm::new().always("0.8"), config.clone());
        let mut g = graph(json!({
            "task_id": "t",
            "nodes": [
                {"id": "N1", "type": "NAVIGATE", "goal": "open", "predicate": "URL contains /home",
                 "params": {"url": "https://shop.test/home"}},
                {"id": "N2", "type": "VERIFY", "goal": "on search", "predicate": "URL contains /search"}
            ],
            "edges": [["N1", "N2"]]
        }));

        let result = run(&mut exec, &mut g, &config).await;

        let first = &result.rollbacks[0];
        assert_eq!(first.failing.as_str(), "N2");
        assert_eq!(first.failure, FailureType::GroundingFail);
        assert_eq!(first.strategy, "switch anchor");
        assert_eq!(first.depth, 0);
        assert_eq!(result.rollbacks[1].strategy, "wait for element");

        // third failure escalates, and there is no COLLECT ancestor
        assert_eq!(result.rollbacks.len(), 2);
        assert_eq!(
            result.outcome,
            TaskOutcome::Aborted {
                reason: AbortReason::NoRollbackTarget {
                    node: NodeId::from("N2")
                }
            }
        );
        let n2 = result.node("N2").unwrap();
        assert_eq!(n2.attempts, 3);
        assert_eq!(n2.status, NodeStatus::Aborted);
        assert_eq!(result.router.small_model_calls, 3);
    }

    #[tokio::test]
    async fn test_exhausted_node_rolls_back_to_collect() {
        let config = test_config();
        let browser = ScriptedBrowser::new()
            .page("https://shop.test/list", "List", "<ul></ul>")
            .elements("li.item", vec![Element::new("Lamp").with_attr("href", "/lamp")]);
        let mut exec = executor(browser, ScriptedLlm::new().always("0.5"), config.clone());
        let mut g = graph(json!({
            "task_id": "t",
            "nodes": [
                {"id": "N1", "type": "NAVIGATE", "goal": "open", "predicate": "URL contains /list",
                 "params": {"url": "https://shop.test/list"}},
                {"id": "C", "type": "COLLECT", "goal": "items", "predicate": "at least 1 li.item",
                 "params": {"selector": "li.item"}},
                {"id": "V", "type": "VERIFY", "goal": "checkout", "predicate": "URL contains /checkout"}
            ],
            "edges": [["N1", "C"], ["C", "V"]]
        }));

        let result = run(&mut exec, &mut g, &config).await;

        let escalation = result
            .rollbacks
            .iter()
            .find(|r| r.failure == FailureType::PlanFail)
            .unwrap();
        assert_eq!(escalation.target.as_str(), "C");
        assert_eq!(escalation.depth, 2);
        assert_eq!(
            escalation.reset,
            vec![NodeId::from("C"), NodeId::from("V")]
        );
        // second escalation has no COLLECT left above
        assert!(matches!(
            result.outcome,
            TaskOutcome::Aborted {
                reason: AbortReason::NoRollbackTarget { .. }
            }
        ));
        assert!(result.nodes.iter().all(|n| n.attempts <= config.max_repair_per_node));
        assert_eq!(result.node("N1").unwrap().status, NodeStatus::Success);
    }

    #[tokio::test]
    async fn test_step_budget_aborts() {
        let config = Config {
            max_steps: 3,
            ..test_config()
        };
        let browser = ScriptedBrowser::new().page("https://shop.test/home", "Home", "");
        let mut exec = executor(browser, ScriptedLlm::new().always("0.1"), config.clone());
        let mut g = graph(json!({
            "task_id": "t",
            "nodes": [
                {"id": "N1", "type": "NAVIGATE", "goal": "open", "predicate": "URL contains /home",
                 "params": {"url": "https://shop.test/home"}},
                {"id": "N2", "type": "VERIFY", "goal": "cart", "predicate": "URL contains /cart"}
            ],
            "edges": [["N1", "N2"]]
        }));

        let mut ctx = ExecutionContext::new(&config);
        let token = ctx.cancellation_token();
        let result = exec.execute(&mut g, &mut ctx).await.unwrap();

        assert_eq!(
            result.outcome,
            TaskOutcome::Aborted {
                reason: AbortReason::BudgetExceeded
            }
        );
        assert_eq!(result.steps, 3);
        assert!(token.is_cancelled());
        assert_eq!(result.node("N2").unwrap().status, NodeStatus::Aborted);
    }

    #[tokio::test]
    async fn test_dependencies_run_before_dependents() {
        let config = test_config();
        let browser = ScriptedBrowser::new()
            .page("https://shop.test/list", "List", "")
            .elements("li.price", vec![Element::new("$3"), Element::new("$4")]);
        let mut exec = executor(browser.clone(), ScriptedLlm::new(), config.clone());
        let mut g = graph(json!({
            "task_id": "t",
            "nodes": [
                {"id": "S", "type": "COMPUTE", "goal": "total", "predicate": "output not empty",
                 "params": {"op": "sum", "input": "C"}},
                {"id": "C", "type": "COLLECT", "goal": "prices", "predicate": "at least 2 li.price",
                 "params": {"selector": "li.price"}},
                {"id": "N1", "type": "NAVIGATE", "goal": "open", "predicate": "URL contains /list",
                 "params": {"url": "https://shop.test/list"}}
            ],
            "edges": [["N1", "C"], ["C", "S"]]
        }));

        let result = run(&mut exec, &mut g, &config).await;
        assert!(result.is_completed());
        assert_eq!(result.node("S").unwrap().output, Some(json!(7.0)));

        let calls = browser.calls();
        let navigate = calls.iter().position(|c| c.starts_with("navigate:")).unwrap();
        let query = calls.iter().position(|c| c == "query:li.price").unwrap();
        assert!(navigate < query);
    }

    #[tokio::test]
    async fn test_iterate_splices_chain_per_item() {
        let config = test_config();
        let browser = ScriptedBrowser::new()
            .page("https://shop.test/list", "List", "")
            .elements(
                "a.product",
                vec![
                    Element::new("Lamp").with_attr("href", "https://shop.test/p/lamp"),
                    Element::new("Desk").with_attr("href", "https://shop.test/p/desk"),
                ],
            )
            .page("https://shop.test/p/lamp", "Lamp", "")
            .page("https://shop.test/p/desk", "Desk", "");
        let mut exec = executor(browser, ScriptedLlm::new(), config.clone());
        let mut g = graph(json!({
            "task_id": "t",
            "nodes": [
                {"id": "N1", "type": "NAVIGATE", "goal": "open", "predicate": "URL contains /list",
                 "params": {"url": "https://shop.test/list"}},
                {"id": "C", "type": "COLLECT", "goal": "products", "predicate": "at least 1 a.product",
                 "params": {"selector": "a.product"}},
                {"id": "It", "type": "ITERATE", "goal": "visit each", "predicate": "output not empty",
                 "params": {"body": [
                     {"type": "NAVIGATE", "goal": "open {item.text}", "predicate": "URL contains /p/",
                      "params": {"url": "{item}"}}
                 ]}},
                {"id": "Done", "type": "VERIFY", "goal": "finished", "predicate": "URL contains shop.test"}
            ],
            "edges": [["N1", "C"], ["C", "It"], ["It", "Done"]]
        }));

        let result = run(&mut exec, &mut g, &config).await;
        assert!(result.is_completed());
        for id in ["It#0.0", "It#1.0"] {
            let report = result.node(id).unwrap();
            assert_eq!(report.status, NodeStatus::Success);
            assert_eq!(report.spliced_from, Some(NodeId::from("It")));
        }
        // chain tails feed the successor of the ITERATE node
        let order: Vec<&str> = result.nodes.iter().map(|n| n.id.as_str()).collect();
        assert!(order.contains(&"Done"));
        assert!(g.dependencies(&NodeId::from("Done")).contains(&NodeId::from("It#1.0")));
    }

    #[tokio::test]
    async fn test_branch_skips_untaken_arm() {
        let config = test_config();
        let browser = ScriptedBrowser::new().page("https://shop.test/cart", "Cart", "");
        let mut exec = executor(browser, ScriptedLlm::new(), config.clone());
        let mut g = graph(json!({
            "task_id": "t",
            "nodes": [
                {"id": "N1", "type": "NAVIGATE", "goal": "open", "predicate": "URL contains /cart",
                 "params": {"url": "https://shop.test/cart"}},
                {"id": "B", "type": "BRANCH", "goal": "logged in?", "predicate": "output not empty",
                 "params": {
                     "condition": "url contains /login",
                     "then": ["Login"],
                     "else": [{"type": "VERIFY", "goal": "cart", "predicate": "URL contains /cart"}]
                 }},
                {"id": "Login", "type": "ACT", "goal": "log in", "predicate": "URL contains /account",
                 "params": {"action": "click", "target": "#login"}}
            ],
            "edges": [["N1", "B"], ["B", "Login"]]
        }));

        let result = run(&mut exec, &mut g, &config).await;
        assert!(result.is_completed());
        assert_eq!(result.node("B").unwrap().output, Some(json!({"taken": "else"})));
        assert_eq!(result.node("Login").unwrap().status, NodeStatus::Skipped);
        assert_eq!(result.node("B#else.0").unwrap().status, NodeStatus::Success);
    }

    #[tokio::test]
    async fn test_interstitial_is_dismissed() {
        let config = test_config();
        let browser = ScriptedBrowser::new()
            .page("https://shop.test/home", "Home", "<div class=\"modal\">Sign up</div>")
            .elements(".popup-close", vec![Element::new("x")])
            .on_act("click", ".popup-close", "https://shop.test/home#closed")
            .page("https://shop.test/home#closed", "Welcome", "<main>welcome</main>");
        let mut exec = executor(browser.clone(), ScriptedLlm::new().always("0.9"), config.clone());
        let mut g = graph(json!({
            "task_id": "t",
            "nodes": [
                {"id": "N1", "type": "NAVIGATE", "goal": "open", "predicate": "URL contains /home",
                 "params": {"url": "https://shop.test/home"}},
                {"id": "F", "type": "VERIFY", "goal": "welcome shown", "predicate": "title contains Welcome"}
            ],
            "edges": [["N1", "F"]]
        }));

        let result = run(&mut exec, &mut g, &config).await;
        assert!(result.is_completed());
        assert_eq!(result.rollbacks.len(), 1);
        assert_eq!(result.rollbacks[0].failure, FailureType::StateFail);
        assert_eq!(result.rollbacks[0].strategy, "dismiss interstitial");
        assert!(browser.calls().contains(&"act:click:.popup-close".to_string()));
    }

    #[tokio::test]
    async fn test_committed_side_effect_requires_manual_decision() {
        let config = test_config();
        let browser = ScriptedBrowser::new()
            .page("https://shop.test/list", "List", "")
            .elements("li.item", vec![Element::new("Lamp")])
            .elements("#buy", vec![Element::new("Buy")])
            .on_act("click", "#buy", "https://shop.test/ordered")
            .page("https://shop.test/ordered", "Ordered", "");
        let mut exec = executor(browser, ScriptedLlm::new().always("0.3"), config.clone());
        let mut g = graph(json!({
            "task_id": "t",
            "nodes": [
                {"id": "N1", "type": "NAVIGATE", "goal": "open", "predicate": "URL contains /list",
                 "params": {"url": "https://shop.test/list"}},
                {"id": "C", "type": "COLLECT", "goal": "items", "predicate": "at least 1 li.item",
                 "params": {"selector": "li.item"}},
                {"id": "Buy", "type": "ACT", "goal": "place order", "predicate": "URL contains /ordered",
                 "idempotent": false, "params": {"action": "click", "target": "#buy"}},
                {"id": "V", "type": "VERIFY", "goal": "receipt", "predicate": "URL contains /receipt"}
            ],
            "edges": [["N1", "C"], ["C", "Buy"], ["Buy", "V"]]
        }));

        let result = run(&mut exec, &mut g, &config).await;
        assert_eq!(
            result.outcome,
            TaskOutcome::ManualInterventionRequired {
                node: NodeId::from("V"),
                blocking: NodeId::from("Buy"),
                awaiting: vec![NodeId::from("Buy")],
            }
        );
        assert_eq!(g.get(&NodeId::from("V")).unwrap().status(), NodeStatus::Pending);
        assert_eq!(g.get(&NodeId::from("Buy")).unwrap().status(), NodeStatus::Success);

        // keep the order and resume; the escalation now rewinds around it
        g.resolve_manual(&NodeId::from("Buy"), ManualDecision::KeepCommitted)
            .unwrap();
        let result = run(&mut exec, &mut g, &config).await;
        let escalation = result
            .rollbacks
            .iter()
            .find(|r| r.failure == FailureType::PlanFail)
            .unwrap();
        assert_eq!(escalation.reset, vec![NodeId::from("C"), NodeId::from("V")]);
        assert_eq!(g.get(&NodeId::from("Buy")).unwrap().status(), NodeStatus::Success);
        assert!(result.nodes.iter().all(|n| n.attempts <= config.max_repair_per_node));
    }

    #[tokio::test]
    async fn test_compute_failure_reflects_op() {
        let config = test_config();
        let browser = ScriptedBrowser::new()
            .page("https://shop.test/list", "List", "")
            .elements("li.name", vec![Element::new("Lamp"), Element::new("Desk")]);
        let mut exec = executor(browser, ScriptedLlm::new().reply("0.2").reply("count").always("0.9"), config.clone());
        let mut g = graph(json!({
            "task_id": "t",
            "nodes": [
                {"id": "N1", "type": "NAVIGATE", "goal": "open", "predicate": "URL contains /list",
                 "params": {"url": "https://shop.test/list"}},
                {"id": "C", "type": "COLLECT", "goal": "names", "predicate": "at least 1 li.name",
                 "params": {"selector": "li.name"}},
                {"id": "K", "type": "COMPUTE", "goal": "how many products", "predicate": "output not empty",
                 "params": {"op": "sum"}}
            ],
            "edges": [["N1", "C"], ["C", "K"]]
        }));

        let result = run(&mut exec, &mut g, &config).await;
        assert!(result.is_completed());
        assert_eq!(result.rollbacks[0].failure, FailureType::ComputeFail);
        assert_eq!(result.node("K").unwrap().output, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_plan_fail_escalates_retry_to_large_model() {
        let config = test_config();
        let browser = ScriptedBrowser::new()
            .page("https://shop.test/list", "List", "<ul></ul>")
            .elements("li.item", vec![Element::new("Lamp")]);
        let llm = ScriptedLlm::new().always("0.5");
        let mut exec = executor(browser, llm.clone(), config.clone());
        let mut g = graph(json!({
            "task_id": "t",
            "nodes": [
                {"id": "N1", "type": "NAVIGATE", "goal": "open", "predicate": "URL contains /list",
                 "params": {"url": "https://shop.test/list"}},
                {"id": "C", "type": "COLLECT", "goal": "items", "predicate": "at least 1 li.item",
                 "params": {"selector": "li.item"}},
                {"id": "V", "type": "VERIFY", "goal": "checkout", "predicate": "URL contains /checkout"}
            ],
            "edges": [["N1", "C"], ["C", "V"]]
        }));

        let result = run(&mut exec, &mut g, &config).await;

        assert!(result
            .rollbacks
            .iter()
            .any(|r| r.failure == FailureType::PlanFail && r.target.as_str() == "C"));
        // three judgments before the escalation, three after it
        assert_eq!(result.router.small_model_calls, 3);
        assert!(result.router.large_model_calls > 0);
        assert_eq!(result.router.large_model_calls, 3);
        assert_eq!(result.router.escalations, 1);
        let models = llm.models();
        assert_eq!(models.last(), Some(&config.large_model));
        assert_eq!(models.first(), Some(&config.small_model));
    }

    #[tokio::test]
    async fn test_wave_holds_one_page_node_beside_compute() {
        let config = test_config();
        let exec = executor(ScriptedBrowser::new(), ScriptedLlm::new(), config);
        let g = graph(json!({
            "task_id": "t",
            "nodes": [
                {"id": "A", "type": "VERIFY", "goal": "on list", "predicate": "URL contains /list"},
                {"id": "B", "type": "VERIFY", "goal": "titled", "predicate": "title contains List"},
                {"id": "K", "type": "COMPUTE", "goal": "how many", "predicate": "output not empty",
                 "params": {"op": "count"}}
            ],
            "edges": []
        }));
        let ready = g.ready_nodes();
        assert_eq!(ready.len(), 3);

        assert_eq!(
            exec.build_wave(&g, &ready, 10),
            vec![NodeId::from("A"), NodeId::from("K")]
        );
        assert_eq!(exec.build_wave(&g, &ready, 1), vec![NodeId::from("A")]);
    }

    #[tokio::test]
    async fn test_page_nodes_never_share_a_wave() {
        let config = Config {
            max_steps: 4,
            ..test_config()
        };
        let browser = ScriptedBrowser::new()
            .page("https://shop.test/list", "List", "")
            .elements("li.item", vec![Element::new("Lamp"), Element::new("Desk")]);
        let mut exec = executor(browser, ScriptedLlm::new(), config.clone());
        let mut g = graph(json!({
            "task_id": "t",
            "nodes": [
                {"id": "N1", "type": "NAVIGATE", "goal": "open", "predicate": "URL contains /list",
                 "params": {"url": "https://shop.test/list"}},
                {"id": "C", "type": "COLLECT", "goal": "items", "predicate": "at least 2 li.item",
                 "params": {"selector": "li.item"}},
                {"id": "A", "type": "VERIFY", "goal": "on list", "predicate": "URL contains /list"},
                {"id": "B", "type": "VERIFY", "goal": "titled", "predicate": "title contains List"},
                {"id": "K", "type": "COMPUTE", "goal": "how many", "predicate": "output not empty",
                 "params": {"op": "count", "input": "C"}}
            ],
            "edges": [["N1", "C"], ["C", "A"], ["C", "B"], ["C", "K"]]
        }));

        let result = run(&mut exec, &mut g, &config).await;

        // N1, C, then one wave of A beside K; B is left without a step
        assert_eq!(result.steps, 4);
        assert_eq!(
            result.outcome,
            TaskOutcome::Aborted {
                reason: AbortReason::BudgetExceeded
            }
        );
        assert_eq!(result.node("A").unwrap().status, NodeStatus::Success);
        let k = result.node("K").unwrap();
        assert_eq!(k.status, NodeStatus::Success);
        assert_eq!(k.output, Some(json!(2)));
        assert_eq!(result.node("B").unwrap().status, NodeStatus::Aborted);
    }

    #[tokio::test]
    async fn test_wait_timeout_is_grounding_failure() {
        let config = test_config();
        let browser = ScriptedBrowser::new()
            .page("https://shop.test/home", "Home", "")
            .elements("#go", vec![Element::new("Go")]);
        let mut exec = executor(browser, ScriptedLlm::new().always("0.4"), config.clone());
        let mut g = graph(json!({
            "task_id": "t",
            "nodes": [
                {"id": "N1", "type": "NAVIGATE", "goal": "open", "predicate": "URL contains /home",
                 "params": {"url": "https://shop.test/home"}},
                {"id": "Go", "type": "ACT", "goal": "start", "predicate": "URL contains /home",
                 "params": {"action": "click", "target": "#go",
                            "wait_until": {"element": "#done", "timeout_ms": 20}}}
            ],
            "edges": [["N1", "Go"]]
        }));

        let mut ctx = ExecutionContext::new(&config);
        let result = exec.execute(&mut g, &mut ctx).await;
        assert!(result.is_ok());
        let result = result.unwrap();

        let first = &result.rollbacks[0];
        assert_eq!(first.failing.as_str(), "Go");
        assert_eq!(first.failure, FailureType::GroundingFail);
        assert!(matches!(result.outcome, TaskOutcome::Aborted { .. }));
    }
}
