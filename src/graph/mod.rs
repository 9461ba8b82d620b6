//! Task graph: an arena of typed steps with id-based adjacency.
//!
//! Nodes live in an insertion-ordered map keyed by `NodeId`; edges are kept
//! as predecessor and successor sets. Acyclicity is established once at load
//! by a topological sort and re-checked locally whenever ITERATE/BRANCH
//! splice new nodes in.

pub mod node;
pub mod predicate;
mod schema;
mod splice;
mod validate;

pub use node::{
    ManualDecision, NodeId, NodeRuntime, NodeStatus, NodeType, RepairHints, TaskNode,
};
pub use predicate::Predicate;
pub use schema::{GraphSpec, NodeSpec, NodeTemplate};

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Graph has no nodes")]
    Empty,

    #[error("Duplicate node id '{0}'")]
    DuplicateNode(NodeId),

    #[error("Unknown node '{0}'")]
    UnknownNode(NodeId),

    #[error("Edge {from} -> {to} references an unknown node")]
    UnknownEdgeEndpoint { from: NodeId, to: NodeId },

    #[error("Node '{0}' depends on itself")]
    SelfLoop(NodeId),

    #[error("Cycle detected among nodes {nodes:?}")]
    Cycle { nodes: Vec<NodeId> },

    #[error("Invalid predicate: {0}")]
    InvalidPredicate(String),

    #[error("Node '{node}' cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        node: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },

    #[error("Node '{0}' is not awaiting a manual decision")]
    NotAwaitingManual(NodeId),

    #[error("Failed to parse graph document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Directed acyclic graph of task nodes.
///
/// # Invariants
/// - node ids are unique
/// - every edge endpoint is a node of the graph
/// - `topo_rank` is a valid topological numbering of the current node set
#[derive(Debug, Clone)]
pub struct TaskGraph {
    task_id: String,
    nodes: IndexMap<NodeId, TaskNode>,
    preds: HashMap<NodeId, IndexSet<NodeId>>,
    succs: HashMap<NodeId, IndexSet<NodeId>>,
    topo_rank: HashMap<NodeId, usize>,
    metadata: Value,
}

impl TaskGraph {
    /// Build and validate a graph from its document form.
    ///
    /// # Errors
    /// Empty node set, duplicate ids, dangling or self-referencing edges, and
    /// cycles are all rejected before anything executes.
    pub fn from_spec(spec: GraphSpec) -> Result<Self, GraphError> {
        if spec.nodes.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut nodes = IndexMap::with_capacity(spec.nodes.len());
        for node_spec in spec.nodes {
            let node = node_spec.into_node();
            if nodes.contains_key(&node.id) {
                return Err(GraphError::DuplicateNode(node.id));
            }
            nodes.insert(node.id.clone(), node);
        }

        let mut graph = Self {
            task_id: spec
                .task_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            nodes,
            preds: HashMap::new(),
            succs: HashMap::new(),
            topo_rank: HashMap::new(),
            metadata: spec.metadata,
        };

        for (from, to) in spec.edges {
            let (from, to) = (NodeId::from(from), NodeId::from(to));
            validate::check_edge(&graph.nodes, &from, &to)?;
            graph.insert_edge(from, to);
        }

        graph.recompute_ranks()?;
        tracing::debug!(
            task_id = %graph.task_id,
            nodes = graph.nodes.len(),
            "Task graph validated"
        );
        Ok(graph)
    }

    /// Parse a JSON graph document.
    pub fn from_json(json: &str) -> Result<Self, GraphError> {
        let spec: GraphSpec = serde_json::from_str(json)?;
        Self::from_spec(spec)
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &NodeId) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut TaskNode> {
        self.nodes.get_mut(id)
    }

    pub fn get(&self, id: &NodeId) -> Result<&TaskNode, GraphError> {
        self.nodes
            .get(id)
            .ok_or_else(|| GraphError::UnknownNode(id.clone()))
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Result<&mut TaskNode, GraphError> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownNode(id.clone()))
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.values()
    }

    pub fn dependencies(&self, id: &NodeId) -> Vec<NodeId> {
        self.preds
            .get(id)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn successors(&self, id: &NodeId) -> Vec<NodeId> {
        self.succs
            .get(id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn topo_rank(&self, id: &NodeId) -> usize {
        self.topo_rank.get(id).copied().unwrap_or(usize::MAX)
    }

    /// Sort key for deterministic scheduling: topological rank, then insertion order.
    fn schedule_key(&self, id: &NodeId) -> (usize, usize) {
        (
            self.topo_rank(id),
            self.nodes.get_index_of(id).unwrap_or(usize::MAX),
        )
    }

    /// Pending nodes whose dependencies are all SUCCESS or SKIPPED, in schedule order.
    pub fn ready_nodes(&self) -> Vec<NodeId> {
        let mut ready: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.status() == NodeStatus::Pending)
            .filter(|n| {
                self.preds.get(&n.id).map_or(true, |deps| {
                    deps.iter().all(|d| {
                        self.nodes
                            .get(d)
                            .map_or(false, |dep| dep.status().satisfies_dependency())
                    })
                })
            })
            .map(|n| n.id.clone())
            .collect();
        ready.sort_by_key(|id| self.schedule_key(id));
        ready
    }

    /// True once every node is in a terminal status.
    pub fn is_exhausted(&self) -> bool {
        self.nodes.values().all(|n| n.status().is_terminal())
    }

    /// All ancestors with their hop distance, nearest first (ties by schedule order).
    pub fn ancestors_by_distance(&self, id: &NodeId) -> Vec<(NodeId, usize)> {
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut found = Vec::new();
        let mut queue: VecDeque<(NodeId, usize)> = VecDeque::new();
        queue.push_back((id.clone(), 0));
        seen.insert(id.clone());

        while let Some((current, distance)) = queue.pop_front() {
            for pred in self.preds.get(&current).into_iter().flatten() {
                if seen.insert(pred.clone()) {
                    found.push((pred.clone(), distance + 1));
                    queue.push_back((pred.clone(), distance + 1));
                }
            }
        }

        found.sort_by_key(|(node, distance)| (*distance, self.schedule_key(node)));
        found
    }

    /// Whether `to` can be reached from `from` along successor edges.
    pub fn is_reachable(&self, from: &NodeId, to: &NodeId) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![from.clone()];
        while let Some(current) = stack.pop() {
            if &current == to {
                return true;
            }
            if seen.insert(current.clone()) {
                stack.extend(self.succs.get(&current).into_iter().flatten().cloned());
            }
        }
        false
    }

    /// Nodes lying on some path from `ancestor` to `node`, both included, in schedule order.
    pub fn path_between(&self, ancestor: &NodeId, node: &NodeId) -> Vec<NodeId> {
        let mut on_path: Vec<NodeId> = self
            .ancestors_by_distance(node)
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| id == ancestor || self.is_reachable(ancestor, id))
            .collect();
        if !on_path.contains(ancestor) {
            return Vec::new();
        }
        on_path.push(node.clone());
        on_path.sort_by_key(|id| self.schedule_key(id));
        on_path
    }

    /// Nodes currently flagged as needing a manual decision.
    pub fn awaiting_manual(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.runtime.needs_manual)
            .map(|n| n.id.clone())
            .collect()
    }

    /// Inject a decision for a node flagged NEEDS_MANUAL.
    ///
    /// The node keeps its SUCCESS status either way; `execute` may then be
    /// called again on this graph to resume.
    pub fn resolve_manual(&mut self, id: &NodeId, decision: ManualDecision) -> Result<(), GraphError> {
        let node = self.get_mut(id)?;
        if !node.runtime.needs_manual {
            return Err(GraphError::NotAwaitingManual(id.clone()));
        }
        node.runtime.needs_manual = false;
        node.runtime.manual_decision = Some(decision);
        tracing::info!(node = %id, ?decision, "Manual decision recorded");
        Ok(())
    }

    fn insert_edge(&mut self, from: NodeId, to: NodeId) {
        self.succs.entry(from.clone()).or_default().insert(to.clone());
        self.preds.entry(to).or_default().insert(from);
    }

    fn recompute_ranks(&mut self) -> Result<(), GraphError> {
        let order = validate::topological_order(&self.nodes, &self.preds, &self.succs)?;
        self.topo_rank = order
            .into_iter()
            .enumerate()
            .map(|(rank, id)| (id, rank))
            .collect();
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn chain_graph() -> TaskGraph {
        TaskGraph::from_spec(
            serde_json::from_value(json!({
                "task_id": "t1",
                "nodes": [
                    {"id": "N1", "type": "NAVIGATE", "goal": "open", "predicate": "URL contains /start"},
                    {"id": "C", "type": "COLLECT", "goal": "list", "predicate": "at least 1 li"},
                    {"id": "A", "type": "ACT", "goal": "click", "predicate": "URL contains /item"},
                    {"id": "V", "type": "VERIFY", "goal": "check", "predicate": "URL contains /item"}
                ],
                "edges": [["N1", "C"], ["C", "A"], ["A", "V"]]
            }))
            .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_cycle_rejected_at_load() {
        let result = TaskGraph::from_json(
            r#"{
                "nodes": [
                    {"id": "A", "type": "NAVIGATE", "predicate": "URL contains a"},
                    {"id": "B", "type": "VERIFY", "predicate": "URL contains b"},
                    {"id": "C", "type": "VERIFY", "predicate": "URL contains c"}
                ],
                "edges": [["A", "B"], ["B", "C"], ["C", "B"]]
            }"#,
        );
        match result {
            Err(GraphError::Cycle { nodes }) => {
                assert_eq!(nodes, vec![NodeId::from("B"), NodeId::from("C")]);
            }
            other => panic!("expected cycle error, got {:?}", other.map(|g| g.len())),
        }
    }

    #[test]
    fn test_structural_errors() {
        assert!(matches!(
            TaskGraph::from_json(r#"{"nodes": []}"#),
            Err(GraphError::Empty)
        ));
        assert!(matches!(
            TaskGraph::from_json(
                r#"{"nodes": [
                    {"id": "A", "type": "VERIFY", "predicate": "URL contains a"},
                    {"id": "A", "type": "VERIFY", "predicate": "URL contains a"}
                ]}"#
            ),
            Err(GraphError::DuplicateNode(_))
        ));
        assert!(matches!(
            TaskGraph::from_json(
                r#"{"nodes": [{"id": "A", "type": "VERIFY", "predicate": "URL contains a"}],
                    "edges": [["A", "Z"]]}"#
            ),
            Err(GraphError::UnknownEdgeEndpoint { .. })
        ));
        assert!(matches!(
            TaskGraph::from_json(
                r#"{"nodes": [{"id": "A", "type": "VERIFY", "predicate": "URL contains a"}],
                    "edges": [["A", "A"]]}"#
            ),
            Err(GraphError::SelfLoop(_))
        ));
    }

    #[test]
    fn test_ready_set_respects_dependencies() {
        let mut graph = chain_graph();
        assert_eq!(graph.ready_nodes(), vec![NodeId::from("N1")]);

        let n1 = graph.get_mut(&"N1".into()).unwrap();
        n1.start().unwrap();
        assert!(graph.ready_nodes().is_empty());

        graph.get_mut(&"N1".into()).unwrap().succeed(None).unwrap();
        assert_eq!(graph.ready_nodes(), vec![NodeId::from("C")]);

        graph.get_mut(&"C".into()).unwrap().skip(&"N1".into()).unwrap();
        assert_eq!(graph.ready_nodes(), vec![NodeId::from("A")]);
    }

    #[test]
    fn test_ready_tie_break_is_topological_then_insertion() {
        let graph = TaskGraph::from_json(
            r#"{"nodes": [
                {"id": "late", "type": "VERIFY", "predicate": "URL contains x"},
                {"id": "root", "type": "NAVIGATE", "predicate": "URL contains x"},
                {"id": "other", "type": "COMPUTE", "predicate": "output not empty"}
            ], "edges": [["root", "late"]]}"#,
        )
        .unwrap();
        assert_eq!(
            graph.ready_nodes(),
            vec![NodeId::from("root"), NodeId::from("other")]
        );
        assert!(graph.topo_rank(&"root".into()) < graph.topo_rank(&"late".into()));
    }

    #[test]
    fn test_ancestors_and_paths() {
        let graph = chain_graph();
        let ancestors = graph.ancestors_by_distance(&"V".into());
        assert_eq!(
            ancestors,
            vec![
                (NodeId::from("A"), 1),
                (NodeId::from("C"), 2),
                (NodeId::from("N1"), 3)
            ]
        );
        assert_eq!(
            graph.path_between(&"C".into(), &"V".into()),
            vec![NodeId::from("C"), NodeId::from("A"), NodeId::from("V")]
        );
        assert!(graph.path_between(&"V".into(), &"C".into()).is_empty());
    }

    #[test]
    fn test_resolve_manual_requires_flag() {
        let mut graph = chain_graph();
        let id = NodeId::from("A");
        assert!(matches!(
            graph.resolve_manual(&id, ManualDecision::KeepCommitted),
            Err(GraphError::NotAwaitingManual(_))
        ));
        graph.get_mut(&id).unwrap().runtime.needs_manual = true;
        assert_eq!(graph.awaiting_manual(), vec![id.clone()]);
        graph.resolve_manual(&id, ManualDecision::KeepCommitted).unwrap();
        assert!(graph.awaiting_manual().is_empty());
    }
}
