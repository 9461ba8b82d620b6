//! Runtime subgraph splicing for ITERATE and BRANCH.

use std::collections::HashSet;

use super::node::{NodeId, NodeStatus, TaskNode};
use super::{GraphError, TaskGraph};

impl TaskGraph {
    /// Splice chains of fresh nodes after `origin`.
    ///
    /// Each chain's head depends on `origin`; each chain's tail feeds every
    /// successor `origin` had before the splice. The check is local: the new
    /// edges close a cycle only if some successor can already reach `origin`.
    /// On any error the graph is left untouched.
    pub fn splice_chains(
        &mut self,
        origin: &NodeId,
        chains: Vec<Vec<TaskNode>>,
    ) -> Result<Vec<NodeId>, GraphError> {
        if !self.contains(origin) {
            return Err(GraphError::UnknownNode(origin.clone()));
        }

        let successors = self.successors(origin);
        if let Some(back) = successors.iter().find(|s| self.is_reachable(s, origin)) {
            return Err(GraphError::Cycle {
                nodes: vec![origin.clone(), back.clone()],
            });
        }

        let mut fresh = HashSet::new();
        for node in chains.iter().flatten() {
            if self.contains(&node.id) || !fresh.insert(node.id.clone()) {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
        }

        let mut added = Vec::new();
        for chain in chains {
            let mut previous = origin.clone();
            for mut node in chain {
                node.runtime.spliced_from = Some(origin.clone());
                let id = node.id.clone();
                self.nodes.insert(id.clone(), node);
                self.insert_edge(previous, id.clone());
                added.push(id.clone());
                previous = id;
            }
            if &previous != origin {
                for successor in &successors {
                    self.insert_edge(previous.clone(), successor.clone());
                }
            }
        }

        if let Err(err) = self.recompute_ranks() {
            for id in &added {
                self.remove_node(id);
            }
            // the pre-splice graph was valid, so this cannot fail again
            let _ = self.recompute_ranks();
            return Err(err);
        }

        tracing::info!(
            origin = %origin,
            added = added.len(),
            "Spliced runtime subgraph"
        );
        Ok(added)
    }

    /// Undo every splice rooted at `origin` and restore nodes its arm skipped.
    ///
    /// Used when a rollback re-queues an ITERATE or BRANCH node so that the
    /// re-run splices a fresh subgraph instead of stacking a second one.
    pub fn unsplice(&mut self, origin: &NodeId) -> Vec<NodeId> {
        let mut origins = vec![origin.clone()];
        let mut removed = Vec::new();
        while let Some(current) = origins.pop() {
            let children: Vec<NodeId> = self
                .nodes
                .values()
                .filter(|n| n.runtime.spliced_from.as_ref() == Some(&current))
                .map(|n| n.id.clone())
                .collect();
            for child in children {
                origins.push(child.clone());
                self.remove_node(&child);
                removed.push(child);
            }
        }

        for node in self.nodes.values_mut() {
            if node.runtime.skipped_by.as_ref() == Some(origin)
                && node.runtime.status == NodeStatus::Skipped
            {
                node.runtime.status = NodeStatus::Pending;
                node.runtime.skipped_by = None;
            }
        }

        if !removed.is_empty() {
            let _ = self.recompute_ranks();
            tracing::debug!(origin = %origin, removed = removed.len(), "Removed spliced subgraph");
        }
        removed
    }

    fn remove_node(&mut self, id: &NodeId) {
        self.nodes.shift_remove(id);
        self.topo_rank.remove(id);
        if let Some(preds) = self.preds.remove(id) {
            for pred in preds {
                if let Some(s) = self.succs.get_mut(&pred) {
                    s.shift_remove(id);
                }
            }
        }
        if let Some(succs) = self.succs.remove(id) {
            for succ in succs {
                if let Some(p) = self.preds.get_mut(&succ) {
                    p.shift_remove(id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{validate, NodeType, Predicate};

    fn is_acyclic(graph: &TaskGraph) -> bool {
        validate::topological_order(&graph.nodes, &graph.preds, &graph.succs).is_ok()
    }

    fn graph() -> TaskGraph {
        TaskGraph::from_json(
            r#"{"nodes": [
                {"id": "C", "type": "COLLECT", "predicate": "at least 1 a"},
                {"id": "I", "type": "ITERATE", "predicate": "output not empty"},
                {"id": "S", "type": "COMPUTE", "predicate": "output not empty"}
            ], "edges": [["C", "I"], ["I", "S"]]}"#,
        )
        .unwrap()
    }

    fn step(id: &str) -> TaskNode {
        TaskNode::new(id, NodeType::Extract, "read", Predicate::OutputNotEmpty)
    }

    #[test]
    fn test_splice_wires_chain_between_origin_and_successors() {
        let mut g = graph();
        let origin = NodeId::from("I");
        let added = g
            .splice_chains(
                &origin,
                vec![
                    vec![step("I#0.0"), step("I#0.1")],
                    vec![step("I#1.0"), step("I#1.1")],
                ],
            )
            .unwrap();
        assert_eq!(added.len(), 4);
        assert!(is_acyclic(&g));
        assert_eq!(g.dependencies(&"I#0.0".into()), vec![origin.clone()]);
        assert_eq!(g.dependencies(&"I#0.1".into()), vec![NodeId::from("I#0.0")]);

        let s_deps = g.dependencies(&"S".into());
        assert!(s_deps.contains(&"I#0.1".into()));
        assert!(s_deps.contains(&"I#1.1".into()));
        assert!(g.topo_rank(&"I#1.1".into()) < g.topo_rank(&"S".into()));
    }

    #[test]
    fn test_duplicate_spliced_id_leaves_graph_untouched() {
        let mut g = graph();
        let result = g.splice_chains(&"I".into(), vec![vec![step("S")]]);
        assert!(matches!(result, Err(GraphError::DuplicateNode(_))));
        assert_eq!(g.len(), 3);
    }

    #[test]
    fn test_unsplice_removes_nested_nodes_and_restores_skips() {
        let mut g = graph();
        let origin = NodeId::from("I");
        g.splice_chains(&origin, vec![vec![step("I#0.0")]]).unwrap();
        g.splice_chains(&"I#0.0".into(), vec![vec![step("I#0.0#0.0")]])
            .unwrap();
        g.get_mut(&"S".into()).unwrap().skip(&origin).unwrap();

        let removed = g.unsplice(&origin);
        assert_eq!(removed.len(), 2);
        assert_eq!(g.len(), 3);
        assert_eq!(g.get(&"S".into()).unwrap().status(), NodeStatus::Pending);
        assert_eq!(g.dependencies(&"S".into()), vec![origin]);
        assert!(is_acyclic(&g));
    }
}
