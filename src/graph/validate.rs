//! Load-time structural validation (Kahn topological sort).

use std::collections::{BTreeSet, HashMap};

use indexmap::{IndexMap, IndexSet};

use super::node::{NodeId, TaskNode};
use super::GraphError;

/// Compute a deterministic topological order.
///
/// Among nodes whose dependencies are all placed, the earliest inserted one
/// goes first, so ranks are stable across runs.
///
/// # Errors
/// `GraphError::Cycle` naming every node that could not be placed.
pub(super) fn topological_order(
    nodes: &IndexMap<NodeId, TaskNode>,
    preds: &HashMap<NodeId, IndexSet<NodeId>>,
    succs: &HashMap<NodeId, IndexSet<NodeId>>,
) -> Result<Vec<NodeId>, GraphError> {
    let mut in_degree: Vec<usize> = nodes
        .keys()
        .map(|id| preds.get(id).map_or(0, IndexSet::len))
        .collect();

    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| i)
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(index) = ready.pop_first() {
        let Some((id, _)) = nodes.get_index(index) else {
            continue;
        };
        order.push(id.clone());
        for next in succs.get(id).into_iter().flatten() {
            if let Some(next_index) = nodes.get_index_of(next) {
                in_degree[next_index] -= 1;
                if in_degree[next_index] == 0 {
                    ready.insert(next_index);
                }
            }
        }
    }

    if order.len() == nodes.len() {
        Ok(order)
    } else {
        let placed: IndexSet<&NodeId> = order.iter().collect();
        let remaining = nodes
            .keys()
            .filter(|id| !placed.contains(id))
            .cloned()
            .collect();
        Err(GraphError::Cycle { nodes: remaining })
    }
}

/// Check edge endpoints before any ordering is attempted.
pub(super) fn check_edge(
    nodes: &IndexMap<NodeId, TaskNode>,
    from: &NodeId,
    to: &NodeId,
) -> Result<(), GraphError> {
    if from == to {
        return Err(GraphError::SelfLoop(from.clone()));
    }
    if !nodes.contains_key(from) || !nodes.contains_key(to) {
        return Err(GraphError::UnknownEdgeEndpoint {
            from: from.clone(),
            to: to.clone(),
        });
    }
    Ok(())
}
