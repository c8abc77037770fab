//! Dependency graph derived from lazy-reference bindings
//!
//! Edges are never declared by hand: a `Binding::Ref` from consumer to
//! producer is the edge. The graph is rebuilt from the workflow on each
//! validation, so it can never drift out of sync with the bindings.

use std::collections::VecDeque;

use crate::binding::{Binding, NodeId};
use crate::error::SpindleError;
use crate::workflow::Workflow;

/// Forward and reverse adjacency for one workflow, indexed by [`NodeId`]
#[derive(Debug, Clone)]
pub struct DepGraph {
    preds: Vec<Vec<NodeId>>,
    succs: Vec<Vec<NodeId>>,
}

impl DepGraph {
    /// Extract the dependency edges implied by a workflow's bindings
    pub fn from_workflow(workflow: &Workflow) -> Self {
        let n = workflow.instances().len();
        let mut preds: Vec<Vec<NodeId>> = vec![Vec::new(); n];
        let mut succs: Vec<Vec<NodeId>> = vec![Vec::new(); n];

        for instance in workflow.instances() {
            let consumer = instance.id;
            for binding in instance.bindings.values() {
                if let Binding::Ref(reference) = binding {
                    let producer = reference.producer;
                    // Two refs to the same producer are one edge
                    if !preds[consumer.index()].contains(&producer) {
                        preds[consumer.index()].push(producer);
                        succs[producer.index()].push(consumer);
                    }
                }
            }
        }

        Self { preds, succs }
    }

    #[cfg(test)]
    pub(crate) fn from_edges(n: usize, edges: &[(usize, usize)]) -> Self {
        let mut preds: Vec<Vec<NodeId>> = vec![Vec::new(); n];
        let mut succs: Vec<Vec<NodeId>> = vec![Vec::new(); n];
        for &(producer, consumer) in edges {
            preds[consumer].push(NodeId(producer));
            succs[producer].push(NodeId(consumer));
        }
        Self { preds, succs }
    }

    pub fn len(&self) -> usize {
        self.preds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.preds.is_empty()
    }

    /// Tasks this node reads outputs from
    pub fn dependencies(&self, node: NodeId) -> &[NodeId] {
        &self.preds[node.index()]
    }

    /// Tasks that read this node's outputs
    pub fn consumers(&self, node: NodeId) -> &[NodeId] {
        &self.succs[node.index()]
    }

    /// Kahn's algorithm. Returns the nodes in a valid execution order, or
    /// the members of a cycle if one exists.
    pub fn topo_order(&self) -> Result<Vec<NodeId>, Vec<NodeId>> {
        let n = self.len();
        let mut in_degree: Vec<usize> = (0..n).map(|i| self.preds[i].len()).collect();
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(i) = queue.pop_front() {
            order.push(NodeId(i));
            for &succ in &self.succs[i] {
                in_degree[succ.index()] -= 1;
                if in_degree[succ.index()] == 0 {
                    queue.push_back(succ.index());
                }
            }
        }

        if order.len() == n {
            Ok(order)
        } else {
            // Whatever never reached in-degree zero is on or behind a cycle
            let members: Vec<NodeId> = (0..n)
                .filter(|&i| in_degree[i] > 0)
                .map(NodeId)
                .collect();
            Err(members)
        }
    }

    /// BFS reachability along forward edges
    pub fn has_path(&self, from: NodeId, to: NodeId) -> bool {
        if from == to {
            return true;
        }
        let mut seen = vec![false; self.len()];
        let mut queue = VecDeque::from([from]);
        seen[from.index()] = true;
        while let Some(node) = queue.pop_front() {
            for &succ in &self.succs[node.index()] {
                if succ == to {
                    return true;
                }
                if !seen[succ.index()] {
                    seen[succ.index()] = true;
                    queue.push_back(succ);
                }
            }
        }
        false
    }
}

/// Convert cycle members into a displayable error using task names
pub fn cycle_error(workflow: &Workflow, members: Vec<NodeId>) -> SpindleError {
    let mut names: Vec<String> = members
        .iter()
        .map(|id| workflow.instance(*id).spec.name().to_string())
        .collect();
    // Close the chain for readability
    if let Some(first) = names.first().cloned() {
        names.push(first);
    }
    SpindleError::GraphCycle { members: names }
}
