use std::collections::HashSet;

use petgraph::algo::{kosaraju_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::error::GraphError;

/// A directed dependency graph over arbitrary node payloads. An edge A → B
/// means "A must complete before B".
#[derive(Debug, Default)]
pub struct DepGraph<N> {
    graph: DiGraph<N, ()>,
    edges: HashSet<(NodeIndex, NodeIndex)>,
}

impl<N: std::fmt::Display> DepGraph<N> {
    pub fn new() -> Self {
        DepGraph { graph: DiGraph::new(), edges: HashSet::new() }
    }

    pub fn add_node(&mut self, node: N) -> NodeIndex {
        self.graph.add_node(node)
    }

    /// Add a dependency edge, deduplicating. Self-edges are rejected: a node
    /// trivially depends on itself.
    pub fn add_edge(&mut self, from: NodeIndex, to: NodeIndex) -> Result<(), GraphError> {
        if from == to {
            return Err(GraphError::SelfLoop(self.graph[from].to_string()));
        }
        if self.edges.insert((from, to)) {
            self.graph.add_edge(from, to, ());
        }
        Ok(())
    }

    pub fn node(&self, idx: NodeIndex) -> &N {
        &self.graph[idx]
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> {
        self.graph.node_indices()
    }

    pub fn predecessors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(idx, Direction::Incoming)
            .collect()
    }

    pub fn successors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect()
    }

    /// Reject cyclic graphs before the walk begins, reporting the node cycle.
    pub fn check_acyclic(&self) -> Result<(), GraphError> {
        if toposort(&self.graph, None).is_ok() {
            return Ok(());
        }
        // Reconstruct a printable cycle from the strongly connected
        // components: any component with more than one node is cyclic.
        for component in kosaraju_scc(&self.graph) {
            if component.len() > 1 {
                let mut path: Vec<String> = component
                    .iter()
                    .map(|idx| self.graph[*idx].to_string())
                    .collect();
                path.sort();
                let first = path[0].clone();
                path.push(first);
                return Err(GraphError::Cycle { path });
            }
        }
        Err(GraphError::Cycle { path: vec!["<unidentified>".to_string()] })
    }

    /// A topological order; callers must have checked acyclicity first.
    pub fn topo_order(&self) -> Vec<NodeIndex> {
        toposort(&self.graph, None).unwrap_or_default()
    }

    /// All nodes from which any node in `roots` is reachable, including the
    /// roots themselves. Used for targeting: keeping a node keeps everything
    /// it depends on.
    pub fn ancestors_of(&self, roots: &HashSet<NodeIndex>) -> HashSet<NodeIndex> {
        let mut seen: HashSet<NodeIndex> = roots.clone();
        let mut stack: Vec<NodeIndex> = roots.iter().copied().collect();
        while let Some(idx) = stack.pop() {
            for pred in self.predecessors(idx) {
                if seen.insert(pred) {
                    stack.push(pred);
                }
            }
        }
        seen
    }
}
