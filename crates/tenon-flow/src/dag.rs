//! Pipeline task graph.
//!
//! Nodes are pipeline task names; edges point from a predecessor to the
//! tasks that wait on it, combining explicit `runAfter` edges with implicit
//! edges inferred from result consumption. The graph is validated acyclic
//! before any scheduling decision is made, and every traversal is
//! deterministic: ties break by task declaration order.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::error::{Error, Result};

/// A directed acyclic graph over pipeline task names.
#[derive(Debug, Clone, Default)]
pub(crate) struct TaskGraph {
    graph: DiGraph<String, ()>,
    index_map: HashMap<String, NodeIndex>,
    declaration_order: Vec<NodeIndex>,
}

impl TaskGraph {
    /// Creates an empty graph.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds a task node. Adding an existing name is a no-op.
    pub(crate) fn add_task(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.index_map.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(name.to_string());
        self.index_map.insert(name.to_string(), idx);
        self.declaration_order.push(idx);
        idx
    }

    /// Adds a dependency edge: `waiter` becomes ready only after
    /// `predecessor` reaches a terminal state. Both tasks must exist.
    pub(crate) fn add_dependency(&mut self, predecessor: &str, waiter: &str) -> Result<()> {
        let from = self.index_of(predecessor)?;
        let to = self.index_of(waiter)?;
        // Duplicate edges are harmless for readiness but pollute traversals.
        if self.graph.edges_connecting(from, to).next().is_none() {
            self.graph.add_edge(from, to, ());
        }
        Ok(())
    }

    /// Returns the predecessors of a task in declaration order.
    pub(crate) fn predecessors(&self, name: &str) -> Result<Vec<&str>> {
        let idx = self.index_of(name)?;
        let mut incoming: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .collect();
        incoming.sort_by_key(|n| self.declaration_position(*n));
        Ok(incoming
            .into_iter()
            .filter_map(|i| self.graph.node_weight(i).map(String::as_str))
            .collect())
    }

    /// Verifies the graph is acyclic using Kahn's algorithm.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`]-adjacent graph failure naming a task
    /// still stuck in the cycle (deterministically the first by declaration
    /// order).
    pub(crate) fn check_acyclic(&self) -> Result<()> {
        let mut in_degree: HashMap<NodeIndex, usize> =
            self.graph.node_indices().map(|i| (i, 0)).collect();
        for edge in self.graph.edge_references() {
            *in_degree.entry(edge.target()).or_insert(0) += 1;
        }

        let mut queue: Vec<NodeIndex> = self
            .declaration_order
            .iter()
            .filter(|&&i| in_degree.get(&i).copied() == Some(0))
            .copied()
            .collect();
        let mut visited = 0;

        while let Some(idx) = queue.pop() {
            visited += 1;
            let mut next: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .collect();
            next.sort_by_key(|n| self.declaration_position(*n));
            for n in next {
                if let Some(d) = in_degree.get_mut(&n) {
                    *d = d.saturating_sub(1);
                    if *d == 0 {
                        queue.push(n);
                    }
                }
            }
        }

        if visited == self.graph.node_count() {
            return Ok(());
        }

        let stuck = self
            .declaration_order
            .iter()
            .find(|&&i| in_degree.get(&i).copied().unwrap_or(0) > 0)
            .and_then(|&i| self.graph.node_weight(i))
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        Err(Error::internal(format!(
            "cycle detected in pipeline task graph involving \"{stuck}\""
        )))
    }

    fn index_of(&self, name: &str) -> Result<NodeIndex> {
        self.index_map
            .get(name)
            .copied()
            .ok_or_else(|| Error::internal(format!("task \"{name}\" is not in the graph")))
    }

    fn declaration_position(&self, idx: NodeIndex) -> usize {
        self.declaration_order
            .iter()
            .position(|&i| i == idx)
            .unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predecessors_in_declaration_order() {
        let mut g = TaskGraph::new();
        g.add_task("fetch");
        g.add_task("lint");
        g.add_task("build");
        g.add_dependency("fetch", "build").unwrap();
        g.add_dependency("lint", "build").unwrap();

        assert_eq!(g.predecessors("build").unwrap(), vec!["fetch", "lint"]);
        assert!(g.predecessors("fetch").unwrap().is_empty());
    }

    #[test]
    fn duplicate_edges_collapse() {
        let mut g = TaskGraph::new();
        g.add_task("a");
        g.add_task("b");
        g.add_dependency("a", "b").unwrap();
        g.add_dependency("a", "b").unwrap();
        assert_eq!(g.predecessors("b").unwrap(), vec!["a"]);
    }

    #[test]
    fn cycle_is_detected() {
        let mut g = TaskGraph::new();
        g.add_task("a");
        g.add_task("b");
        g.add_dependency("a", "b").unwrap();
        g.add_dependency("b", "a").unwrap();
        assert!(g.check_acyclic().is_err());
    }

    #[test]
    fn diamond_is_acyclic() {
        let mut g = TaskGraph::new();
        for name in ["root", "left", "right", "join"] {
            g.add_task(name);
        }
        g.add_dependency("root", "left").unwrap();
        g.add_dependency("root", "right").unwrap();
        g.add_dependency("left", "join").unwrap();
        g.add_dependency("right", "join").unwrap();
        assert!(g.check_acyclic().is_ok());
    }

    #[test]
    fn unknown_task_edge_fails() {
        let mut g = TaskGraph::new();
        g.add_task("a");
        assert!(g.add_dependency("ghost", "a").is_err());
    }
}
