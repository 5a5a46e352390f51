//! Dependency graph and topological sorting
//!
//! An edge `from -> to` means `from` depends on `to`: `to` must be deployed
//! first. Nodes keep their insertion order, which is also the tie-break for
//! independent nodes, so the same input always sorts the same way.

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{VisitMap, Visitable};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// One concrete cycle, starting and ending at the same node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub path: Vec<String>,
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path.join(" → "))
    }
}

/// Directed dependency graph over identifiers, wrapping petgraph's `DiGraph`
#[derive(Debug, Clone)]
pub struct DependencyGraph<N> {
    graph: DiGraph<N, ()>,
    /// Map from identifier to node index for O(1) lookups
    node_map: HashMap<N, NodeIndex>,
}

impl<N> Default for DependencyGraph<N> {
    fn default() -> Self {
        Self {
            graph: DiGraph::new(),
            node_map: HashMap::new(),
        }
    }
}

impl<N> DependencyGraph<N>
where
    N: Clone + Eq + Hash + fmt::Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph over `ids`, keeping only edges that point inside the set.
    ///
    /// Edges to identifiers outside the set are assumed to be satisfied
    /// elsewhere and are dropped.
    pub fn build<I, F, D>(ids: I, mut edge_source: F) -> Self
    where
        I: IntoIterator<Item = N>,
        F: FnMut(&N) -> D,
        D: IntoIterator<Item = N>,
    {
        let mut graph = Self::new();
        for id in ids {
            graph.add_node(id);
        }
        for from in graph.graph.node_indices().collect::<Vec<_>>() {
            let id = graph.graph[from].clone();
            for to in edge_source(&id) {
                graph.add_edge(&id, &to);
            }
        }
        graph
    }

    /// Add a node; adding an existing node is a no-op
    pub fn add_node(&mut self, node: N) -> NodeIndex {
        if let Some(&index) = self.node_map.get(&node) {
            return index;
        }
        let index = self.graph.add_node(node.clone());
        self.node_map.insert(node, index);
        index
    }

    /// Record that `from` depends on `to`.
    ///
    /// Returns `false` when either end is not in the graph. Repeated edges
    /// collapse into one. Self-edges are kept so sorting reports them.
    pub fn add_edge(&mut self, from: &N, to: &N) -> bool {
        match (self.node_map.get(from), self.node_map.get(to)) {
            (Some(&f), Some(&t)) => {
                self.graph.update_edge(f, t, ());
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, node: &N) -> bool {
        self.node_map.contains_key(node)
    }

    /// Nodes in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = &N> {
        self.graph.node_weights()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Direct dependencies of a node, in insertion order
    pub fn dependencies_of(&self, node: &N) -> Vec<&N> {
        self.node_map
            .get(node)
            .map(|&index| {
                self.deps(index)
                    .into_iter()
                    .map(|dep| &self.graph[dep])
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Nodes ordered so that every dependency precedes its dependents.
    ///
    /// Depth-first over nodes in insertion order, emitting each node after
    /// all of its dependencies. Fails with the first cycle found.
    pub fn topological_sort(&self) -> Result<Vec<N>, CycleReport> {
        Ok(self
            .sorted_indices()?
            .into_iter()
            .map(|index| self.graph[index].clone())
            .collect())
    }

    /// Nodes grouped into waves: every node's dependencies sit in an
    /// earlier wave, so nodes within a wave are independent of each other.
    pub fn levels(&self) -> Result<Vec<Vec<N>>, CycleReport> {
        let order = self.sorted_indices()?;
        let mut depth = vec![0usize; self.graph.node_count()];
        for &index in &order {
            depth[index.index()] = self
                .graph
                .neighbors_directed(index, Direction::Outgoing)
                .map(|dep| depth[dep.index()] + 1)
                .max()
                .unwrap_or(0);
        }

        let mut levels: Vec<Vec<N>> = Vec::new();
        // Input order within a wave
        for index in self.graph.node_indices() {
            let d = depth[index.index()];
            if levels.len() <= d {
                levels.resize_with(d + 1, Vec::new);
            }
            levels[d].push(self.graph[index].clone());
        }
        Ok(levels)
    }

    /// Outgoing neighbours sorted by index; petgraph yields them newest first
    fn deps(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut deps: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();
        deps.sort_unstable();
        deps
    }

    fn sorted_indices(&self) -> Result<Vec<NodeIndex>, CycleReport> {
        let mut discovered = self.graph.visit_map();
        let mut finished = self.graph.visit_map();
        let mut order = Vec::with_capacity(self.graph.node_count());

        for start in self.graph.node_indices() {
            if !discovered.visit(start) {
                continue;
            }
            // (node, dependencies still to visit)
            let mut stack = vec![(start, self.deps(start).into_iter())];

            while let Some((node, pending)) = stack.last_mut() {
                let node = *node;
                match pending.next() {
                    Some(dep) if discovered.visit(dep) => {
                        stack.push((dep, self.deps(dep).into_iter()));
                    }
                    Some(dep) if !finished.is_visited(&dep) => {
                        return Err(self.cycle_from(&stack, dep));
                    }
                    Some(_) => {}
                    None => {
                        finished.visit(node);
                        order.push(node);
                        stack.pop();
                    }
                }
            }
        }

        Ok(order)
    }

    fn cycle_from<I>(&self, stack: &[(NodeIndex, I)], back_to: NodeIndex) -> CycleReport {
        let start = stack
            .iter()
            .position(|(node, _)| *node == back_to)
            .unwrap_or(0);
        let mut path: Vec<String> = stack[start..]
            .iter()
            .map(|(node, _)| self.graph[*node].to_string())
            .collect();
        path.push(self.graph[back_to].to_string());
        CycleReport { path }
    }
}
