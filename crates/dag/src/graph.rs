//! # Dependency graph
//!
//! Arena-style graph over declared components using petgraph. Nodes live in
//! an indexed collection; an edge points from a dependency to its dependent,
//! so traversal order is deployment order.

use std::collections::HashMap;
use std::fmt;

use itertools::Itertools;
use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use petgraph::visit::Bfs;
use tracing::debug;

pub use petgraph::graph::NodeIndex;

use crate::error::{DagError, DagResult};

/// A node that can be placed in a [`DependencyGraph`].
pub trait GraphNode {
    /// Unique name of the node within one graph.
    fn name(&self) -> &str;

    /// Whether a failure of this node fails the whole phase.
    fn is_required(&self) -> bool {
        true
    }
}

/// Declared relationship: `from` may only start once `to` has finished.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    #[must_use]
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Validated, acyclic dependency graph partitioned into levels.
#[derive(Debug, Clone)]
pub struct DependencyGraph<N> {
    /// Edges run dependency -> dependent.
    graph: DiGraph<N, ()>,
    /// Map from node name to index for O(1) lookups
    node_map: HashMap<String, NodeIndex>,
    /// Level partition; each level sorted by declaration order.
    levels: Vec<Vec<NodeIndex>>,
    level_of: HashMap<NodeIndex, usize>,
}

impl<N: GraphNode> DependencyGraph<N> {
    /// Compile nodes and edges into a graph.
    ///
    /// Construction is pure: it performs no I/O and keeps no state between
    /// calls. Duplicate edges are accepted and collapse into one.
    ///
    /// Only `edges` orders the graph. Dependencies a node carries itself
    /// are not read here; callers that keep them on the node (such as the
    /// component registry) must translate them into `edges` first.
    ///
    /// # Errors
    ///
    /// * `DagError::InvalidName` for an empty node name
    /// * `DagError::DuplicateName` when two nodes share a name
    /// * `DagError::SelfEdge` for an edge from a node to itself
    /// * `DagError::DanglingReference` when an edge names an undeclared node
    /// * `DagError::CycleDetected` naming the members of a cycle
    pub fn build<I>(nodes: Vec<N>, edges: I) -> DagResult<Self>
    where
        I: IntoIterator<Item = Edge>,
    {
        let mut graph = DiGraph::with_capacity(nodes.len(), 0);
        let mut node_map = HashMap::with_capacity(nodes.len());

        for node in nodes {
            let name = node.name().to_string();
            if name.trim().is_empty() {
                return Err(DagError::invalid_name("component name cannot be empty"));
            }
            if node_map.contains_key(&name) {
                return Err(DagError::duplicate_name(name));
            }
            let index = graph.add_node(node);
            node_map.insert(name, index);
        }

        for edge in edges {
            if edge.from == edge.to {
                return Err(DagError::self_edge(edge.from));
            }
            let from = *node_map.get(&edge.from).ok_or_else(|| {
                DagError::dangling_reference(&edge.from, &edge.to, &edge.from)
            })?;
            let to = *node_map
                .get(&edge.to)
                .ok_or_else(|| DagError::dangling_reference(&edge.from, &edge.to, &edge.to))?;
            graph.update_edge(to, from, ());
        }

        let (levels, level_of) = partition_levels(&graph)?;

        debug!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            levels = levels.len(),
            "Built dependency graph"
        );

        Ok(Self {
            graph,
            node_map,
            levels,
            level_of,
        })
    }

    /// Look up a node index by name.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<NodeIndex> {
        self.node_map.get(name).copied()
    }

    /// Name of the node at `index`.
    #[must_use]
    pub fn name_of(&self, index: NodeIndex) -> Option<&str> {
        self.graph.node_weight(index).map(GraphNode::name)
    }

    /// Names of the direct dependencies of `index`, in declaration order.
    #[must_use]
    pub fn dependency_names(&self, index: NodeIndex) -> Vec<&str> {
        self.dependencies(index)
            .into_iter()
            .filter_map(|dep| self.name_of(dep))
            .collect()
    }

    /// Level partition as node names.
    #[must_use]
    pub fn level_names(&self) -> Vec<Vec<&str>> {
        self.levels
            .iter()
            .map(|level| level.iter().filter_map(|&i| self.name_of(i)).collect())
            .collect()
    }
}

impl<N> DependencyGraph<N> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    #[must_use]
    pub fn node(&self, index: NodeIndex) -> Option<&N> {
        self.graph.node_weight(index)
    }

    /// All nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &N)> {
        self.graph
            .node_indices()
            .filter_map(|i| self.graph.node_weight(i).map(|n| (i, n)))
    }

    /// Levels in dispatch order.
    #[must_use]
    pub fn levels(&self) -> &[Vec<NodeIndex>] {
        &self.levels
    }

    #[must_use]
    pub fn level_of(&self, index: NodeIndex) -> Option<usize> {
        self.level_of.get(&index).copied()
    }

    /// Direct dependencies of `index`, sorted by declaration order.
    #[must_use]
    pub fn dependencies(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .sorted()
            .collect()
    }

    /// Direct dependents of `index`, sorted by declaration order.
    #[must_use]
    pub fn dependents(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(index, Direction::Outgoing)
            .sorted()
            .collect()
    }

    /// Every node that depends on `index` directly or transitively.
    #[must_use]
    pub fn transitive_dependents(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut bfs = Bfs::new(&self.graph, index);
        let mut found = Vec::new();
        while let Some(next) = bfs.next(&self.graph) {
            if next != index {
                found.push(next);
            }
        }
        found.sort();
        found
    }
}

type Levels = (Vec<Vec<NodeIndex>>, HashMap<NodeIndex, usize>);

/// Kahn's algorithm, one frontier at a time. Each frontier is a level, so a
/// node's level is the length of the longest dependency chain below it.
fn partition_levels<N: GraphNode>(graph: &DiGraph<N, ()>) -> DagResult<Levels> {
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|i| (i, graph.neighbors_directed(i, Direction::Incoming).count()))
        .collect();

    let mut frontier: Vec<NodeIndex> = graph
        .node_indices()
        .filter(|i| in_degree.get(i).is_some_and(|d| *d == 0))
        .collect();

    let mut levels: Vec<Vec<NodeIndex>> = Vec::new();
    let mut level_of = HashMap::with_capacity(graph.node_count());

    while !frontier.is_empty() {
        frontier.sort();
        let mut next = Vec::new();
        for &index in &frontier {
            level_of.insert(index, levels.len());
            for dependent in graph.neighbors_directed(index, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        next.push(dependent);
                    }
                }
            }
        }
        levels.push(std::mem::replace(&mut frontier, next));
    }

    if level_of.len() < graph.node_count() {
        return Err(DagError::cycle_detected(cycle_members(graph)));
    }

    Ok((levels, level_of))
}

/// Names of the first strongly connected component with more than one
/// member. Self-edges are rejected earlier, so every cycle has at least two.
fn cycle_members<N: GraphNode>(graph: &DiGraph<N, ()>) -> Vec<String> {
    tarjan_scc(graph)
        .into_iter()
        .find(|scc| scc.len() > 1)
        .map(|scc| {
            scc.into_iter()
                .sorted()
                .filter_map(|i| graph.node_weight(i).map(|n| n.name().to_string()))
                .collect()
        })
        .unwrap_or_default()
}
