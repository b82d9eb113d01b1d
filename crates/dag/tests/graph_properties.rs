//! Property-based tests for the dependency graph builder.
//!
//! Uses proptest to validate:
//! - Every edge of an acyclic graph crosses levels downward
//! - Every node lands in exactly one level
//! - Any cycle is rejected and named

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use keel_dag::{DagError, DependencyGraph, Edge, GraphNode};
use proptest::prelude::*;

#[derive(Debug, Clone)]
struct Component(String);

impl GraphNode for Component {
    fn name(&self) -> &str {
        &self.0
    }
}

fn components(count: usize) -> Vec<Component> {
    (0..count).map(|i| Component(format!("c{i}"))).collect()
}

/// Random acyclic edge sets: a node may only depend on a lower-numbered one.
fn acyclic_edges() -> impl Strategy<Value = (usize, Vec<Edge>)> {
    (1usize..24).prop_flat_map(|count| {
        let pairs = prop::collection::vec((0..count, 0..count), 0..count * 3);
        pairs.prop_map(move |pairs| {
            let edges = pairs
                .into_iter()
                .filter(|(a, b)| a != b)
                .map(|(a, b)| {
                    let (from, to) = if a > b { (a, b) } else { (b, a) };
                    Edge::new(format!("c{from}"), format!("c{to}"))
                })
                .collect();
            (count, edges)
        })
    })
}

proptest! {
    /// Property: level(to) < level(from) for every edge
    #[test]
    fn prop_edges_point_to_lower_levels((count, edges) in acyclic_edges()) {
        let graph = DependencyGraph::build(components(count), edges.clone()).unwrap();

        for edge in &edges {
            let from = graph.index_of(&edge.from).unwrap();
            let to = graph.index_of(&edge.to).unwrap();
            prop_assert!(
                graph.level_of(to).unwrap() < graph.level_of(from).unwrap(),
                "edge {} violates level order", edge
            );
        }
    }

    /// Property: the levels partition the node set
    #[test]
    fn prop_levels_partition_nodes((count, edges) in acyclic_edges()) {
        let graph = DependencyGraph::build(components(count), edges).unwrap();

        let mut seen: Vec<String> = graph
            .level_names()
            .into_iter()
            .flatten()
            .map(str::to_string)
            .collect();
        seen.sort();
        seen.dedup();
        prop_assert_eq!(seen.len(), count);
        prop_assert!(graph.levels().iter().all(|level| !level.is_empty()));
    }

    /// Property: level 0 is exactly the set of nodes without dependencies
    #[test]
    fn prop_level_zero_has_no_dependencies((count, edges) in acyclic_edges()) {
        let graph = DependencyGraph::build(components(count), edges).unwrap();

        for (index, _) in graph.nodes() {
            let is_root = graph.dependencies(index).is_empty();
            prop_assert_eq!(is_root, graph.level_of(index) == Some(0));
        }
    }

    /// Property: closing a chain into a ring is always reported as a cycle
    /// naming a member of the ring
    #[test]
    fn prop_ring_is_rejected(
        (count, edges) in acyclic_edges(),
        ring in prop::collection::vec(0usize..24, 2..6),
    ) {
        let mut ring: Vec<usize> = ring.into_iter().map(|i| i % count).collect();
        ring.dedup();
        ring.sort_unstable();
        ring.dedup();
        if ring.len() < 2 {
            return Ok(());
        }

        let mut all_edges = edges;
        for pair in ring.windows(2) {
            all_edges.push(Edge::new(format!("c{}", pair[1]), format!("c{}", pair[0])));
        }
        let first = ring[0];
        let last = ring[ring.len() - 1];
        all_edges.push(Edge::new(format!("c{first}"), format!("c{last}")));

        let members: Vec<String> = ring.iter().map(|i| format!("c{i}")).collect();
        match DependencyGraph::build(components(count), all_edges) {
            Err(DagError::CycleDetected(named)) => {
                prop_assert!(!named.is_empty());
                prop_assert!(named.iter().any(|n| members.contains(n)));
            }
            other => prop_assert!(false, "expected cycle, got {:?}", other.map(|g| g.len())),
        }
    }
}

#[test]
fn scenario_levels_for_fan_out_then_chain() {
    let graph = DependencyGraph::build(
        vec![
            Component("A".into()),
            Component("B".into()),
            Component("C".into()),
            Component("D".into()),
        ],
        vec![Edge::new("B", "A"), Edge::new("C", "A"), Edge::new("D", "C")],
    )
    .unwrap();

    assert_eq!(
        graph.level_names(),
        vec![vec!["A"], vec!["B", "C"], vec!["D"]]
    );
}
