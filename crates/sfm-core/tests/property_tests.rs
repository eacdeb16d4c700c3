//! # Property-Based Tests
//!
//! Invariants that must hold for arbitrary mutation sequences.

use proptest::collection::vec;
use proptest::prelude::*;
use sfm_core::{
    CentralityMeasure, Graph, MemoryConfig, MemoryManager, Node, NodeId, QueryConfig,
    QueryEngine, Relationship, RelationshipKind, SfmError, SharedGraph, snapshot_from_bytes,
    snapshot_to_bytes,
};
use std::collections::BTreeSet;

const KINDS: [RelationshipKind; 4] = [
    RelationshipKind::Trades,
    RelationshipKind::Supplies,
    RelationshipKind::Funds,
    RelationshipKind::CollaboratesWith,
];

#[derive(Debug, Clone)]
enum Op {
    AddNode(u8),
    AddRelationship(u8, u8, usize),
    RemoveNode(u8, bool),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..24).prop_map(Op::AddNode),
        4 => (0u8..24, 0u8..24, 0usize..KINDS.len())
            .prop_map(|(s, t, k)| Op::AddRelationship(s, t, k)),
        1 => (0u8..24, any::<bool>()).prop_map(|(n, c)| Op::RemoveNode(n, c)),
    ]
}

fn id(n: u8) -> NodeId {
    NodeId::from_u128(u128::from(n) + 1)
}

/// Apply `ops`, ignoring the expected validation failures.
fn build(ops: &[Op]) -> Graph {
    let mut graph = Graph::new();
    for (i, op) in ops.iter().enumerate() {
        match *op {
            Op::AddNode(n) => {
                let _ = graph.add_node(Node::actor(format!("n{n}")).with_id(id(n)));
            }
            Op::AddRelationship(s, t, k) => {
                let rel = Relationship::new(id(s), id(t), KINDS[k])
                    .with_id(sfm_core::RelationshipId::from_u128(i as u128 + 1));
                let _ = graph.add_relationship(rel);
            }
            Op::RemoveNode(n, cascade) => {
                let _ = graph.remove_node(id(n), cascade);
            }
        }
    }
    graph
}

// =============================================================================
// PROPERTY TESTS
// =============================================================================

proptest! {
    /// Every relationship resolves both endpoints after any sequence.
    #[test]
    fn referential_integrity_holds(ops in vec(op(), 1..80)) {
        let graph = build(&ops);
        for rel in graph.relationships() {
            prop_assert!(graph.contains_node(rel.source_id));
            prop_assert!(graph.contains_node(rel.target_id));
        }
    }

    /// Node count equals the number of distinct identities inserted.
    #[test]
    fn identities_are_unique(ids in vec(0u8..32, 1..60)) {
        let mut graph = Graph::new();
        let mut seen = BTreeSet::new();
        for n in &ids {
            let result = graph.add_node(Node::institution("i").with_id(id(*n)));
            if seen.insert(*n) {
                prop_assert!(result.is_ok());
            } else {
                let is_duplicate = matches!(result, Err(SfmError::DuplicateIdentity { .. }));
                prop_assert!(is_duplicate);
            }
        }
        prop_assert_eq!(graph.node_count(), seen.len());
    }

    /// Cascading removal leaves no relationship referencing the node; a
    /// refused removal changes nothing.
    #[test]
    fn removal_is_consistent(ops in vec(op(), 1..80), victim in 0u8..24) {
        let mut graph = build(&ops);
        let before = graph.snapshot().expect("snapshot");
        match graph.remove_node(id(victim), false) {
            Err(SfmError::NodeInUse { .. }) => {
                prop_assert_eq!(graph.snapshot().expect("unchanged"), before);
                graph.remove_node(id(victim), true).expect("cascade");
            }
            Err(e) => prop_assert!(e.is_not_found()),
            Ok(()) => {}
        }
        prop_assert!(!graph.contains_node(id(victim)));
        prop_assert!(graph
            .relationships()
            .all(|r| r.source_id != id(victim) && r.target_id != id(victim)));
    }

    /// The canonical snapshot survives encoding unchanged.
    #[test]
    fn snapshot_bytes_preserve_graph(ops in vec(op(), 1..60)) {
        let snapshot = build(&ops).snapshot().expect("snapshot");
        let bytes = snapshot_to_bytes(&snapshot).expect("encode");
        prop_assert_eq!(snapshot_from_bytes(&bytes).expect("decode"), snapshot);
    }

    /// Identical mutation sequences give identical centrality rankings.
    #[test]
    fn centrality_is_deterministic(ops in vec(op(), 1..60)) {
        let first = QueryEngine::new(SharedGraph::new(build(&ops)), None, QueryConfig::default());
        let second = QueryEngine::new(SharedGraph::new(build(&ops)), None, QueryConfig::default());
        for measure in [CentralityMeasure::Degree, CentralityMeasure::Betweenness] {
            prop_assert_eq!(
                first.centrality(None, measure).expect("first"),
                second.centrality(None, measure).expect("second")
            );
        }
    }

    /// After a successful limit change, usage never exceeds the limit.
    #[test]
    fn memory_limit_is_respected(count in 1usize..60, limit_share in 0.0f64..1.0) {
        let graph = SharedGraph::default();
        let memory = MemoryManager::attach(graph.clone(), MemoryConfig::default()).expect("attach");
        for i in 0..count {
            graph
                .add_node(Node::actor(format!("actor-{i}")).with_metadata("note", "x".repeat(i)))
                .expect("add");
        }
        let total = memory.stats().estimated_bytes;
        let limit = (total as f64 * limit_share) as usize;
        memory.set_memory_limit(limit).expect("no pinned nodes");
        let stats = memory.stats();
        prop_assert!(stats.estimated_bytes <= limit);
        prop_assert_eq!(stats.resident_nodes + stats.non_resident_nodes, count);
    }
}
